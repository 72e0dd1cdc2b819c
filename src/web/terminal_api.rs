//! HTTP surface of the terminal sessions

use crate::terminal::{TerminalEvent, TerminalManager};
use crate::web::internal::error_response;
use crate::web::server::GateContext;
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::HttpResponse;
use futures_util::{future, stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Deserialize)]
pub struct CreateTerminalRequest {
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TerminalInput {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct TerminalResize {
    pub cols: u16,
    pub rows: u16,
}

fn manager(ctx: &GateContext) -> Result<&Arc<TerminalManager>, HttpResponse> {
    ctx.terminals
        .as_ref()
        .ok_or_else(|| HttpResponse::NotFound().json(json!({ "error": "Terminal sessions are disabled" })))
}

pub async fn create(ctx: web::Data<GateContext>, body: web::Json<CreateTerminalRequest>) -> HttpResponse {
    let manager = match manager(&ctx) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let default_cwd = ctx.supervisor.working_directory();
    match manager.create(body.cols, body.rows, body.cwd.as_deref(), &default_cwd) {
        Ok(id) => HttpResponse::Ok().json(json!({ "sessionId": id })),
        Err(e) => error_response(&e),
    }
}

pub async fn input(
    ctx: web::Data<GateContext>,
    id: web::Path<String>,
    body: web::Json<TerminalInput>,
) -> HttpResponse {
    let manager = match manager(&ctx) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match manager.input(&id, &body.data) {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(e) => error_response(&e),
    }
}

pub async fn resize(
    ctx: web::Data<GateContext>,
    id: web::Path<String>,
    body: web::Json<TerminalResize>,
) -> HttpResponse {
    let manager = match manager(&ctx) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match manager.resize(&id, body.cols, body.rows) {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(e) => error_response(&e),
    }
}

pub async fn close(ctx: web::Data<GateContext>, id: web::Path<String>) -> HttpResponse {
    let manager = match manager(&ctx) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match manager.close(&id) {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(e) => error_response(&e),
    }
}

/// Server-sent events: one `data:` frame per event, ending after the exit event
pub async fn stream_output(ctx: web::Data<GateContext>, id: web::Path<String>) -> HttpResponse {
    let manager = match manager(&ctx) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let subscription = match manager.stream(&id) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    let initial = subscription.already_exited.then_some(TerminalEvent::Exit);
    // Lagged receivers skip what they missed
    let live = BroadcastStream::new(subscription.events).filter_map(|event| future::ready(event.ok()));

    let frames = stream::iter(initial)
        .chain(live)
        .scan(false, |finished, event| {
            if *finished {
                return future::ready(None);
            }
            *finished = event == TerminalEvent::Exit;
            future::ready(Some(event))
        })
        .map(|event| {
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| r#"{"type":"exit"}"#.to_string());
            Ok::<Bytes, actix_web::Error>(Bytes::from(format!("data: {}\n\n", payload)))
        });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(frames)
}

pub fn configure_terminal_api(cfg: &mut web::ServiceConfig, mount: &str) {
    cfg.service(
        web::scope(&format!("{}/terminal", mount))
            .route("/create", web::post().to(create))
            .route("/{id}/stream", web::get().to(stream_output))
            .route("/{id}/input", web::post().to(input))
            .route("/{id}/resize", web::post().to(resize))
            .route("/{id}", web::delete().to(close)),
    );
}
