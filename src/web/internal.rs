//! Endpoints the gate serves itself: health, supervisor control, working directory,
//! model metadata, and recent logs

use crate::error::GateError;
use crate::web::server::GateContext;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

/// JSON error body with a status derived from the error kind
pub fn error_response(err: &GateError) -> HttpResponse {
    let body = json!({ "success": false, "error": err.to_string() });
    match err {
        GateError::Validation { .. } => HttpResponse::BadRequest().json(body),
        GateError::NotFound { .. } | GateError::Io(_) => HttpResponse::NotFound().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Local health, answered even while the backend is down
pub async fn health(ctx: web::Data<GateContext>) -> HttpResponse {
    let supervisor = &ctx.supervisor;
    let info = supervisor.server_info();
    let status = supervisor.status();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "serverPort": info.port,
        "backendPort": status.backend_port,
        "apiPrefix": status.api_prefix,
        "isOpenCodeReady": status.ready,
        "lastError": status.last_error,
        "restarting": status.restarting,
    }))
}

pub async fn server_info(ctx: web::Data<GateContext>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.supervisor.server_info())
}

pub async fn status(ctx: web::Data<GateContext>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.supervisor.status())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    pub wait_for_agent: Option<String>,
}

pub async fn restart(ctx: web::Data<GateContext>, body: Option<web::Json<RestartRequest>>) -> HttpResponse {
    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    info!("🔄 Restart requested over HTTP");

    let outcome = match request.wait_for_agent.as_deref() {
        Some(agent) => ctx.supervisor.restart_and_wait_for_agent(agent).await,
        None => ctx.supervisor.restart().await,
    };
    match outcome {
        Ok(()) => HttpResponse::Ok().json(json!({
            "success": true,
            "status": ctx.supervisor.status(),
        })),
        Err(e) => {
            error!("Restart failed: {}", e);
            error_response(&e)
        }
    }
}

pub async fn stop(ctx: web::Data<GateContext>) -> HttpResponse {
    match ctx.supervisor.stop().await {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub level: Option<String>,
    pub search: Option<String>,
}

pub async fn logs(ctx: web::Data<GateContext>, query: web::Query<LogsQuery>) -> HttpResponse {
    let Some(buffer) = ctx.logs.as_ref() else {
        return HttpResponse::Ok().json(json!({ "logs": [], "total": 0 }));
    };
    let limit = query.limit.unwrap_or(100).min(1000);
    let entries = buffer.get_filtered_entries(limit, query.level.as_deref(), query.search.as_deref());
    HttpResponse::Ok().json(json!({
        "total": entries.len(),
        "logs": entries,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DirectoryChangeRequest {
    pub path: String,
}

pub async fn change_directory(
    ctx: web::Data<GateContext>,
    body: web::Json<DirectoryChangeRequest>,
) -> HttpResponse {
    match ctx.supervisor.set_working_directory(&body.path).await {
        Ok(change) => HttpResponse::Ok().json(json!({
            "success": true,
            "restarted": change.restarted,
            "path": change.path,
        })),
        Err(e) => {
            warn!("Working directory change to '{}' failed: {}", body.path, e);
            error_response(&e)
        }
    }
}

pub async fn models_metadata(ctx: web::Data<GateContext>) -> HttpResponse {
    match ctx.models.get().await {
        Some(payload) => HttpResponse::Ok().json(payload),
        None => HttpResponse::BadGateway().json(json!({ "error": "Model metadata unavailable" })),
    }
}

/// Register the internal routes under `mount`
pub fn configure_internal(cfg: &mut web::ServiceConfig, mount: &str) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope(&format!("{}/gate", mount))
                .route("/server-info", web::get().to(server_info))
                .route("/status", web::get().to(status))
                .route("/restart", web::post().to(restart))
                .route("/stop", web::post().to(stop))
                .route("/logs", web::get().to(logs)),
        )
        .route(
            &format!("{}/opencode/directory", mount),
            web::post().to(change_directory),
        )
        .route(
            &format!("{}/openchamber/models-metadata", mount),
            web::get().to(models_metadata),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_response(&GateError::validation("empty")).status(), 400);
        assert_eq!(error_response(&GateError::not_found("x")).status(), 404);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(error_response(&GateError::Io(io)).status(), 404);
        assert_eq!(error_response(&GateError::restart("boom")).status(), 500);
    }
}
