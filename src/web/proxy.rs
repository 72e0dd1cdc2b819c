//! Forwarding of API requests to the backend
//!
//! Every request under the mount is admitted (or answered 503), rewritten onto the live
//! backend port and prefix, and relayed with a streamed response body.

use crate::web::gate::{self, Admission};
use crate::web::server::GateContext;
use crate::web::websocket;
use actix_web::http::{header, StatusCode};
use actix_web::web::{self, Bytes, BytesMut};
use actix_web::{HttpRequest, HttpResponse};
use futures_util::StreamExt;
use serde_json::json;
use tracing::{debug, warn};

/// Catch-all handler for everything that is not an internal route
pub async fn forward(
    req: HttpRequest,
    payload: web::Payload,
    ctx: web::Data<GateContext>,
) -> actix_web::Result<HttpResponse> {
    let path = req.path().to_string();
    let rest = match gate::strip_mount(&path, &ctx.mount_path) {
        Some(rest) => rest.to_string(),
        None => {
            return Ok(HttpResponse::NotFound().json(json!({ "error": "Not found" })));
        }
    };

    // Unmatched paths in the gate's own namespace are never forwarded
    if gate::is_bypass_path(&path, &ctx.mount_path) {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Not found" })));
    }

    let route = ctx.supervisor.route_snapshot();
    match gate::admit(&route, &path, &ctx.mount_path) {
        Admission::Forward => {}
        Admission::Restarting => {
            debug!("Gating {} {} while backend is not ready", req.method(), path);
            return Ok(unavailable("OpenCode is restarting", true));
        }
        Admission::Stopped => {
            return Ok(unavailable("OpenCode is stopped", false));
        }
    }

    let target_path = gate::rewrite_path(&rest, route.prefix.as_forward_prefix());

    if is_websocket_upgrade(&req) {
        let target = gate::target_url(&route.authority, &target_path, req.query_string(), "ws");
        return websocket::relay(&req, payload, target, route.restarting).await;
    }

    let body = match read_body(payload, ctx.body_limit).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let target = gate::target_url(&route.authority, &target_path, req.query_string(), "http");
    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return Ok(HttpResponse::MethodNotAllowed().json(json!({ "error": "Unsupported method" })));
        }
    };

    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok());
    let event_stream = gate::wants_event_stream(accept);

    let mut builder = ctx.client.request(method.clone(), &target);
    for (name, value) in req.headers() {
        let name = name.as_str();
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || gate::is_hop_by_hop(name)
        {
            continue;
        }
        builder = builder.header(name, value.as_bytes());
    }
    builder = builder.header("host", route.authority.as_str());
    if event_stream {
        builder = builder
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive");
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Proxy request to {} failed: {}", target, e);
            return Ok(unavailable("OpenCode is unavailable", route.restarting));
        }
    };

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND && !route.prefix.is_detected() {
        debug!("Backend answered 404 for {} with prefix undetected", target_path);
        ctx.supervisor.trigger_prefix_discovery();
    }
    if status.is_success() && method != reqwest::Method::GET && is_config_path(&rest, &ctx.config_path) {
        // The backend reloads after a configuration write; confirm it came back
        let supervisor = ctx.supervisor.clone();
        actix_web::rt::spawn(async move {
            if let Err(e) = supervisor.verify_readiness().await {
                warn!("Backend not ready after configuration change: {}", e);
            }
        });
    }

    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = HttpResponse::build(status);
    let mut upstream_event_stream = false;
    for (name, value) in response.headers() {
        let name = name.as_str();
        if name.eq_ignore_ascii_case("content-length") || gate::is_hop_by_hop(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("content-type") {
            upstream_event_stream = gate::wants_event_stream(value.to_str().ok());
        }
        out.append_header((name, value.as_bytes()));
    }
    if upstream_event_stream {
        out.insert_header((header::CACHE_CONTROL, "no-cache"));
        out.insert_header(("X-Accel-Buffering", "no"));
    }

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    Ok(out.streaming(stream))
}

/// 503 with the stable `{error, restarting}` body
pub fn unavailable(message: &str, restarting: bool) -> HttpResponse {
    HttpResponse::ServiceUnavailable()
        .insert_header((header::RETRY_AFTER, "1"))
        .json(json!({ "error": message, "restarting": restarting }))
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
}

fn is_config_path(rest: &str, config_path: &str) -> bool {
    rest == config_path
        || rest
            .strip_prefix(config_path)
            .map_or(false, |tail| tail.starts_with('/'))
}

async fn read_body(mut payload: web::Payload, limit: usize) -> Result<Bytes, HttpResponse> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| {
            HttpResponse::BadRequest().json(json!({ "error": format!("Failed to read request body: {}", e) }))
        })?;
        if body.len() + chunk.len() > limit {
            return Err(HttpResponse::PayloadTooLarge()
                .json(json!({ "error": format!("Request body exceeds {} bytes", limit) })));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}
