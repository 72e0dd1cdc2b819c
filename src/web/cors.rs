//! Permissive CORS for the whole gate
//!
//! Every response carries `Access-Control-Allow-Origin: *`, including gated 503s and the
//! gate's own endpoints. Preflight requests are answered here and never forwarded.

use actix_web::http::header;
use actix_web::middleware::DefaultHeaders;
use actix_web::{guard, web, HttpRequest, HttpResponse};

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";

/// Headers added to every response that does not set them itself
pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_EXPOSE_HEADERS, "*"))
}

/// Answer `OPTIONS` preflights for any path; must be registered before other routes
pub fn configure_preflight(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/{tail:.*}")
            .guard(guard::Options())
            .guard(guard::fn_guard(|ctx| {
                ctx.head()
                    .headers()
                    .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
            }))
            .to(preflight),
    );
}

async fn preflight(req: HttpRequest) -> HttpResponse {
    let allow_headers = req
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string();

    HttpResponse::NoContent()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers))
        .insert_header((header::ACCESS_CONTROL_MAX_AGE, "86400"))
        .finish()
}
