//! HTTP behavior of the gate: internal routes, admission, and forwarding

#![cfg(unix)]

mod common;

use actix_web::http::Method;
use actix_web::{test, web, App};
use agentgate::config::Config;
use agentgate::supervisor::BackendSupervisor;
use agentgate::web::{configure_app, cors_headers, proxy, GateContext};
use common::*;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn idle_config() -> Config {
    let mut config = Config::default();
    config.terminal.enabled = false;
    config
}

macro_rules! gate_app {
    ($supervisor:expr) => {{
        let context = GateContext::new($supervisor, None, None).unwrap();
        let mount = context.mount_path.clone();
        test::init_service(
            App::new()
                .wrap(cors_headers())
                .app_data(web::Data::new(context))
                .configure(|cfg| configure_app(cfg, &mount, false))
                .default_service(web::to(proxy::forward)),
        )
        .await
    }};
}

async fn ready_supervisor(server: &MockServer, dir: &std::path::Path, prefix: &str) -> BackendSupervisor {
    let script = backend_script(dir, "backend.sh", &[]);
    let mut config = test_config(&script, dir);
    config.backend.port = Some(mock_port(server));
    config.backend.api_prefix = Some(prefix.to_string());
    let supervisor = BackendSupervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    supervisor.wait_until_ready(Duration::from_secs(5)).await.unwrap();
    supervisor
}

#[actix_web::test]
async fn test_gated_while_backend_not_ready() {
    let supervisor = BackendSupervisor::new(idle_config()).unwrap();
    let app = gate_app!(supervisor);

    let req = test::TestRequest::get().uri("/api/session").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "1");
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["restarting"], json!(true));
    assert!(body["error"].is_string());
}

#[actix_web::test]
async fn test_stopped_backend_is_not_restarting() {
    let supervisor = BackendSupervisor::new(idle_config()).unwrap();
    supervisor.stop().await.unwrap();
    let app = gate_app!(supervisor);

    let req = test::TestRequest::get().uri("/api/session").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 503);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["restarting"], json!(false));
}

#[actix_web::test]
async fn test_internal_routes_answer_while_gated() {
    let supervisor = BackendSupervisor::new(idle_config()).unwrap();
    supervisor.set_gate_port(3000);
    let app = gate_app!(supervisor);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["serverPort"], 3000);
    assert_eq!(body["isOpenCodeReady"], json!(false));

    let req = test::TestRequest::get().uri("/api/gate/server-info").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["port"], 3000);

    let req = test::TestRequest::get().uri("/api/gate/nope").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get().uri("/elsewhere").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn test_directory_change_validation() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();

    let supervisor = BackendSupervisor::new(idle_config()).unwrap();
    let app = gate_app!(supervisor);

    let req = test::TestRequest::post()
        .uri("/api/opencode/directory")
        .set_json(json!({ "path": "" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/opencode/directory")
        .set_json(json!({ "path": file.to_str().unwrap() }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/opencode/directory")
        .set_json(json!({ "path": dir.path().join("absent").to_str().unwrap() }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], json!(false));
}

#[actix_web::test]
async fn test_forwards_with_prefix_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_healthy_api(&server, "/opencode").await;
    Mock::given(method("GET"))
        .and(path("/opencode/session"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "s1"}])))
        .mount(&server)
        .await;

    let supervisor = ready_supervisor(&server, dir.path(), "/opencode").await;
    let app = gate_app!(supervisor.clone());

    let req = test::TestRequest::get().uri("/api/session?limit=5").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body[0]["id"], "s1");

    supervisor.shutdown().await;
}

#[actix_web::test]
async fn test_forwards_body_and_keeps_upstream_status() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_healthy_api(&server, "").await;
    Mock::given(method("POST"))
        .and(path("/session/s1/message"))
        .and(header("x-client", "ui"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let supervisor = ready_supervisor(&server, dir.path(), "").await;
    let app = gate_app!(supervisor.clone());

    let req = test::TestRequest::post()
        .uri("/api/session/s1/message")
        .insert_header(("x-client", "ui"))
        .set_json(json!({"text": "hi"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    // Unknown upstream routes surface the backend's own 404
    let req = test::TestRequest::get().uri("/api/unknown").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    supervisor.shutdown().await;
}

#[actix_web::test]
async fn test_event_stream_headers() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_healthy_api(&server, "").await;
    Mock::given(method("GET"))
        .and(path("/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string("data: {\"type\":\"server.connected\"}\n\n"),
        )
        .mount(&server)
        .await;

    let supervisor = ready_supervisor(&server, dir.path(), "").await;
    let app = gate_app!(supervisor.clone());

    let req = test::TestRequest::get()
        .uri("/api/event")
        .insert_header(("accept", "text/event-stream"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");
    let body = test::read_body(resp).await;
    assert!(String::from_utf8_lossy(&body).contains("server.connected"));

    supervisor.shutdown().await;
}

#[actix_web::test]
async fn test_cors_headers_on_every_response() {
    let supervisor = BackendSupervisor::new(idle_config()).unwrap();
    let app = gate_app!(supervisor);

    let req = test::TestRequest::get()
        .uri("/api/session")
        .insert_header(("origin", "http://localhost:5173"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");

    let req = test::TestRequest::default()
        .method(Method::OPTIONS)
        .uri("/api/session")
        .insert_header(("origin", "http://localhost:5173"))
        .insert_header(("access-control-request-method", "POST"))
        .insert_header(("access-control-request-headers", "content-type"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);
    assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
    assert!(resp
        .headers()
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("POST"));
    assert_eq!(resp.headers().get("access-control-allow-headers").unwrap(), "content-type");

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
}

#[actix_web::test]
async fn test_connection_error_after_grace_is_unavailable() {
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = idle_config();
    config.backend.port = Some(closed_port);
    config.backend.api_prefix = Some(String::new());
    config.supervisor.grace_period_ms = 0;
    let supervisor = BackendSupervisor::new(config).unwrap();
    supervisor.state().write().mark_not_ready(true, None);
    let app = gate_app!(supervisor);

    let req = test::TestRequest::get().uri("/api/session").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "1");
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "OpenCode is unavailable");
    assert_eq!(body["restarting"], json!(false));
}

#[actix_web::test]
async fn test_backend_404_retries_prefix_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let script = backend_script(dir.path(), "backend.sh", &[]);
    let mut config = test_config(&script, dir.path());
    config.backend.port = Some(mock_port(&server));
    config.supervisor.grace_period_ms = 0;
    config.supervisor.discovery_backoff_initial_ms = 30_000;
    config.supervisor.discovery_backoff_max_ms = 30_000;
    let supervisor = BackendSupervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    supervisor.state().write().mark_not_ready(true, None);

    // The first discovery pass finds nothing and settles into a long backoff
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(supervisor.status().api_prefix, None);

    Mock::given(method("GET"))
        .and(path("/opencode/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let app = gate_app!(supervisor.clone());
    let req = test::TestRequest::get().uri("/api/session").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let detected = eventually(Duration::from_secs(3), || {
        supervisor.status().api_prefix.as_deref() == Some("/opencode")
    })
    .await;
    assert!(detected, "prefix not rediscovered: {:?}", supervisor.status());

    supervisor.shutdown().await;
}

#[actix_web::test]
async fn test_failed_check_after_config_write_clears_ready() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_healthy_api(&server, "").await;
    let script = backend_script(dir.path(), "backend.sh", &[]);
    let mut config = test_config(&script, dir.path());
    config.backend.port = Some(mock_port(&server));
    config.backend.api_prefix = Some(String::new());
    config.supervisor.ready_timeout_ms = 300;
    let supervisor = BackendSupervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    supervisor.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    // The write is accepted, then the backend stops answering its health contract
    server.reset().await;
    Mock::given(method("PATCH"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"theme": "light"})))
        .mount(&server)
        .await;

    let app = gate_app!(supervisor.clone());
    let req = test::TestRequest::patch()
        .uri("/api/config")
        .set_json(json!({"theme": "light"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    assert!(eventually(Duration::from_secs(3), || !supervisor.is_ready()).await);
    assert!(supervisor.status().last_error.is_some());

    supervisor.shutdown().await;
}
