//! Port and prefix discovery against a live backend process

#![cfg(unix)]

mod common;

use agentgate::supervisor::{BackendSupervisor, PortSource};
use common::*;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_port_scraped_from_output() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_healthy_api(&server, "").await;

    let script = announcing_backend(dir.path(), mock_port(&server));
    let supervisor = BackendSupervisor::new(test_config(&script, dir.path())).unwrap();
    supervisor.start().await.unwrap();
    supervisor.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.backend_port, Some(mock_port(&server)));
    assert_eq!(status.port_source, Some(PortSource::Discovered));
    assert_eq!(status.api_prefix, Some(String::new()));
    assert!(status.recent_output.iter().any(|l| l.contains("listening on")));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_prefix_from_documentation_marker() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"<script>window.__API_BASE__ = "/opencode/";</script>"#),
        )
        .mount(&server)
        .await;
    mount_healthy_api(&server, "/opencode").await;

    let script = announcing_backend(dir.path(), mock_port(&server));
    let supervisor = BackendSupervisor::new(test_config(&script, dir.path())).unwrap();
    supervisor.start().await.unwrap();
    supervisor.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    assert_eq!(supervisor.status().api_prefix, Some("/opencode".to_string()));
    let route = supervisor.route_snapshot();
    assert!(!route.gated);
    assert_eq!(route.prefix.as_forward_prefix(), "/opencode");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_root_404_falls_through_to_next_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    // Nothing answers at the root; only the /api candidate serves the contract
    mount_healthy_api(&server, "/api").await;

    let script = announcing_backend(dir.path(), mock_port(&server));
    let supervisor = BackendSupervisor::new(test_config(&script, dir.path())).unwrap();
    supervisor.start().await.unwrap();
    supervisor.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    assert_eq!(supervisor.status().api_prefix, Some("/api".to_string()));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_configured_prefix_skips_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_healthy_api(&server, "/custom").await;

    let script = backend_script(dir.path(), "quiet.sh", &[]);
    let mut config = test_config(&script, dir.path());
    config.backend.port = Some(mock_port(&server));
    config.backend.api_prefix = Some("/custom".to_string());

    let supervisor = BackendSupervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    supervisor.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.port_source, Some(PortSource::Configured));
    assert_eq!(status.api_prefix, Some("/custom".to_string()));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_missing_port_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let script = backend_script(dir.path(), "silent.sh", &["starting up".to_string()]);
    let mut config = test_config(&script, dir.path());
    config.supervisor.port_wait_timeout_ms = 300;

    let supervisor = BackendSupervisor::new(config).unwrap();
    supervisor.start().await.unwrap();

    let err = supervisor
        .wait_until_ready(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("port"));
    assert!(!supervisor.is_ready());
    assert_eq!(supervisor.status().backend_port, None);
    assert_eq!(supervisor.route_snapshot().authority, "127.0.0.1:1");

    supervisor.shutdown().await;
}
