//! Shared helpers: a scripted backend process and a wiremock backend API

#![allow(dead_code)]

use agentgate::config::Config;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Write an executable `/bin/sh` script with `body`
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join(name);
    std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

/// A backend that prints `lines` and then stays alive
#[cfg(unix)]
pub fn backend_script(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let mut body = String::new();
    for line in lines {
        body.push_str(&format!("echo '{}'\n", line));
    }
    body.push_str("exec sleep 300");
    write_script(dir, name, &body)
}

/// A backend that announces `port` in its output
#[cfg(unix)]
pub fn announcing_backend(dir: &Path, port: u16) -> PathBuf {
    backend_script(
        dir,
        "backend.sh",
        &[format!("opencode server listening on http://127.0.0.1:{}", port)],
    )
}

/// Configuration with short timings pointing at `script`
pub fn test_config(script: &Path, working_dir: &Path) -> Config {
    let mut config = Config::default();
    config.backend.binary = Some(script.to_path_buf());
    config.backend.args = Vec::new();
    config.backend.use_shell_path = false;
    config.backend.working_dir = Some(working_dir.to_path_buf());

    let s = &mut config.supervisor;
    s.graceful_stop_ms = 1_000;
    s.kill_wait_ms = 1_000;
    s.teardown_deadline_ms = 3_000;
    s.restart_delay_ms = 10;
    s.crash_restart_delay_ms = 50;
    s.port_wait_timeout_ms = 5_000;
    s.ready_timeout_ms = 5_000;
    s.poll_interval_ms = 50;
    s.probe_timeout_ms = 1_000;
    s.discovery_backoff_initial_ms = 50;
    s.discovery_backoff_max_ms = 200;
    s.agent_wait_timeout_ms = 2_000;

    config.terminal.enabled = false;
    config
}

/// Mount the full health contract under `prefix`
pub async fn mount_healthy_api(server: &MockServer, prefix: &str) {
    Mock::given(method("GET"))
        .and(path(format!("{}/health", prefix)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"isOpenCodeReady": true})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/config", prefix)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"theme": "dark"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/agent", prefix)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"name": "build"}, {"name": "plan"}])))
        .mount(server)
        .await;
}

pub fn mock_port(server: &MockServer) -> u16 {
    server.address().port()
}

/// Poll `check` every 20ms until it holds or `limit` passes
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
