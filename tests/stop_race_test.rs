//! An explicit stop wins over a launch that is still resolving PATH
//!
//! Kept in its own binary: it points `SHELL` at a slow script for the whole process.

#![cfg(unix)]

mod common;

use agentgate::supervisor::{BackendSupervisor, ProcessState};
use common::*;
use std::time::Duration;

#[tokio::test]
async fn test_stop_during_launch_prevents_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let slow_shell = write_script(dir.path(), "slow-shell.sh", "sleep 2");
    std::env::set_var("SHELL", &slow_shell);

    let script = backend_script(dir.path(), "backend.sh", &[]);
    let mut config = test_config(&script, dir.path());
    config.backend.use_shell_path = true;
    config.backend.port = Some(1);
    config.backend.api_prefix = Some(String::new());
    let supervisor = BackendSupervisor::new(config).unwrap();

    let starting = supervisor.clone();
    let start = tokio::spawn(async move { starting.start().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    supervisor.stop().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), start)
        .await
        .expect("start did not finish")
        .unwrap();
    assert!(result.is_err());

    let status = supervisor.status();
    assert!(status.stopped);
    assert_eq!(status.pid, None);
    assert_eq!(status.process, ProcessState::Stopped);
    assert!(!status.process.is_alive());

    // A later explicit start is honoured
    supervisor.start().await.unwrap();
    let status = supervisor.status();
    assert!(!status.stopped);
    assert_eq!(status.process, ProcessState::Running);

    supervisor.shutdown().await;
}
