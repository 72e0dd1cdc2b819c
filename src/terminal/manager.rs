//! Terminal session lifecycle: create, drive, stream, close, and idle reaping

use crate::config::TerminalConfig;
use crate::error::{GateError, Result};
use crate::terminal::registry::IdleRegistry;
use crate::terminal::session::{TerminalEvent, TerminalSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct TerminalManager {
    config: TerminalConfig,
    sessions: IdleRegistry<Arc<TerminalSession>>,
}

/// A subscription to a session's output
pub struct TerminalStream {
    /// Set when the shell had already ended at subscription time
    pub already_exited: bool,
    pub events: broadcast::Receiver<TerminalEvent>,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            sessions: IdleRegistry::new(),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start a shell; `cwd` falls back to `default_cwd`
    pub fn create(&self, cols: u16, rows: u16, cwd: Option<&str>, default_cwd: &Path) -> Result<String> {
        let cwd = match cwd.map(str::trim).filter(|c| !c.is_empty()) {
            Some(requested) => {
                let path = PathBuf::from(requested);
                if !path.is_dir() {
                    return Err(GateError::validation(format!(
                        "Terminal directory does not exist: {}",
                        path.display()
                    )));
                }
                path
            }
            None => default_cwd.to_path_buf(),
        };

        let id = uuid::Uuid::new_v4().to_string();
        let shell = self.config.resolve_shell();
        let session = TerminalSession::spawn(id.clone(), &shell, &cwd, cols, rows)?;
        self.sessions.insert(id.clone(), session, Instant::now());

        info!("🖥️ Terminal {} started ({} in {})", id, shell, cwd.display());
        Ok(id)
    }

    fn active(&self, id: &str) -> Result<Arc<TerminalSession>> {
        self.sessions
            .touch(id, Instant::now())
            .ok_or_else(|| not_found(id))
    }

    pub fn input(&self, id: &str, data: &str) -> Result<()> {
        self.active(id)?.write(data)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.active(id)?.resize(cols, rows)
    }

    pub fn stream(&self, id: &str) -> Result<TerminalStream> {
        let session = self.active(id)?;
        let events = session.subscribe();
        Ok(TerminalStream {
            already_exited: session.has_exited(),
            events,
        })
    }

    pub fn close(&self, id: &str) -> Result<()> {
        let session = self.sessions.remove(id).ok_or_else(|| not_found(id))?;
        session.kill();
        info!("Terminal {} closed", id);
        Ok(())
    }

    /// Close sessions idle longer than the configured timeout; returns how many
    pub fn reap_idle(&self, now: Instant) -> usize {
        let reaped = self.sessions.reap(now, self.config.idle_timeout());
        for (id, session) in &reaped {
            info!("⌛ Terminal {} idle for over {:?}, closing", id, self.config.idle_timeout());
            session.kill();
        }
        reaped.len()
    }

    /// Periodic reaper; stops when the manager is dropped
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.reap_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let reaped = manager.reap_idle(Instant::now());
                if reaped > 0 {
                    debug!("Reaped {} idle terminal session(s)", reaped);
                }
            }
        })
    }

    pub fn close_all(&self) {
        for (id, session) in self.sessions.drain() {
            debug!("Closing terminal {} on shutdown", id);
            session.kill();
        }
    }
}

fn not_found(id: &str) -> GateError {
    GateError::not_found(format!("Terminal session {}", id))
}
