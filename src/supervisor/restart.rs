//! Restart orchestration and crash handling
//!
//! A restart walks `TearingDown -> Delaying -> Launching -> AwaitingPort -> AwaitingReady`
//! and back to `Idle`. Concurrent requests join the restart already running.

use crate::error::{GateError, Result};
use crate::supervisor::manager::SupervisorInner;
use crate::supervisor::process::{ProcessState, StopOutcome};
use crate::supervisor::state::RestartPhase;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a restart was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Requested,
    Crash,
    WorkingDirectory,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::Requested => write!(f, "requested"),
            RestartReason::Crash => write!(f, "crash"),
            RestartReason::WorkingDirectory => write!(f, "working directory change"),
        }
    }
}

impl SupervisorInner {
    /// Restart the backend, joining a restart that is already running
    pub(crate) async fn restart(self: &Arc<Self>, reason: RestartReason) -> Result<()> {
        let inner = Arc::clone(self);
        let joined = self
            .restart_flight
            .run(&self.runtime, move || async move { inner.run_restart(reason).await });

        if joined.coalesced {
            info!("🔁 Restart ({}) joined the restart already in progress", reason);
        }
        joined.future.await
    }

    async fn run_restart(self: Arc<Self>, reason: RestartReason) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.shutting_down {
                return Err(GateError::restart("supervisor is shutting down"));
            }
            if reason != RestartReason::Crash {
                state.stopped = false;
            }
            state.phase = RestartPhase::TearingDown;
            state.restart_count += 1;
            state.mark_not_ready(true, None);
        }
        info!("🔄 Restarting backend ({})", reason);

        let outcome = self.restart_steps().await;

        let mut state = self.state.write();
        state.phase = RestartPhase::Idle;
        match &outcome {
            Ok(()) => info!("✅ Backend restart ({}) complete", reason),
            Err(e) => {
                error!("❌ Backend restart ({}) failed: {}", reason, e);
                state.readiness.last_error = Some(e.to_string());
            }
        }
        outcome
    }

    async fn restart_steps(self: &Arc<Self>) -> Result<()> {
        let outcome = self.teardown().await;
        debug!("Teardown outcome: {:?}", outcome);

        {
            let backend = &self.config.backend;
            let mut state = self.state.write();
            state.reset_discovery(backend.port, backend.api_prefix.as_deref());
            state.phase = RestartPhase::Delaying;
        }
        self.discovery.reset();
        tokio::time::sleep(self.config.supervisor.restart_delay()).await;

        {
            let state = self.state.read();
            if state.stopped || state.shutting_down {
                return Err(GateError::restart("backend was stopped during restart"));
            }
        }

        self.state.write().phase = RestartPhase::Launching;
        let generation = self.launch().await?;

        self.state.write().phase = RestartPhase::AwaitingPort;
        self.wait_for_port(generation, self.config.supervisor.port_wait_timeout())
            .await?;

        self.state.write().phase = RestartPhase::AwaitingReady;
        self.readiness
            .wait_until_ready(generation, self.config.supervisor.ready_timeout())
            .await
    }

    /// Stop the current process, bounded by the teardown deadline
    pub(crate) async fn teardown(&self) -> Option<StopOutcome> {
        let taken = self.process.lock().await.take();
        let (generation, process) = taken?;

        let cfg = &self.config.supervisor;
        debug!("Tearing down backend generation {}", generation);
        match tokio::time::timeout(
            cfg.teardown_deadline(),
            process.stop(cfg.graceful_stop(), cfg.kill_wait()),
        )
        .await
        {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(
                    "Backend teardown exceeded {:?}, continuing anyway",
                    cfg.teardown_deadline()
                );
                Some(StopOutcome::TimedOut)
            }
        }
    }

    /// React to a process exit reported by the event pump
    pub(crate) async fn handle_exit(self: &Arc<Self>, generation: u64, exit: ProcessState) {
        // Teardown takes the process out of the slot first; an exit for a process that is
        // still in the slot was not asked for
        let unexpected = {
            let mut slot = self.process.lock().await;
            match slot.as_ref() {
                Some((current, _)) if *current == generation => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };

        let should_restart = {
            let mut state = self.state.write();
            let halted = state.stopped || state.shutting_down;
            let recorded = if halted {
                state.record_exit(generation, ProcessState::Stopped)
            } else {
                state.record_exit(generation, exit.clone())
            };
            if !recorded {
                debug!("Ignoring exit of stale backend generation {}", generation);
                return;
            }

            if unexpected && !halted {
                let message = format!("Backend {}", exit);
                warn!("💥 {} unexpectedly, restarting", message);
                state.mark_not_ready(true, Some(message));
                true
            } else {
                info!("Backend generation {} {}", generation, exit);
                false
            }
        };

        if !should_restart {
            return;
        }

        tokio::time::sleep(self.config.supervisor.crash_restart_delay()).await;

        {
            let state = self.state.read();
            if state.stopped || state.shutting_down || !state.is_current(generation) {
                debug!("Crash restart for generation {} no longer needed", generation);
                return;
            }
        }

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Err(e) = inner.restart(RestartReason::Crash).await {
                warn!("Crash restart failed: {}", e);
            }
        });
    }
}
