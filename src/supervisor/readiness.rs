//! Readiness monitor
//!
//! A backend is ready once health, configuration, and agent listing all answer against
//! the same prefix in one polling iteration.

use crate::error::{GateError, Result};
use crate::supervisor::probe::{ProbeClient, ProbeOutcome};
use crate::supervisor::state::SharedState;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Endpoint paths of the health contract, relative to the API prefix
#[derive(Debug, Clone)]
pub struct HealthContract {
    pub health_path: String,
    pub config_path: String,
    pub agent_path: String,
}

/// Outcome of one pass over the candidates
enum Iteration {
    Ready,
    NotYet(String),
    Abort(GateError),
}

/// Polls the backend until it satisfies the health contract
pub struct ReadinessMonitor {
    state: SharedState,
    probe: ProbeClient,
    contract: HealthContract,
    candidates: Vec<String>,
    poll_interval: Duration,
}

impl ReadinessMonitor {
    pub fn new(
        state: SharedState,
        probe: ProbeClient,
        contract: HealthContract,
        candidates: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state,
            probe,
            contract,
            candidates,
            poll_interval,
        }
    }

    /// Poll until ready, the deadline passes, or the generation is replaced
    pub async fn wait_until_ready(&self, generation: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut last_error = String::from("backend has not answered yet");

        loop {
            match self.iteration(generation).await {
                Iteration::Ready => return Ok(()),
                Iteration::Abort(e) => {
                    self.state.write().record_error(generation, e.to_string());
                    return Err(e);
                }
                Iteration::NotYet(reason) => {
                    debug!("Backend not ready yet: {}", reason);
                    last_error = reason;
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                let message = format!(
                    "Backend not ready after {:?}: {}",
                    timeout, last_error
                );
                warn!("⏱️ {}", message);
                self.state.write().record_error(generation, message.clone());
                return Err(GateError::readiness(message));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn iteration(&self, generation: u64) -> Iteration {
        let (port, detected) = {
            let state = self.state.read();
            if !state.is_current(generation) {
                return Iteration::Abort(GateError::restart(
                    "backend was replaced while waiting for readiness",
                ));
            }
            if state.shutting_down || state.stopped {
                return Iteration::Abort(GateError::readiness("backend was stopped"));
            }
            if !state.process.is_alive() {
                return Iteration::Abort(GateError::readiness(format!(
                    "backend {} before becoming ready",
                    state.process
                )));
            }
            (state.backend_port(), state.prefix.value().map(str::to_string))
        };

        let port = match port {
            Some(port) => port,
            None => return Iteration::NotYet("backend port not known yet".to_string()),
        };

        let candidates = match detected {
            Some(ref prefix) => vec![prefix.clone()],
            None => self.candidates.clone(),
        };

        let mut last = String::new();
        for candidate in candidates {
            match self.check_contract(generation, port, &candidate).await {
                ProbeOutcome::Success(effective) => {
                    let mut state = self.state.write();
                    if detected.is_none() {
                        state.detect_prefix(generation, &effective);
                    }
                    if state.mark_ready(generation) {
                        info!(
                            "✅ Backend ready on port {} (prefix {:?})",
                            port,
                            state.prefix.as_forward_prefix()
                        );
                        return Iteration::Ready;
                    }
                    return Iteration::NotYet("backend state changed during the check".to_string());
                }
                ProbeOutcome::Retry(e) => {
                    if e.is_not_found() && candidate.is_empty() && detected.is_none() {
                        debug!("Root prefix answered 404, trying next candidate");
                    }
                    last = e.message;
                }
                ProbeOutcome::Fatal(e) => return Iteration::Abort(GateError::readiness(e)),
            }
        }

        self.state.write().record_error(generation, last.clone());
        Iteration::NotYet(last)
    }

    /// Health, then configuration, then agent listing against one prefix
    ///
    /// On success returns the prefix the backend actually serves. A redirect that lands on
    /// a different prefix promotes that prefix right away, even if a later step fails.
    async fn check_contract(&self, generation: u64, port: u16, prefix: &str) -> ProbeOutcome<String> {
        let mut effective: Option<String> = None;

        let revealed = match self.probe.health(port, prefix, &self.contract.health_path).await {
            ProbeOutcome::Success(probed) => probed.effective_prefix,
            other => return other.map(|_| String::new()),
        };
        self.note_redirect(generation, prefix, revealed, &mut effective);

        let revealed = match self.probe.config(port, prefix, &self.contract.config_path).await {
            ProbeOutcome::Success(probed) => probed.effective_prefix,
            other => return other.map(|_| String::new()),
        };
        self.note_redirect(generation, prefix, revealed, &mut effective);

        let revealed = match self.probe.agents(port, prefix, &self.contract.agent_path).await {
            ProbeOutcome::Success(probed) => probed.effective_prefix,
            other => return other.map(|_| String::new()),
        };
        self.note_redirect(generation, prefix, revealed, &mut effective);

        ProbeOutcome::Success(effective.unwrap_or_else(|| prefix.to_string()))
    }

    fn note_redirect(
        &self,
        generation: u64,
        requested: &str,
        revealed: Option<String>,
        effective: &mut Option<String>,
    ) {
        let found = match revealed {
            Some(found) if found != requested && effective.is_none() => found,
            _ => return,
        };
        if self.state.write().detect_prefix(generation, &found) {
            info!("🧭 Backend API prefix revealed by redirect: {:?}", found);
        }
        *effective = Some(found);
    }

    /// Poll the agent listing until `agent` shows up
    pub async fn wait_for_agent(&self, generation: u64, agent: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let (port, prefix) = {
                let state = self.state.read();
                if !state.is_current(generation) {
                    return Err(GateError::restart(
                        "backend was replaced while waiting for the agent",
                    ));
                }
                (state.backend_port(), state.prefix.as_forward_prefix().to_string())
            };

            if let Some(port) = port {
                match self.probe.agents(port, &prefix, &self.contract.agent_path).await {
                    ProbeOutcome::Success(probed) if probed.value.iter().any(|n| n == agent) => {
                        info!("🤖 Agent '{}' is available", agent);
                        return Ok(());
                    }
                    ProbeOutcome::Success(_) => debug!("Agent '{}' not listed yet", agent),
                    ProbeOutcome::Retry(e) => debug!("Agent listing failed: {}", e),
                    ProbeOutcome::Fatal(e) => return Err(GateError::readiness(e)),
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(GateError::readiness(format!(
                    "Agent '{}' did not appear within {:?}",
                    agent, timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
