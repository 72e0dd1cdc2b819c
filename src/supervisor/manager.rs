//! Backend supervisor facade
//!
//! [`BackendSupervisor`] owns the backend process and all state derived from it. It is
//! created once and handed to the proxy gate, the control channel, and the terminal API.

use crate::config::Config;
use crate::error::{GateError, Result};
use crate::supervisor::discovery::{normalize_prefix, DiscoveryEngine, DiscoverySettings};
use crate::supervisor::inflight::InFlight;
use crate::supervisor::probe::ProbeClient;
use crate::supervisor::process::{BackendProcess, LaunchSpec, ProcessEvent, ProcessState};
use crate::supervisor::readiness::{HealthContract, ReadinessMonitor};
use crate::supervisor::restart::RestartReason;
use crate::supervisor::shell_path;
use crate::supervisor::state::{ApiPrefix, SharedState, SupervisorState};
use crate::supervisor::types::{DirectoryChange, ServerInfo, SupervisorStatus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// How often the port wait re-reads the state
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the gate needs to route one request, read under a single lock
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    /// Answer 503 `restarting` instead of forwarding
    pub gated: bool,
    pub restarting: bool,
    pub stopped: bool,
    /// `host:port` of the backend, or the unreachable sentinel
    pub authority: String,
    pub prefix: ApiPrefix,
    pub generation: u64,
}

pub(crate) struct SupervisorInner {
    pub(crate) config: Config,
    pub(crate) state: SharedState,
    pub(crate) discovery: Arc<DiscoveryEngine>,
    pub(crate) readiness: ReadinessMonitor,
    pub(crate) restart_flight: InFlight<()>,
    /// Current process, tagged with its generation
    pub(crate) process: Mutex<Option<(u64, BackendProcess)>>,
    directory_lock: Mutex<()>,
    gate_port: AtomicU16,
    pub(crate) runtime: Handle,
}

/// Supervisor of the backend process
#[derive(Clone)]
pub struct BackendSupervisor {
    inner: Arc<SupervisorInner>,
}

impl BackendSupervisor {
    /// Build a supervisor; must be called from within a tokio runtime
    pub fn new(config: Config) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| GateError::config(format!("Supervisor needs a tokio runtime: {}", e)))?;

        let working_dir = config.backend.effective_working_dir();
        let mut initial = SupervisorState::new(working_dir, config.supervisor.recent_output_lines);
        initial.reset_discovery(config.backend.port, config.backend.api_prefix.as_deref());
        let state = initial.shared();

        let probe = ProbeClient::new(config.supervisor.probe_timeout())?;
        let candidates: Vec<String> = config
            .backend
            .prefix_candidates
            .iter()
            .map(|c| normalize_prefix(c))
            .collect();

        let discovery = Arc::new(DiscoveryEngine::new(
            state.clone(),
            probe.clone(),
            DiscoverySettings {
                candidates: candidates.clone(),
                doc_path: config.backend.doc_path.clone(),
                config_path: config.backend.config_path.clone(),
                backoff_initial: config.supervisor.discovery_backoff_initial(),
                backoff_max: config.supervisor.discovery_backoff_max(),
            },
            runtime.clone(),
        ));

        let readiness = ReadinessMonitor::new(
            state.clone(),
            probe,
            HealthContract {
                health_path: config.backend.health_path.clone(),
                config_path: config.backend.config_path.clone(),
                agent_path: config.backend.agent_path.clone(),
            },
            candidates,
            config.supervisor.poll_interval(),
        );

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config,
                state,
                discovery,
                readiness,
                restart_flight: InFlight::new("restart"),
                process: Mutex::new(None),
                directory_lock: Mutex::new(()),
                gate_port: AtomicU16::new(0),
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Shared state handle (read-mostly; used by the gate and tests)
    pub fn state(&self) -> SharedState {
        self.inner.state.clone()
    }

    /// Record the port the gate actually bound
    pub fn set_gate_port(&self, port: u16) {
        self.inner.gate_port.store(port, Ordering::SeqCst);
    }

    pub fn gate_port(&self) -> u16 {
        self.inner.gate_port.load(Ordering::SeqCst)
    }

    /// Launch the backend; readiness is awaited in the background
    ///
    /// Only a launch failure is returned. Port and readiness problems are recorded as the
    /// last error and visible through [`status`](Self::status).
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            if state.shutting_down {
                return Err(GateError::restart("supervisor is shutting down"));
            }
            state.stopped = false;
            if state.process.is_alive() {
                debug!("Backend already running, start is a no-op");
                return Ok(());
            }
        }

        let generation = self.inner.launch().await?;
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Err(e) = inner.bring_up(generation).await {
                warn!("Backend did not become ready: {}", e);
            }
        });
        Ok(())
    }

    /// Wait for the current process to pass the health contract
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let generation = self.inner.state.read().generation;
        self.inner.wait_for_port(generation, timeout).await?;
        self.inner.readiness.wait_until_ready(generation, timeout).await
    }

    /// Re-run the readiness check, e.g. after the backend configuration changed
    ///
    /// A failed check takes the backend out of the ready state.
    pub async fn verify_readiness(&self) -> Result<()> {
        let generation = self.inner.state.read().generation;
        let result = self
            .inner
            .readiness
            .wait_until_ready(generation, self.inner.config.supervisor.ready_timeout())
            .await;

        if let Err(e) = &result {
            let mut state = self.inner.state.write();
            if state.is_current(generation) {
                state.mark_not_ready(true, Some(e.to_string()));
            }
        }
        result
    }

    /// Restart the backend; concurrent callers share one restart
    pub async fn restart(&self) -> Result<()> {
        self.inner.restart(RestartReason::Requested).await
    }

    /// Restart, then wait until `agent` appears in the agent listing
    pub async fn restart_and_wait_for_agent(&self, agent: &str) -> Result<()> {
        self.inner.restart(RestartReason::Requested).await?;
        let generation = self.inner.state.read().generation;
        self.inner
            .readiness
            .wait_for_agent(generation, agent, self.inner.config.supervisor.agent_wait_timeout())
            .await
    }

    /// Stop the backend without restarting it
    pub async fn stop(&self) -> Result<()> {
        info!("⏹️ Stopping backend");
        {
            let mut state = self.inner.state.write();
            state.stopped = true;
            state.mark_not_ready(false, None);
        }

        let outcome = self.inner.teardown().await;
        debug!("Backend teardown outcome: {:?}", outcome);

        let mut state = self.inner.state.write();
        state.process = ProcessState::Stopped;
        state.pid = None;
        state.started_at = None;
        Ok(())
    }

    /// Stop for good; no further restarts happen
    pub async fn shutdown(&self) {
        info!("🛑 Supervisor shutting down");
        self.inner.state.write().shutting_down = true;
        if let Err(e) = self.stop().await {
            warn!("Error while stopping backend during shutdown: {}", e);
        }
    }

    /// Point the backend at another directory, restarting it when something changed
    pub async fn set_working_directory(&self, raw: &str) -> Result<DirectoryChange> {
        let _guard = self.inner.directory_lock.lock().await;

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GateError::validation("Directory path is required"));
        }

        let path = expand_home(trimmed);
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_dir() {
            return Err(GateError::validation(format!(
                "Specified path is not a directory: {}",
                path.display()
            )));
        }
        let path = tokio::fs::canonicalize(&path).await.unwrap_or(path);

        let unchanged = {
            let state = self.inner.state.read();
            state.working_dir == path && state.backend_port().is_some() && state.process.is_alive()
        };
        if unchanged {
            debug!("Working directory unchanged ({}), no restart", path.display());
            return Ok(DirectoryChange {
                path: path.display().to_string(),
                restarted: false,
            });
        }

        info!("📂 Switching backend working directory to {}", path.display());
        self.inner.state.write().working_dir = path.clone();
        self.inner.restart(RestartReason::WorkingDirectory).await?;

        Ok(DirectoryChange {
            path: path.display().to_string(),
            restarted: true,
        })
    }

    /// Ask discovery to look for the prefix again (no-op once detected)
    pub fn trigger_prefix_discovery(&self) {
        self.inner.discovery.trigger();
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.read().readiness.is_ready
    }

    pub fn is_restarting(&self) -> bool {
        self.inner.state.read().is_restarting()
    }

    pub fn working_directory(&self) -> PathBuf {
        self.inner.state.read().working_dir.clone()
    }

    pub fn server_info(&self) -> ServerInfo {
        let state = self.inner.state.read();
        ServerInfo {
            port: self.gate_port(),
            backend_port: state.backend_port(),
            host: self.inner.config.server.host.clone(),
            ready: state.readiness.is_ready,
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.inner.state.read();
        SupervisorStatus {
            ready: state.readiness.is_ready,
            restarting: state.is_restarting(),
            phase: state.phase,
            stopped: state.stopped,
            backend_port: state.backend_port(),
            port_source: state.port.map(|b| b.source),
            api_prefix: state.prefix.value().map(str::to_string),
            last_error: state.readiness.last_error.clone(),
            process: state.process.clone(),
            pid: state.pid,
            uptime_seconds: state.started_at.map(|t| t.elapsed().as_secs()),
            restart_count: state.restart_count,
            generation: state.generation,
            working_directory: state.working_dir.display().to_string(),
            recent_output: state.recent_output(),
        }
    }

    /// Routing decision inputs for one request
    pub fn route_snapshot(&self) -> RouteSnapshot {
        let grace = self.inner.config.supervisor.grace_period();
        let state = self.inner.state.read();
        RouteSnapshot {
            gated: state.readiness.should_gate(grace, Instant::now()),
            restarting: state.is_restarting(),
            stopped: state.stopped || state.shutting_down,
            authority: state.upstream_authority(),
            prefix: state.prefix.clone(),
            generation: state.generation,
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(raw).to_path_buf()
}

impl SupervisorInner {
    /// Spawn a new backend process under a fresh generation
    pub(crate) async fn launch(self: &Arc<Self>) -> Result<u64> {
        let backend = &self.config.backend;
        let path = shell_path::augmented_path(backend.use_shell_path).await;
        let program = shell_path::resolve_program(backend.binary.as_deref(), &backend.command, &path);

        // Held until the new process is in the slot, so a concurrent stop either prevents
        // the spawn or finds the process to tear down
        let mut slot = self.process.lock().await;

        let (generation, cwd) = {
            let mut state = self.state.write();
            if state.stopped || state.shutting_down {
                return Err(GateError::restart("backend was stopped before it could launch"));
            }
            let generation = state.begin_generation(backend.port, backend.api_prefix.as_deref());
            state.clear_output();
            (generation, state.working_dir.clone())
        };
        self.discovery.reset();

        let mut args = backend.args.clone();
        args.push("--port".to_string());
        args.push(backend.port.unwrap_or(0).to_string());

        let mut env: Vec<(String, String)> = backend
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("PATH".to_string(), path));

        let spec = LaunchSpec {
            program,
            args,
            cwd,
            env,
        };
        info!(
            "🚀 Launching backend (generation {}): {} in {}",
            generation,
            spec.display_command(),
            spec.cwd.display()
        );

        match BackendProcess::start(&spec) {
            Ok((process, events)) => {
                self.state.write().record_spawned(generation, process.pid());
                let previous = slot.replace((generation, process));
                drop(slot);
                if let Some((old_generation, _)) = previous {
                    // Dropping the handle kills it
                    warn!("Replaced a live backend handle from generation {}", old_generation);
                }
                self.spawn_event_pump(generation, events);
                if !self.state.read().prefix.is_detected() {
                    self.discovery.trigger();
                }
                Ok(generation)
            }
            Err(e) => {
                error!("❌ Failed to launch backend: {}", e);
                self.state.write().record_launch_failure(generation, e.to_string());
                Err(e.into())
            }
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, generation: u64, mut events: mpsc::Receiver<ProcessEvent>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Stdout(line) => {
                        info!("[backend] {}", line);
                        inner.observe(generation, line);
                    }
                    ProcessEvent::Stderr(line) => {
                        warn!("[backend] {}", line);
                        inner.observe(generation, line);
                    }
                    ProcessEvent::Exited(exit) => {
                        inner.handle_exit(generation, exit).await;
                        break;
                    }
                }
            }
        });
    }

    fn observe(&self, generation: u64, line: String) {
        self.discovery.observe_line(generation, &line);
        let mut state = self.state.write();
        if state.is_current(generation) {
            state.push_output(line);
        }
    }

    /// Port wait, then readiness; used after a fresh start
    async fn bring_up(self: Arc<Self>, generation: u64) -> Result<()> {
        self.wait_for_port(generation, self.config.supervisor.port_wait_timeout())
            .await?;
        self.readiness
            .wait_until_ready(generation, self.config.supervisor.ready_timeout())
            .await
    }

    /// Wait until the generation has a port (configured ports are known immediately)
    pub(crate) async fn wait_for_port(&self, generation: u64, timeout: Duration) -> Result<u16> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.read();
                if !state.is_current(generation) {
                    return Err(GateError::restart("backend was replaced while waiting for its port"));
                }
                if let Some(port) = state.backend_port() {
                    return Ok(port);
                }
                if !state.process.is_alive() {
                    return Err(GateError::discovery(format!(
                        "backend {} before reporting a port",
                        state.process
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let message = format!("backend did not report a port within {:?}", timeout);
                self.state.write().record_error(generation, message.clone());
                return Err(GateError::discovery(message));
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }
}
