//! Shared supervisor state
//!
//! Everything the proxy gate and the supervisor tasks need to agree on lives in one
//! [`SupervisorState`] behind a single lock. Writers tag their updates with the process
//! generation they were computed for, so results from a replaced process are dropped.

use crate::supervisor::process::ProcessState;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle to the supervisor state
pub type SharedState = Arc<RwLock<SupervisorState>>;

/// Upstream used while no port is known; nothing listens on port 1.
pub const SENTINEL_UPSTREAM: &str = "127.0.0.1:1";

/// Where the backend port came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSource {
    Configured,
    Discovered,
}

/// Port the current backend process listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub port: u16,
    pub source: PortSource,
}

/// Normalized API path prefix of the backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApiPrefix {
    #[default]
    Undetected,
    Detected(String),
}

impl ApiPrefix {
    pub fn is_detected(&self) -> bool {
        matches!(self, ApiPrefix::Detected(_))
    }

    /// Detected value, or `None` while undetected
    pub fn value(&self) -> Option<&str> {
        match self {
            ApiPrefix::Detected(p) => Some(p.as_str()),
            ApiPrefix::Undetected => None,
        }
    }

    /// Prefix to use when building a forward target (empty while undetected)
    pub fn as_forward_prefix(&self) -> &str {
        self.value().unwrap_or("")
    }
}

/// Readiness of the backend as seen by the gate
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    pub is_ready: bool,
    /// Start of the current grace window; `None` means no window was started
    pub not_ready_since: Option<Instant>,
    pub last_error: Option<String>,
}

impl ReadinessState {
    /// Whether an inbound request should get a 503 `restarting` answer right now
    ///
    /// Not ready with no grace window started gates traffic, as does a window that is
    /// still open. Once the window has elapsed requests are forwarded and fail on their own.
    pub fn should_gate(&self, grace: Duration, now: Instant) -> bool {
        if self.is_ready {
            return false;
        }
        match self.not_ready_since {
            None => true,
            Some(since) => now.saturating_duration_since(since) < grace,
        }
    }
}

/// Phase of the restart state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPhase {
    #[default]
    Idle,
    TearingDown,
    Delaying,
    Launching,
    AwaitingPort,
    AwaitingReady,
}

/// The state bundle
#[derive(Debug)]
pub struct SupervisorState {
    /// Incremented on every launch
    pub generation: u64,
    pub port: Option<PortBinding>,
    pub prefix: ApiPrefix,
    pub readiness: ReadinessState,
    pub process: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub working_dir: PathBuf,
    pub phase: RestartPhase,
    pub restart_count: u32,
    /// Set by an explicit stop; cleared only by an explicit start or restart
    pub stopped: bool,
    /// Set once on shutdown; never cleared
    pub shutting_down: bool,
    recent_output: VecDeque<String>,
    recent_output_limit: usize,
}

impl SupervisorState {
    pub fn new(working_dir: PathBuf, recent_output_limit: usize) -> Self {
        Self {
            generation: 0,
            port: None,
            prefix: ApiPrefix::Undetected,
            readiness: ReadinessState::default(),
            process: ProcessState::NotStarted,
            pid: None,
            started_at: None,
            working_dir,
            phase: RestartPhase::Idle,
            restart_count: 0,
            stopped: false,
            shutting_down: false,
            recent_output: VecDeque::new(),
            recent_output_limit: recent_output_limit.max(1),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    pub fn is_restarting(&self) -> bool {
        self.phase != RestartPhase::Idle
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn backend_port(&self) -> Option<u16> {
        self.port.map(|b| b.port)
    }

    /// `host:port` of the current backend, or the sentinel when unknown
    pub fn upstream_authority(&self) -> String {
        match self.port {
            Some(binding) => format!("127.0.0.1:{}", binding.port),
            None => SENTINEL_UPSTREAM.to_string(),
        }
    }

    /// Open a new generation for a process about to be launched
    pub fn begin_generation(&mut self, configured_port: Option<u16>, configured_prefix: Option<&str>) -> u64 {
        self.generation += 1;
        self.reset_discovery(configured_port, configured_prefix);
        self.process = ProcessState::Starting;
        self.pid = None;
        self.started_at = None;
        self.generation
    }

    /// Forget everything learned about the previous process
    pub fn reset_discovery(&mut self, configured_port: Option<u16>, configured_prefix: Option<&str>) {
        self.port = configured_port.map(|port| PortBinding {
            port,
            source: PortSource::Configured,
        });
        self.prefix = match configured_prefix {
            Some(p) => ApiPrefix::Detected(p.to_string()),
            None => ApiPrefix::Undetected,
        };
        self.readiness.is_ready = false;
    }

    pub fn record_spawned(&mut self, generation: u64, pid: Option<u32>) {
        if self.is_current(generation) {
            self.process = ProcessState::Running;
            self.pid = pid;
            self.started_at = Some(Instant::now());
        }
    }

    pub fn record_exit(&mut self, generation: u64, state: ProcessState) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.process = state;
        self.pid = None;
        self.started_at = None;
        true
    }

    pub fn record_launch_failure(&mut self, generation: u64, reason: String) {
        if self.is_current(generation) {
            self.process = ProcessState::FailedToStart { reason: reason.clone() };
            self.readiness.is_ready = false;
            self.readiness.last_error = Some(reason);
        }
    }

    /// Adopt a scraped port; only the first one for a generation is kept
    pub fn adopt_port(&mut self, generation: u64, port: u16) -> bool {
        if !self.is_current(generation) || self.port.is_some() {
            return false;
        }
        self.port = Some(PortBinding {
            port,
            source: PortSource::Discovered,
        });
        true
    }

    /// Fix the prefix for a generation; later detections are ignored
    pub fn detect_prefix(&mut self, generation: u64, prefix: &str) -> bool {
        if !self.is_current(generation) || self.prefix.is_detected() {
            return false;
        }
        self.prefix = ApiPrefix::Detected(prefix.to_string());
        true
    }

    pub fn mark_ready(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.port.is_none() || !self.prefix.is_detected() {
            return false;
        }
        self.readiness = ReadinessState {
            is_ready: true,
            not_ready_since: None,
            last_error: None,
        };
        true
    }

    /// Force not-ready; `start_grace` opens a grace window if none is open yet
    pub fn mark_not_ready(&mut self, start_grace: bool, error: Option<String>) {
        self.readiness.is_ready = false;
        if start_grace && self.readiness.not_ready_since.is_none() {
            self.readiness.not_ready_since = Some(Instant::now());
        }
        if error.is_some() {
            self.readiness.last_error = error;
        }
    }

    pub fn record_error(&mut self, generation: u64, error: String) {
        if self.is_current(generation) {
            self.readiness.last_error = Some(error);
        }
    }

    pub fn push_output(&mut self, line: String) {
        self.recent_output.push_back(line);
        while self.recent_output.len() > self.recent_output_limit {
            self.recent_output.pop_front();
        }
    }

    pub fn recent_output(&self) -> Vec<String> {
        self.recent_output.iter().cloned().collect()
    }

    pub fn clear_output(&mut self) {
        self.recent_output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SupervisorState {
        SupervisorState::new(PathBuf::from("/tmp"), 3)
    }

    #[test]
    fn test_grace_window() {
        let grace = Duration::from_secs(12);
        let now = Instant::now();

        let mut readiness = ReadinessState::default();
        assert!(readiness.should_gate(grace, now), "no window started gates traffic");

        readiness.not_ready_since = Some(now);
        assert!(readiness.should_gate(grace, now + Duration::from_secs(11)));
        assert!(!readiness.should_gate(grace, now + Duration::from_secs(12)));

        readiness.is_ready = true;
        assert!(!readiness.should_gate(grace, now));
    }

    #[test]
    fn test_first_port_wins() {
        let mut s = state();
        let gen = s.begin_generation(None, None);
        assert!(s.adopt_port(gen, 4096));
        assert!(!s.adopt_port(gen, 5000));
        assert_eq!(s.backend_port(), Some(4096));
        assert_eq!(s.upstream_authority(), "127.0.0.1:4096");
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut s = state();
        let old = s.begin_generation(None, None);
        let new = s.begin_generation(None, None);
        assert!(!s.adopt_port(old, 4096));
        assert!(!s.detect_prefix(old, "/api"));
        assert!(s.adopt_port(new, 4097));
        assert_eq!(s.port.map(|b| b.source), Some(PortSource::Discovered));
    }

    #[test]
    fn test_configured_port_survives_reset() {
        let mut s = state();
        let gen = s.begin_generation(Some(4096), None);
        assert_eq!(s.backend_port(), Some(4096));
        assert!(!s.adopt_port(gen, 5000));
        s.reset_discovery(Some(4096), None);
        assert_eq!(s.port.map(|b| b.source), Some(PortSource::Configured));
        assert_eq!(s.prefix, ApiPrefix::Undetected);
    }

    #[test]
    fn test_ready_requires_port_and_prefix() {
        let mut s = state();
        let gen = s.begin_generation(None, None);
        assert!(!s.mark_ready(gen));
        s.adopt_port(gen, 4096);
        assert!(!s.mark_ready(gen));
        s.detect_prefix(gen, "");
        assert!(s.mark_ready(gen));
        assert!(s.readiness.is_ready);
        assert_eq!(s.upstream_authority(), "127.0.0.1:4096");
    }

    #[test]
    fn test_not_ready_keeps_first_grace_start() {
        let mut s = state();
        s.mark_not_ready(true, None);
        let first = s.readiness.not_ready_since;
        s.mark_not_ready(true, Some("boom".to_string()));
        assert_eq!(s.readiness.not_ready_since, first);
        assert_eq!(s.readiness.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_new_generation_keeps_stop_request() {
        let mut s = state();
        s.stopped = true;
        s.begin_generation(None, None);
        assert!(s.stopped);
    }

    #[test]
    fn test_recent_output_is_bounded() {
        let mut s = state();
        for i in 0..5 {
            s.push_output(format!("line {}", i));
        }
        assert_eq!(s.recent_output(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_sentinel_when_port_unknown() {
        let s = state();
        assert_eq!(s.upstream_authority(), SENTINEL_UPSTREAM);
    }
}
