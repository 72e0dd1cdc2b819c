//! Backend Supervisor Module
//!
//! Launches the backend, discovers where it listens and under which API prefix, tracks
//! its readiness, and restarts it on request or after a crash.

pub mod client;
pub mod control;
pub mod discovery;
pub mod inflight;
pub mod manager;
pub mod probe;
pub mod process;
pub mod readiness;
pub mod restart;
pub mod shell_path;
pub mod state;
pub mod types;

pub use client::SupervisorClient;
pub use control::ControlServer;
pub use discovery::{normalize_prefix, parse_port};
pub use manager::{BackendSupervisor, RouteSnapshot};
pub use process::{ProcessState, StopOutcome};
pub use restart::RestartReason;
pub use state::{ApiPrefix, PortSource, RestartPhase, SharedState, SENTINEL_UPSTREAM};
pub use types::*;
