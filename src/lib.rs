//! AgentGate - supervisor and reverse proxy for a locally launched AI coding-agent server
//!
//! This crate launches the agent backend as a child process, discovers the port and API
//! prefix it serves, tracks its readiness, restarts it when it dies or when asked to, and
//! fronts it with an HTTP gate that forwards requests (including event streams and
//! WebSockets) only while the backend can answer them.

pub mod config;
pub mod error;
pub mod startup;
pub mod supervisor;
pub mod terminal;
pub mod web;

pub use config::Config;
pub use error::{GateError, Result, StartError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "agentgate.yaml";

/// Default gate host
pub const DEFAULT_HOST: &str = "127.0.0.1";
