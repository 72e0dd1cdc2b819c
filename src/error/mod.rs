//! Error handling module for AgentGate
//!
//! This module provides the error types shared by the supervisor and the proxy gate.

mod error;

// Re-export the main error types and utilities
pub use error::{GateError, Result, StartError, BINARY_NOT_FOUND_HINT};
