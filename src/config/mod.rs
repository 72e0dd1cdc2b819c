//! Configuration module for AgentGate
//!
//! This module provides configuration loading, environment overrides, and validation.

mod config;
pub mod environment;

// Re-export the main configuration types
pub use config::{
    BackendConfig, CliOverrides, Config, ConfigResolution, ControlConfig, LoggingConfig,
    ServerConfig, SupervisorConfig, TerminalConfig,
};
pub use environment::{EnvVars, EnvironmentOverrides};
