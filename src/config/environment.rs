//! Environment variable integration for AgentGate configuration

use crate::config::Config;
use crate::error::{GateError, Result};
use std::env;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Environment variable names used by AgentGate
pub struct EnvVars;

impl EnvVars {
    pub const ENV: &'static str = "AGENTGATE_ENV";
    pub const CONFIG_PATH: &'static str = "AGENTGATE_CONFIG_PATH";
    pub const HOST: &'static str = "AGENTGATE_HOST";
    pub const PORT: &'static str = "AGENTGATE_PORT";
    pub const LOG_LEVEL: &'static str = "AGENTGATE_LOG_LEVEL";
    pub const LOG_FORMAT: &'static str = "AGENTGATE_LOG_FORMAT";
    pub const BACKEND_BINARY: &'static str = "OPENCODE_BINARY";
    pub const BACKEND_PORT: &'static str = "OPENCODE_PORT";
    pub const BACKEND_API_PREFIX: &'static str = "OPENCODE_API_PREFIX";
    pub const BACKEND_WORKING_DIR: &'static str = "OPENCODE_WORKING_DIR";
}

/// Environment configuration overrides
#[derive(Debug, Clone, Default)]
pub struct EnvironmentOverrides {
    /// Config file path override
    pub config_path: Option<PathBuf>,
    /// Gate host override
    pub host: Option<String>,
    /// Gate port override
    pub port: Option<u16>,
    /// Log level override
    pub log_level: Option<String>,
    /// Log format override
    pub log_format: Option<String>,
    /// Backend executable override
    pub backend_binary: Option<PathBuf>,
    /// Fixed backend port
    pub backend_port: Option<u16>,
    /// Fixed API prefix
    pub backend_api_prefix: Option<String>,
    /// Backend working directory
    pub backend_working_dir: Option<PathBuf>,
}

/// Read a variable, treating empty values as unset
fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_port(name: &str, value: &str) -> Result<u16> {
    value.parse::<u16>().map_err(|e| {
        warn!("Invalid {}: {} ({})", name, value, e);
        GateError::config(format!("Invalid {} environment variable: {} ({})", name, value, e))
    })
}

impl EnvironmentOverrides {
    /// Load environment variable overrides
    pub fn load() -> Result<Self> {
        let mut overrides = EnvironmentOverrides::default();

        if let Some(path) = non_empty_var(EnvVars::CONFIG_PATH) {
            debug!("Environment override: {}={}", EnvVars::CONFIG_PATH, path);
            overrides.config_path = Some(PathBuf::from(path));
        }

        if let Some(host) = non_empty_var(EnvVars::HOST) {
            debug!("Environment override: {}={}", EnvVars::HOST, host);
            overrides.host = Some(host);
        }

        if let Some(port) = non_empty_var(EnvVars::PORT) {
            overrides.port = Some(parse_port(EnvVars::PORT, &port)?);
        }

        if let Some(level) = non_empty_var(EnvVars::LOG_LEVEL) {
            overrides.log_level = Some(level);
        }

        if let Some(format) = non_empty_var(EnvVars::LOG_FORMAT) {
            match format.to_lowercase().as_str() {
                "text" | "json" => overrides.log_format = Some(format.to_lowercase()),
                _ => {
                    warn!("Invalid {}: {} (expected: text/json)", EnvVars::LOG_FORMAT, format);
                    return Err(GateError::config(format!(
                        "Invalid {}: {} (valid options: text, json)",
                        EnvVars::LOG_FORMAT,
                        format
                    )));
                }
            }
        }

        if let Some(binary) = non_empty_var(EnvVars::BACKEND_BINARY) {
            debug!("Environment override: {}={}", EnvVars::BACKEND_BINARY, binary);
            overrides.backend_binary = Some(PathBuf::from(binary));
        }

        if let Some(port) = non_empty_var(EnvVars::BACKEND_PORT) {
            let port = parse_port(EnvVars::BACKEND_PORT, &port)?;
            if port == 0 {
                return Err(GateError::config(format!(
                    "Invalid {}: 0 (unset the variable to let the backend choose)",
                    EnvVars::BACKEND_PORT
                )));
            }
            overrides.backend_port = Some(port);
        }

        // An explicitly empty prefix is meaningful, so this one is read raw
        if let Ok(prefix) = env::var(EnvVars::BACKEND_API_PREFIX) {
            let normalized = crate::supervisor::normalize_prefix(&prefix);
            debug!("Environment override: {}={:?}", EnvVars::BACKEND_API_PREFIX, normalized);
            overrides.backend_api_prefix = Some(normalized);
        }

        if let Some(dir) = non_empty_var(EnvVars::BACKEND_WORKING_DIR) {
            overrides.backend_working_dir = Some(PathBuf::from(dir));
        }

        Ok(overrides)
    }

    /// Apply environment overrides to a config
    pub fn apply_to_config(&self, config: &mut Config) {
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(ref format) = self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(ref binary) = self.backend_binary {
            info!("Environment override: backend binary set to {:?}", binary);
            config.backend.binary = Some(binary.clone());
        }
        if let Some(port) = self.backend_port {
            if config.backend.port != Some(port) {
                info!(
                    "Environment override: backend port changed from {:?} to {}",
                    config.backend.port, port
                );
            }
            config.backend.port = Some(port);
        }
        if let Some(ref prefix) = self.backend_api_prefix {
            config.backend.api_prefix = Some(prefix.clone());
        }
        if let Some(ref dir) = self.backend_working_dir {
            config.backend.working_dir = Some(dir.clone());
        }
    }

    /// Get the effective config file path (with environment override)
    pub fn get_config_path(&self, default_path: &std::path::Path) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| default_path.to_path_buf())
    }

    /// Check if any environment overrides are active
    pub fn has_overrides(&self) -> bool {
        !self.get_override_summary().is_empty()
    }

    /// Get summary of active overrides for logging
    pub fn get_override_summary(&self) -> Vec<String> {
        let mut summary = Vec::new();

        if let Some(ref path) = self.config_path {
            summary.push(format!("{}={:?}", EnvVars::CONFIG_PATH, path));
        }
        if let Some(ref host) = self.host {
            summary.push(format!("{}={}", EnvVars::HOST, host));
        }
        if let Some(port) = self.port {
            summary.push(format!("{}={}", EnvVars::PORT, port));
        }
        if let Some(ref level) = self.log_level {
            summary.push(format!("{}={}", EnvVars::LOG_LEVEL, level));
        }
        if let Some(ref format) = self.log_format {
            summary.push(format!("{}={}", EnvVars::LOG_FORMAT, format));
        }
        if let Some(ref binary) = self.backend_binary {
            summary.push(format!("{}={:?}", EnvVars::BACKEND_BINARY, binary));
        }
        if let Some(port) = self.backend_port {
            summary.push(format!("{}={}", EnvVars::BACKEND_PORT, port));
        }
        if let Some(ref prefix) = self.backend_api_prefix {
            summary.push(format!("{}={:?}", EnvVars::BACKEND_API_PREFIX, prefix));
        }
        if let Some(ref dir) = self.backend_working_dir {
            summary.push(format!("{}={:?}", EnvVars::BACKEND_WORKING_DIR, dir));
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overrides() {
        let overrides = EnvironmentOverrides {
            backend_port: Some(4096),
            backend_api_prefix: Some(String::new()),
            log_format: Some("json".to_string()),
            ..Default::default()
        };
        let mut config = Config::default();
        overrides.apply_to_config(&mut config);

        assert_eq!(config.backend.port, Some(4096));
        assert_eq!(config.backend.api_prefix.as_deref(), Some(""));
        assert_eq!(config.logging.format, "json");
        assert!(overrides.has_overrides());
        assert_eq!(overrides.get_override_summary().len(), 3);
    }

    #[test]
    fn test_no_overrides() {
        let overrides = EnvironmentOverrides::default();
        assert!(!overrides.has_overrides());
        assert_eq!(
            overrides.get_config_path(std::path::Path::new("agentgate.yaml")),
            PathBuf::from("agentgate.yaml")
        );
    }
}
