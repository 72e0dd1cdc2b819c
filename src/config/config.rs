//! Configuration management for AgentGate

use crate::config::environment::{EnvVars, EnvironmentOverrides};
use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Default functions for serde
fn default_mount_path() -> String {
    "/api".to_string()
}

fn default_body_limit() -> usize {
    32 * 1024 * 1024
}

fn default_command() -> String {
    "opencode".to_string()
}

fn default_args() -> Vec<String> {
    vec!["serve".to_string()]
}

fn default_prefix_candidates() -> Vec<String> {
    vec![String::new(), "/api".to_string(), "/opencode".to_string()]
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_config_path() -> String {
    "/config".to_string()
}

fn default_agent_path() -> String {
    "/agent".to_string()
}

fn default_doc_path() -> String {
    "/doc".to_string()
}

fn default_true() -> bool {
    true
}

/// Upper bound accepted for any supervisor timing knob (10 minutes)
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Gate HTTP server configuration
    pub server: ServerConfig,
    /// Backend process configuration
    pub backend: BackendConfig,
    /// Supervisor timing configuration
    pub supervisor: SupervisorConfig,
    /// Terminal session configuration
    pub terminal: TerminalConfig,
    /// TCP control channel configuration
    pub control: ControlConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Gate HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to (0 lets the OS choose)
    pub port: u16,
    /// Path under which backend traffic is mounted
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    /// Maximum forwarded request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            mount_path: default_mount_path(),
            body_limit: default_body_limit(),
        }
    }
}

/// Backend process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit path to the backend executable, bypassing PATH search
    pub binary: Option<PathBuf>,
    /// Command name searched on the augmented PATH
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments placed before `--port <n>`
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Fixed backend port; disables port scraping
    pub port: Option<u16>,
    /// Fixed API prefix; disables prefix discovery
    pub api_prefix: Option<String>,
    /// Working directory for the backend process
    pub working_dir: Option<PathBuf>,
    /// Candidate roots tried when the prefix is unknown
    #[serde(default = "default_prefix_candidates")]
    pub prefix_candidates: Vec<String>,
    /// Extra environment for the backend process
    pub env: HashMap<String, String>,
    /// Rebuild PATH from the user's interactive login shell
    #[serde(default = "default_true")]
    pub use_shell_path: bool,
    /// Liveness endpoint, relative to the API prefix
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Configuration-read endpoint, relative to the API prefix
    #[serde(default = "default_config_path")]
    pub config_path: String,
    /// Agent-listing endpoint, relative to the API prefix
    #[serde(default = "default_agent_path")]
    pub agent_path: String,
    /// Documentation endpoint carrying the `__API_BASE__` marker
    #[serde(default = "default_doc_path")]
    pub doc_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary: None,
            command: default_command(),
            args: default_args(),
            port: None,
            api_prefix: None,
            working_dir: None,
            prefix_candidates: default_prefix_candidates(),
            env: HashMap::new(),
            use_shell_path: true,
            health_path: default_health_path(),
            config_path: default_config_path(),
            agent_path: default_agent_path(),
            doc_path: default_doc_path(),
        }
    }
}

impl BackendConfig {
    /// Working directory the backend starts in, falling back to the current directory
    pub fn effective_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Supervisor timing configuration (all values in milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Window after SIGTERM before escalating to a kill
    pub graceful_stop_ms: u64,
    /// Window after the kill before giving up on the exit status
    pub kill_wait_ms: u64,
    /// Final deadline for the whole teardown
    pub teardown_deadline_ms: u64,
    /// Delay between teardown and relaunch on explicit restarts
    pub restart_delay_ms: u64,
    /// Delay before restarting after an unexpected exit
    pub crash_restart_delay_ms: u64,
    /// How long to wait for a scraped port after launch
    pub port_wait_timeout_ms: u64,
    /// How long to wait for the full health contract
    pub ready_timeout_ms: u64,
    /// Interval between readiness iterations
    pub poll_interval_ms: u64,
    /// Timeout applied to each individual probe request
    pub probe_timeout_ms: u64,
    /// Window after becoming not ready during which requests get 503 restarting
    pub grace_period_ms: u64,
    /// First prefix discovery retry delay
    pub discovery_backoff_initial_ms: u64,
    /// Ceiling for the prefix discovery retry delay
    pub discovery_backoff_max_ms: u64,
    /// How long to wait for a named agent after a restart
    pub agent_wait_timeout_ms: u64,
    /// Number of recent output lines kept for diagnostics
    pub recent_output_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_stop_ms: 3_000,
            kill_wait_ms: 5_000,
            teardown_deadline_ms: 10_000,
            restart_delay_ms: 250,
            crash_restart_delay_ms: 750,
            port_wait_timeout_ms: 15_000,
            ready_timeout_ms: 20_000,
            poll_interval_ms: 500,
            probe_timeout_ms: 3_000,
            grace_period_ms: 12_000,
            discovery_backoff_initial_ms: 500,
            discovery_backoff_max_ms: 8_000,
            agent_wait_timeout_ms: 10_000,
            recent_output_lines: 200,
        }
    }
}

impl SupervisorConfig {
    pub fn graceful_stop(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn teardown_deadline(&self) -> Duration {
        Duration::from_millis(self.teardown_deadline_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn crash_restart_delay(&self) -> Duration {
        Duration::from_millis(self.crash_restart_delay_ms)
    }

    pub fn port_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.port_wait_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn discovery_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_initial_ms)
    }

    pub fn discovery_backoff_max(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_max_ms)
    }

    pub fn agent_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_wait_timeout_ms)
    }

    /// Validate supervisor timing configuration
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("graceful_stop_ms", self.graceful_stop_ms),
            ("kill_wait_ms", self.kill_wait_ms),
            ("teardown_deadline_ms", self.teardown_deadline_ms),
            ("port_wait_timeout_ms", self.port_wait_timeout_ms),
            ("ready_timeout_ms", self.ready_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("grace_period_ms", self.grace_period_ms),
            ("discovery_backoff_initial_ms", self.discovery_backoff_initial_ms),
            ("discovery_backoff_max_ms", self.discovery_backoff_max_ms),
            ("agent_wait_timeout_ms", self.agent_wait_timeout_ms),
        ];

        for (name, value) in required {
            if value == 0 {
                return Err(GateError::config(format!("supervisor.{} cannot be 0", name)));
            }
            if value > MAX_TIMEOUT_MS {
                return Err(GateError::config(format!(
                    "supervisor.{} = {} is too high. Maximum allowed is {} ms",
                    name, value, MAX_TIMEOUT_MS
                )));
            }
        }

        // Optional delays may be 0 but share the ceiling
        for (name, value) in [
            ("restart_delay_ms", self.restart_delay_ms),
            ("crash_restart_delay_ms", self.crash_restart_delay_ms),
        ] {
            if value > MAX_TIMEOUT_MS {
                return Err(GateError::config(format!(
                    "supervisor.{} = {} is too high. Maximum allowed is {} ms",
                    name, value, MAX_TIMEOUT_MS
                )));
            }
        }

        if self.discovery_backoff_initial_ms > self.discovery_backoff_max_ms {
            return Err(GateError::config(
                "supervisor.discovery_backoff_initial_ms cannot exceed discovery_backoff_max_ms",
            ));
        }

        if self.recent_output_lines == 0 {
            return Err(GateError::config("supervisor.recent_output_lines cannot be 0"));
        }

        Ok(())
    }
}

/// Terminal session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Enable the terminal endpoints
    pub enabled: bool,
    /// Shell to launch; `$SHELL` then `/bin/sh` when unset
    pub shell: Option<String>,
    /// Sessions idle strictly longer than this are closed
    pub idle_timeout_ms: u64,
    /// How often the reaper runs
    pub reap_interval_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shell: None,
            idle_timeout_ms: 30 * 60 * 1000,
            reap_interval_ms: 60 * 1000,
        }
    }
}

impl TerminalConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Shell program for new sessions
    pub fn resolve_shell(&self) -> String {
        self.shell
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// TCP control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Enable the control channel
    pub enabled: bool,
    /// Host the control channel listens on
    pub host: String,
    /// Port the control channel listens on
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8791,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Number of log entries kept in memory for the logs endpoint
    pub buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            buffer_size: 1000,
        }
    }
}

/// Command line overrides (highest precedence)
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend_port: Option<u16>,
    pub working_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Where each effective setting came from, for the startup summary
#[derive(Debug, Clone)]
pub struct ConfigResolution {
    /// Config file that was requested
    pub config_path: PathBuf,
    /// Whether the file existed and was parsed
    pub config_file_loaded: bool,
    /// Environment overrides that were applied
    pub env_overrides: Vec<String>,
    /// CLI overrides that were applied
    pub cli_overrides: Vec<String>,
}

impl Config {
    /// Load .env files in order of precedence
    fn load_env_files() -> Result<()> {
        // Determine environment
        let env = std::env::var(EnvVars::ENV)
            .or_else(|_| std::env::var("ENV"))
            .unwrap_or_else(|_| "development".to_string());

        // Each file overrides the previous one
        let env_specific_file = format!(".env.{}", env);
        let env_files = vec![".env", &env_specific_file, ".env.local"];

        for env_file in env_files {
            match dotenvy::from_filename(env_file) {
                Ok(_) => {
                    tracing::info!("Loaded environment variables from {}", env_file);
                }
                Err(e) if e.not_found() => {
                    tracing::debug!("No {} file found, skipping", env_file);
                }
                Err(e) => {
                    tracing::warn!("Failed to load {}: {}", env_file, e);
                }
            }
        }

        tracing::debug!("Environment: {}", env);
        Ok(())
    }

    /// Parse a config file, falling back to defaults when it does not exist
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("Config file {:?} not found, using defaults", path);
            return Ok((Self::default(), false));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::config(format!("Failed to read config file: {}", e)))?;

        let config = serde_yaml::from_str(&content)
            .map_err(|e| GateError::config(format!("Failed to parse config file: {}", e)))?;

        Ok((config, true))
    }

    /// Load configuration from file with environment variables and CLI overrides
    ///
    /// Precedence: defaults < file < environment < CLI.
    pub fn load<P: AsRef<Path>>(path: P, cli: CliOverrides) -> Result<(Self, ConfigResolution)> {
        Self::load_env_files()?;

        let env_overrides = EnvironmentOverrides::load()?;
        let config_path = env_overrides.get_config_path(path.as_ref());

        let (mut config, config_file_loaded) = Self::from_file(&config_path)?;
        env_overrides.apply_to_config(&mut config);
        let cli_overrides = config.apply_cli_overrides(cli);

        config.validate()?;

        let resolution = ConfigResolution {
            config_path,
            config_file_loaded,
            env_overrides: env_overrides.get_override_summary(),
            cli_overrides,
        };
        Ok((config, resolution))
    }

    /// Apply CLI overrides, returning a summary of what changed
    pub fn apply_cli_overrides(&mut self, cli: CliOverrides) -> Vec<String> {
        let mut applied = Vec::new();

        if let Some(host) = cli.host {
            applied.push(format!("--host {}", host));
            self.server.host = host;
        }
        if let Some(port) = cli.port {
            applied.push(format!("--port {}", port));
            self.server.port = port;
        }
        if let Some(port) = cli.backend_port {
            applied.push(format!("--backend-port {}", port));
            self.backend.port = Some(port);
        }
        if let Some(dir) = cli.working_dir {
            applied.push(format!("--working-dir {:?}", dir));
            self.backend.working_dir = Some(dir);
        }
        if let Some(level) = cli.log_level {
            applied.push(format!("--log-level {}", level));
            self.logging.level = level;
        }

        applied
    }

    /// Validate the full configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(GateError::config("Server host cannot be empty"));
        }

        if !self.server.mount_path.starts_with('/') {
            return Err(GateError::config(format!(
                "server.mount_path '{}' must start with '/'",
                self.server.mount_path
            )));
        }

        if self.server.body_limit == 0 {
            return Err(GateError::config("server.body_limit cannot be 0"));
        }

        if self.backend.binary.is_none() && self.backend.command.trim().is_empty() {
            return Err(GateError::config(
                "backend.command cannot be empty when backend.binary is not set",
            ));
        }

        if let Some(ref prefix) = self.backend.api_prefix {
            if !prefix.is_empty() && !prefix.starts_with('/') {
                return Err(GateError::config(format!(
                    "backend.api_prefix '{}' must be empty or start with '/'",
                    prefix
                )));
            }
        }

        if self.backend.prefix_candidates.is_empty() {
            return Err(GateError::config("backend.prefix_candidates cannot be empty"));
        }

        self.supervisor.validate()?;

        if self.terminal.idle_timeout_ms == 0 || self.terminal.reap_interval_ms == 0 {
            return Err(GateError::config(
                "terminal.idle_timeout_ms and terminal.reap_interval_ms must be greater than 0",
            ));
        }

        if self.control.enabled && self.control.port == 0 {
            return Err(GateError::config("control.port cannot be 0 when the control channel is enabled"));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(GateError::config(format!(
                    "Invalid logging.format '{}'. Must be one of: text, json",
                    other
                )))
            }
        }

        Ok(())
    }
}
