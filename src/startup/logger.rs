//! Startup logging

use crate::config::{Config, ConfigResolution};
use tracing::{info, warn};

/// Startup logger for configuration and service information
pub struct StartupLogger;

impl StartupLogger {
    /// Log where the configuration came from and what will run
    pub fn display_startup_info(
        config: &Config,
        resolution: &ConfigResolution,
        version: &str,
        additional_info: Option<&StartupAdditionalInfo>,
    ) {
        info!("🚀 AgentGate v{} starting...", version);
        info!("");

        Self::display_configuration_resolution(resolution);

        if !resolution.env_overrides.is_empty() || !resolution.cli_overrides.is_empty() {
            Self::display_overrides(resolution);
        }

        Self::display_backend(config);
        Self::display_feature_status(config);

        if let Some(info) = additional_info {
            Self::display_server_information(info);
        }
    }

    fn display_configuration_resolution(resolution: &ConfigResolution) {
        info!("📁 Configuration Resolution:");
        if resolution.config_file_loaded {
            info!("   Config file: {:?} ✅", resolution.config_path);
        } else {
            info!(
                "   Config file: built-in defaults ({:?} not found)",
                resolution.config_path
            );
        }
        info!("");
    }

    fn display_overrides(resolution: &ConfigResolution) {
        info!("🔧 Overrides:");
        for env in &resolution.env_overrides {
            info!("   ✅ {} (environment)", env);
        }
        for cli in &resolution.cli_overrides {
            info!("   ✅ {} (command line)", cli);
        }
        info!("");
    }

    fn display_backend(config: &Config) {
        let backend = &config.backend;
        info!("🤖 Backend:");
        match &backend.binary {
            Some(path) => info!("   Binary: {:?}", path),
            None => info!("   Command: {} (resolved from PATH)", backend.command),
        }
        info!("   Arguments: {}", backend.args.join(" "));
        match backend.port {
            Some(port) => info!("   Port: {} (configured)", port),
            None => info!("   Port: discovered from output"),
        }
        match &backend.api_prefix {
            Some(prefix) => info!("   API prefix: {:?} (configured)", prefix),
            None => info!("   API prefix: discovered (candidates {:?})", backend.prefix_candidates),
        }
        info!("   Working directory: {:?}", backend.effective_working_dir());
        info!("");
    }

    fn display_feature_status(config: &Config) {
        info!("🎯 Feature Status:");
        info!("   ✅ Proxy gate (mounted at {})", config.server.mount_path);
        if config.terminal.enabled {
            info!("   ✅ Terminal sessions (idle timeout {:?})", config.terminal.idle_timeout());
        } else {
            warn!("   ⚠️  Terminal sessions (disabled)");
        }
        if config.control.enabled {
            info!(
                "   ✅ Control channel ({}:{})",
                config.control.host, config.control.port
            );
        } else {
            info!("   ❌ Control channel (disabled)");
        }
        info!("");
    }

    fn display_server_information(info: &StartupAdditionalInfo) {
        info!("🌐 Server Information:");
        info!("   HTTP: http://{}:{}", info.host, info.port);
        info!("   Health: http://{}:{}/health", info.host, info.port);
        info!("   API: http://{}:{}{}", info.host, info.port, info.mount_path);
        info!("");
    }
}

/// Address details only known after binding
pub struct StartupAdditionalInfo {
    pub host: String,
    pub port: u16,
    pub mount_path: String,
}

impl StartupAdditionalInfo {
    pub fn new(host: String, port: u16, mount_path: String) -> Self {
        Self {
            host,
            port,
            mount_path,
        }
    }
}

/// Display startup banner with version information
pub fn display_startup_banner(version: &str) {
    info!("");
    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║                        AgentGate v{:<8}                   ║", version);
    info!("║          Backend supervisor & dynamic reverse proxy          ║");
    info!("╚══════════════════════════════════════════════════════════════╝");
    info!("");
}
