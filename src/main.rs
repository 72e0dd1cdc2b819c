use agentgate::config::{CliOverrides, Config, LoggingConfig};
use agentgate::startup::{self, StartupAdditionalInfo, StartupLogger};
use agentgate::supervisor::{BackendSupervisor, ControlServer, SupervisorClient, SupervisorResponse};
use agentgate::terminal::TerminalManager;
use agentgate::web::{self, GateContext, GateServer};
use agentgate::{GateError, StartError, DEFAULT_CONFIG_FILE};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Gate host
    #[arg(long)]
    host: Option<String>,

    /// Gate port (0 lets the OS choose)
    #[arg(long)]
    port: Option<u16>,

    /// Fixed backend port; disables port discovery
    #[arg(long)]
    backend_port: Option<u16>,

    /// Working directory of the backend
    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Talk to a running gate over its control channel
    Client {
        /// Control channel port
        #[arg(long, default_value_t = 8791)]
        control_port: u16,

        /// Control channel host
        #[arg(long, default_value = "127.0.0.1")]
        control_host: String,

        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Restart the backend
    Restart {
        /// Wait until this agent is listed again
        #[arg(long)]
        wait_for_agent: Option<String>,
    },
    /// Stop the backend
    Stop,
    /// Detailed supervisor status
    Status,
    /// Gate and backend addresses
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Client {
        control_port,
        control_host,
        action,
    }) = cli.command
    {
        return run_client(control_host, control_port, action).await;
    }

    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        backend_port: cli.backend_port,
        working_dir: cli.working_dir,
        log_level: cli.log_level,
    };
    let (config, resolution) = Config::load(&cli.config, overrides)?;

    init_logging(&config.logging)?;
    startup::display_startup_banner(env!("CARGO_PKG_VERSION"));

    run_gate(config, resolution).await
}

async fn run_gate(config: Config, resolution: agentgate::config::ConfigResolution) -> Result<()> {
    let supervisor = BackendSupervisor::new(config.clone())?;

    let terminals = if config.terminal.enabled {
        let manager = Arc::new(TerminalManager::new(config.terminal.clone()));
        manager.spawn_reaper();
        Some(manager)
    } else {
        None
    };

    let context = GateContext::new(supervisor.clone(), terminals.clone(), web::get_global_log_buffer())?;
    let server = GateServer::bind(&config, context)?;
    let server_handle = server.handle();
    let addr = server.local_addr();

    let startup_info = StartupAdditionalInfo::new(
        config.server.host.clone(),
        addr.port(),
        config.server.mount_path.clone(),
    );
    StartupLogger::display_startup_info(&config, &resolution, env!("CARGO_PKG_VERSION"), Some(&startup_info));

    if config.control.enabled {
        let control_addr = format!("{}:{}", config.control.host, config.control.port);
        match ControlServer::bind(supervisor.clone(), &control_addr).await {
            Ok(control) => {
                tokio::spawn(control.serve());
            }
            Err(e) => warn!("⚠️  Control channel unavailable on {}: {}", control_addr, e),
        }
    }

    // The gate stays up even when the backend cannot be launched
    if let Err(e) = supervisor.start().await {
        error!("❌ Backend failed to start: {}", e);
        if let GateError::Start(StartError::NotFound { hint, .. }) = &e {
            error!("   {}", hint);
        }
    }

    let server_task = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("Gate server stopped"),
                Ok(Err(e)) => error!("Gate server failed: {}", e),
                Err(e) => error!("Gate server task failed: {}", e),
            }
        }
    }

    server_handle.stop(true).await;
    if let Some(terminals) = terminals {
        terminals.close_all();
    }
    supervisor.shutdown().await;
    info!("👋 AgentGate stopped");
    Ok(())
}

async fn run_client(host: String, port: u16, action: ClientAction) -> Result<()> {
    let client = SupervisorClient::new(port).host(host);
    let response: SupervisorResponse = match action {
        ClientAction::Restart { wait_for_agent } => client.restart(wait_for_agent).await?,
        ClientAction::Stop => client.stop().await?,
        ClientAction::Status => client.status().await?,
        ClientAction::Info => client.server_info().await?,
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        anyhow::bail!("{}", response.message);
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let log_buffer = web::initialize_global_log_buffer(logging.buffer_size);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(web::LogBufferLayer::new(log_buffer));

    if logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}
