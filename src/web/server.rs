//! The gate's HTTP server

use crate::config::Config;
use crate::error::{GateError, Result};
use crate::supervisor::BackendSupervisor;
use crate::terminal::TerminalManager;
use crate::web::cors::{configure_preflight, cors_headers};
use crate::web::internal::configure_internal;
use crate::web::log_buffer::LogBuffer;
use crate::web::models_metadata::ModelsMetadataCache;
use crate::web::proxy;
use crate::web::terminal_api::configure_terminal_api;
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything request handlers share
pub struct GateContext {
    pub supervisor: BackendSupervisor,
    /// Client for forwarded requests (no overall timeout; streams are long-lived)
    pub client: reqwest::Client,
    pub mount_path: String,
    pub body_limit: usize,
    /// Backend configuration endpoint, relative to the API prefix
    pub config_path: String,
    pub models: ModelsMetadataCache,
    pub terminals: Option<Arc<TerminalManager>>,
    pub logs: Option<Arc<LogBuffer>>,
}

impl GateContext {
    pub fn new(
        supervisor: BackendSupervisor,
        terminals: Option<Arc<TerminalManager>>,
        logs: Option<Arc<LogBuffer>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(FORWARD_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| GateError::config(format!("Failed to build forwarding client: {}", e)))?;

        let config = supervisor.config();
        Ok(Self {
            mount_path: config.server.mount_path.trim_end_matches('/').to_string(),
            body_limit: config.server.body_limit,
            config_path: config.backend.config_path.clone(),
            models: ModelsMetadataCache::new(client.clone()),
            client,
            supervisor,
            terminals,
            logs,
        })
    }
}

/// Register every route of the gate
pub fn configure_app(cfg: &mut web::ServiceConfig, mount: &str, terminals_enabled: bool) {
    configure_preflight(cfg);
    configure_internal(cfg, mount);
    if terminals_enabled {
        configure_terminal_api(cfg, mount);
    }
}

/// A bound, not yet running gate server
pub struct GateServer {
    server: actix_web::dev::Server,
    addr: SocketAddr,
}

impl GateServer {
    /// Bind the listener; the actual port is recorded on the supervisor
    pub fn bind(config: &Config, context: GateContext) -> Result<Self> {
        let mount = context.mount_path.clone();
        let terminals_enabled = context.terminals.is_some();
        let supervisor = context.supervisor.clone();
        let data = web::Data::new(context);

        let server = HttpServer::new(move || {
            App::new()
                .wrap(cors_headers())
                .app_data(data.clone())
                .app_data(web::JsonConfig::default().limit(1024 * 1024))
                .configure(|cfg| configure_app(cfg, &mount, terminals_enabled))
                .default_service(web::to(proxy::forward))
        })
        .disable_signals()
        .bind((config.server.host.as_str(), config.server.port))?;

        let addr = server
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| GateError::config("Gate server bound no address"))?;
        supervisor.set_gate_port(addr.port());

        info!("🌐 Gate listening on http://{}", addr);
        Ok(Self {
            server: server.run(),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    /// Serve until stopped through a [`ServerHandle`]
    pub async fn run(self) -> Result<()> {
        self.server.await?;
        Ok(())
    }
}
