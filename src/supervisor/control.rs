//! Local control channel
//!
//! Newline-delimited JSON over TCP: one [`SupervisorCommand`] per connection, answered with
//! one [`SupervisorResponse`] line.

use crate::error::Result;
use crate::supervisor::manager::BackendSupervisor;
use crate::supervisor::types::{SupervisorCommand, SupervisorResponse};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// TCP server for supervisor commands
pub struct ControlServer {
    supervisor: BackendSupervisor,
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(supervisor: BackendSupervisor, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { supervisor, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("✅ Supervisor control interface listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted control connection from {}", addr);
                    let supervisor = self.supervisor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, supervisor).await {
                            error!("Error handling control connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(mut stream: TcpStream, supervisor: BackendSupervisor) -> Result<()> {
        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();

        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<SupervisorCommand>(&line) {
            Ok(command) => Self::handle_command(command, &supervisor).await,
            Err(e) => SupervisorResponse::error(format!("Invalid command format: {}", e)),
        };
        Self::send_response(&mut stream, &response).await
    }

    async fn handle_command(command: SupervisorCommand, supervisor: &BackendSupervisor) -> SupervisorResponse {
        match command {
            SupervisorCommand::Restart { wait_for_agent } => {
                let outcome = match wait_for_agent.as_deref() {
                    Some(agent) => supervisor.restart_and_wait_for_agent(agent).await,
                    None => supervisor.restart().await,
                };
                match outcome {
                    Ok(()) => SupervisorResponse::ok(
                        "Backend restarted successfully",
                        serde_json::to_value(supervisor.status()).ok(),
                    ),
                    Err(e) => SupervisorResponse::error(format!("Failed to restart backend: {}", e)),
                }
            }
            SupervisorCommand::Stop => match supervisor.stop().await {
                Ok(()) => SupervisorResponse::ok("Backend stopped successfully", None),
                Err(e) => SupervisorResponse::error(format!("Failed to stop backend: {}", e)),
            },
            SupervisorCommand::Status => SupervisorResponse::ok(
                "Status retrieved successfully",
                serde_json::to_value(supervisor.status()).ok(),
            ),
            SupervisorCommand::ServerInfo => SupervisorResponse::ok(
                "Server info retrieved successfully",
                serde_json::to_value(supervisor.server_info()).ok(),
            ),
        }
    }

    async fn send_response(stream: &mut TcpStream, response: &SupervisorResponse) -> Result<()> {
        let response_json = serde_json::to_string(response)?;
        stream.write_all(response_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }
}
