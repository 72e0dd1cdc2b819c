//! Supervisor Client
//!
//! Client for the local control channel of a running gate.

use super::types::{SupervisorCommand, SupervisorResponse};
use crate::error::{GateError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Client for the control channel
pub struct SupervisorClient {
    host: String,
    port: u16,
    timeout_seconds: u64,
}

impl SupervisorClient {
    pub fn new(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            timeout_seconds: 10,
        }
    }

    /// Client with a custom timeout (applies to connect, write and read separately)
    pub fn with_timeout(port: u16, timeout_seconds: u64) -> Self {
        Self {
            timeout_seconds,
            ..Self::new(port)
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the control channel accepts connections
    pub async fn is_available(&self) -> bool {
        matches!(
            timeout(Duration::from_secs(2), TcpStream::connect(self.address())).await,
            Ok(Ok(_))
        )
    }

    /// Send one command and read one response
    pub async fn send_command(&self, command: SupervisorCommand) -> Result<SupervisorResponse> {
        debug!("Sending supervisor command: {:?}", command);
        let limit = Duration::from_secs(self.timeout_seconds);

        let mut stream = timeout(limit, TcpStream::connect(self.address()))
            .await
            .map_err(|_| GateError::timeout("Supervisor connection timeout"))?
            .map_err(|e| GateError::connection(format!("Failed to connect to supervisor: {}", e)))?;

        let command_json = serde_json::to_string(&command)?;

        let write_future = async {
            stream.write_all(command_json.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        timeout(limit, write_future)
            .await
            .map_err(|_| GateError::timeout("Supervisor write timeout"))?
            .map_err(|e| GateError::connection(format!("Failed to send command to supervisor: {}", e)))?;

        let mut reader = BufReader::new(&mut stream);
        let mut response_line = String::new();
        timeout(limit, reader.read_line(&mut response_line))
            .await
            .map_err(|_| GateError::timeout("Supervisor response timeout"))?
            .map_err(|e| GateError::connection(format!("Failed to read supervisor response: {}", e)))?;

        let response: SupervisorResponse = serde_json::from_str(&response_line)?;
        debug!("Received supervisor response: {:?}", response);
        Ok(response)
    }

    pub async fn restart(&self, wait_for_agent: Option<String>) -> Result<SupervisorResponse> {
        info!("🔄 Requesting backend restart via supervisor");
        self.send_command(SupervisorCommand::Restart { wait_for_agent }).await
    }

    pub async fn stop(&self) -> Result<SupervisorResponse> {
        info!("⏹️ Requesting backend stop via supervisor");
        self.send_command(SupervisorCommand::Stop).await
    }

    pub async fn status(&self) -> Result<SupervisorResponse> {
        self.send_command(SupervisorCommand::Status).await
    }

    pub async fn server_info(&self) -> Result<SupervisorResponse> {
        self.send_command(SupervisorCommand::ServerInfo).await
    }
}
