//! Supervisor Communication Types
//!
//! Types shared by the supervisor facade, the HTTP control endpoints, and the TCP control
//! channel.

use crate::supervisor::process::ProcessState;
use crate::supervisor::state::{PortSource, RestartPhase};
use serde::{Deserialize, Serialize};

/// Commands accepted on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorCommand {
    /// Restart the backend, optionally waiting for a named agent afterwards
    Restart { wait_for_agent: Option<String> },
    /// Stop the backend (no automatic restart)
    Stop,
    /// Detailed supervisor status
    Status,
    /// Gate/backend addresses and readiness
    ServerInfo,
}

/// Response from supervisor commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub timestamp: String,
}

impl SupervisorResponse {
    pub fn ok<S: Into<String>>(message: S, data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Addresses and readiness, as shown to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Port the gate listens on
    pub port: u16,
    /// Port the backend listens on, once known
    pub backend_port: Option<u16>,
    pub host: String,
    pub ready: bool,
}

/// Detailed supervisor status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub ready: bool,
    pub restarting: bool,
    pub phase: RestartPhase,
    pub stopped: bool,
    pub backend_port: Option<u16>,
    pub port_source: Option<PortSource>,
    /// `None` while undetected
    pub api_prefix: Option<String>,
    pub last_error: Option<String>,
    pub process: ProcessState,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub restart_count: u32,
    pub generation: u64,
    pub working_directory: String,
    pub recent_output: Vec<String>,
}

/// Result of a working directory change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryChange {
    pub path: String,
    pub restarted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_string(&SupervisorCommand::Restart {
            wait_for_agent: Some("build".to_string()),
        })
        .unwrap();
        assert_eq!(json, r#"{"Restart":{"wait_for_agent":"build"}}"#);

        let parsed: SupervisorCommand = serde_json::from_str(r#""Status""#).unwrap();
        assert_eq!(parsed, SupervisorCommand::Status);
    }

    #[test]
    fn test_server_info_is_camel_case() {
        let info = ServerInfo {
            port: 3000,
            backend_port: Some(4096),
            host: "127.0.0.1".to_string(),
            ready: true,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["backendPort"], 4096);
        assert_eq!(value["ready"], true);
    }
}
