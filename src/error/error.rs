//! Error types and handling for AgentGate

use thiserror::Error;

/// Result type alias for AgentGate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Hint attached to "executable not found" launch failures
pub const BINARY_NOT_FOUND_HINT: &str =
    "Install the OpenCode CLI or set OPENCODE_BINARY (backend.binary) to the full path of the executable";

/// Why the backend process could not be launched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// The executable could not be located
    #[error("Backend executable '{program}' not found. {hint}")]
    NotFound { program: String, hint: String },

    /// Any other OS-level spawn failure
    #[error("Failed to spawn backend '{program}': {message}")]
    Spawn { program: String, message: String },
}

impl StartError {
    /// Create a not-found error carrying the standard remediation hint
    pub fn not_found<S: Into<String>>(program: S) -> Self {
        Self::NotFound {
            program: program.into(),
            hint: BINARY_NOT_FOUND_HINT.to_string(),
        }
    }

    /// Classify a spawn failure from the OS
    pub fn from_io<S: Into<String>>(program: S, error: &std::io::Error) -> Self {
        let program = program.into();
        if error.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(program)
        } else {
            Self::Spawn {
                program,
                message: error.to_string(),
            }
        }
    }

    /// Remediation text, when the operator can fix this through configuration
    pub fn hint(&self) -> Option<&str> {
        match self {
            StartError::NotFound { hint, .. } => Some(hint),
            StartError::Spawn { .. } => None,
        }
    }
}

/// Main error type for AgentGate
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Backend launch errors
    #[error("Launch error: {0}")]
    Start(#[from] StartError),

    /// Port or API prefix discovery errors
    #[error("Discovery error: {message}")]
    Discovery { message: String },

    /// Backend never answered its health contract in time
    #[error("Readiness error: {message}")]
    Readiness { message: String },

    /// Restart orchestration errors
    #[error("Restart error: {message}")]
    Restart { message: String },

    /// Connection errors (backend, control channel)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Terminal session errors
    #[error("Terminal error: {message}")]
    Terminal { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Lookup of a missing resource
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GateError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a discovery error
    pub fn discovery<S: Into<String>>(message: S) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    /// Create a readiness error
    pub fn readiness<S: Into<String>>(message: S) -> Self {
        Self::Readiness {
            message: message.into(),
        }
    }

    /// Create a restart error
    pub fn restart<S: Into<String>>(message: S) -> Self {
        Self::Restart {
            message: message.into(),
        }
    }

    /// Create a timeout error (using connection error type)
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: format!("Timeout: {}", message.into()),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a terminal error
    pub fn terminal<S: Into<String>>(message: S) -> Self {
        Self::Terminal {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::Http(_)
                | GateError::Io(_)
                | GateError::Connection { .. }
                | GateError::Discovery { .. }
                | GateError::Readiness { .. }
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            GateError::Config { .. } => "config",
            GateError::Start(_) => "start",
            GateError::Discovery { .. } => "discovery",
            GateError::Readiness { .. } => "readiness",
            GateError::Restart { .. } => "restart",
            GateError::Connection { .. } => "connection",
            GateError::Terminal { .. } => "terminal",
            GateError::Validation { .. } => "validation",
            GateError::NotFound { .. } => "not_found",
            GateError::Io(_) => "io",
            GateError::Serde(_) => "serialization",
            GateError::Yaml(_) => "yaml",
            GateError::Http(_) => "http",
            GateError::Internal(_) => "internal",
        }
    }
}

impl Clone for GateError {
    fn clone(&self) -> Self {
        match self {
            GateError::Config { message } => GateError::Config { message: message.clone() },
            GateError::Start(e) => GateError::Start(e.clone()),
            GateError::Discovery { message } => GateError::Discovery { message: message.clone() },
            GateError::Readiness { message } => GateError::Readiness { message: message.clone() },
            GateError::Restart { message } => GateError::Restart { message: message.clone() },
            GateError::Connection { message } => GateError::Connection { message: message.clone() },
            GateError::Terminal { message } => GateError::Terminal { message: message.clone() },
            GateError::Validation { message } => GateError::Validation { message: message.clone() },
            GateError::NotFound { message } => GateError::NotFound { message: message.clone() },

            // For non-cloneable types, convert to string representation
            GateError::Io(e) => GateError::connection(format!("IO error: {}", e)),
            GateError::Serde(e) => GateError::validation(format!("Serialization error: {}", e)),
            GateError::Yaml(e) => GateError::config(format!("YAML error: {}", e)),
            GateError::Http(e) => GateError::connection(format!("HTTP error: {}", e)),
            GateError::Internal(e) => GateError::restart(format!("Internal error: {}", e)),
        }
    }
}
