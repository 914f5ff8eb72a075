use thiserror::Error;

use crate::models::OperationType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No provider available for operation {operation}")]
    NoProviderAvailable { operation: OperationType },

    #[error("Backend '{backend_id}' failed: {cause}")]
    Backend {
        backend_id: String,
        #[source]
        cause: BackendError,
    },

    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credential error: {0}")]
    Credential(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        Error::Credential(msg.into())
    }

    pub fn backend(backend_id: impl Into<String>, cause: BackendError) -> Self {
        Error::Backend {
            backend_id: backend_id.into(),
            cause,
        }
    }

    /// Id of the backend that produced this error, if it came from an attempt.
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            Error::Backend { backend_id, .. } => Some(backend_id),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::Configuration(format!("invalid backend configuration: {}", errors))
    }
}

/// Failure of a single adapter invocation or health probe.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("operation {0} is not supported by this backend")]
    Unsupported(OperationType),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn transport(msg: impl Into<String>) -> Self {
        BackendError::Transport(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        BackendError::InvalidResponse(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        BackendError::Unavailable(msg.into())
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout { after_ms: 0 }
        } else if let Some(status) = e.status() {
            BackendError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}
