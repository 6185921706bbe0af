use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Proxy already shut down")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to start engine on port {port}: {reason}")]
    StartFailed { port: u16, reason: String },

    #[error("Hook registration failed: {0}")]
    HookRegistration(String),

    #[error("System proxy configuration failed: {0}")]
    SystemProxy(String),

    #[error("Engine not running")]
    NotRunning,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Upload failed: {0}")]
    Transport(String),

    #[error("Collector returned status {0}")]
    Status(u16),

    #[error("Upload timed out")]
    Timeout,
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout
        } else if let Some(status) = err.status() {
            RelayError::Status(status.as_u16())
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
