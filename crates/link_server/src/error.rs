//! Error types for the link server.
//!
//! Every fallible operation in the crate returns [`BridgeError`]. Only
//! [`BridgeError::UnsupportedPlatform`] is meant to halt the process; the
//! remaining variants describe conditions that are logged or handed back to a
//! caller while the bridge keeps running.

use thiserror::Error;

/// Errors produced by the supervisor, the relay and the correlation layer.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured platform has no known launch recipe.
    #[error("Unsupported platform '{0}'. Accepted values are 'windows' and 'ubuntu'")]
    UnsupportedPlatform(String),

    #[error("Failed to spawn server process: {0}")]
    Spawn(String),

    /// The child process has no stdin to write to.
    #[error("Server process is not running")]
    NotRunning,

    /// A correlated call reached its deadline without a reply.
    #[error("No response for call {id}")]
    NoResponse { id: String },

    /// A reply referenced a call id that is not pending (late or never issued).
    #[error("Call {id} does not exist")]
    UnknownCall { id: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Network(err.to_string())
    }
}
