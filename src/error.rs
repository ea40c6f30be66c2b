//! Error types shared by the lifecycle, sync and edit layers.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the bridge core.
///
/// The type is `Clone` because a single failed server start is delivered to
/// every caller waiting on that start.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The server process could not be spawned
    #[error("failed to start language server for {root}: {reason}")]
    Spawn { root: PathBuf, reason: String },

    /// The initialize handshake failed or was rejected
    #[error("language server initialization failed: {0}")]
    Initialize(String),

    /// The connection to the server is gone
    #[error("connection to language server closed")]
    ConnectionClosed,

    /// A request did not receive a response in time
    #[error("request '{method}' timed out")]
    Timeout { method: String },

    /// A request was superseded by a newer one
    #[error("request cancelled")]
    Cancelled,

    /// The server answered with a JSON-RPC error
    #[error("language server error {code}: {message}")]
    Server { code: i64, message: String },

    /// An edit could not be validated or applied
    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    /// Malformed message on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// The server for this root is being torn down
    #[error("language server for {0} is stopping")]
    Stopped(PathBuf),

    /// The server crashed too many times and will not be restarted
    #[error("language server for {0} crashed too many times")]
    RestartLimit(PathBuf),
}

impl BridgeError {
    /// Whether this error only means a newer request replaced this one
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
