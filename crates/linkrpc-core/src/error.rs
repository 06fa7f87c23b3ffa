//! Error types for linkrpc.
//!
//! One enum covers the whole link: protocol parsing, method resolution,
//! connection state and errors reported by the remote peer. `ErrorKind`
//! groups the variants into the categories callers usually branch on.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Main error type for linkrpc.
#[derive(Debug, Error)]
pub enum RpcError {
    // Parser errors
    #[error("Invalid JSON message: {message}")]
    InvalidJsonMessage { message: String },

    #[error("RPC id must be an integer, got {found}")]
    RpcIdInvalid { found: String },

    #[error("RPC version must be \"2.0\", got {found}")]
    RpcVersionInvalid { found: String },

    #[error("Invalid method format: {path:?}")]
    InvalidMethodFormat { path: String },

    // Resource errors
    #[error("Cannot find module: {name}")]
    CannotFoundModule { name: String },

    #[error("Cannot find function: {name}")]
    CannotFoundFunc { name: String },

    // Connection errors
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Listener already occupied at {addr}")]
    ListenerOccupied { addr: SocketAddr },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No response after {0:?}")]
    Timeout(Duration),

    // Remote errors
    /// Error object returned by the remote peer.
    #[error("Network error {code}: {message}")]
    Network { code: i64, message: String },

    // Handler and internal errors
    #[error("{0}")]
    Handler(String),

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for linkrpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Broad error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed JSON, wrong version, non-integer id, unresolvable method path.
    Parser,
    /// Missing namespace or handler.
    Resource,
    /// Not connected, listener occupied, transport failures.
    Connection,
    /// Error reported by the peer.
    Remote,
    /// Handler failures and local serialization/IO problems.
    Internal,
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a handler error from any displayable message.
    pub fn handler(message: impl Into<String>) -> Self {
        RpcError::Handler(message.into())
    }

    /// Create an invalid-message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        RpcError::InvalidJsonMessage {
            message: message.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::InvalidJsonMessage { .. }
            | RpcError::RpcIdInvalid { .. }
            | RpcError::RpcVersionInvalid { .. }
            | RpcError::InvalidMethodFormat { .. } => ErrorKind::Parser,

            RpcError::CannotFoundModule { .. } | RpcError::CannotFoundFunc { .. } => {
                ErrorKind::Resource
            }

            RpcError::NotConnected
            | RpcError::ConnectionClosed
            | RpcError::ListenerOccupied { .. }
            | RpcError::InvalidAddress(_)
            | RpcError::Transport(_)
            | RpcError::Timeout(_) => ErrorKind::Connection,

            RpcError::Network { .. } => ErrorKind::Remote,

            RpcError::Handler(_) | RpcError::Json { .. } | RpcError::Io { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a reconnecting client may succeed by sending again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::NotConnected | RpcError::ConnectionClosed | RpcError::Timeout(_)
        )
    }
}
