//! Transport errors

use grid_proto::{HandlerId, MuxId, ProtoError};
use std::fmt;
use thiserror::Error;

/// Error returned by a registered handler.
///
/// Travels to the caller as a normal response and leaves the connection healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteErr(pub String);

impl RemoteErr {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RemoteErr {}

impl From<String> for RemoteErr {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for RemoteErr {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Errors of the physical link (dial, socket I/O)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,
}

/// Grid errors
#[derive(Debug, Error)]
pub enum GridError {
    #[error("Connection to remote is down")]
    Disconnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Grid is shutting down")]
    Shutdown,

    #[error("Timeout")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(RemoteErr),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid handler id: {0}")]
    InvalidHandlerId(u8),

    #[error("Handler {0} already registered")]
    HandlerAlreadyRegistered(HandlerId),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Unable to open stream: {0}")]
    MuxConnect(String),

    #[error("Flow control violation: {0}")]
    FlowControl(String),

    #[error("Mux {mux_id}: expected seq {expected}, got {got}")]
    OutOfOrder { mux_id: MuxId, expected: u32, got: u32 },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl GridError {
    /// Application-level failure reported by the remote handler
    pub fn is_remote(&self) -> bool {
        matches!(self, GridError::Remote(_))
    }

    pub fn remote_message(&self) -> Option<&str> {
        match self {
            GridError::Remote(e) => Some(e.message()),
            _ => None,
        }
    }
}

impl From<RemoteErr> for GridError {
    fn from(err: RemoteErr) -> Self {
        GridError::Remote(err)
    }
}

pub type GridResult<T> = Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let remote: GridError = RemoteErr::new("bucket not found").into();
        assert!(remote.is_remote());
        assert_eq!(remote.remote_message(), Some("bucket not found"));

        assert!(!GridError::Disconnected.is_remote());
        assert_eq!(GridError::Disconnected.remote_message(), None);
    }

    #[test]
    fn test_error_display() {
        let err = GridError::OutOfOrder {
            mux_id: 3,
            expected: 1,
            got: 4,
        };
        assert_eq!(err.to_string(), "Mux 3: expected seq 1, got 4");
        assert_eq!(
            GridError::HandlerAlreadyRegistered(HandlerId::TRACE).to_string(),
            "Handler TRACE(3) already registered"
        );
    }
}
