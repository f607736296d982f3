//! Error types shared by the proxy core.
//!
//! Each enum maps to one band of the failure taxonomy: transport failures of
//! a single connection, registry bookkeeping failures, and session-fatal
//! conditions. None of them ever crosses a session boundary.

use std::io;
use std::time::Duration;

use hopper_id::ClientId;
use thiserror::Error;

/// Failure of a single client-side or backend-side connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket read/write failure or peer reset.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A unit could not be decoded from the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Establishing the connection took longer than allowed.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The peer did not complete its handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns true for failures that are an ordinary peer hang-up.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Failures of the session registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The backend directory is empty, so there is no default backend.
    #[error("no backends configured")]
    NoBackendsConfigured,

    /// A session for this client already exists.
    #[error("session for {0} already exists")]
    DuplicateClient(ClientId),
}

/// Session-fatal conditions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pending buffer grew past its ceiling.
    #[error("pending buffer overflow: {size} bytes exceeds limit of {limit} bytes")]
    BufferOverflow { size: usize, limit: usize },

    /// Connecting to a transfer target failed and the policy gave up.
    #[error("transfer to server {target} failed: {source}")]
    TransferFailed {
        target: String,
        #[source]
        source: TransportError,
    },

    /// The initial backend could not be reached.
    #[error("could not connect to server {backend}: {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: TransportError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(TransportError::Closed.is_disconnect());
        assert!(TransportError::Io(io::ErrorKind::ConnectionReset.into()).is_disconnect());
        assert!(!TransportError::Protocol("bad frame".into()).is_disconnect());
        assert!(!TransportError::ConnectTimeout(Duration::from_secs(2)).is_disconnect());
    }

    #[test]
    fn test_buffer_overflow_message() {
        let err = SessionError::BufferOverflow {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "pending buffer overflow: 2048 bytes exceeds limit of 1024 bytes"
        );
    }
}
