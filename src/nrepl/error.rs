//! Error taxonomy for the nREPL client.
//!
//! Errors that have to be fanned out to several pending requests
//! (`TransportError`, `ProtocolError`, `SessionError`) are `Clone` and carry
//! rendered messages instead of `std::io::Error`.

use std::time::Duration;

use thiserror::Error;

/// Failure to establish a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The server actively refused the connection (nothing listening).
    #[error("Connection refused by {addr}")]
    Refused {
        /// Address that refused the connection
        addr: String,
    },

    /// The attempt did not complete within the caller's timeout.
    #[error("Connection timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The host name could not be resolved.
    #[error("Could not resolve host {host}: {reason}")]
    DnsFailure {
        /// Host name that failed to resolve
        host: String,
        /// Resolver message
        reason: String,
    },

    /// Another connect is still outstanding on this session.
    #[error("A connection attempt is already in progress")]
    InProgress,

    /// Any other socket error while connecting.
    #[error("Connection failed: {0}")]
    Io(#[source] std::io::Error),
}

impl ConnectError {
    /// Map a `TcpStream::connect` failure for `addr` attempted with `timeout`.
    pub(crate) fn from_io(err: std::io::Error, addr: &str, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::Refused {
                addr: addr.to_string(),
            },
            std::io::ErrorKind::TimedOut => ConnectError::Timeout(timeout),
            _ => ConnectError::Io(err),
        }
    }
}

/// Failure on an established (or expected) connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is not in the Connected state.
    #[error("Not connected")]
    NotConnected,

    /// Writing to the socket failed.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The peer closed the connection or the read side failed.
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// `on_receive` was called on a transport that already has a handler.
    #[error("A receive handler is already registered")]
    HandlerRegistered,
}

/// Malformed data on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Bencode framing is broken; the stream cannot be resynchronized.
    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    /// A well-formed value had the wrong shape for where it appeared.
    #[error("Unexpected type for {field}: expected {expected}")]
    UnexpectedType {
        /// Field (or position) that held the wrong value
        field: String,
        /// What the field should have held
        expected: &'static str,
    },
}

/// Why a connection ended or a pending request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors returned by the evaluation coordinator.
#[derive(Debug, Error)]
pub enum ReplError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server answered the request with an error status.
    #[error("Server rejected {op}: {status}")]
    Remote {
        /// Operation that was rejected
        op: String,
        /// Status flags reported by the server, comma separated
        status: String,
    },

    /// The request was cancelled before it completed.
    #[error("Request cancelled")]
    Cancelled,

    /// Local I/O (e.g. reading a file for load-file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SessionError> for ReplError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(e) => ReplError::Transport(e),
            SessionError::Protocol(e) => ReplError::Protocol(e),
        }
    }
}
