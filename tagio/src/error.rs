//! Error and completion-status types for tagio.

use std::fmt;
use std::io;

use thiserror::Error;

/// Failures reported by the transport API itself.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// System call failure during socket setup.
    #[error("syscall failed: {0}")]
    Sys(#[from] nix::Error),
    /// No listener is bound on this context.
    #[error("context has no listener")]
    NotListening,
    /// The referenced connection does not exist.
    #[error("unknown connection #{0}")]
    UnknownConnection(u32),
}

/// Result type for tagio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Completion code delivered with every finished operation.
///
/// Every posted operation completes exactly once with one of these
/// codes, and a connection latches the first non-OK code it observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed successfully.
    Ok,
    /// Operation was canceled by a disconnect.
    Canceled,
    /// Connection establishment did not finish within the timeout.
    TimedOut,
    /// The peer closed or reset the stream.
    ConnectionReset,
    /// The peer violated the wire protocol.
    ProtocolError,
    /// The connection was not established when the operation was posted.
    NotConnected,
}

impl Status {
    /// Whether this code reports success.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::Canceled => "canceled",
            Status::TimedOut => "timed out",
            Status::ConnectionReset => "connection reset",
            Status::ProtocolError => "protocol error",
            Status::NotConnected => "not connected",
        };
        f.write_str(s)
    }
}
