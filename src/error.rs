//! Tunnel error taxonomy.
//!
//! DESIGN
//! ======
//! Errors are scoped. Stream-scoped variants (`Protocol`, `Transport`, and a
//! liveness `Timeout`) end the whole session and fan out to every virtual
//! connection it owns. Connection-scoped variants (`Dial`, `Remote`, `Closed`,
//! a deadline `Timeout`) reach only the caller of that one dial/read/write.
//!
//! The type is `Clone` because one session failure is delivered to many
//! connections; `io::Error` is kept behind an `Arc` for that reason.

use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    /// Malformed or illegal frame; the stream can no longer be trusted.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Handshake rejected by the server-side authorizer.
    #[error("authorization failed: {0}")]
    Auth(String),
    /// The far side could not (or would not) dial the requested address.
    #[error("dial failed: {0}")]
    Dial(String),
    /// Liveness, dial, or read/write deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),
    /// No live session for the peer, or it went away mid-flight.
    #[error("session closed: {0}")]
    SessionClosed(String),
    /// The peer closed the connection with an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The connection was already closed locally.
    #[error("connection closed")]
    Closed,
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// WebSocket transport failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Local socket I/O failure.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl TunnelError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Whether a reconnect loop should try again after this error. The
    /// connector itself stops only when its own token is cancelled.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Whether this error ends the whole session rather than one connection.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Transport(_) | Self::SessionClosed(_))
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Timeout(_) => io::ErrorKind::TimedOut,
            Self::Dial(_) => io::ErrorKind::ConnectionRefused,
            Self::Remote(_) => io::ErrorKind::ConnectionReset,
            Self::Closed | Self::SessionClosed(_) | Self::Transport(_) => io::ErrorKind::BrokenPipe,
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::Auth(_) => io::ErrorKind::PermissionDenied,
            Self::Protocol(_) => io::ErrorKind::InvalidData,
            Self::Io(err) => err.kind(),
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<frames::CodecError> for TunnelError {
    fn from(err: frames::CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = err.io_kind();
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
