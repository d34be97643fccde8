//! Session-level error types.

use dialer_wire::{StreamError, WireError};
use thiserror::Error;

/// Failures of the underlying transport. Fatal to the whole session.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Socket or stream I/O failed
    #[error("tunnel io: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded
    #[error("tunnel framing: {0}")]
    Wire(#[from] WireError),

    /// The peer went away
    #[error("tunnel closed")]
    Closed,

    /// A second read loop was started on the same session
    #[error("session is already being served")]
    AlreadyServing,
}

/// Failures on the dial path
#[derive(Error, Debug)]
pub enum DialError {
    /// No session is registered for the client key
    #[error("failed to find session for client {0}")]
    NoSession(String),

    /// The session has been closed
    #[error("session closed")]
    SessionClosed,

    /// The caller gave up before the dial finished
    #[error("dial cancelled")]
    Cancelled,

    /// The connect request could not be sent
    #[error("dial failed: {0}")]
    Tunnel(#[from] TunnelError),

    /// The background dial task did not complete
    #[error("dial task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<DialError> for std::io::Error {
    fn from(err: DialError) -> Self {
        let kind = match err {
            DialError::NoSession(_) => std::io::ErrorKind::NotConnected,
            DialError::Cancelled => std::io::ErrorKind::Interrupted,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<TunnelError> for StreamError {
    fn from(err: TunnelError) -> Self {
        StreamError::other(err)
    }
}
