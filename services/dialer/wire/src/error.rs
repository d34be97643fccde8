//! Wire protocol and stream error types.

use std::io;
use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown message type
    #[error("unknown type {0}")]
    Type(u8),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// Connect payload is not of the form `proto/address`
    #[error("malformed connect target: {0:?}")]
    Target(String),

    /// JSON body could not be encoded or decoded
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors scoped to one logical connection.
///
/// These are the values carried by Error messages. Only the text survives a
/// hop across the tunnel: the receiver decodes [`StreamError::Eof`] from the
/// literal `EOF` and everything else into [`StreamError::Other`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Clean end of stream
    #[error("EOF")]
    Eof,

    /// Read or write on a connection that has been torn down
    #[error("io: read/write on closed pipe")]
    ClosedPipe,

    /// A read or write deadline elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The owning tunnel went away
    #[error("tunnel disconnect")]
    TunnelDisconnect,

    /// Any other error, identified only by its text
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Build an opaque error from anything displayable
    pub fn other(err: impl std::fmt::Display) -> Self {
        StreamError::Other(err.to_string())
    }

    /// Whether this is a clean end of stream
    pub fn is_eof(&self) -> bool {
        matches!(self, StreamError::Eof)
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => StreamError::Eof,
            io::ErrorKind::BrokenPipe => StreamError::ClosedPipe,
            io::ErrorKind::TimedOut => StreamError::DeadlineExceeded,
            _ => StreamError::Other(err.to_string()),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::Eof => io::ErrorKind::UnexpectedEof,
            StreamError::ClosedPipe => io::ErrorKind::BrokenPipe,
            StreamError::DeadlineExceeded => io::ErrorKind::TimedOut,
            StreamError::TunnelDisconnect => io::ErrorKind::ConnectionReset,
            StreamError::Other(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
