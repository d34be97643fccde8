//! Messages exchanged over a tunnel.
//!
//! A [`Message`] is immutable once built. The constructors stamp every
//! message with a process-wide diagnostic id; ids are never used for ordering
//! or deduplication.

use crate::error::{StreamError, WireError};
use bytes::Bytes;
use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Text of an Error message that signals a clean end of stream
pub const EOF_TEXT: &str = "EOF";

static ID_COUNTER: Lazy<AtomicI64> =
    Lazy::new(|| AtomicI64::new(rand::thread_rng().gen_range(0..i64::MAX / 2)));

/// Next diagnostic message id
pub fn next_id() -> i64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Message types as defined in the tunnel protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Bytes for an open connection
    Data = 1,
    /// Request to open an outbound connection on the receiver's side
    Connect = 2,
    /// Terminal error for a connection
    Error = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Connect),
            3 => Ok(MessageType::Error),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// One frame of the tunnel protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: i64,
    connection_id: i64,
    message_type: MessageType,
    payload: Bytes,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    address: String,
}

impl Message {
    /// Data message wrapping `payload`
    pub fn data(connection_id: i64, payload: Bytes) -> Self {
        Self {
            id: next_id(),
            connection_id,
            message_type: MessageType::Data,
            payload,
            protocol: String::new(),
            address: String::new(),
        }
    }

    /// Connect request for `protocol`/`address`.
    ///
    /// The payload repeats the target as `proto/address` so encodings that
    /// only carry the payload can still recover it.
    pub fn connect(connection_id: i64, protocol: &str, address: &str) -> Self {
        Self {
            id: next_id(),
            connection_id,
            message_type: MessageType::Connect,
            payload: Bytes::from(format!("{}/{}", protocol, address)),
            protocol: protocol.to_string(),
            address: address.to_string(),
        }
    }

    /// Error message carrying the text of `err`
    pub fn error(connection_id: i64, err: &StreamError) -> Self {
        Self {
            id: next_id(),
            connection_id,
            message_type: MessageType::Error,
            payload: Bytes::from(err.to_string()),
            protocol: String::new(),
            address: String::new(),
        }
    }

    /// Rebuild a message from the fields a minimal encoding carries.
    ///
    /// Connect targets are parsed back out of the payload. A payload that is
    /// not `proto/address` leaves the target empty; see
    /// [`Message::check_target`].
    pub fn from_parts(
        id: i64,
        message_type: MessageType,
        connection_id: i64,
        payload: Bytes,
    ) -> Self {
        let mut message = Self {
            id,
            connection_id,
            message_type,
            payload,
            protocol: String::new(),
            address: String::new(),
        };
        message.fill_target();
        message
    }

    /// Recover protocol and address from the payload if they are missing
    pub(crate) fn fill_target(&mut self) {
        if self.message_type != MessageType::Connect || !self.protocol.is_empty() {
            return;
        }
        if let Some((protocol, address)) = split_target(&self.payload) {
            self.protocol = protocol;
            self.address = address;
        }
    }

    /// Fails for a connect request whose target could not be recovered
    pub fn check_target(&self) -> Result<(), WireError> {
        if self.message_type == MessageType::Connect && self.protocol.is_empty() {
            return Err(WireError::Target(
                String::from_utf8_lossy(&self.payload).into_owned(),
            ));
        }
        Ok(())
    }

    /// Diagnostic id
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Logical connection this message belongs to
    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Raw payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, keeping the payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Target network protocol (connect requests only)
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Target address (connect requests only)
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Decode the error carried by an Error message.
    ///
    /// `EOF` decodes to [`StreamError::Eof`]; any other text becomes an
    /// opaque [`StreamError::Other`].
    pub fn err(&self) -> StreamError {
        let text = String::from_utf8_lossy(&self.payload);
        if text == EOF_TEXT {
            StreamError::Eof
        } else {
            StreamError::Other(text.into_owned())
        }
    }
}

fn split_target(payload: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(payload).ok()?;
    match text.split_once('/') {
        Some((protocol, address)) if !protocol.is_empty() => {
            Some((protocol.to_string(), address.to_string()))
        }
        _ => None,
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type {
            MessageType::Data => write!(
                f,
                "{} DATA         [{}]: {} bytes",
                self.id,
                self.connection_id,
                self.payload.len()
            ),
            MessageType::Error => {
                write!(f, "{} ERROR        [{}]: {}", self.id, self.connection_id, self.err())
            }
            MessageType::Connect => write!(
                f,
                "{} CONNECT      [{}]: {}/{}",
                self.id, self.connection_id, self.protocol, self.address
            ),
        }
    }
}
