//! Length-delimited framing of messages over a byte stream.

use crate::error::WireError;
use crate::message::{Message, MessageType};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Binary header size after the length prefix: id, type, connection id
pub const FRAME_HEADER_SIZE: usize = 8 + 1 + 8;

/// How a message body is laid out after the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Compact binary header followed by the raw payload
    #[default]
    Binary,
    /// serde_json of the whole message
    Json,
}

impl Encoding {
    /// Encode one message into a length-prefixed frame
    pub fn encode(&self, message: &Message, max_frame_size: usize) -> Result<Bytes, WireError> {
        let body = match self {
            Encoding::Binary => {
                let mut body = BytesMut::with_capacity(FRAME_HEADER_SIZE + message.payload().len());
                body.put_i64(message.id());
                body.put_u8(message.message_type() as u8);
                body.put_i64(message.connection_id());
                body.put_slice(message.payload());
                body.freeze()
            }
            Encoding::Json => Bytes::from(serde_json::to_vec(message)?),
        };

        let total_size = 4 + body.len();
        if total_size > max_frame_size {
            return Err(WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn decode_body(&self, mut body: Bytes) -> Result<Message, WireError> {
        match self {
            Encoding::Binary => {
                if body.len() < FRAME_HEADER_SIZE {
                    return Err(WireError::Malformed);
                }
                let id = body.get_i64();
                let message_type = MessageType::try_from(body.get_u8())?;
                let connection_id = body.get_i64();
                Ok(Message::from_parts(id, message_type, connection_id, body))
            }
            Encoding::Json => {
                let mut message: Message = serde_json::from_slice(&body)?;
                message.fill_target();
                Ok(message)
            }
        }
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    encoding: Encoding,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Override the frame size limit
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Encoding this decoder expects
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame is
    /// available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len + 4 > self.max_frame_size {
            return Err(WireError::Size(frame_len + 4));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(frame_len).freeze();
        self.encoding.decode_body(body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Encoding::default())
    }
}
