//! Message framing, stream errors and frame encodings for the remote dialer.
//!
//! A tunnel carries [`Message`] values between two peers. Each message names a
//! logical connection, a type and an opaque payload. This crate defines those
//! messages and two interchangeable encodings for carrying them over a byte
//! stream.
//!
//! ## Wire Format
//!
//! Binary encoding (connect targets travel inside the payload):
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | i64 id               | diagnostic message id      |
//! +----------------------+----------------------------+
//! | u8 type              | 1 data, 2 connect, 3 error |
//! +----------------------+----------------------------+
//! | i64 connection_id    | logical connection         |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```
//!
//! JSON encoding: `u32 frame_len` followed by the serde_json form of the
//! whole message.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod message;

// Re-export main types
pub use error::{StreamError, WireError};
pub use frame::{Encoding, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
pub use message::{next_id, Message, MessageType, EOF_TEXT};
