//! Sessions, logical connections and dialers for the remote dialer.
//!
//! A [`Session`] runs over one [`Tunnel`] and multiplexes any number of
//! [`Connection`]s across it. Either side can ask the other to open a real
//! outbound connection; the receiving side dials it and pumps bytes between
//! that socket and the logical connection.
//!
//! ## Features
//!
//! - **Tunnels**: in-process channel pairs and framed byte streams (TCP)
//! - **Connections**: `AsyncRead`/`AsyncWrite` streams with read and write deadlines
//! - **Session Management**: sessions registered per client key, first-session dialing
//! - **Bridge**: outbound TCP/Unix dials with a bidirectional byte pump
//!
//! ## Example
//!
//! ```rust,no_run
//! use dialer_session::{read_client_key, Server, StreamTunnel};
//! use dialer_wire::Encoding;
//! use std::sync::Arc;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Arc::new(Server::new());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8123").await?;
//!
//! // Accept one agent
//! let (mut stream, _) = listener.accept().await?;
//! let client_key = read_client_key(&mut stream).await?;
//! let tunnel = Arc::new(StreamTunnel::new(stream, Encoding::Binary));
//! {
//!     let server = server.clone();
//!     let client_key = client_key.clone();
//!     tokio::spawn(async move { server.serve_tunnel(&client_key, tunnel).await });
//! }
//!
//! // Reach a service on the agent's network
//! let mut conn = server.dialer(&client_key).dial("tcp", "127.0.0.1:5432").await?;
//! conn.write_all(b"ping").await?;
//! let mut reply = [0u8; 4];
//! conn.read_exact(&mut reply).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod read_buffer;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;

// Re-export main types
pub use client::{client_connect, connect_to_proxy, DEFAULT_RETRY_DELAY};
pub use config::{SessionConfig, MAX_BUFFER};
pub use connection::{Connection, ConnectionAddr};
pub use error::{DialError, TunnelError};
pub use manager::{Dial, Dialer, SessionManager};
pub use read_buffer::ReadBuffer;
pub use server::{ClientDialer, Server};
pub use session::{Session, CLIENT_SESSION_KEY};
pub use transport::{
    announce_client_key, connect_tcp, listen_tcp, read_client_key, StreamTunnel,
    MAX_CLIENT_KEY_LEN,
};
pub use tunnel::{write_message, ChannelTunnel, Tunnel};
