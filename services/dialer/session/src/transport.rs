//! Byte-stream tunnels and TCP helpers.
//!
//! [`StreamTunnel`] frames messages over any `AsyncRead + AsyncWrite` stream.
//! Agents announce their client key with a short preamble before framing
//! begins.

use crate::error::TunnelError;
use crate::tunnel::Tunnel;
use async_trait::async_trait;
use bytes::BytesMut;
use dialer_wire::{Encoding, FrameDecoder, Message, DEFAULT_MAX_FRAME_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::trace;

/// Longest client key accepted in a preamble
pub const MAX_CLIENT_KEY_LEN: usize = 1024;

struct FrameReader<S> {
    io: ReadHalf<S>,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

/// Tunnel carrying length-delimited frames over a byte stream
pub struct StreamTunnel<S> {
    reader: Mutex<FrameReader<S>>,
    writer: Mutex<WriteHalf<S>>,
    encoding: Encoding,
    max_frame_size: usize,
}

impl<S> StreamTunnel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `stream` using `encoding` for every frame
    pub fn new(stream: S, encoding: Encoding) -> Self {
        let (io, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FrameReader {
                io,
                decoder: FrameDecoder::new(encoding),
                buffer: BytesMut::with_capacity(64 * 1024),
            }),
            writer: Mutex::new(writer),
            encoding,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Override the frame size limit for both directions
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        let reader = self.reader.get_mut();
        reader.decoder = FrameDecoder::new(self.encoding).with_max_frame_size(max_frame_size);
        self
    }
}

#[async_trait]
impl<S> Tunnel for StreamTunnel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn receive_message(&self) -> Result<Message, TunnelError> {
        let mut guard = self.reader.lock().await;
        let reader = &mut *guard;
        loop {
            if let Some(message) = reader.decoder.decode(&mut reader.buffer)? {
                return Ok(message);
            }

            let bytes_read = reader.io.read_buf(&mut reader.buffer).await?;
            if bytes_read == 0 {
                return Err(TunnelError::Closed);
            }
            trace!(
                "Read {} bytes, buffer now has {} bytes",
                bytes_read,
                reader.buffer.len()
            );
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), TunnelError> {
        let frame = self.encoding.encode(&message, self.max_frame_size)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: &str) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Write the client-key preamble an agent sends before its first frame
pub async fn announce_client_key<W: AsyncWrite + Unpin>(
    writer: &mut W,
    client_key: &str,
) -> Result<(), TunnelError> {
    if client_key.is_empty() || client_key.len() > MAX_CLIENT_KEY_LEN {
        return Err(invalid_key(format!("invalid client key length {}", client_key.len())));
    }
    writer.write_u16(client_key.len() as u16).await?;
    writer.write_all(client_key.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the client-key preamble from a freshly accepted agent stream
pub async fn read_client_key<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, TunnelError> {
    let len = reader.read_u16().await? as usize;
    if len == 0 || len > MAX_CLIENT_KEY_LEN {
        return Err(invalid_key(format!("invalid client key length {}", len)));
    }
    let mut key = vec![0u8; len];
    reader.read_exact(&mut key).await?;
    String::from_utf8(key).map_err(|_| invalid_key("client key is not utf-8".to_string()))
}

fn invalid_key(reason: String) -> TunnelError {
    TunnelError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dialer_wire::MessageType;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_stream_tunnel_over_duplex() {
        for encoding in [Encoding::Binary, Encoding::Json] {
            let (left, right) = tokio::io::duplex(64);
            let a = StreamTunnel::new(left, encoding);
            let b = StreamTunnel::new(right, encoding);

            let payload = Bytes::from(vec![7u8; 1000]);
            let sender = tokio::spawn(async move {
                a.send_message(Message::connect(1, "tcp", "db:5432")).await.unwrap();
                a.send_message(Message::data(1, payload)).await.unwrap();
                a
            });

            let connect = b.receive_message().await.unwrap();
            assert_eq!(connect.message_type(), MessageType::Connect);
            assert_eq!(connect.protocol(), "tcp");
            assert_eq!(connect.address(), "db:5432");

            let data = b.receive_message().await.unwrap();
            assert_eq!(data.payload().len(), 1000);

            let a = sender.await.unwrap();
            drop(a);
            assert!(matches!(b.receive_message().await, Err(TunnelError::Closed)));
        }
    }

    #[tokio::test]
    async fn test_client_key_preamble() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let agent = tokio::spawn(async move {
            let mut stream = connect_tcp(&bound_addr.to_string()).await.unwrap();
            announce_client_key(&mut stream, "agent-7").await.unwrap();
            stream
        });

        let (mut accepted, _) = listener.accept().await.unwrap();
        assert_eq!(read_client_key(&mut accepted).await.unwrap(), "agent-7");
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_client_key_rejected() {
        let mut sink = Vec::new();
        assert!(announce_client_key(&mut sink, "").await.is_err());
    }
}
