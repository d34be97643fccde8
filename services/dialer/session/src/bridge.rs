//! Outbound dials and the byte pump behind a connect request.
//!
//! When the peer asks for a connection, the receiving side dials the real
//! target and copies bytes both ways between that socket and the logical
//! connection. Whichever direction stops first stops the other. The final
//! Error frame goes out only after both have stopped, so it can never
//! overtake a Data frame for the same connection.

use crate::config::SessionConfig;
use crate::connection::ConnectionCore;
use bytes::Bytes;
use dialer_wire::StreamError;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Socket produced by an outbound dial
pub(crate) enum OutboundStream {
    /// TCP over IPv4 or IPv6
    Tcp(TcpStream),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for OutboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OutboundStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            OutboundStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            OutboundStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            OutboundStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            OutboundStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            OutboundStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            OutboundStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            OutboundStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Network part of a possibly namespaced protocol (`http::tcp` -> `tcp`)
pub(crate) fn network(protocol: &str) -> &str {
    protocol
        .rsplit_once("::")
        .map_or(protocol, |(_, network)| network)
}

/// Dial `address` over `protocol`, giving up after `timeout`
pub(crate) async fn connect_outbound(
    protocol: &str,
    address: &str,
    timeout: Duration,
) -> io::Result<OutboundStream> {
    let network = network(protocol);
    let connect = async {
        match network {
            "tcp" => TcpStream::connect(address).await.map(OutboundStream::Tcp),
            "tcp4" => connect_tcp_family(address, true).await.map(OutboundStream::Tcp),
            "tcp6" => connect_tcp_family(address, false).await.map(OutboundStream::Tcp),
            #[cfg(unix)]
            "unix" => UnixStream::connect(address).await.map(OutboundStream::Unix),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported protocol {}", other),
            )),
        }
    };

    tokio::time::timeout(timeout, connect).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {} {}: i/o timeout", network, address),
        )
    })?
}

async fn connect_tcp_family(address: &str, ipv4: bool) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await? {
        if addr.is_ipv4() != ipv4 {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no suitable address found for {}", address),
        )
    }))
}

/// Serve a connect request: dial the target, then pump until either side ends
pub(crate) async fn client_dial(
    conn: Arc<ConnectionCore>,
    protocol: String,
    address: String,
    config: SessionConfig,
) {
    let stream = match connect_outbound(&protocol, &address, config.dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Dial {}/{} for connection {} failed: {}",
                protocol,
                address,
                conn.id(),
                e
            );
            conn.close_with(StreamError::from(e)).await;
            return;
        }
    };

    debug!(
        "Connection {} dialed {}/{}",
        conn.id(),
        protocol,
        address
    );
    let err = pipe(&conn, stream, config.copy_buffer_size).await;
    debug!("Connection {} pump finished: {}", conn.id(), err);
    conn.close_with(err).await;
}

/// Copy bytes both ways between `stream` and `conn` and return the error
/// that ended the first direction to stop.
///
/// The connection is closed locally but the peer is not told; the caller
/// sends that once this returns.
async fn pipe<S>(conn: &ConnectionCore, stream: S, buffer_size: usize) -> StreamError
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let socket_done = Notify::new();
    let conn_done = Notify::new();

    let downstream = async {
        let result = tokio::select! {
            err = copy_to_socket(conn, &mut writer, buffer_size) => Some(err),
            _ = conn_done.notified() => None,
        };
        if let Some(err) = &result {
            conn.local_close(err.clone());
        }
        socket_done.notify_one();
        result
    };

    let upstream = async {
        let result = copy_from_socket(conn, &mut reader, buffer_size, &socket_done).await;
        if let Some(err) = &result {
            conn.local_close(err.clone());
        }
        conn_done.notify_one();
        result
    };

    let (down, up) = tokio::join!(downstream, upstream);
    conn.close_error()
        .or(down)
        .or(up)
        .unwrap_or(StreamError::ClosedPipe)
}

async fn copy_to_socket<W>(conn: &ConnectionCore, writer: &mut W, buffer_size: usize) -> StreamError
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match conn.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => return err,
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return e.into();
        }
    }
}

/// Forward socket reads as Data frames. Only the socket read is abandoned on
/// `stop`; a send already started always completes.
async fn copy_from_socket<R>(
    conn: &ConnectionCore,
    reader: &mut R,
    buffer_size: usize,
    stop: &Notify,
) -> Option<StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = stop.notified() => return None,
        };
        let n = match read {
            Ok(0) => return Some(StreamError::Eof),
            Ok(n) => n,
            Err(e) => return Some(e.into()),
        };
        if let Err(err) = conn.write_bytes(Bytes::copy_from_slice(&buf[..n])).await {
            return Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::tunnel::{ChannelTunnel, Tunnel};
    use dialer_wire::{Message, MessageType};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    fn session_pair() -> (Arc<Session>, ChannelTunnel) {
        let (ours, theirs) = ChannelTunnel::pair(64);
        let session = Session::new(5, "agent", Arc::new(ours), SessionConfig::default());
        let runner = session.clone();
        tokio::spawn(async move { runner.run().await });
        (session, theirs)
    }

    async fn next(peer: &ChannelTunnel) -> Message {
        timeout(Duration::from_secs(5), peer.receive_message())
            .await
            .expect("peer frame")
            .unwrap()
    }

    #[test]
    fn test_network_strips_prefix() {
        assert_eq!(network("tcp"), "tcp");
        assert_eq!(network("http::tcp"), "tcp");
        assert_eq!(network("a::b::unix"), "unix");
    }

    #[tokio::test]
    async fn test_connect_request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 64];
            while !request.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(RESPONSE).await.unwrap();
            request
        });

        let (session, peer) = session_pair();
        peer.send_message(Message::connect(7, "tcp", &target)).await.unwrap();
        peer.send_message(Message::data(7, Bytes::from_static(REQUEST)))
            .await
            .unwrap();

        let mut response = Vec::new();
        let closing = loop {
            let frame = next(&peer).await;
            assert_eq!(frame.connection_id(), 7);
            match frame.message_type() {
                MessageType::Data => response.extend_from_slice(frame.payload()),
                MessageType::Error => break frame,
                MessageType::Connect => panic!("unexpected connect"),
            }
        };
        assert_eq!(response, RESPONSE);
        assert_eq!(closing.err(), StreamError::Eof);
        assert_eq!(server.await.unwrap(), REQUEST);

        // Exactly one close notification
        assert!(timeout(Duration::from_millis(200), peer.receive_message())
            .await
            .is_err());
        assert_eq!(session.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (session, peer) = session_pair();
        peer.send_message(Message::connect(3, "tcp", &target)).await.unwrap();

        let frame = next(&peer).await;
        assert_eq!(frame.message_type(), MessageType::Error);
        assert_eq!(frame.connection_id(), 3);
        assert!(!frame.err().is_eof());
        assert_eq!(session.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let (_session, peer) = session_pair();
        peer.send_message(Message::connect(4, "sctp", "somewhere:1"))
            .await
            .unwrap();

        let frame = next(&peer).await;
        assert_eq!(frame.message_type(), MessageType::Error);
        assert_eq!(
            frame.err(),
            StreamError::Other("unsupported protocol sctp".to_string())
        );
    }

    #[tokio::test]
    async fn test_peer_close_stops_pump_silently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let (session, peer) = session_pair();
        peer.send_message(Message::connect(9, "tcp", &target)).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        peer.send_message(Message::error(9, &StreamError::Eof)).await.unwrap();

        // The dialed socket is released once the peer closes
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // and nothing is echoed back
        assert!(timeout(Duration::from_millis(200), peer.receive_message())
            .await
            .is_err());
        assert_eq!(session.connection_count(), 0);
    }
}
