//! Logical connections multiplexed over a session.
//!
//! Every connection has a shared core that the session keeps in its table
//! and a handle ([`Connection`]) given to application code. Closing happens
//! in two tiers: a local close releases the receive buffer and fails further
//! I/O, and a tunnel close additionally tells the peer, at most once.

use crate::read_buffer::{ReadBuffer, ReadTimer};
use crate::session::Session;
use bytes::Bytes;
use dialer_wire::{Message, StreamError};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Protocol and address a connection was opened for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAddr {
    protocol: String,
    address: String,
}

impl ConnectionAddr {
    /// Build an address from its parts
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }

    /// Network protocol, e.g. `tcp`
    pub fn network(&self) -> &str {
        &self.protocol
    }

    /// Target address
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ConnectionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug)]
enum ConnState {
    Open,
    Closed {
        err: StreamError,
        peer_notified: bool,
    },
}

struct Deadlines {
    write: Option<Instant>,
}

/// State shared between a session's table and the connection's users
pub(crate) struct ConnectionCore {
    id: i64,
    addr: ConnectionAddr,
    session: Weak<Session>,
    buffer: ReadBuffer,
    state: Mutex<ConnState>,
    deadlines: Mutex<Deadlines>,
}

impl ConnectionCore {
    pub(crate) fn new(
        id: i64,
        session: &Arc<Session>,
        addr: ConnectionAddr,
        compact_threshold: usize,
    ) -> Self {
        Self {
            id,
            addr,
            session: Arc::downgrade(session),
            buffer: ReadBuffer::with_compact_threshold(id, compact_threshold),
            state: Mutex::new(ConnState::Open),
            deadlines: Mutex::new(Deadlines { write: None }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn addr(&self) -> &ConnectionAddr {
        &self.addr
    }

    pub(crate) fn buffer(&self) -> &ReadBuffer {
        &self.buffer
    }

    /// Error the connection was closed with, if any
    pub(crate) fn close_error(&self) -> Option<StreamError> {
        match &*self.state() {
            ConnState::Open => None,
            ConnState::Closed { err, .. } => Some(err.clone()),
        }
    }

    /// Queue inbound bytes from a Data frame
    pub(crate) fn on_data(&self, payload: &[u8]) -> Result<(), StreamError> {
        self.buffer.write(payload)
    }

    pub(crate) async fn read(&self, dst: &mut [u8]) -> Result<usize, StreamError> {
        self.buffer.read(dst).await
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        if data.is_empty() {
            return Ok(0);
        }
        self.write_bytes(Bytes::copy_from_slice(data)).await
    }

    /// Send `data` to the peer as one Data frame
    pub(crate) async fn write_bytes(&self, data: Bytes) -> Result<usize, StreamError> {
        if self.close_error().is_some() {
            return Err(StreamError::ClosedPipe);
        }
        let write_deadline = self
            .deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write;
        if let Some(deadline) = write_deadline {
            if Instant::now() >= deadline {
                return Err(StreamError::DeadlineExceeded);
            }
        }
        let session = self.session.upgrade().ok_or(StreamError::ClosedPipe)?;
        Ok(session.write_message(Message::data(self.id, data)).await?)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write = deadline;
    }

    /// Release local resources. The first recorded error wins.
    pub(crate) fn local_close(&self, err: StreamError) -> bool {
        {
            let mut state = self.state();
            if !matches!(*state, ConnState::Open) {
                return false;
            }
            *state = ConnState::Closed {
                err: err.clone(),
                peer_notified: false,
            };
        }
        debug!(connection_id = self.id, "connection closed: {}", err);
        self.buffer.close(Some(err));
        true
    }

    /// Tear down after the peer reported `err`; the peer needs no reply
    pub(crate) fn remote_close(&self, err: StreamError) {
        {
            let mut state = self.state();
            if let ConnState::Closed { peer_notified, .. } = &mut *state {
                *peer_notified = true;
                return;
            }
            *state = ConnState::Closed {
                err: err.clone(),
                peer_notified: true,
            };
        }
        debug!(connection_id = self.id, "connection closed by peer: {}", err);
        self.buffer.close(Some(err));
    }

    fn take_peer_notification(&self) -> Option<StreamError> {
        match &mut *self.state() {
            ConnState::Closed {
                err,
                peer_notified,
            } if !*peer_notified => {
                *peer_notified = true;
                Some(err.clone())
            }
            _ => None,
        }
    }

    /// Close locally, then send the recorded error to the peer once
    pub(crate) async fn tunnel_close(&self, err: StreamError) {
        self.local_close(err);
        let Some(err) = self.take_peer_notification() else {
            return;
        };
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Err(e) = session.write_message(Message::error(self.id, &err)).await {
            debug!(
                connection_id = self.id,
                "failed to notify peer of close ({}): {}", err, e
            );
        }
    }

    /// Deregister from the session and tunnel-close with `err`
    pub(crate) async fn close_with(&self, err: StreamError) {
        if let Some(session) = self.session.upgrade() {
            session.forget_connection(self);
        }
        self.tunnel_close(err).await;
    }
}

/// A multiplexed byte stream.
///
/// Reads block until data arrives, the stream ends, or the read deadline
/// passes. Writes are sent to the peer immediately as Data frames. The type
/// implements [`AsyncRead`] and [`AsyncWrite`] so it can stand in for a
/// socket; end of stream surfaces as a zero-length read there.
pub struct Connection {
    core: Arc<ConnectionCore>,
    read_timer: ReadTimer,
    // Mutex slots keep `Connection: Sync`; the poll methods reach them through `get_mut`
    pending_write: Mutex<Option<BoxFuture<'static, Result<usize, StreamError>>>>,
    pending_close: Mutex<Option<BoxFuture<'static, ()>>>,
}

fn slot<T>(cell: &mut Mutex<T>) -> &mut T {
    cell.get_mut().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    pub(crate) fn new(core: Arc<ConnectionCore>) -> Self {
        Self {
            core,
            read_timer: None,
            pending_write: Mutex::new(None),
            pending_close: Mutex::new(None),
        }
    }

    /// Connection id within the owning session
    pub fn id(&self) -> i64 {
        self.core.id()
    }

    /// Address the connection was opened for
    pub fn local_addr(&self) -> &ConnectionAddr {
        self.core.addr()
    }

    /// Address the connection was opened for
    pub fn remote_addr(&self) -> &ConnectionAddr {
        self.core.addr()
    }

    /// Read available bytes into `dst`
    pub fn read<'a>(
        &self,
        dst: &'a mut [u8],
    ) -> impl Future<Output = Result<usize, StreamError>> + Send + 'a {
        let core = self.core.clone();
        async move { core.read(dst).await }
    }

    /// Send `data` to the peer
    pub fn write<'a>(
        &self,
        data: &'a [u8],
    ) -> impl Future<Output = Result<usize, StreamError>> + Send + 'a {
        let core = self.core.clone();
        async move { core.write(data).await }
    }

    /// Close the connection and tell the peer. Further calls do nothing.
    pub fn close(&self) -> impl Future<Output = ()> + Send + 'static {
        let core = self.core.clone();
        async move { core.close_with(StreamError::Eof).await }
    }

    /// Error the connection was torn down with, if it has been
    pub fn close_error(&self) -> Option<StreamError> {
        self.core.close_error()
    }

    /// Set both deadlines
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the absolute deadline for reads; `None` waits forever
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.core.buffer().set_deadline(deadline);
    }

    /// Set the absolute deadline checked when a write starts
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.core.set_write_deadline(deadline);
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, StreamError>> {
        let pending = slot(&mut self.pending_write);
        match pending.as_mut() {
            Some(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(res) => {
                    *pending = None;
                    Poll::Ready(res)
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Ready(Ok(0)),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id())
            .field("addr", self.core.addr())
            .field("closed", &self.core.close_error())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.core.buffer().poll_read(cx, buf, &mut this.read_timer) {
            Poll::Ready(Ok(())) | Poll::Ready(Err(StreamError::Eof)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if slot(&mut this.pending_write).is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let core = this.core.clone();
            let data = Bytes::copy_from_slice(buf);
            *slot(&mut this.pending_write) = Some(Box::pin(async move { core.write_bytes(data).await }));
        }
        this.poll_pending_write(cx).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.get_mut()
            .poll_pending_write(cx)
            .map(|res| res.map(|_| ()).map_err(io::Error::from))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if let Poll::Ready(Err(e)) = this.poll_pending_write(cx) {
            warn!(connection_id = this.core.id(), "write failed during shutdown: {}", e);
        }
        if slot(&mut this.pending_write).is_some() {
            return Poll::Pending;
        }
        let core = this.core.clone();
        let pending = slot(&mut this.pending_close);
        let fut = pending
            .get_or_insert_with(move || Box::pin(async move { core.close_with(StreamError::Eof).await }));
        match fut.as_mut().poll(cx) {
            Poll::Ready(()) => {
                *pending = None;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.core.close_error().is_some() {
            return;
        }
        // Dropping an open handle closes it so the peer releases its socket
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let core = self.core.clone();
            handle.spawn(async move { core.close_with(StreamError::Eof).await });
        } else {
            self.core.local_close(StreamError::ClosedPipe);
        }
    }
}
