//! Session: one tunnel and the logical connections multiplexed over it.
//!
//! A single task runs [`Session::run`], which reads frames in arrival order
//! and dispatches them:
//!
//! - `Connect` registers a connection under the frame's id and starts an
//!   outbound dial plus byte pump in the background.
//! - `Data` is queued on the matching connection. Data for an unknown id is
//!   answered with an Error frame.
//! - `Error` tears the matching connection down without replying.
//!
//! Connections opened from this side get ids from a per-session counter and
//! are returned to the caller as soon as the connect request is sent.

use crate::bridge;
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionAddr, ConnectionCore};
use crate::error::{DialError, TunnelError};
use crate::tunnel::{write_message, Tunnel};
use dialer_wire::{Message, MessageType, StreamError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

/// Client key used by the agent side, which only ever has one session
pub const CLIENT_SESSION_KEY: &str = "client";

#[derive(Default)]
struct ConnectionTable {
    connections: HashMap<i64, Arc<ConnectionCore>>,
    closed: bool,
}

/// One tunnel and its live connections
pub struct Session {
    client_key: String,
    session_key: i64,
    config: SessionConfig,
    next_connection_id: AtomicI64,
    tunnel: Arc<dyn Tunnel>,
    table: Mutex<ConnectionTable>,
    serving: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a session for `client_key` over `tunnel`
    pub fn new(
        session_key: i64,
        client_key: impl Into<String>,
        tunnel: Arc<dyn Tunnel>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_key: client_key.into(),
            session_key,
            config,
            next_connection_id: AtomicI64::new(0),
            tunnel,
            table: Mutex::new(ConnectionTable::default()),
            serving: tokio::sync::Mutex::new(()),
        })
    }

    /// Create the agent-side session for a tunnel to the server
    pub fn new_client(tunnel: Arc<dyn Tunnel>, config: SessionConfig) -> Arc<Self> {
        Self::new(0, CLIENT_SESSION_KEY, tunnel, config)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Logical identity of the peer
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Random id distinguishing sessions under one client key
    pub fn session_key(&self) -> i64 {
        self.session_key
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Whether [`Session::close`] has run
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Read and dispatch frames until the tunnel fails.
    ///
    /// Only transport errors end the loop; the caller should then deregister
    /// and close the session.
    pub async fn run(self: &Arc<Self>) -> Result<(), TunnelError> {
        let _serving = self
            .serving
            .try_lock()
            .map_err(|_| TunnelError::AlreadyServing)?;
        info!(
            "Serving session {}/{}",
            self.client_key, self.session_key
        );

        loop {
            let message = self.tunnel.receive_message().await.map_err(|e| {
                info!(
                    "Session {}/{} tunnel ended: {}",
                    self.client_key, self.session_key, e
                );
                e
            })?;
            trace!("recv {}", message);
            self.serve_message(message).await;
        }
    }

    async fn serve_message(self: &Arc<Self>, message: Message) {
        let connection_id = message.connection_id();

        if message.message_type() == MessageType::Connect {
            if let Err(e) = message.check_target() {
                let err = StreamError::other(&e);
                warn!("Rejecting connect {}: {}", connection_id, err);
                if let Err(e) = self.write_message(Message::error(connection_id, &err)).await {
                    debug!("Failed to reject connect {}: {}", connection_id, e);
                }
                return;
            }
            self.client_connect(&message);
            return;
        }

        let conn = self.lock().connections.get(&connection_id).cloned();
        let Some(conn) = conn else {
            if message.message_type() == MessageType::Data {
                let err = StreamError::Other(format!(
                    "connection not found {}/{}/{}",
                    self.client_key, self.session_key, connection_id
                ));
                warn!("{}", err);
                if let Err(e) = self.write_message(Message::error(connection_id, &err)).await {
                    debug!("Failed to report unknown connection {}: {}", connection_id, e);
                }
            }
            return;
        };

        match message.message_type() {
            MessageType::Data => {
                if let Err(e) = conn.on_data(message.payload()) {
                    self.close_connection(connection_id, e).await;
                }
            }
            MessageType::Error => {
                if let Some(conn) = self.take_connection(connection_id) {
                    conn.remote_close(message.err());
                }
            }
            MessageType::Connect => {}
        }
    }

    fn client_connect(self: &Arc<Self>, message: &Message) {
        let connection_id = message.connection_id();
        let core = Arc::new(ConnectionCore::new(
            connection_id,
            self,
            ConnectionAddr::new(message.protocol(), message.address()),
            self.config.compact_threshold,
        ));

        let replaced = {
            let mut table = self.lock();
            if table.closed {
                debug!("Ignoring connect {} on closed session", connection_id);
                return;
            }
            table.connections.insert(connection_id, core.clone())
        };
        if let Some(old) = replaced {
            warn!("Connect request reuses live connection id {}", connection_id);
            // The id now names the new connection on both sides; the old one goes quietly
            old.remote_close(StreamError::ClosedPipe);
        }

        debug!(
            "Connect request {} for {}/{}",
            connection_id,
            message.protocol(),
            message.address()
        );
        tokio::spawn(bridge::client_dial(
            core,
            message.protocol().to_string(),
            message.address().to_string(),
            self.config.clone(),
        ));
    }

    /// Open a connection to `protocol`/`address` on the peer's side.
    ///
    /// Returns as soon as the connect request is sent. If the peer cannot
    /// connect it answers with an Error frame, which closes the returned
    /// connection.
    pub async fn open_connection(
        self: &Arc<Self>,
        protocol: &str,
        address: &str,
    ) -> Result<Connection, DialError> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let core = Arc::new(ConnectionCore::new(
            connection_id,
            self,
            ConnectionAddr::new(protocol, address),
            self.config.compact_threshold,
        ));

        {
            let mut table = self.lock();
            if table.closed {
                return Err(DialError::SessionClosed);
            }
            table.connections.insert(connection_id, core.clone());
        }

        if let Err(e) = self
            .write_message(Message::connect(connection_id, protocol, address))
            .await
        {
            self.close_connection(connection_id, StreamError::other(&e)).await;
            return Err(e.into());
        }

        debug!(
            "Opened connection {} to {}/{} via {}/{}",
            connection_id, protocol, address, self.client_key, self.session_key
        );
        Ok(Connection::new(core))
    }

    /// Like [`Session::open_connection`], abandoning the dial once `cancel`
    /// completes.
    ///
    /// An abandoned dial still runs to the end in the background and the
    /// connection it produces is closed, so the peer never keeps an orphaned
    /// socket.
    pub async fn open_connection_until<F>(
        self: &Arc<Self>,
        protocol: &str,
        address: &str,
        cancel: F,
    ) -> Result<Connection, DialError>
    where
        F: Future<Output = ()>,
    {
        let session = self.clone();
        let (protocol, address) = (protocol.to_string(), address.to_string());
        let mut attempt =
            tokio::spawn(async move { session.open_connection(&protocol, &address).await });

        let outcome = tokio::select! {
            _ = cancel => None,
            result = &mut attempt => Some(result),
        };

        match outcome {
            Some(result) => result?,
            None => {
                tokio::spawn(async move {
                    if let Ok(Ok(conn)) = attempt.await {
                        conn.close().await;
                    }
                });
                Err(DialError::Cancelled)
            }
        }
    }

    /// Send one message over the tunnel
    pub(crate) async fn write_message(&self, message: Message) -> Result<usize, TunnelError> {
        write_message(self.tunnel.as_ref(), message).await
    }

    /// Deregister connection `connection_id` and tunnel-close it with `err`
    pub(crate) async fn close_connection(&self, connection_id: i64, err: StreamError) {
        if let Some(conn) = self.take_connection(connection_id) {
            conn.tunnel_close(err).await;
        }
    }

    pub(crate) fn take_connection(&self, connection_id: i64) -> Option<Arc<ConnectionCore>> {
        self.lock().connections.remove(&connection_id)
    }

    /// Deregister `core` if it is still the connection registered under its id
    pub(crate) fn forget_connection(&self, core: &ConnectionCore) {
        let mut table = self.lock();
        let registered = table
            .connections
            .get(&core.id())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), core));
        if registered {
            table.connections.remove(&core.id());
        }
    }

    /// Tear down every connection with "tunnel disconnect" and refuse new ones
    pub async fn close(&self) {
        let drained: Vec<Arc<ConnectionCore>> = {
            let mut table = self.lock();
            table.closed = true;
            table.connections.drain().map(|(_, conn)| conn).collect()
        };
        info!(
            "Closing session {}/{} with {} connections",
            self.client_key,
            self.session_key,
            drained.len()
        );
        for conn in drained {
            conn.tunnel_close(StreamError::TunnelDisconnect).await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_key", &self.client_key)
            .field("session_key", &self.session_key)
            .field("connections", &self.connection_count())
            .finish()
    }
}
