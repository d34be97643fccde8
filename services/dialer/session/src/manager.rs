//! Registry of sessions by client key, and the dialers resolved from it.

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::DialError;
use crate::session::Session;
use crate::tunnel::Tunnel;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Outbound-connection factory backed by a remote peer
#[async_trait]
pub trait Dial: Send + Sync {
    /// Open a connection to `protocol`/`address` through the peer
    async fn dial(&self, protocol: &str, address: &str) -> Result<Connection, DialError>;
}

/// Sessions registered per client key, in registration order
#[derive(Debug, Default)]
pub struct SessionManager {
    clients: Mutex<HashMap<String, Vec<Arc<Session>>>>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create an empty manager using default session settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty manager whose sessions use `config`
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Session>>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session for `tunnel` with a fresh random session key and
    /// append it to `client_key`'s list
    pub fn register(&self, client_key: &str, tunnel: Arc<dyn Tunnel>) -> Arc<Session> {
        let session_key = rand::thread_rng().gen_range(0..i64::MAX);
        let session = Session::new(session_key, client_key, tunnel, self.config.clone());

        let count = {
            let mut clients = self.lock();
            let sessions = clients.entry(client_key.to_string()).or_default();
            sessions.push(session.clone());
            sessions.len()
        };
        info!(
            "Registered session {}/{} ({} for this client)",
            client_key, session_key, count
        );
        session
    }

    /// Remove `session` from its client key's list and close it
    pub async fn deregister(&self, session: &Arc<Session>) {
        {
            let mut clients = self.lock();
            if let Some(sessions) = clients.get_mut(session.client_key()) {
                if let Some(pos) = sessions
                    .iter()
                    .position(|s| s.session_key() == session.session_key())
                {
                    sessions.remove(pos);
                }
                if sessions.is_empty() {
                    clients.remove(session.client_key());
                }
            }
        }
        info!(
            "Deregistered session {}/{}",
            session.client_key(),
            session.session_key()
        );
        session.close().await;
    }

    /// Dialer bound to the first session registered under `client_key`.
    ///
    /// Selection is always the oldest live session; there is no balancing
    /// across sessions of the same client.
    pub fn resolve_dialer(&self, client_key: &str) -> Result<Dialer, DialError> {
        let session = self
            .lock()
            .get(client_key)
            .and_then(|sessions| sessions.first().cloned())
            .ok_or_else(|| DialError::NoSession(client_key.to_string()))?;
        debug!(
            "Resolved dialer for {} to session {}",
            client_key,
            session.session_key()
        );
        Ok(Dialer::new(session))
    }

    /// Whether any session is registered under `client_key`
    pub fn has_session(&self, client_key: &str) -> bool {
        self.lock().contains_key(client_key)
    }

    /// Number of sessions registered under `client_key`
    pub fn session_count(&self, client_key: &str) -> usize {
        self.lock().get(client_key).map_or(0, Vec::len)
    }

    /// Client keys with at least one session
    pub fn client_keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

/// Dial function bound to one session
#[derive(Debug, Clone)]
pub struct Dialer {
    session: Arc<Session>,
    prefix: Option<String>,
}

impl Dialer {
    /// Dial through `session`
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            prefix: None,
        }
    }

    /// Namespace every dial as `prefix::protocol`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Session this dialer sends connect requests through
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn protocol(&self, protocol: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}::{}", prefix, protocol),
            None => protocol.to_string(),
        }
    }

    /// Open a connection, returning once the connect request is sent
    pub async fn dial(&self, protocol: &str, address: &str) -> Result<Connection, DialError> {
        self.session
            .open_connection(&self.protocol(protocol), address)
            .await
    }

    /// Open a connection unless `cancel` completes first
    pub async fn dial_until<F>(
        &self,
        protocol: &str,
        address: &str,
        cancel: F,
    ) -> Result<Connection, DialError>
    where
        F: Future<Output = ()>,
    {
        self.session
            .open_connection_until(&self.protocol(protocol), address, cancel)
            .await
    }
}

#[async_trait]
impl Dial for Dialer {
    async fn dial(&self, protocol: &str, address: &str) -> Result<Connection, DialError> {
        Dialer::dial(self, protocol, address).await
    }
}
