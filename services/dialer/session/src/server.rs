//! Server facade: accepts agent tunnels and dials through them.

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::{DialError, TunnelError};
use crate::manager::{Dial, SessionManager};
use crate::session::Session;
use crate::tunnel::Tunnel;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Accepts tunnels from agents and hands out dialers by client key
#[derive(Debug, Default)]
pub struct Server {
    sessions: Arc<SessionManager>,
}

impl Server {
    /// Create a server with default session settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server whose sessions use `config`
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(SessionManager::with_config(config)),
        }
    }

    /// Register a tunnel for `client_key` without serving it
    pub fn session_add(&self, client_key: &str, tunnel: Arc<dyn Tunnel>) -> Arc<Session> {
        self.sessions.register(client_key, tunnel)
    }

    /// Deregister and close `session`
    pub async fn session_remove(&self, session: &Arc<Session>) {
        self.sessions.deregister(session).await;
    }

    /// Register `tunnel`, serve it until the transport fails, then deregister.
    ///
    /// Returns the transport error that ended the session.
    pub async fn serve_tunnel(
        &self,
        client_key: &str,
        tunnel: Arc<dyn Tunnel>,
    ) -> Result<(), TunnelError> {
        let session = self.session_add(client_key, tunnel);
        let result = session.run().await;
        match &result {
            Ok(()) => info!("Session {}/{} finished", client_key, session.session_key()),
            Err(TunnelError::Closed) => {
                info!("Agent {} disconnected", client_key)
            }
            Err(e) => error!("Session {}/{} failed: {}", client_key, session.session_key(), e),
        }
        self.session_remove(&session).await;
        result
    }

    /// Whether an agent is connected under `client_key`
    pub fn has_session(&self, client_key: &str) -> bool {
        self.sessions.has_session(client_key)
    }

    /// Registry backing this server
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Dialer for `client_key`, resolved to a session at every dial
    pub fn dialer(&self, client_key: &str) -> ClientDialer {
        ClientDialer {
            sessions: self.sessions.clone(),
            client_key: client_key.to_string(),
            prefix: None,
        }
    }
}

/// Dials through whichever session is first for a client key at dial time
#[derive(Debug, Clone)]
pub struct ClientDialer {
    sessions: Arc<SessionManager>,
    client_key: String,
    prefix: Option<String>,
}

impl ClientDialer {
    /// Namespace every dial as `prefix::protocol`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Client key this dialer resolves
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    fn resolve(&self) -> Result<crate::manager::Dialer, DialError> {
        let dialer = self.sessions.resolve_dialer(&self.client_key)?;
        Ok(match &self.prefix {
            Some(prefix) => dialer.with_prefix(prefix.clone()),
            None => dialer,
        })
    }

    /// Open a connection through the agent
    pub async fn dial(&self, protocol: &str, address: &str) -> Result<Connection, DialError> {
        self.resolve()?.dial(protocol, address).await
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
        self.resolve()?.dial_until(protocol, address, cancel).await
    }
}

#[async_trait]
impl Dial for ClientDialer {
    async fn dial(&self, protocol: &str, address: &str) -> Result<Connection, DialError> {
        ClientDialer::dial(self, protocol, address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ChannelTunnel;
    use dialer_wire::MessageType;

    #[tokio::test]
    async fn test_dialer_resolves_lazily() {
        let server = Arc::new(Server::new());
        let dialer = server.dialer("agent-1");
        assert!(matches!(
            dialer.dial("tcp", "db:5432").await,
            Err(DialError::NoSession(_))
        ));

        let (ours, peer) = ChannelTunnel::pair(8);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_tunnel("agent-1", Arc::new(ours)).await })
        };
        while !server.has_session("agent-1") {
            tokio::task::yield_now().await;
        }

        let conn = dialer.dial("tcp", "db:5432").await.unwrap();
        let connect = peer.receive_message().await.unwrap();
        assert_eq!(connect.message_type(), MessageType::Connect);
        assert_eq!(connect.connection_id(), conn.id());

        // Agent goes away: the session is deregistered and its connections torn down
        drop(peer);
        assert!(matches!(serving.await.unwrap(), Err(TunnelError::Closed)));
        assert!(!server.has_session("agent-1"));
        assert!(conn.close_error().is_some());
        assert!(matches!(
            dialer.dial("tcp", "db:5432").await,
            Err(DialError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn test_prefixed_client_dialer() {
        let server = Server::new();
        let (ours, peer) = ChannelTunnel::pair(8);
        server.session_add("agent-2", Arc::new(ours));

        let dialer = server.dialer("agent-2").with_prefix("socks");
        assert_eq!(dialer.client_key(), "agent-2");
        dialer.dial("tcp", "10.0.0.1:22").await.unwrap();
        assert_eq!(peer.receive_message().await.unwrap().protocol(), "socks::tcp");
    }
}
