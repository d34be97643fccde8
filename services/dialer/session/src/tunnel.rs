//! The duplex channel a session runs over.
//!
//! A [`Tunnel`] moves whole [`Message`] values between two peers. Only one
//! task receives from a tunnel at a time, but any number of connections may
//! send concurrently, so implementations must serialize sends themselves.

use crate::error::TunnelError;
use async_trait::async_trait;
use dialer_wire::Message;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Duplex message transport shared by every connection of a session
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Receive the next message from the peer
    async fn receive_message(&self) -> Result<Message, TunnelError>;

    /// Send one message to the peer
    async fn send_message(&self, message: Message) -> Result<(), TunnelError>;
}

/// Hand `message` to the tunnel, reporting the payload length sent
pub async fn write_message(tunnel: &dyn Tunnel, message: Message) -> Result<usize, TunnelError> {
    let len = message.payload().len();
    trace!("send {}", message);
    tunnel.send_message(message).await?;
    Ok(len)
}

/// In-process tunnel backed by bounded channels
pub struct ChannelTunnel {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

impl ChannelTunnel {
    /// Create two connected ends; each holds at most `capacity` unread messages
    pub fn pair(capacity: usize) -> (ChannelTunnel, ChannelTunnel) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            ChannelTunnel {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            ChannelTunnel {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Tunnel for ChannelTunnel {
    async fn receive_message(&self) -> Result<Message, TunnelError> {
        self.rx.lock().await.recv().await.ok_or(TunnelError::Closed)
    }

    async fn send_message(&self, message: Message) -> Result<(), TunnelError> {
        self.tx.send(message).await.map_err(|_| TunnelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_channel_pair() {
        let (a, b) = ChannelTunnel::pair(4);

        let sent = write_message(&a, Message::data(3, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        assert_eq!(sent, 4);

        let received = b.receive_message().await.unwrap();
        assert_eq!(received.connection_id(), 3);
        assert_eq!(&received.payload()[..], b"ping");
    }

    #[tokio::test]
    async fn test_dropped_peer_closes() {
        let (a, b) = ChannelTunnel::pair(1);
        drop(b);
        assert!(matches!(a.receive_message().await, Err(TunnelError::Closed)));
        assert!(matches!(
            a.send_message(Message::data(1, Bytes::new())).await,
            Err(TunnelError::Closed)
        ));
    }
}
