//! Agent side: serve connect requests arriving over a tunnel to the server.

use crate::config::SessionConfig;
use crate::error::TunnelError;
use crate::session::Session;
use crate::tunnel::Tunnel;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Pause after a failed proxy session before [`client_connect`] returns
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Run a client session over `tunnel` until it fails or `shutdown` completes.
///
/// The session is closed on the way out either way. Shutdown is not an error.
pub async fn connect_to_proxy<F>(
    tunnel: Arc<dyn Tunnel>,
    config: SessionConfig,
    shutdown: F,
) -> Result<(), TunnelError>
where
    F: Future<Output = ()>,
{
    info!("Connecting to proxy");
    let session = Session::new_client(tunnel, config);

    let result = tokio::select! {
        result = session.run() => result,
        _ = shutdown => {
            info!("Proxy done");
            Ok(())
        }
    };

    session.close().await;
    result
}

/// [`connect_to_proxy`], then wait `retry_delay` if it failed so callers can
/// reconnect in a loop
pub async fn client_connect<F>(
    tunnel: Arc<dyn Tunnel>,
    config: SessionConfig,
    retry_delay: Duration,
    shutdown: F,
) -> Result<(), TunnelError>
where
    F: Future<Output = ()>,
{
    if let Err(e) = connect_to_proxy(tunnel, config, shutdown).await {
        error!("Remote dialer proxy error: {}", e);
        tokio::time::sleep(retry_delay).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ChannelTunnel;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_shutdown_is_clean() {
        let (ours, _peer) = ChannelTunnel::pair(4);
        let result = connect_to_proxy(
            Arc::new(ours),
            SessionConfig::default(),
            std::future::ready(()),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_waits_before_returning() {
        let (ours, peer) = ChannelTunnel::pair(4);
        drop(peer);

        let start = Instant::now();
        let result = client_connect(
            Arc::new(ours),
            SessionConfig::default(),
            DEFAULT_RETRY_DELAY,
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(TunnelError::Closed)));
        assert!(Instant::now() - start >= DEFAULT_RETRY_DELAY);
    }
}
