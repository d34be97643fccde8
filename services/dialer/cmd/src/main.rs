//! Remote dialer node binary.
//!
//! `server` accepts agent tunnels and exposes their networks through port
//! forwards. `agent` connects out to a server and serves its connect
//! requests.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialer_session::{
    announce_client_key, client_connect, connect_tcp, listen_tcp, read_client_key, Dial, Server,
    StreamTunnel,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{parse_encoding, DialerConfig, PortForward};
use logging::DialerLogFormatter;

/// Reverse-dialing proxy node
#[derive(Parser, Debug)]
#[command(name = "remote-dialer", version, about = "Multiplexes outbound connections over agent tunnels")]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Frame encoding on agent tunnels (binary, json)
    #[arg(long)]
    encoding: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept agent tunnels
    Server {
        /// Listen address for agents, e.g. 0.0.0.0:8123
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Port forward LISTEN=CLIENT_KEY=PROTO/ADDRESS (repeatable)
        #[arg(long = "forward")]
        forwards: Vec<String>,
    },
    /// Connect to a server and serve its connect requests
    Agent {
        /// Server address, e.g. 10.0.0.1:8123
        #[arg(long)]
        server: Option<String>,

        /// Client key announced to the server
        #[arg(long)]
        client_key: Option<String>,

        /// Pause between reconnect attempts, e.g. 5s
        #[arg(long)]
        retry_delay: Option<humantime::Duration>,

        /// Bound on outbound dials, e.g. 1m
        #[arg(long)]
        dial_timeout: Option<humantime::Duration>,
    },
}

impl Args {
    /// Command-line flags take precedence over file and environment
    fn apply(&self, config: &mut DialerConfig) -> anyhow::Result<()> {
        if let Some(encoding) = &self.encoding {
            config.encoding = parse_encoding(encoding)?;
        }
        match &self.command {
            Command::Server { listen, forwards } => {
                if let Some(listen) = listen {
                    config.server.listen = *listen;
                }
                config.server.forwards.extend(forwards.iter().cloned());
            }
            Command::Agent {
                server,
                client_key,
                retry_delay,
                dial_timeout,
            } => {
                if let Some(server) = server {
                    config.agent.server = server.clone();
                }
                if let Some(client_key) = client_key {
                    config.agent.client_key = client_key.clone();
                }
                if let Some(retry_delay) = retry_delay {
                    config.agent.retry_delay = **retry_delay;
                }
                if let Some(dial_timeout) = dial_timeout {
                    config.session.dial_timeout = **dial_timeout;
                }
            }
        }
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive(format!("remote_dialer={}", args.log_level).parse()?)
            .add_directive(format!("dialer_session={}", args.log_level).parse()?)
            .add_directive(format!("dialer_wire={}", args.log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(DialerLogFormatter::new("dialer".to_string()))
        .init();

    info!("Starting remote dialer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DialerConfig::load(args.config.as_deref())?;
    args.apply(&mut config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    match args.command {
        Command::Server { .. } => run_server(config, shutdown_rx).await,
        Command::Agent { .. } => run_agent(config, shutdown_rx).await,
    }
}

/// Resolves once shutdown has been requested
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_server(config: DialerConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let server = Arc::new(Server::with_config(config.session_config()));

    for forward in config.port_forwards()? {
        let listener = TcpListener::bind(forward.listen)
            .await
            .with_context(|| format!("binding port forward {}", forward.listen))?;
        info!(
            component = "forward",
            "Forwarding {} to {}/{} via {}",
            forward.listen, forward.protocol, forward.address, forward.client_key
        );
        tokio::spawn(run_forward(server.clone(), listener, forward));
    }

    let listener = listen_tcp(config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!("Listening for agents on {} ({:?} frames)", config.server.listen, config.encoding);

    let accept_loop = async {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("Accepted agent connection from {}", peer_addr);
                    tokio::spawn(serve_agent(server.clone(), stream, peer_addr, config.clone()));
                }
                Err(e) => {
                    warn!("Accept error: {}; stopping listener", e);
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = shutdown_requested(shutdown) => {}
    }
    info!("Server stopped");
    Ok(())
}

async fn serve_agent(
    server: Arc<Server>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: DialerConfig,
) {
    let client_key = match tokio::time::timeout(
        config.server.handshake_timeout,
        read_client_key(&mut stream),
    )
    .await
    {
        Ok(Ok(key)) => key,
        Ok(Err(e)) => {
            warn!("Agent {} sent a bad client key: {}", peer_addr, e);
            return;
        }
        Err(_) => {
            warn!("Agent {} did not announce a client key in time", peer_addr);
            return;
        }
    };

    info!("Agent {} connected as {}", peer_addr, client_key);
    let tunnel = Arc::new(StreamTunnel::new(stream, config.encoding));
    if let Err(e) = server.serve_tunnel(&client_key, tunnel).await {
        debug!("Agent {} ({}) tunnel ended: {}", peer_addr, client_key, e);
    }
}

async fn run_forward(server: Arc<Server>, listener: TcpListener, forward: PortForward) {
    let dialer: Arc<dyn Dial> = Arc::new(server.dialer(&forward.client_key));
    loop {
        let (mut socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(component = "forward", "Accept on {} failed: {}", forward.listen, e);
                return;
            }
        };

        let dialer = dialer.clone();
        let forward = forward.clone();
        tokio::spawn(async move {
            let mut conn = match dialer.dial(&forward.protocol, &forward.address).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        component = "forward",
                        "Dial {}/{} for {} failed: {}",
                        forward.protocol, forward.address, peer_addr, e
                    );
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut socket, &mut conn).await {
                Ok((up, down)) => debug!(
                    component = "forward",
                    "Forward {} closed ({} bytes up, {} bytes down)",
                    peer_addr, up, down
                ),
                Err(e) => debug!(component = "forward", "Forward {} ended: {}", peer_addr, e),
            }
            conn.close().await;
        });
    }
}

async fn run_agent(config: DialerConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let retry_delay: Duration = config.agent.retry_delay;

    while !*shutdown.borrow() {
        let mut stream = match connect_tcp(&config.agent.server).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", config.agent.server, e);
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => continue,
                    _ = shutdown_requested(shutdown.clone()) => break,
                }
            }
        };

        if let Err(e) = announce_client_key(&mut stream, &config.agent.client_key).await {
            warn!("Failed to announce client key: {}", e);
            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => continue,
                _ = shutdown_requested(shutdown.clone()) => break,
            }
        }

        info!(
            "Connected to {} as {}",
            config.agent.server, config.agent.client_key
        );
        let tunnel = Arc::new(StreamTunnel::new(stream, config.encoding));
        let result = client_connect(
            tunnel,
            config.session_config(),
            retry_delay,
            shutdown_requested(shutdown.clone()),
        )
        .await;
        if result.is_ok() {
            break;
        }
    }

    info!("Agent stopped");
    Ok(())
}
