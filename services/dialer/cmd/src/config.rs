//! Configuration for the remote dialer node.
//!
//! Values come from an optional YAML file, then `REMOTE_DIALER_*`
//! environment variables, then command-line flags.

use anyhow::{anyhow, bail, Context, Result};
use dialer_session::SessionConfig;
use dialer_wire::Encoding;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration (matches the YAML layout)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Frame encoding used on agent tunnels
    pub encoding: Encoding,
    /// Server mode settings
    pub server: ServerConfig,
    /// Agent mode settings
    pub agent: AgentConfig,
    /// Per-session tuning
    pub session: SessionSettings,
}

/// Server mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address agents connect to
    pub listen: SocketAddr,
    /// Port forwards, `LISTEN=CLIENT_KEY=PROTO/ADDRESS`
    pub forwards: Vec<String>,
    /// Time allowed for an agent to announce its client key
    #[serde(with = "humantime_duration")]
    pub handshake_timeout: Duration,
}

/// Agent mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Server address to connect to
    pub server: String,
    /// Identity announced to the server
    pub client_key: String,
    /// Pause between reconnect attempts
    #[serde(with = "humantime_duration")]
    pub retry_delay: Duration,
}

/// Per-session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Bound on outbound dials made for connect requests
    #[serde(with = "humantime_duration")]
    pub dial_timeout: Duration,
    /// Byte pump chunk size
    pub copy_buffer_size: usize,
    /// Idle receive-buffer size that triggers compaction
    pub compact_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8123)),
            forwards: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8123".to_string(),
            client_key: "agent".to_string(),
            retry_delay: dialer_session::DEFAULT_RETRY_DELAY,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            dial_timeout: defaults.dial_timeout,
            copy_buffer_size: defaults.copy_buffer_size,
            compact_threshold: defaults.compact_threshold,
        }
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Binary,
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            session: SessionSettings::default(),
        }
    }
}

impl DialerConfig {
    /// Load from `config_path` (if given and present), then apply the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {:?}", path))?;
                let config: DialerConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Some(path) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_environment_overrides()?;
        Ok(config)
    }

    /// Apply `REMOTE_DIALER_*` environment variables
    fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("REMOTE_DIALER_ENCODING") {
            self.encoding = parse_encoding(&value)?;
            info!("Encoding overridden by environment: {:?}", self.encoding);
        }

        if let Some(value) = lookup("REMOTE_DIALER_LISTEN") {
            self.server.listen = value
                .parse()
                .with_context(|| format!("REMOTE_DIALER_LISTEN={}", value))?;
            info!("Listen address overridden by environment: {}", self.server.listen);
        }

        if let Some(value) = lookup("REMOTE_DIALER_FORWARDS") {
            self.server.forwards = value
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
            info!("Forwards overridden by environment: {:?}", self.server.forwards);
        }

        if let Some(value) = lookup("REMOTE_DIALER_SERVER") {
            self.agent.server = value;
            info!("Server address overridden by environment: {}", self.agent.server);
        }

        if let Some(value) = lookup("REMOTE_DIALER_CLIENT_KEY") {
            self.agent.client_key = value;
            info!("Client key overridden by environment: {}", self.agent.client_key);
        }

        if let Some(value) = lookup("REMOTE_DIALER_RETRY_DELAY") {
            self.agent.retry_delay = humantime::parse_duration(&value)
                .with_context(|| format!("REMOTE_DIALER_RETRY_DELAY={}", value))?;
        }

        if let Some(value) = lookup("REMOTE_DIALER_DIAL_TIMEOUT") {
            self.session.dial_timeout = humantime::parse_duration(&value)
                .with_context(|| format!("REMOTE_DIALER_DIAL_TIMEOUT={}", value))?;
        }

        Ok(())
    }

    /// Session settings in library form
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            dial_timeout: self.session.dial_timeout,
            copy_buffer_size: self.session.copy_buffer_size.max(1),
            compact_threshold: self.session.compact_threshold,
        }
    }

    /// Parsed port forwards
    pub fn port_forwards(&self) -> Result<Vec<PortForward>> {
        self.server.forwards.iter().map(|f| f.parse()).collect()
    }
}

/// Parse an encoding name (`binary` or `json`)
pub fn parse_encoding(value: &str) -> Result<Encoding> {
    match value.trim().to_ascii_lowercase().as_str() {
        "binary" => Ok(Encoding::Binary),
        "json" => Ok(Encoding::Json),
        other => bail!("unknown encoding {:?} (expected binary or json)", other),
    }
}

/// Local listener bridged to a target on an agent's network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub listen: SocketAddr,
    pub client_key: String,
    pub protocol: String,
    pub address: String,
}

impl FromStr for PortForward {
    type Err = anyhow::Error;

    /// `LISTEN=CLIENT_KEY=PROTO/ADDRESS`, e.g. `127.0.0.1:15432=edge-1=tcp/db:5432`
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '=');
        let (Some(listen), Some(client_key), Some(target)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("port forward {:?} is not LISTEN=CLIENT_KEY=PROTO/ADDRESS", s);
        };
        let listen = listen
            .parse()
            .with_context(|| format!("port forward {:?}: bad listen address", s))?;
        let (protocol, address) = target
            .split_once('/')
            .filter(|(p, a)| !p.is_empty() && !a.is_empty())
            .ok_or_else(|| anyhow!("port forward {:?}: target must be PROTO/ADDRESS", s))?;
        if client_key.is_empty() {
            bail!("port forward {:?}: empty client key", s);
        }

        Ok(Self {
            listen,
            client_key: client_key.to_string(),
            protocol: protocol.to_string(),
            address: address.to_string(),
        })
    }
}

/// Durations written the humantime way (`10s`, `1m 30s`)
mod humantime_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DialerConfig::default();
        assert_eq!(config.encoding, Encoding::Binary);
        assert_eq!(config.server.listen.port(), 8123);
        assert_eq!(config.agent.retry_delay, Duration::from_secs(5));
        assert_eq!(config.session_config().dial_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
encoding: json
server:
  listen: 127.0.0.1:9000
  forwards:
    - 127.0.0.1:15432=edge-1=tcp/db:5432
agent:
  client_key: edge-1
  retry_delay: 250ms
session:
  dial_timeout: 5s
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = DialerConfig::load(Some(temp_file.path())).unwrap();

        assert_eq!(config.encoding, Encoding::Json);
        assert_eq!(config.server.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.agent.client_key, "edge-1");
        assert_eq!(config.agent.server, "127.0.0.1:8123");
        assert_eq!(config.agent.retry_delay, Duration::from_millis(250));
        assert_eq!(config.session.dial_timeout, Duration::from_secs(5));

        let forwards = config.port_forwards().unwrap();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].client_key, "edge-1");
        assert_eq!(forwards[0].address, "db:5432");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DialerConfig::load(Some(dir.path().join("absent.yaml").as_path())).unwrap();
        assert_eq!(config.agent.client_key, "agent");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"session:\n  dial_timeout: soon\n").unwrap();
        assert!(DialerConfig::load(Some(temp_file.path())).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("REMOTE_DIALER_ENCODING", "JSON"),
            ("REMOTE_DIALER_CLIENT_KEY", "edge-9"),
            ("REMOTE_DIALER_FORWARDS", "127.0.0.1:1=a=tcp/x:1, 127.0.0.1:2=b=unix//tmp/s"),
            ("REMOTE_DIALER_DIAL_TIMEOUT", "2s"),
        ]
        .into_iter()
        .collect();

        let mut config = DialerConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.encoding, Encoding::Json);
        assert_eq!(config.agent.client_key, "edge-9");
        assert_eq!(config.session.dial_timeout, Duration::from_secs(2));
        let forwards = config.port_forwards().unwrap();
        assert_eq!(forwards[1].protocol, "unix");
        assert_eq!(forwards[1].address, "/tmp/s");

        let mut config = DialerConfig::default();
        assert!(config
            .apply_overrides(|name| (name == "REMOTE_DIALER_LISTEN").then(|| "nope".to_string()))
            .is_err());
    }

    #[test]
    fn test_port_forward_parsing() {
        let forward: PortForward = "0.0.0.0:8080=edge-1=http::tcp/intranet:80".parse().unwrap();
        assert_eq!(forward.listen.port(), 8080);
        assert_eq!(forward.protocol, "http::tcp");
        assert_eq!(forward.address, "intranet:80");

        assert!("0.0.0.0:8080=edge-1".parse::<PortForward>().is_err());
        assert!("0.0.0.0:8080==tcp/x:1".parse::<PortForward>().is_err());
        assert!("0.0.0.0:8080=edge-1=tcp".parse::<PortForward>().is_err());
        assert!("nowhere=edge-1=tcp/x:1".parse::<PortForward>().is_err());
    }
}
