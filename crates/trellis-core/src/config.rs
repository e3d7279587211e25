//! Configuration system for Trellis.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml
//!
//! Environment overrides are named `TRELLIS_<SECTION>__<FIELD>`, for example
//! `TRELLIS_TRANSPORT__CONNECTION_TYPE=plain`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub identity: IdentityConfig,
    pub node: NodeConfig,
    pub transport: TransportConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the X25519 private key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex node id. Only honoured for plain connections; encrypted nodes
    /// always derive their id from the public key.
    pub id: Option<String>,
    /// Where the message listener binds.
    pub listen_addr: SocketAddr,
    /// Message endpoint advertised to peers. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// Administrative endpoint advertised to peers, if any.
    pub admin_addr: Option<SocketAddr>,
    /// Overlay-wide network name. A join answered with a different name is
    /// logged but not refused.
    pub network_id: String,
    /// Node to join through, as `<node-id-hex>@<host:port>`.
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Plain,
    #[default]
    Encrypted,
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "tcp" => Ok(ConnectionType::Plain),
            "encrypted" | "noise" => Ok(ConnectionType::Encrypted),
            other => Err(format!("unknown connection type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connection_type: ConnectionType,
    /// Idle outbound connections kept across all destinations.
    pub socket_cache_capacity: usize,
    /// Pooled connections idle longer than this are closed.
    pub socket_idle_timeout_secs: u64,
    /// Worker slots shared by inbound connections and originated sends.
    pub max_inbound_connections: usize,
    /// An inbound connection with no traffic for this long is closed.
    pub connection_idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// How long a caller waits for a reply once its request is written.
    pub request_timeout_secs: u64,
    /// Attempts per transmit on transient failure. 0 = unbounded.
    pub transmit_max_attempts: u32,
    /// Wall-clock ceiling per transmit. 0 = unbounded.
    pub transmit_max_elapsed_secs: u64,
    /// Largest frame accepted from a peer, prefix included.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Ceiling for the Introduction ramp.
    pub introduction_rate_secs: u64,
    /// Interval the Introduction ramp starts from.
    pub introduction_floor_secs: u64,
    pub reunion_interval_secs: u64,
    /// Dossier entries not heard from for this long are dropped after a
    /// failed ping.
    pub dossier_ttl_secs: u64,
    /// Where the dossier is persisted between runs. None = memory only.
    pub dossier_path: Option<PathBuf>,
    /// Objects the local publication index may hold.
    pub publication_capacity: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 12001)),
            advertise_addr: None,
            admin_addr: None,
            network_id: "trellis".to_string(),
            gateway: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Encrypted,
            socket_cache_capacity: 32,
            socket_idle_timeout_secs: 120,
            max_inbound_connections: 20,
            connection_idle_timeout_secs: 660,
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            transmit_max_attempts: 8,
            transmit_max_elapsed_secs: 30,
            max_frame_bytes: crate::frame::DEFAULT_MAX_FRAME,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            introduction_rate_secs: 600,
            introduction_floor_secs: 5,
            reunion_interval_secs: 3600,
            dossier_ttl_secs: 30 * 24 * 3600,
            dossier_path: Some(data_dir().join("dossier.json")),
            publication_capacity: 10_000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trellis")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("trellis")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TrellisConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TrellisConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TrellisConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `TRELLIS_*` overrides read through `lookup`. Values that fail to
    /// parse leave the field untouched.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn set<T: FromStr>(value: Option<String>, field: &mut T) {
            if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
                *field = parsed;
            }
        }

        if let Some(v) = lookup("TRELLIS_IDENTITY__KEYPAIR_PATH") {
            self.identity.keypair_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TRELLIS_NODE__ID") {
            self.node.id = Some(v);
        }
        set(lookup("TRELLIS_NODE__LISTEN_ADDR"), &mut self.node.listen_addr);
        if let Some(addr) = lookup("TRELLIS_NODE__ADVERTISE_ADDR").and_then(|v| v.parse().ok()) {
            self.node.advertise_addr = Some(addr);
        }
        if let Some(v) = lookup("TRELLIS_NODE__NETWORK_ID") {
            self.node.network_id = v;
        }
        if let Some(v) = lookup("TRELLIS_NODE__GATEWAY") {
            self.node.gateway = Some(v);
        }

        set(lookup("TRELLIS_TRANSPORT__CONNECTION_TYPE"), &mut self.transport.connection_type);
        set(
            lookup("TRELLIS_TRANSPORT__SOCKET_CACHE_CAPACITY"),
            &mut self.transport.socket_cache_capacity,
        );
        set(
            lookup("TRELLIS_TRANSPORT__SOCKET_IDLE_TIMEOUT_SECS"),
            &mut self.transport.socket_idle_timeout_secs,
        );
        set(
            lookup("TRELLIS_TRANSPORT__MAX_INBOUND_CONNECTIONS"),
            &mut self.transport.max_inbound_connections,
        );
        set(
            lookup("TRELLIS_TRANSPORT__CONNECTION_IDLE_TIMEOUT_SECS"),
            &mut self.transport.connection_idle_timeout_secs,
        );
        set(
            lookup("TRELLIS_TRANSPORT__TRANSMIT_MAX_ATTEMPTS"),
            &mut self.transport.transmit_max_attempts,
        );

        set(
            lookup("TRELLIS_ROUTING__INTRODUCTION_RATE_SECS"),
            &mut self.routing.introduction_rate_secs,
        );
        set(
            lookup("TRELLIS_ROUTING__REUNION_INTERVAL_SECS"),
            &mut self.routing.reunion_interval_secs,
        );
        set(lookup("TRELLIS_ROUTING__DOSSIER_TTL_SECS"), &mut self.routing.dossier_ttl_secs);
    }
}
