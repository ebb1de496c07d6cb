//! Configuration for Shoal

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShoalConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ShoalConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SHOAL_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Ok(port) = std::env::var("SHOAL_PORT") {
            if let Ok(p) = port.parse() {
                config.server.port = p;
            }
        }
        if let Ok(addr) = std::env::var("SHOAL_ADVERTISE_ADDR") {
            config.cluster.advertise_addr = Some(addr);
        }
        if let Ok(peers) = std::env::var("SHOAL_PEERS") {
            config.cluster.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(level) = std::env::var("SHOAL_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }

    /// The address other nodes and clients should use to reach this node.
    pub fn advertised(&self) -> String {
        self.cluster
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.server.bind_address, self.server.port))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cluster.initial_buckets.is_power_of_two() || self.cluster.initial_buckets < 2 {
            return Err(Error::InvalidConfig(format!(
                "initial_buckets must be a power of two >= 2, got {}",
                self.cluster.initial_buckets
            )));
        }
        if self.cluster.transit_max < self.cluster.transit_min {
            return Err(Error::InvalidConfig(format!(
                "transit_max ({}) must be >= transit_min ({})",
                self.cluster.transit_max, self.cluster.transit_min
            )));
        }
        for peer in &self.cluster.peers {
            if peer.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(Error::InvalidAddress(peer.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 13600,
        }
    }
}

/// Cluster behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address advertised to peers and clients; defaults to bind:port.
    pub advertise_addr: Option<String>,
    /// Peer addresses to connect to at startup.  Empty means this node
    /// bootstraps a new cluster and owns all initial buckets.
    pub peers: Vec<String>,
    /// Buckets a bootstrap node starts with (power of two).
    pub initial_buckets: u64,
    /// Ideal-per-node floor below which the mask is split.
    pub min_buckets: i64,
    /// Migration backpressure window.
    pub transit_max: u32,
    pub transit_min: u32,
    /// Timeout on a pending outbound connect.
    pub connect_timeout_ms: u64,
    /// Delay between reconnect attempts to an unreachable peer.
    pub reconnect_wait_ms: u64,
    /// Interval between LOADLEVELS probes to each active peer.
    pub loadlevel_interval_ms: u64,
    /// Tick for the cooperative shutdown drain.
    pub shutdown_tick_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            advertise_addr: None,
            peers: Vec::new(),
            initial_buckets: crate::DEFAULT_BUCKETS,
            min_buckets: crate::MIN_BUCKETS,
            transit_max: crate::TRANSIT_MAX,
            transit_min: crate::TRANSIT_MIN,
            connect_timeout_ms: 5_000,
            reconnect_wait_ms: 5_000,
            loadlevel_interval_ms: 5_000,
            shutdown_tick_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
