//! Configuration for fedmeshd

use anyhow::Context;
use clap::Parser;
use fedmesh_core::wire::{PARAMS_HEADER, PARAMS_TRAILER};
use fedmesh_core::{NodeAddress, Role};
use fedmesh_net::crypto::CIPHER_BLOCK_SIZE;
use fedmesh_net::ConnectionSettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// fedmeshd - federated learning peer node
#[derive(Parser, Debug, Clone)]
#[command(name = "fedmeshd")]
#[command(about = "fedmesh peer node: membership, heartbeats and gossip")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, env = "FEDMESH_LISTEN", default_value = "127.0.0.1:6666")]
    pub listen: SocketAddr,

    /// IP advertised to peers (defaults to the listen IP)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Neighbors to dial at startup (comma-separated ip:port)
    #[arg(short, long, value_delimiter = ',')]
    pub neighbors: Vec<NodeAddress>,

    /// Encrypt peer connections
    #[arg(long)]
    pub encrypt: bool,

    /// Role of this node
    #[arg(long, default_value = "trainer")]
    pub role: Role,

    /// Broadcast START_LEARNING once the neighbors are dialed
    #[arg(long)]
    pub start: bool,

    /// Training rounds requested by --start
    #[arg(long, default_value = "1")]
    pub rounds: u32,

    /// Local epochs per round requested by --start
    #[arg(long, default_value = "1")]
    pub epochs: u32,

    /// JSON file with tuning parameters
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Ask each neighbor to introduce us to all of its neighbors
    #[arg(long)]
    pub connect_full: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.start {
            if self.rounds == 0 || self.epochs == 0 {
                anyhow::bail!("--start needs --rounds and --epochs greater than zero");
            }
            if self.role == Role::Idle {
                anyhow::bail!("An idle node cannot be the start node");
            }
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format '{}' (expected pretty or json)", self.log_format);
        }
        Ok(())
    }

    /// Load tuning parameters from `--settings`, or defaults, and validate them
    pub fn load_settings(&self) -> anyhow::Result<NodeSettings> {
        let settings = match &self.settings {
            Some(path) => NodeSettings::from_file(path)?,
            None => NodeSettings::default(),
        };
        settings.validated()
    }
}

/// Numeric tuning parameters. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Size of every socket read and of every PARAMS frame
    pub block_size: usize,
    /// Silence after which a neighbor or a heartbeat entry is dropped
    pub node_timeout: f64,
    pub heartbeat_period: f64,
    /// Liveness sweeps per heartbeat period
    pub heartbeater_refresh_neighbors_by_period: u32,
    /// Sends allowed per gossip tick
    pub gossip_messages_per_round: usize,
    /// Gossip ticks per second
    pub gossip_messages_frec: f64,
    /// Dedup cache capacity per connection
    pub amount_last_messages_saved: usize,
    /// Timeout of the reachability probe on inbound handshakes
    pub probe_timeout: f64,
    /// SO_RCVBUF / SO_SNDBUF for peer sockets
    pub tcp_buffer_size: Option<u32>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            block_size: 8192,
            node_timeout: 20.0,
            heartbeat_period: 4.0,
            heartbeater_refresh_neighbors_by_period: 4,
            gossip_messages_per_round: 100,
            gossip_messages_frec: 100.0,
            amount_last_messages_saved: 100,
            probe_timeout: 2.0,
            tcp_buffer_size: None,
        }
    }
}

impl NodeSettings {
    /// Read settings from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }

    /// Check every parameter and round the block size up to the cipher block
    pub fn validated(mut self) -> anyhow::Result<Self> {
        let min_block = PARAMS_HEADER.len() + PARAMS_TRAILER.len() + 1;
        if self.block_size < min_block {
            anyhow::bail!("block_size must be at least {} bytes", min_block);
        }
        let rem = self.block_size % CIPHER_BLOCK_SIZE;
        if rem != 0 {
            let rounded = self.block_size + CIPHER_BLOCK_SIZE - rem;
            info!("Block size {} rounded up to {}", self.block_size, rounded);
            self.block_size = rounded;
        }

        for (name, value) in [
            ("node_timeout", self.node_timeout),
            ("heartbeat_period", self.heartbeat_period),
            ("gossip_messages_frec", self.gossip_messages_frec),
            ("probe_timeout", self.probe_timeout),
        ] {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("{} must be a positive number, got {}", name, value);
            }
        }
        if self.heartbeater_refresh_neighbors_by_period == 0 {
            anyhow::bail!("heartbeater_refresh_neighbors_by_period must be greater than zero");
        }
        if self.gossip_messages_per_round == 0 {
            anyhow::bail!("gossip_messages_per_round must be greater than zero");
        }
        if self.amount_last_messages_saved == 0 {
            anyhow::bail!("amount_last_messages_saved must be greater than zero");
        }
        if self.tcp_buffer_size == Some(0) {
            anyhow::bail!("tcp_buffer_size must be greater than zero when set");
        }
        Ok(self)
    }

    pub fn node_timeout(&self) -> Duration {
        secs(self.node_timeout)
    }

    pub fn heartbeat_period(&self) -> Duration {
        secs(self.heartbeat_period)
    }

    /// Spacing between gossip ticks
    pub fn gossip_period(&self) -> Duration {
        secs(1.0 / self.gossip_messages_frec)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout)
    }

    /// Parameters every connection of this node shares
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            block_size: self.block_size,
            node_timeout: self.node_timeout(),
            amount_last_messages_saved: self.amount_last_messages_saved,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
