//! fedmeshd - fedmesh peer node
//!
//! This daemon provides:
//! - Peer admission with reachability probing and optional encryption
//! - Heartbeat-based liveness tracking of the whole network
//! - Bounded-fanout gossip of control commands
//! - A control API for the federated learning orchestration layer

pub mod config;
pub mod gossiper;
pub mod heartbeater;
pub mod neighbors;
pub mod node;

pub use config::{Config, NodeSettings};
pub use gossiper::{GossipSend, GossipStats, Gossiper};
pub use heartbeater::Heartbeater;
pub use neighbors::NeighborSet;
pub use node::{Node, NodeError, NodeEvent, NodeStats};
