//! Core protocol types for fedmesh
//!
//! Addresses identify peers on the wire, roles describe what a node does in a
//! training round, and dedup tokens make gossiped commands idempotent.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

// =============================================================================
// NODE ADDRESS
// =============================================================================

/// Unique identifier of a peer: the (host, port) it listens on.
///
/// This is the address a node *claims* in its handshake, not the ephemeral
/// source address of the TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: IpAddr,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// Socket address to dial
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for NodeAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| ProtocolError::InvalidField {
                command: "ADDRESS",
                field: "address",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// ROLE
// =============================================================================

/// Role a node plays in the federation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Aggregates models received from trainers
    Aggregator,
    /// Trains on its local dataset
    #[default]
    Trainer,
    /// Serves the global model without training
    Server,
    /// Relays models without training or aggregating
    Proxy,
    /// Participates in membership only
    Idle,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Aggregator => "aggregator",
            Role::Trainer => "trainer",
            Role::Server => "server",
            Role::Proxy => "proxy",
            Role::Idle => "idle",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aggregator" => Ok(Role::Aggregator),
            "trainer" => Ok(Role::Trainer),
            "server" => Ok(Role::Server),
            "proxy" => Ok(Role::Proxy),
            "idle" => Ok(Role::Idle),
            other => Err(ProtocolError::InvalidField {
                command: "ROLE",
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// DEDUP TOKEN
// =============================================================================

/// Bytes of BLAKE3 output kept in a token (rendered as hex on the wire)
const TOKEN_BYTES: usize = 16;

/// Opaque identifier appended to every gossiped message.
///
/// Generated from BLAKE3(content || unix nanos || random u32) so two identical
/// messages built in the same instant still get distinct tokens.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupToken(String);

impl DedupToken {
    /// Generate a fresh token for a message body
    pub fn generate(content: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let salt: u32 = rand::thread_rng().gen();

        let mut hasher = blake3::Hasher::new();
        hasher.update(content.as_bytes());
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&salt.to_le_bytes());
        Self(hex::encode(&hasher.finalize().as_bytes()[..TOKEN_BYTES]))
    }

    /// Wrap a token read off the wire
    pub fn from_wire(token: &str) -> Self {
        Self(token.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
