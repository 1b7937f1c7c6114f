//! Periodic heartbeats and the peer liveness table
//!
//! Every period the heartbeater asks the node to broadcast a `BEAT`; every
//! second period it also asks for a `ROLE` broadcast and a status report.
//! Between beats the liveness table is swept several times so stale peers
//! disappear without waiting a whole period.

use crate::config::NodeSettings;
use crate::node::NodeEvent;
use fedmesh_core::Role;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PeerLiveness {
    last_seen: Instant,
    role: Option<Role>,
}

/// Heartbeat scheduler and liveness table of one node
pub struct Heartbeater {
    /// Our own node name, never tracked
    name: String,
    node_timeout: Duration,
    period: Duration,
    refresh_by_period: u32,
    peers: RwLock<HashMap<String, PeerLiveness>>,
    /// Diagnostic copy of our neighbor list
    neighbors_view: RwLock<String>,
}

impl Heartbeater {
    pub fn new(name: impl Into<String>, settings: &NodeSettings) -> Self {
        Self {
            name: name.into(),
            node_timeout: settings.node_timeout(),
            period: settings.heartbeat_period(),
            refresh_by_period: settings.heartbeater_refresh_neighbors_by_period.max(1),
            peers: RwLock::new(HashMap::new()),
            neighbors_view: RwLock::new(String::new()),
        }
    }

    /// Record a heartbeat from `node`
    pub fn beat_received(&self, node: &str) {
        self.beat_received_at(node, Instant::now());
    }

    pub fn beat_received_at(&self, node: &str, at: Instant) {
        if node == self.name {
            return;
        }
        let mut peers = self.peers.write();
        match peers.get_mut(node) {
            Some(entry) => entry.last_seen = entry.last_seen.max(at),
            None => {
                debug!("New node in network: {}", node);
                peers.insert(
                    node.to_string(),
                    PeerLiveness {
                        last_seen: at,
                        role: None,
                    },
                );
            }
        }
    }

    /// Record the role announced by `node`
    pub fn role_received(&self, node: &str, role: Role) {
        if node == self.name {
            return;
        }
        self.peers
            .write()
            .entry(node.to_string())
            .or_insert_with(|| PeerLiveness {
                last_seen: Instant::now(),
                role: None,
            })
            .role = Some(role);
    }

    /// Drop peers not heard from within the node timeout
    pub fn expire(&self) -> Vec<String> {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&self, now: Instant) -> Vec<String> {
        let mut peers = self.peers.write();
        let expired: Vec<String> = peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > self.node_timeout)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            peers.remove(name);
            info!("Node {} timed out", name);
        }
        expired
    }

    /// Nodes currently considered alive, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.peers.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn contains(&self, node: &str) -> bool {
        self.peers.read().contains_key(node)
    }

    pub fn role_of(&self, node: &str) -> Option<Role> {
        self.peers.read().get(node).and_then(|p| p.role)
    }

    pub fn set_neighbors_view(&self, view: String) {
        *self.neighbors_view.write() = view;
    }

    pub fn neighbors_view(&self) -> String {
        self.neighbors_view.read().clone()
    }

    /// Heartbeat loop; runs until shutdown or until the node goes away
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::UnboundedSender<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let sweep = self.period / self.refresh_by_period;
        let mut beats: u64 = 0;

        loop {
            if events.send(NodeEvent::SendBeat).is_err() {
                break;
            }
            beats += 1;
            if beats % 2 == 0 {
                let _ = events.send(NodeEvent::SendRole);
                let _ = events.send(NodeEvent::ReportStatus);
            }

            for _ in 0..self.refresh_by_period {
                self.expire();
                tokio::select! {
                    _ = tokio::time::sleep(sweep) => {}
                    _ = shutdown.recv() => {
                        debug!("Heartbeater stopped");
                        return;
                    }
                }
            }
        }
    }
}
