//! Bounded-fanout gossip of newly executed messages
//!
//! Each tick spends at most `gossip_messages_per_round` sends. Pending
//! messages are served oldest first: a message whose missing peers fit in the
//! remaining quota is sent to all of them and dropped, otherwise it is sent to
//! as many peers as the quota allows and stays queued for the next tick.

use crate::config::NodeSettings;
use crate::node::NodeEvent;
use fedmesh_core::{DedupToken, NodeAddress};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// One payload to deliver to a set of neighbors
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipSend {
    pub payload: Vec<u8>,
    pub targets: Vec<NodeAddress>,
}

struct PendingMessage {
    payload: Vec<u8>,
    informed: HashSet<NodeAddress>,
}

#[derive(Default)]
struct GossipQueue {
    order: VecDeque<DedupToken>,
    entries: HashMap<DedupToken, PendingMessage>,
}

/// Gossip dissemination engine
pub struct Gossiper {
    queue: Mutex<GossipQueue>,
    messages_per_round: usize,
    period: Duration,
    sent: AtomicU64,
}

impl Gossiper {
    pub fn new(settings: &NodeSettings) -> Self {
        Self {
            queue: Mutex::new(GossipQueue::default()),
            messages_per_round: settings.gossip_messages_per_round.max(1),
            period: settings.gossip_period(),
            sent: AtomicU64::new(0),
        }
    }

    /// Queue messages a connection executed for the first time.
    ///
    /// The delivering neighbor already has them and is marked informed.
    pub fn add_messages(&self, executed: Vec<(DedupToken, Vec<u8>)>, from: NodeAddress) {
        let mut queue = self.queue.lock();
        for (token, payload) in executed {
            match queue.entries.get_mut(&token) {
                Some(pending) => {
                    pending.informed.insert(from);
                }
                None => {
                    queue.order.push_back(token.clone());
                    queue.entries.insert(
                        token,
                        PendingMessage {
                            payload,
                            informed: HashSet::from([from]),
                        },
                    );
                }
            }
        }
    }

    /// Plan the sends of one tick against the current neighbor list
    pub fn tick(&self, neighbors: &[NodeAddress]) -> Vec<GossipSend> {
        let mut guard = self.queue.lock();
        let GossipQueue { order, entries } = &mut *guard;

        let mut quota = self.messages_per_round;
        let mut sends = Vec::new();
        let mut finished = HashSet::new();

        for token in order.iter() {
            let Some(pending) = entries.get_mut(token) else {
                finished.insert(token.clone());
                continue;
            };
            let remaining: Vec<NodeAddress> = neighbors
                .iter()
                .filter(|n| !pending.informed.contains(*n))
                .copied()
                .collect();

            if remaining.len() <= quota {
                quota -= remaining.len();
                if !remaining.is_empty() {
                    sends.push(GossipSend {
                        payload: pending.payload.clone(),
                        targets: remaining,
                    });
                }
                finished.insert(token.clone());
                if quota == 0 {
                    break;
                }
            } else {
                let targets = remaining[..quota].to_vec();
                pending.informed.extend(targets.iter().copied());
                sends.push(GossipSend {
                    payload: pending.payload.clone(),
                    targets,
                });
                break;
            }
        }

        if !finished.is_empty() {
            order.retain(|t| !finished.contains(t));
            for token in &finished {
                entries.remove(token);
            }
        }

        let planned: usize = sends.iter().map(|s| s.targets.len()).sum();
        self.sent.fetch_add(planned as u64, Ordering::Relaxed);
        sends
    }

    /// Messages still waiting for at least one neighbor
    pub fn pending(&self) -> usize {
        self.queue.lock().order.len()
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            pending: self.pending(),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }

    /// Gossip loop. Tick spacing subtracts the time the tick itself took.
    pub async fn run<F>(
        self: Arc<Self>,
        neighbors: F,
        events: mpsc::UnboundedSender<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) where
        F: Fn() -> Vec<NodeAddress> + Send + 'static,
    {
        loop {
            let started = Instant::now();
            for send in self.tick(&neighbors()) {
                debug!("Gossiping {} bytes to {} peers", send.payload.len(), send.targets.len());
                if events.send(NodeEvent::Gossip(send)).is_err() {
                    return;
                }
            }

            let wait = self.period.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    debug!("Gossiper stopped");
                    return;
                }
            }
        }
    }
}

/// Gossip statistics
#[derive(Debug, Clone)]
pub struct GossipStats {
    pub pending: usize,
    pub sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1".parse().unwrap(), port)
    }

    fn gossiper(per_round: usize) -> Gossiper {
        Gossiper::new(&NodeSettings {
            gossip_messages_per_round: per_round,
            ..Default::default()
        })
    }

    fn token(s: &str) -> DedupToken {
        DedupToken::from_wire(s)
    }

    #[test]
    fn test_full_coverage_within_ceil_ticks() {
        let neighbors: Vec<NodeAddress> = (1..=5).map(addr).collect();
        let g = gossiper(2);
        g.add_messages(vec![(token("m1"), b"BEAT x m1\n".to_vec())], addr(99));

        let mut delivered: Vec<NodeAddress> = Vec::new();
        let mut ticks = 0;
        while g.pending() > 0 {
            ticks += 1;
            for send in g.tick(&neighbors) {
                assert!(send.targets.len() <= 2);
                delivered.extend(send.targets);
            }
            assert!(ticks <= 3, "not delivered within ceil(5/2) ticks");
        }

        let unique: HashSet<_> = delivered.iter().copied().collect();
        assert_eq!(delivered.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_source_is_never_sent_back() {
        let neighbors = vec![addr(1), addr(2), addr(3)];
        let g = gossiper(10);
        g.add_messages(vec![(token("m1"), b"x".to_vec())], addr(2));

        let sends = g.tick(&neighbors);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].targets, vec![addr(1), addr(3)]);
        assert_eq!(g.pending(), 0);
    }

    #[test]
    fn test_quota_spans_messages_in_order() {
        let neighbors = vec![addr(1), addr(2), addr(3)];
        let g = gossiper(4);
        g.add_messages(
            vec![(token("a"), b"a".to_vec()), (token("b"), b"b".to_vec())],
            addr(9),
        );

        let first = g.tick(&neighbors);
        assert_eq!(first[0].payload, b"a");
        assert_eq!(first[0].targets.len(), 3);
        assert_eq!(first[1].payload, b"b");
        assert_eq!(first[1].targets, vec![addr(1)]);
        assert_eq!(g.pending(), 1);

        let second = g.tick(&neighbors);
        assert_eq!(second, vec![GossipSend { payload: b"b".to_vec(), targets: vec![addr(2), addr(3)] }]);
        assert_eq!(g.pending(), 0);
        assert_eq!(g.stats().sent, 6);
    }

    #[test]
    fn test_no_neighbors_drops_message() {
        let g = gossiper(3);
        g.add_messages(vec![(token("a"), b"a".to_vec())], addr(1));
        assert!(g.tick(&[addr(1)]).is_empty());
        assert_eq!(g.pending(), 0);
    }

    #[test]
    fn test_second_delivery_marks_informed() {
        let g = gossiper(10);
        g.add_messages(vec![(token("a"), b"a".to_vec())], addr(1));
        g.add_messages(vec![(token("a"), b"a".to_vec())], addr(2));
        let sends = g.tick(&[addr(1), addr(2), addr(3)]);
        assert_eq!(sends[0].targets, vec![addr(3)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tick_spacing_absorbs_tick_work() {
        use std::sync::atomic::AtomicUsize;

        let g = Arc::new(Gossiper::new(&NodeSettings {
            gossip_messages_frec: 20.0,
            ..Default::default()
        }));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        // each tick costs 30ms of a 50ms period
        let neighbors = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            Vec::new()
        };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(g.run(neighbors, events_tx, shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // a fixed 50ms sleep after the work would give about 12
        let count = ticks.load(Ordering::SeqCst);
        assert!((16..=23).contains(&count), "{} ticks in one second", count);
    }
}
