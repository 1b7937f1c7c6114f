//! Registry of directly connected neighbors
//!
//! Admission is split in three steps so no network I/O runs under the lock:
//! [`NeighborSet::reserve`] claims the address, the caller dials or probes,
//! then [`NeighborSet::commit`] publishes the connection or
//! [`NeighborSet::release`] drops the claim. A reserved address is not a
//! neighbor yet, and a second admission for it is refused. Once the set is
//! closed every reservation and commit fails.

use fedmesh_core::NodeAddress;
use fedmesh_net::Connection;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Connections keyed by the address each peer listens on
pub struct NeighborSet<C = Arc<Connection>> {
    inner: Mutex<Inner<C>>,
}

struct Inner<C> {
    connections: HashMap<NodeAddress, C>,
    connecting: HashSet<NodeAddress>,
    closed: bool,
}

impl<C: Clone> NeighborSet<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                connecting: HashSet::new(),
                closed: false,
            }),
        }
    }

    /// Claim `addr` for an admission in progress.
    ///
    /// Fails if it is already a neighbor, another admission holds it, or the
    /// set is closed.
    pub fn reserve(&self, addr: NodeAddress) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed || inner.connections.contains_key(&addr) {
            return false;
        }
        inner.connecting.insert(addr)
    }

    /// Publish the connection for a reserved address.
    ///
    /// Returns false, dropping the reservation, if the set was closed since.
    pub fn commit(&self, addr: NodeAddress, conn: C) -> bool {
        let mut inner = self.inner.lock();
        inner.connecting.remove(&addr);
        if inner.closed {
            return false;
        }
        inner.connections.insert(addr, conn);
        true
    }

    /// Abandon a reservation
    pub fn release(&self, addr: &NodeAddress) {
        self.inner.lock().connecting.remove(addr);
    }

    pub fn remove(&self, addr: &NodeAddress) -> Option<C> {
        self.inner.lock().connections.remove(addr)
    }

    /// Remove the entry for `addr` only if `matches` accepts it
    pub fn remove_if<F>(&self, addr: &NodeAddress, matches: F) -> Option<C>
    where
        F: FnOnce(&C) -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.connections.get(addr).map(matches).unwrap_or(false) {
            inner.connections.remove(addr)
        } else {
            None
        }
    }

    pub fn get(&self, addr: &NodeAddress) -> Option<C> {
        self.inner.lock().connections.get(addr).cloned()
    }

    pub fn contains(&self, addr: &NodeAddress) -> bool {
        self.inner.lock().connections.contains_key(addr)
    }

    /// Neighbor addresses, sorted
    pub fn addresses(&self) -> Vec<NodeAddress> {
        let mut addrs: Vec<NodeAddress> = self.inner.lock().connections.keys().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn connections(&self) -> Vec<C> {
        self.inner.lock().connections.values().cloned().collect()
    }

    /// Every connection except the one for `except`
    pub fn others(&self, except: &NodeAddress) -> Vec<(NodeAddress, C)> {
        self.inner
            .lock()
            .connections
            .iter()
            .filter(|(addr, _)| *addr != except)
            .map(|(addr, c)| (*addr, c.clone()))
            .collect()
    }

    /// Refuse further admissions and return every connection
    pub fn close(&self) -> Vec<C> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.connecting.clear();
        inner.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clone> Default for NeighborSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn test_reservation_is_exclusive() {
        let set: NeighborSet<u32> = NeighborSet::new();
        assert!(set.reserve(addr(1)));
        assert!(!set.reserve(addr(1)));
        assert!(!set.contains(&addr(1)));

        assert!(set.commit(addr(1), 10));
        assert!(set.contains(&addr(1)));
        assert!(!set.reserve(addr(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_release_leaves_no_state() {
        let set: NeighborSet<u32> = NeighborSet::new();
        assert!(set.reserve(addr(2)));
        set.release(&addr(2));
        assert!(set.is_empty());
        assert!(set.reserve(addr(2)));
    }

    #[test]
    fn test_remove_if_checks_identity() {
        let set: NeighborSet<u32> = NeighborSet::new();
        set.reserve(addr(3));
        set.commit(addr(3), 7);

        assert_eq!(set.remove_if(&addr(3), |c| *c == 6), None);
        assert!(set.contains(&addr(3)));
        assert_eq!(set.remove_if(&addr(3), |c| *c == 7), Some(7));
        assert!(set.is_empty());
    }

    #[test]
    fn test_commit_after_close_is_refused() {
        let set: NeighborSet<u32> = NeighborSet::new();
        assert!(set.reserve(addr(4)));
        assert!(set.reserve(addr(5)));
        assert!(set.commit(addr(4), 4));

        assert_eq!(set.close(), vec![4]);
        assert!(!set.commit(addr(5), 5));
        assert!(!set.contains(&addr(5)));
        assert!(!set.reserve(addr(6)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_others_and_close() {
        let set: NeighborSet<u32> = NeighborSet::new();
        for port in 1..=3 {
            set.reserve(addr(port));
            set.commit(addr(port), port as u32);
        }
        let mut others: Vec<u32> = set.others(&addr(2)).into_iter().map(|(_, c)| c).collect();
        others.sort();
        assert_eq!(others, vec![1, 3]);
        assert_eq!(set.addresses(), vec![addr(1), addr(2), addr(3)]);

        assert_eq!(set.close().len(), 3);
        assert!(set.is_empty());
    }
}
