//! Bounded recent-message cache used for gossip deduplication

use crate::types::DedupToken;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// FIFO-bounded record of recently processed dedup tokens.
///
/// Holds at most `capacity` tokens; inserting past the cap evicts the oldest
/// insertion first. Each entry keeps the encoded command it was recorded with
/// (empty when the token was learned from another connection).
pub struct MessageCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

#[derive(Default)]
struct CacheInner {
    order: VecDeque<DedupToken>,
    entries: HashMap<DedupToken, Vec<u8>>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity,
        }
    }

    /// Check whether a token was already processed
    pub fn contains(&self, token: &DedupToken) -> bool {
        self.inner.lock().entries.contains_key(token)
    }

    /// Record a token with its encoded command. Returns false if already present.
    pub fn insert(&self, token: DedupToken, encoded: Vec<u8>) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&token) {
            return false;
        }
        inner.order.push_back(token.clone());
        inner.entries.insert(token, encoded);

        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        true
    }

    /// Record tokens processed elsewhere (no encoded bytes)
    pub fn extend<I>(&self, tokens: I)
    where
        I: IntoIterator<Item = DedupToken>,
    {
        for token in tokens {
            self.insert(token, Vec::new());
        }
    }

    /// Encoded command recorded for a token
    pub fn get(&self, token: &DedupToken) -> Option<Vec<u8>> {
        self.inner.lock().entries.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
