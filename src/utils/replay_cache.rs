//! Replay Cache for connect-token nonces
//!
//! Every connect token is sealed under a unique nonce, so a nonce seen twice
//! means a captured request is being replayed. The cache remembers consumed
//! nonces and refuses them a second time, independently of whether the cipher
//! would accept the token again.
//!
//! Growth is bounded: once `max_entries` nonces are held the oldest is
//! evicted first. Entries inserted with their token's expiry are also dropped
//! once that expiry passes; an expired token is refused before it reaches the
//! cache, so forgetting it cannot reopen a replay window.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, instrument, warn};

use crate::config::NONCE_BYTES;

/// Nonce type tracked by the cache
pub type CacheKey = [u8; NONCE_BYTES];

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    /// Unix seconds after which the token carrying this nonce is dead
    expire_timestamp: Option<u64>,
}

/// Bounded nonce set with O(1) FIFO eviction
///
/// Uses VecDeque to track insertion order for constant-time removal of oldest
/// entries when the cache reaches capacity.
#[derive(Debug)]
pub struct ReplayCache {
    entries: HashMap<CacheKey, CacheEntry>,
    insertion_order: VecDeque<CacheKey>,
    max_entries: usize,
}

impl ReplayCache {
    /// Create a replay cache holding up to 4096 nonces
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create a replay cache holding up to `max_entries` nonces
    pub fn with_capacity(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: HashMap::with_capacity(max_entries),
            insertion_order: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    /// Returns false if `nonce` was already consumed; otherwise records it and returns true
    #[instrument(level = "trace", skip(self, nonce))]
    pub fn check_and_insert(&mut self, nonce: &CacheKey) -> bool {
        self.insert(nonce, None)
    }

    /// Like [`check_and_insert`](Self::check_and_insert), first forgetting
    /// nonces whose tokens expired before `now`
    #[instrument(level = "trace", skip(self, nonce))]
    pub fn check_and_insert_until(&mut self, nonce: &CacheKey, expire_timestamp: u64, now: u64) -> bool {
        self.purge_expired(now);
        self.insert(nonce, Some(expire_timestamp))
    }

    /// Whether `nonce` has already been consumed. Does not record it.
    ///
    /// Callers that still have to authenticate the token check here first and
    /// call [`record_until`](Self::record_until) only once it opens, so that
    /// unauthenticated senders cannot push real nonces out of the cache.
    pub fn contains(&mut self, nonce: &CacheKey, now: u64) -> bool {
        self.purge_expired(now);
        let seen = self.entries.contains_key(nonce);
        if seen {
            warn!(?nonce, "Replay detected - connect token nonce already consumed");
        }
        seen
    }

    /// Record an authenticated nonce until its token expires.
    /// Returns false if it was already present.
    pub fn record_until(&mut self, nonce: &CacheKey, expire_timestamp: u64) -> bool {
        self.insert(nonce, Some(expire_timestamp))
    }

    fn insert(&mut self, nonce: &CacheKey, expire_timestamp: Option<u64>) -> bool {
        if self.entries.contains_key(nonce) {
            warn!(?nonce, "Replay detected - connect token nonce already consumed");
            return false;
        }

        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        self.entries.insert(*nonce, CacheEntry { expire_timestamp });
        self.insertion_order.push_back(*nonce);
        true
    }

    /// Remove entries whose token expired before `now`
    pub fn purge_expired(&mut self, now: u64) {
        let initial_count = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expire_timestamp.is_none_or(|t| t >= now));

        let removed = initial_count - self.entries.len();
        if removed > 0 {
            let entries = &self.entries;
            self.insertion_order.retain(|key| entries.contains_key(key));
            debug!("Purged {} expired replay cache entries", removed);
        }
    }

    fn evict_oldest(&mut self) {
        while self.entries.len() >= self.max_entries {
            match self.insertion_order.pop_front() {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
        debug!("Evicted oldest replay cache entry due to size limit");
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries (useful for testing or manual cache reset)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
        debug!("Replay cache cleared");
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the replay cache
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Current number of entries
    pub entries: usize,
    /// Maximum allowed entries
    pub max_entries: usize,
}
