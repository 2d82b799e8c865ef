//! Replay cache for key agreement tokens.
//!
//! Remembers the nonces each peer has presented during authentication for a
//! bounded time, so that a captured bind token cannot be replayed to open a
//! second security context. Entries expire by TTL and the oldest entries are
//! evicted first when the cache is full.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::utils::metrics::global_metrics;

/// Default lifetime of an entry; longer than any accepted token age.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Seen {
    added_at: Instant,
    timestamp: u64,
}

/// Peer identity plus the nonce it presented.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    peer_id: String,
    nonce: [u8; 16],
}

/// TTL-bounded nonce cache with FIFO eviction.
#[derive(Debug)]
pub struct ReplayCache {
    entries: HashMap<CacheKey, Seen>,
    /// Insertion order, oldest first.
    order: VecDeque<CacheKey>,
    ttl: Duration,
    max_entries: usize,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `nonce` for `peer_id`; true if the same nonce and timestamp
    /// were already recorded and have not expired.
    #[instrument(level = "trace", skip(self, nonce))]
    pub fn is_replay(&mut self, peer_id: &str, nonce: &[u8; 16], timestamp: u64) -> bool {
        self.expire();

        let key = CacheKey {
            peer_id: peer_id.to_string(),
            nonce: *nonce,
        };
        if let Some(seen) = self.entries.get(&key) {
            if seen.timestamp == timestamp {
                warn!(peer_id, timestamp, "Replayed authentication nonce");
                global_metrics().replay_cache_hit();
                return true;
            }
            debug!(peer_id, "Nonce reused with a new timestamp");
        }

        while self.entries.len() >= self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        if self
            .entries
            .insert(
                key.clone(),
                Seen {
                    added_at: Instant::now(),
                    timestamp,
                },
            )
            .is_none()
        {
            self.order.push_back(key);
        }
        false
    }

    fn expire(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map_or(true, |seen| now.duration_since(seen.added_at) >= self.ttl);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_replay_detection() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let nonce = [1u8; 16];
        assert!(!cache.is_replay("10.0.0.1:5000", &nonce, 1234567890));
        assert!(cache.is_replay("10.0.0.1:5000", &nonce, 1234567890));
    }

    #[test]
    fn test_peers_are_independent() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let nonce = [7u8; 16];
        assert!(!cache.is_replay("a", &nonce, 1));
        assert!(!cache.is_replay("b", &nonce, 1));
    }

    #[test]
    fn test_same_nonce_different_timestamp_allowed() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let nonce = [1u8; 16];
        assert!(!cache.is_replay("peer", &nonce, 1));
        assert!(!cache.is_replay("peer", &nonce, 2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expiration() {
        let mut cache = ReplayCache::with_settings(Duration::from_millis(10), 100);
        let nonce = [1u8; 16];
        assert!(!cache.is_replay("peer", &nonce, 5));
        thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_replay("peer", &nonce, 5));
    }

    #[test]
    fn test_max_entries_limit() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 5);
        for i in 0..10u8 {
            assert!(!cache.is_replay("peer", &[i; 16], 1000 + u64::from(i)));
        }
        assert!(cache.len() <= 5);
        // The oldest nonce was evicted and is accepted again.
        assert!(!cache.is_replay("peer", &[0u8; 16], 1000));
    }
}
