//! Per-instance memory tier: TTL entries with a capacity bound.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

/// Default maximum number of memory entries.
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Concurrent TTL map holding serialized values.
///
/// When full, expired entries are purged first; if that frees nothing, the
/// entry closest to expiry is evicted.
#[derive(Debug)]
pub struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    capacity: usize,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryTier {
    /// Creates a tier holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the live value for `key`; expired entries are dropped.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Guard released above; safe to take the write lock.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Stores `value` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Removes `key`.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of stored entries, including not yet purged expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        if self.entries.len() < self.capacity {
            return;
        }
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            trace!("memory tier full; evicting entry closest to expiry");
            self.entries.remove(&key);
        }
    }
}
