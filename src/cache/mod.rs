//! Two-tier result cache: a per-instance memory tier in front of a durable
//! SQLite tier.
//!
//! - `get` checks memory, then durable; a durable hit backfills memory with
//!   `min(30 min, remaining TTL)`.
//! - `wrap` is get-or-compute: on a miss the producer runs and its value is
//!   written durable first, then memory, each with its own TTL from the
//!   caller's policy.
//! - Without a durable tier the cache is compute-through: nothing is
//!   memoized and every `wrap` runs the producer.
//!
//! Durable failures are logged and treated as misses. The cache is a
//! performance layer only.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use debrid_core::cache::{Tier, TwoTierCache};
//!
//! # async fn example(cache: TwoTierCache) {
//! let value: Result<u32, String> = cache
//!     .wrap("answer", || async { Ok(42) }, |_: &u32, tier: Tier| match tier {
//!         Tier::Durable => Some(Duration::from_secs(3600)),
//!         Tier::Memory => Some(Duration::from_secs(60)),
//!     })
//!     .await;
//! # }
//! ```

mod durable;
mod known;
mod memory;

pub use durable::{DurableTier, storage_key};
pub use known::{KNOWN_CACHED_TTL, KnownCached};
pub use memory::{DEFAULT_MEMORY_CAPACITY, MemoryTier};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Upper bound for memory TTLs written by durable backfill.
pub const MAX_MEMORY_BACKFILL_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache tier a TTL applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast per-instance tier.
    Memory,
    /// Shared SQLite tier.
    Durable,
}

/// Cache errors. Only surfaced by direct tier access; `wrap` logs them.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The durable store failed.
    #[error("durable cache error: {0}\n  Suggestion: Check the cache database path and permissions")]
    Durable(#[from] sqlx::Error),

    /// A stored value could not be (de)serialized.
    #[error("cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug)]
struct Tiers {
    memory: MemoryTier,
    durable: DurableTier,
}

/// Two-tier cache handle. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct TwoTierCache {
    tiers: Option<Arc<Tiers>>,
}

impl TwoTierCache {
    /// Creates a cache with both tiers.
    #[must_use]
    pub fn new(memory: MemoryTier, durable: DurableTier) -> Self {
        Self {
            tiers: Some(Arc::new(Tiers { memory, durable })),
        }
    }

    /// Creates a compute-through cache that memoizes nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tiers: None }
    }

    /// True when values are memoized.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tiers.is_some()
    }

    /// Looks `key` up in memory, then in the durable tier.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let tiers = self.tiers.as_ref()?;

        if let Some(raw) = tiers.memory.get(key) {
            trace!("memory tier hit");
            return decode(&raw);
        }

        match tiers.durable.get(key).await {
            Ok(Some((raw, remaining))) => {
                trace!("durable tier hit; backfilling memory");
                let value = decode(&raw)?;
                tiers
                    .memory
                    .set(key, raw, remaining.min(MAX_MEMORY_BACKFILL_TTL));
                Some(value)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, "durable cache read failed; treating as miss");
                None
            }
        }
    }

    /// Writes `value` to both tiers (durable first), with per-tier TTLs.
    ///
    /// A `None` TTL skips that tier.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        durable_ttl: Option<Duration>,
        memory_ttl: Option<Duration>,
    ) {
        let Some(tiers) = self.tiers.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(error = %error, "cache value not serializable; skipping write");
                return;
            }
        };

        if let Some(ttl) = durable_ttl
            && let Err(error) = tiers.durable.set(key, &raw, ttl).await
        {
            warn!(error = %error, "durable cache write failed");
        }
        if let Some(ttl) = memory_ttl {
            tiers.memory.set(key, raw, ttl);
        }
    }

    /// Removes `key` from both tiers.
    pub async fn delete(&self, key: &str) {
        let Some(tiers) = self.tiers.as_ref() else {
            return;
        };
        tiers.memory.delete(key);
        if let Err(error) = tiers.durable.delete(key).await {
            warn!(error = %error, "durable cache delete failed");
        }
    }

    /// Get-or-compute. Errors from `producer` are returned and never cached.
    ///
    /// `ttl` is asked once per tier; returning `None` skips that tier.
    ///
    /// # Errors
    ///
    /// Returns the producer's error.
    pub async fn wrap<T, E, F, Fut, P>(&self, key: &str, producer: F, ttl: P) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T, Tier) -> Option<Duration>,
    {
        if !self.is_enabled() {
            return producer().await;
        }

        if let Some(hit) = self.get::<T>(key).await {
            debug!("cache hit");
            return Ok(hit);
        }

        let value = producer().await?;
        self.set(
            key,
            &value,
            ttl(&value, Tier::Durable),
            ttl(&value, Tier::Memory),
        )
        .await;
        Ok(value)
    }

    /// Purges expired durable rows. No-op without a durable tier.
    pub async fn purge_expired(&self) {
        let Some(tiers) = self.tiers.as_ref() else {
            return;
        };
        match tiers.durable.purge_expired().await {
            Ok(removed) if removed > 0 => debug!(removed, "purged expired cache rows"),
            Ok(_) => {}
            Err(error) => warn!(error = %error, "durable cache purge failed"),
        }
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(error = %error, "cached value has an unexpected shape; ignoring");
            None
        }
    }
}
