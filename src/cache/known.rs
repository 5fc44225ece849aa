//! "Known cached" markers written after successful unrestrictions.
//!
//! Availability checks consult these markers before asking the provider, so
//! files the account recently played are reported cached without a provider
//! round trip. Markers are per file: playing one episode of a pack says
//! nothing about its siblings.

use std::time::Duration;

use futures_util::future::join_all;
use tracing::trace;

use crate::debrid::{CachedStreams, ProviderKey, StreamCandidate, stream_key};

use super::TwoTierCache;

/// Durable lifetime of a known-cached marker.
pub const KNOWN_CACHED_TTL: Duration = Duration::from_secs(8 * 60 * 60);

const KNOWN_CACHED_MEMORY_TTL: Duration = Duration::from_secs(30 * 60);

/// Known-cached marker store on top of the result cache.
#[derive(Debug, Clone, Default)]
pub struct KnownCached {
    cache: TwoTierCache,
}

fn marker_key(provider: ProviderKey, info_hash: &str, file_index: Option<u32>) -> String {
    format!(
        "availability|{provider}|{}",
        stream_key(&info_hash.to_lowercase(), file_index)
    )
}

impl KnownCached {
    /// Creates the store over `cache`.
    #[must_use]
    pub fn new(cache: TwoTierCache) -> Self {
        Self { cache }
    }

    /// Records file `file_index` of `info_hash` as cached for `provider`,
    /// awaiting the write.
    pub async fn record(&self, provider: ProviderKey, info_hash: &str, file_index: Option<u32>) {
        self.cache
            .set(
                &marker_key(provider, info_hash, file_index),
                &true,
                Some(KNOWN_CACHED_TTL),
                Some(KNOWN_CACHED_MEMORY_TTL),
            )
            .await;
    }

    /// Records the marker in the background. Never blocks the caller.
    pub fn mark(&self, provider: ProviderKey, info_hash: &str, file_index: Option<u32>) {
        if !self.cache.is_enabled() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.clone();
        let info_hash = info_hash.to_string();
        handle.spawn(async move {
            store.record(provider, &info_hash, file_index).await;
            trace!(provider = %provider, "recorded known-cached marker");
        });
    }

    /// Streams of `streams` with a marker for `provider`.
    pub async fn cached_streams(&self, provider: ProviderKey, streams: &[StreamCandidate]) -> CachedStreams {
        let mut cached = CachedStreams::default();
        if !self.cache.is_enabled() {
            return cached;
        }
        let lookups = streams.iter().map(|stream| async move {
            self.cache
                .get::<bool>(&marker_key(provider, &stream.info_hash, stream.file_index))
                .await
                .filter(|known| *known)
                .map(|_| stream_key(&stream.info_hash.to_lowercase(), stream.file_index))
        });
        for key in join_all(lookups).await.into_iter().flatten() {
            cached.insert_stream(key);
        }
        cached
    }

    /// Store over an in-memory database.
    #[cfg(test)]
    pub(crate) async fn for_tests() -> Self {
        use crate::cache::{DurableTier, MemoryTier};
        use crate::db::Database;

        #[allow(clippy::unwrap_used)]
        let db = Database::new_in_memory().await.unwrap();
        Self::new(TwoTierCache::new(MemoryTier::new(16), DurableTier::new(db)))
    }
}
