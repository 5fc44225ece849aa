//! Shared helpers for provider adapters: availability fan-out, remote item
//! selection and success bookkeeping.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use futures_util::future::try_join_all;
use tracing::{info, warn};

use crate::cache::KnownCached;

use super::{
    AvailabilityEntry, AvailabilityMap, CanonicalError, ProviderError, ProviderKey,
    StreamCandidate, deep_link, stream_key,
};

/// Unique lowercase info hashes of `streams`, in first-seen order.
#[must_use]
pub fn unique_hashes(streams: &[StreamCandidate]) -> Vec<String> {
    let mut seen = HashSet::new();
    streams
        .iter()
        .map(|stream| stream.info_hash.to_lowercase())
        .filter(|hash| seen.insert(hash.clone()))
        .collect()
}

/// Cached state collected for one availability batch.
///
/// Providers answer either per torrent (every file cached) or, like
/// Real-Debrid, per file variant. Known-cached markers answer per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedStreams {
    hashes: HashSet<String>,
    variants: HashMap<String, Vec<HashSet<u32>>>,
    streams: HashSet<String>,
}

impl CachedStreams {
    /// Marks every file of `info_hash` cached.
    pub fn insert_hash(&mut self, info_hash: &str) {
        self.hashes.insert(info_hash.to_lowercase());
    }

    /// Records a cached variant of `info_hash` made of the 0-based `file_indexes`.
    pub fn insert_variant(&mut self, info_hash: &str, file_indexes: HashSet<u32>) {
        if file_indexes.is_empty() {
            return;
        }
        self.variants
            .entry(info_hash.to_lowercase())
            .or_default()
            .push(file_indexes);
    }

    /// Marks one stream (by [`StreamCandidate::key`]) cached.
    pub fn insert_stream(&mut self, stream_key: impl Into<String>) {
        self.streams.insert(stream_key.into());
    }

    /// Merges `other` into `self`.
    pub fn extend(&mut self, other: Self) {
        self.hashes.extend(other.hashes);
        self.streams.extend(other.streams);
        for (hash, variants) in other.variants {
            self.variants.entry(hash).or_default().extend(variants);
        }
    }

    /// True when the file `stream` points at is cached.
    ///
    /// A variant only counts for a stream whose index it contains; streams
    /// without an index accept any variant.
    #[must_use]
    pub fn contains(&self, stream: &StreamCandidate) -> bool {
        let hash = stream.info_hash.to_lowercase();
        if self.hashes.contains(&hash) || self.streams.contains(&stream_key(&hash, stream.file_index)) {
            return true;
        }
        self.variants.get(&hash).is_some_and(|variants| match stream.file_index {
            Some(index) => variants.iter().any(|files| files.contains(&index)),
            None => !variants.is_empty(),
        })
    }
}

impl From<HashSet<String>> for CachedStreams {
    fn from(hashes: HashSet<String>) -> Self {
        Self {
            hashes: hashes.into_iter().map(|hash| hash.to_lowercase()).collect(),
            ..Self::default()
        }
    }
}

/// Builds the availability map for `streams` given what is cached.
#[must_use]
pub fn availability_map(
    streams: &[StreamCandidate],
    credential: &str,
    cached: &CachedStreams,
) -> AvailabilityMap {
    streams
        .iter()
        .map(|stream| {
            let entry = AvailabilityEntry {
                url: deep_link(
                    credential,
                    &stream.info_hash,
                    &stream.file_name_hint(),
                    stream.file_index,
                ),
                cached: cached.contains(stream),
            };
            (stream.key(), entry)
        })
        .collect()
}

/// Availability check shared by adapters with a batch "is cached" endpoint.
///
/// Known-cached markers are consulted first; hashes with a stream still
/// unanswered are split into `batch_size` chunks checked concurrently by
/// `check_batch`. A failed live check returns `Ok(None)` unless the error is
/// canonical, in which case it propagates.
///
/// # Errors
///
/// Returns the live check error when `classify` recognizes it.
pub async fn check_in_batches<F, Fut, R, C>(
    provider: ProviderKey,
    known_cached: &KnownCached,
    streams: &[StreamCandidate],
    credential: &str,
    batch_size: usize,
    classify: C,
    check_batch: F,
) -> Result<Option<AvailabilityMap>, ProviderError>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<R, ProviderError>>,
    R: Into<CachedStreams>,
    C: Fn(&ProviderError) -> Option<CanonicalError>,
{
    let mut cached = known_cached.cached_streams(provider, streams).await;

    let pending: Vec<StreamCandidate> = streams
        .iter()
        .filter(|stream| !cached.contains(stream))
        .cloned()
        .collect();
    let remaining = unique_hashes(&pending);

    if !remaining.is_empty() {
        let batches = remaining
            .chunks(batch_size.max(1))
            .map(|chunk| check_batch(chunk.to_vec()));
        match try_join_all(batches).await {
            Ok(results) => {
                for result in results {
                    cached.extend(result.into());
                }
            }
            Err(error) => {
                if let Some(canonical) = classify(&error) {
                    warn!(provider = %provider, canonical = %canonical, "availability check rejected credential");
                    return Err(error);
                }
                warn!(provider = %provider, error = %error, "availability check failed");
                return Ok(None);
            }
        }
    }

    Ok(Some(availability_map(streams, credential, &cached)))
}

/// Picks the remote item to reuse among those sharing an info hash.
///
/// Non-failed items win over failed ones; ties go to the richest file listing,
/// then to the earliest in `items`.
#[must_use]
pub fn pick_existing<T>(
    items: Vec<T>,
    is_failed: impl Fn(&T) -> bool,
    richness: impl Fn(&T) -> usize,
) -> Option<T> {
    let (healthy, failed): (Vec<T>, Vec<T>) = items.into_iter().partition(|item| !is_failed(item));
    let pool = if healthy.is_empty() { failed } else { healthy };
    let mut best: Option<T> = None;
    for item in pool {
        let better = best
            .as_ref()
            .is_none_or(|current| richness(&item) > richness(current));
        if better {
            best = Some(item);
        }
    }
    best
}

/// Logs an unrestricted link and records the played file as known cached.
pub fn record_unrestricted(
    known_cached: &KnownCached,
    provider: ProviderKey,
    info_hash: &str,
    file_index: Option<u32>,
    url: &str,
) {
    info!(provider = %provider, info_hash, ?file_index, url, "unrestricted link");
    if info_hash.len() == 40 {
        known_cached.mark(provider, info_hash, file_index);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn stream(hash: &str, index: Option<u32>) -> StreamCandidate {
        StreamCandidate {
            info_hash: hash.to_string(),
            file_index: index,
            title: "Movie\nMovie.2020.mkv".to_string(),
            size: None,
            seeders: None,
        }
    }

    #[test]
    fn test_unique_hashes_lowercases_and_dedups() {
        let streams = vec![stream("ABC", Some(0)), stream("abc", Some(1)), stream("def", None)];
        assert_eq!(unique_hashes(&streams), vec!["abc", "def"]);
    }

    #[test]
    fn test_availability_map_keys_and_links() {
        let streams = vec![stream("abc", Some(1))];
        let cached = CachedStreams::from(HashSet::from(["abc".to_string()]));
        let map = availability_map(&streams, "tok", &cached);
        let entry = map.get("abc@1").unwrap();
        assert!(entry.cached);
        assert_eq!(entry.url, "tok/abc/Movie.2020.mkv/1");
    }

    #[tokio::test]
    async fn test_check_in_batches_splits_into_chunks() {
        let streams: Vec<StreamCandidate> =
            (0..5).map(|i| stream(&format!("h{i}"), None)).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let map = check_in_batches(
            ProviderKey::TorBox,
            &KnownCached::default(),
            &streams,
            "tok",
            2,
            |_| None,
            move |batch| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(batch.into_iter().filter(|h| h == "h3").collect::<HashSet<_>>()) }
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(map.get("h3@none").unwrap().cached);
        assert!(!map.get("h0@none").unwrap().cached);
    }

    #[tokio::test]
    async fn test_check_in_batches_tolerates_non_canonical_failure() {
        let streams = vec![stream("abc", None)];
        let result = check_in_batches(
            ProviderKey::TorBox,
            &KnownCached::default(),
            &streams,
            "tok",
            10,
            |_| None,
            |_| async { Err::<HashSet<String>, _>(ProviderError::unexpected(ProviderKey::TorBox, "down")) },
        )
        .await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_check_in_batches_propagates_canonical_failure() {
        let streams = vec![stream("abc", None)];
        let result = check_in_batches(
            ProviderKey::TorBox,
            &KnownCached::default(),
            &streams,
            "tok",
            10,
            |_| Some(CanonicalError::BadToken),
            |_| async { Err::<HashSet<String>, _>(ProviderError::api(ProviderKey::TorBox, "BAD_TOKEN", "")) },
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_availability_link_names_file_above_seeders_line() {
        let mut pack = stream("abc", Some(4));
        pack.title = "Show.S01.1080p\nShow.S01E05.mkv\n👤 40 💾 1.1 GB ⚙️ TPB\nMulti Audio / 🇬🇧 / 🇫🇷".to_string();
        let map = availability_map(&[pack], "tok", &CachedStreams::default());
        assert_eq!(map.get("abc@4").unwrap().url, "tok/abc/Show.S01E05.mkv/4");
    }

    #[test]
    fn test_file_variants_only_cover_their_indexes() {
        let mut cached = CachedStreams::default();
        cached.insert_variant("ABC", HashSet::from([0]));

        assert!(cached.contains(&stream("abc", Some(0))));
        assert!(!cached.contains(&stream("abc", Some(1))));
        assert!(cached.contains(&stream("abc", None)));
        assert!(!cached.contains(&stream("def", Some(0))));
    }

    #[test]
    fn test_stream_markers_do_not_spread_to_sibling_files() {
        let mut cached = CachedStreams::default();
        cached.insert_stream(stream_key("abc", Some(3)));

        assert!(cached.contains(&stream("ABC", Some(3))));
        assert!(!cached.contains(&stream("abc", Some(4))));
        assert!(!cached.contains(&stream("abc", None)));
    }

    #[tokio::test]
    async fn test_known_marker_skips_only_its_own_file() {
        let store = KnownCached::for_tests().await;
        store.record(ProviderKey::RealDebrid, "abc", Some(0)).await;
        let streams = vec![stream("abc", Some(0)), stream("abc", Some(1))];
        let checked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&checked);

        let map = check_in_batches(
            ProviderKey::RealDebrid,
            &store,
            &streams,
            "tok",
            10,
            |_| None,
            move |batch| {
                seen.lock().unwrap().extend(batch);
                async { Ok(HashSet::<String>::new()) }
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert!(map.get("abc@0").unwrap().cached);
        assert!(!map.get("abc@1").unwrap().cached);
        assert_eq!(*checked.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[test]
    fn test_pick_existing_prefers_healthy_then_richest() {
        let items = vec![("failed", true, 9), ("small", false, 1), ("rich", false, 3)];
        let picked = pick_existing(items, |item| item.1, |item| item.2).unwrap();
        assert_eq!(picked.0, "rich");

        let only_failed = vec![("a", true, 1), ("b", true, 2)];
        assert_eq!(pick_existing(only_failed, |i| i.1, |i| i.2).unwrap().0, "b");
        assert!(pick_existing(Vec::<(u8, bool, usize)>::new(), |i| i.1, |i| i.2).is_none());
    }
}
