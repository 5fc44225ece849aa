//! Bulk availability checker: fans availability checks out to every
//! configured provider and merges the answers into the stream list.
//!
//! A candidate reported cached by a provider becomes a resolvable link
//! `[{short}+] name` pointing back at the resolution endpoint. The first
//! provider (in [`ProviderKey::ALL`] order) to report it cached wins. With
//! download links enabled, healthy uncached candidates also get one
//! `[{short} download] name` entry per provider.

use std::collections::HashSet;

use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::debrid::{
    AvailabilityMap, CanonicalError, ProviderKey, ProviderRegistry, StreamCandidate,
    credential_fingerprint,
};
use crate::outcome::StaticOutcome;

use super::blacklist::CredentialBlacklist;
use super::options::DebridOptions;

/// Below this many streams every uncached candidate counts as healthy.
pub const SPARSE_RESULT_THRESHOLD: usize = 5;

/// What a listed stream represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// Plain torrent entry, not (yet) served through a provider.
    Torrent(StreamCandidate),
    /// Cached on the provider; the url resolves instantly.
    Cached(ProviderKey),
    /// Uncached; the url submits the torrent to the provider on demand.
    Download(ProviderKey),
    /// The provider rejected the configured credential.
    ProviderError(ProviderKey),
}

/// One entry of a stream listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebridStream {
    /// Short label shown by the client.
    pub name: String,
    /// Long description; the last line is the file name.
    pub title: String,
    /// Resolution endpoint link, absent for plain torrents.
    pub url: Option<String>,
    /// Entry kind.
    pub kind: StreamKind,
}

impl DebridStream {
    /// A plain torrent entry labelled `name`.
    #[must_use]
    pub fn torrent(name: impl Into<String>, candidate: StreamCandidate) -> Self {
        Self {
            name: name.into(),
            title: candidate.title.clone(),
            url: None,
            kind: StreamKind::Torrent(candidate),
        }
    }

    fn candidate(&self) -> Option<&StreamCandidate> {
        match &self.kind {
            StreamKind::Torrent(candidate) => Some(candidate),
            _ => None,
        }
    }

    fn provider_error(provider: ProviderKey, canonical: CanonicalError, host: &str) -> Self {
        let (title, outcome) = match canonical {
            CanonicalError::BadToken => (
                format!("Invalid {} credential", provider.display_name()),
                StaticOutcome::FailedAccess,
            ),
            CanonicalError::AccessDenied => (
                format!("{} subscription expired or access denied", provider.display_name()),
                StaticOutcome::FailedAccess,
            ),
            CanonicalError::AccessBlocked => (
                format!("{} blocked access from this location", provider.display_name()),
                StaticOutcome::BlockedAccess,
            ),
        };
        Self {
            name: format!("[{} error] {}", provider.short_name(), provider.display_name()),
            title,
            url: Some(outcome.url(host)),
            kind: StreamKind::ProviderError(provider),
        }
    }
}

/// Result of one provider's availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderReport {
    /// The provider answered.
    Available(AvailabilityMap),
    /// The provider rejected the credential.
    Rejected(CanonicalError),
    /// The check failed for another reason; the provider is ignored.
    Unavailable,
}

/// Checks availability across every configured provider.
#[derive(Debug, Clone)]
pub struct AvailabilityChecker {
    registry: ProviderRegistry,
    blacklist: CredentialBlacklist,
    host: String,
}

impl AvailabilityChecker {
    /// Creates a checker building links under `host`.
    #[must_use]
    pub fn new(registry: ProviderRegistry, blacklist: CredentialBlacklist, host: impl Into<String>) -> Self {
        Self {
            registry,
            blacklist,
            host: host.into(),
        }
    }

    /// Checks every configured provider concurrently and merges the answers.
    ///
    /// Providers without a registered adapter are skipped. A blacklisted
    /// credential is reported as rejected without contacting the provider.
    #[instrument(skip_all, fields(streams = streams.len(), providers = credentials.len()))]
    pub async fn apply(
        &self,
        streams: Vec<DebridStream>,
        credentials: &[(ProviderKey, String)],
        client_ip: Option<&str>,
        options: DebridOptions,
    ) -> Vec<DebridStream> {
        let candidates: Vec<StreamCandidate> = streams
            .iter()
            .filter_map(DebridStream::candidate)
            .cloned()
            .collect();
        if candidates.is_empty() || credentials.is_empty() {
            return streams;
        }

        let configured: Vec<(ProviderKey, &str)> = ProviderKey::ALL
            .into_iter()
            .filter_map(|key| {
                credentials
                    .iter()
                    .find(|(provider, _)| *provider == key)
                    .map(|(provider, credential)| (*provider, credential.as_str()))
            })
            .collect();

        let checks = configured
            .iter()
            .map(|(provider, credential)| self.check(*provider, credential, &candidates, client_ip));
        let reports: Vec<(ProviderKey, ProviderReport)> = join_all(checks).await.into_iter().flatten().collect();

        merge_availability(streams, &reports, options, &self.host)
    }

    async fn check(
        &self,
        provider: ProviderKey,
        credential: &str,
        candidates: &[StreamCandidate],
        client_ip: Option<&str>,
    ) -> Option<(ProviderKey, ProviderReport)> {
        let Some(adapter) = self.registry.get(provider) else {
            debug!(provider = %provider, "no adapter registered; skipping availability");
            return None;
        };
        if self.blacklist.contains(provider, credential) {
            debug!(provider = %provider, "credential blacklisted; skipping availability");
            return Some((provider, ProviderReport::Rejected(CanonicalError::BadToken)));
        }

        let report = match adapter.check_availability(candidates, credential, client_ip).await {
            Ok(Some(map)) => ProviderReport::Available(map),
            Ok(None) => ProviderReport::Unavailable,
            Err(error) => match adapter.classify_error(&error) {
                Some(CanonicalError::BadToken) => {
                    self.blacklist.insert(provider, credential);
                    ProviderReport::Rejected(CanonicalError::BadToken)
                }
                Some(canonical) => {
                    info!(
                        provider = %provider,
                        credential = %credential_fingerprint(credential),
                        canonical = %canonical,
                        "availability check refused"
                    );
                    ProviderReport::Rejected(canonical)
                }
                None => {
                    warn!(provider = %provider, error = %error, "availability check failed; ignoring provider");
                    ProviderReport::Unavailable
                }
            },
        };
        Some((provider, report))
    }
}

/// Merges provider reports into `streams`.
///
/// Reports are applied in the given order. Rejected providers contribute a
/// single error entry at the top of the list.
#[must_use]
pub fn merge_availability(
    streams: Vec<DebridStream>,
    reports: &[(ProviderKey, ProviderReport)],
    options: DebridOptions,
    host: &str,
) -> Vec<DebridStream> {
    let base = base_url(host);
    let total = streams.len();
    let mut merged = streams;
    let mut downloads = Vec::new();
    let mut errors = Vec::new();
    let mut emitted: HashSet<(ProviderKey, String)> = HashSet::new();

    for (provider, report) in reports {
        let map = match report {
            ProviderReport::Available(map) => map,
            ProviderReport::Rejected(canonical) => {
                errors.push(DebridStream::provider_error(*provider, *canonical, host));
                continue;
            }
            ProviderReport::Unavailable => continue,
        };

        for stream in &mut merged {
            let Some(candidate) = stream.candidate().cloned() else {
                continue;
            };
            let Some(entry) = map.get(&candidate.key()) else {
                continue;
            };
            if !emitted.insert((*provider, candidate.key())) {
                continue;
            }
            let url = format!("{base}/{provider}/{}", entry.url);

            if entry.cached {
                stream.name = format!("[{}+] {}", provider.short_name(), stream.name);
                stream.url = Some(url);
                stream.kind = StreamKind::Cached(*provider);
            } else if options.include_download_links && is_healthy(&candidate, &stream.name, total) {
                downloads.push(DebridStream {
                    name: format!("[{} download] {}", provider.short_name(), stream.name),
                    title: stream.title.clone(),
                    url: Some(url),
                    kind: StreamKind::Download(*provider),
                });
            }
        }
    }

    let mut result = errors;
    result.extend(merged);
    result.extend(downloads);

    let any_cached = result.iter().any(|stream| matches!(stream.kind, StreamKind::Cached(_)));
    if options.only_cached_links || (options.only_cached_links_if_available && any_cached) {
        result.retain(|stream| {
            matches!(stream.kind, StreamKind::Cached(_) | StreamKind::ProviderError(_))
        });
    }
    result
}

/// `host` with a scheme and without a trailing slash.
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Whether an uncached candidate is worth offering as a download link.
fn is_healthy(candidate: &StreamCandidate, name: &str, total: usize) -> bool {
    total <= SPARSE_RESULT_THRESHOLD
        || candidate.seeders != Some(0)
        || is_high_resolution(name)
        || is_high_resolution(&candidate.title)
}

fn is_high_resolution(label: &str) -> bool {
    let label = label.to_ascii_lowercase();
    label.contains("4k") || label.contains("2160p")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::debrid::AvailabilityEntry;

    const HOST: &str = "http://resolver.test";

    fn candidate(seed: char, seeders: Option<u32>) -> StreamCandidate {
        StreamCandidate {
            info_hash: seed.to_string().repeat(40),
            file_index: Some(0),
            title: format!("Movie {seed}.mkv\n👤 {}", seeders.unwrap_or_default()),
            size: None,
            seeders,
        }
    }

    fn report(entries: &[(&StreamCandidate, bool)]) -> ProviderReport {
        ProviderReport::Available(
            entries
                .iter()
                .map(|(candidate, cached)| {
                    (
                        candidate.key(),
                        AvailabilityEntry {
                            url: format!("tok/{}/Movie.mkv/0", candidate.info_hash),
                            cached: *cached,
                        },
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_merge_marks_each_provider_cached_candidate_once() {
        let (one, two, three) = (candidate('a', Some(3)), candidate('b', Some(3)), candidate('c', Some(3)));
        let streams = vec![
            DebridStream::torrent("Resolver\n1080p", one.clone()),
            DebridStream::torrent("Resolver\n720p", two.clone()),
            DebridStream::torrent("Resolver\n480p", three.clone()),
        ];
        let reports = vec![
            (ProviderKey::RealDebrid, report(&[(&one, true), (&two, false), (&three, false)])),
            (ProviderKey::AllDebrid, report(&[(&one, false), (&two, true), (&three, false)])),
        ];

        let merged = merge_availability(streams, &reports, DebridOptions::default(), HOST);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].kind, StreamKind::Cached(ProviderKey::RealDebrid));
        assert_eq!(merged[0].name, "[RD+] Resolver\n1080p");
        assert_eq!(
            merged[0].url.as_deref(),
            Some(format!("{HOST}/realdebrid/tok/{}/Movie.mkv/0", one.info_hash).as_str())
        );
        assert_eq!(merged[1].kind, StreamKind::Cached(ProviderKey::AllDebrid));
        assert_eq!(merged[1].name, "[AD+] Resolver\n720p");
        assert!(matches!(merged[2].kind, StreamKind::Torrent(_)));
        assert!(merged[2].url.is_none());
    }

    #[test]
    fn test_download_links_once_per_candidate_per_provider() {
        let one = candidate('a', Some(3));
        let streams = vec![
            DebridStream::torrent("Resolver", one.clone()),
            DebridStream::torrent("Resolver", one.clone()),
        ];
        let reports = vec![(ProviderKey::TorBox, report(&[(&one, false)]))];
        let options = DebridOptions {
            include_download_links: true,
            ..DebridOptions::default()
        };

        let merged = merge_availability(streams, &reports, options, HOST);

        let downloads: Vec<_> = merged
            .iter()
            .filter(|stream| stream.kind == StreamKind::Download(ProviderKey::TorBox))
            .collect();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].name, "[TB download] Resolver");
        assert_eq!(downloads[0].title, one.title);
    }

    #[test]
    fn test_zero_seeded_candidates_skip_download_links_in_large_results() {
        let dead = candidate('a', Some(0));
        let mut streams = vec![DebridStream::torrent("Resolver\n1080p", dead.clone())];
        let mut entries = vec![(dead.clone(), false)];
        for seed in ['b', 'c', 'd', 'e', 'f'] {
            let alive = candidate(seed, Some(10));
            streams.push(DebridStream::torrent("Resolver\n1080p", alive.clone()));
            entries.push((alive, false));
        }
        let borrowed: Vec<(&StreamCandidate, bool)> = entries.iter().map(|(c, cached)| (c, *cached)).collect();
        let options = DebridOptions {
            include_download_links: true,
            ..DebridOptions::default()
        };

        let merged = merge_availability(streams, &[(ProviderKey::Premiumize, report(&borrowed))], options, HOST);

        let download_count = merged
            .iter()
            .filter(|stream| matches!(stream.kind, StreamKind::Download(_)))
            .count();
        assert_eq!(download_count, 5);
    }

    #[test]
    fn test_high_resolution_zero_seeded_is_still_healthy() {
        let dead = candidate('a', Some(0));
        assert!(is_healthy(&dead, "Resolver\n4k HDR", 50));
        assert!(!is_healthy(&dead, "Resolver\n1080p", 50));
        assert!(is_healthy(&dead, "Resolver\n1080p", 3));
    }

    #[test]
    fn test_only_cached_links_filters_uncached() {
        let (one, two) = (candidate('a', Some(3)), candidate('b', Some(3)));
        let streams = vec![
            DebridStream::torrent("Resolver", one.clone()),
            DebridStream::torrent("Resolver", two.clone()),
        ];
        let reports = vec![(ProviderKey::RealDebrid, report(&[(&one, true), (&two, false)]))];
        let options = DebridOptions {
            only_cached_links: true,
            include_download_links: true,
            ..DebridOptions::default()
        };

        let merged = merge_availability(streams, &reports, options, HOST);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, StreamKind::Cached(ProviderKey::RealDebrid));
    }

    #[test]
    fn test_only_cached_if_available_keeps_all_without_cached() {
        let one = candidate('a', Some(3));
        let streams = vec![DebridStream::torrent("Resolver", one.clone())];
        let reports = vec![(ProviderKey::RealDebrid, report(&[(&one, false)]))];
        let options = DebridOptions {
            only_cached_links_if_available: true,
            ..DebridOptions::default()
        };

        let merged = merge_availability(streams, &reports, options, HOST);

        assert_eq!(merged.len(), 1);
        assert!(matches!(merged[0].kind, StreamKind::Torrent(_)));
    }

    #[test]
    fn test_rejected_provider_adds_error_entry_first() {
        let one = candidate('a', Some(3));
        let streams = vec![DebridStream::torrent("Resolver", one)];
        let reports = vec![
            (ProviderKey::DebridLink, ProviderReport::Rejected(CanonicalError::BadToken)),
            (ProviderKey::Offcloud, ProviderReport::Unavailable),
        ];

        let merged = merge_availability(streams, &reports, DebridOptions::default(), HOST);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].kind, StreamKind::ProviderError(ProviderKey::DebridLink));
        assert_eq!(
            merged[0].url.as_deref(),
            Some(StaticOutcome::FailedAccess.url(HOST).as_str())
        );
    }

    #[tokio::test]
    async fn test_apply_without_configured_providers_is_identity() {
        let checker = AvailabilityChecker::new(ProviderRegistry::new(), CredentialBlacklist::new(), HOST);
        let streams = vec![DebridStream::torrent("Resolver", candidate('a', None))];
        let result = checker
            .apply(streams.clone(), &[(ProviderKey::RealDebrid, "tok".to_string())], None, DebridOptions::default())
            .await;
        assert_eq!(result, streams);
    }
}
