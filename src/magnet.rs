//! Magnet link construction with tracker enrichment.
//!
//! Trackers come from the catalog entry for the torrent. Sources whose
//! trackers require the downloading IP to seed first are skipped so the
//! provider falls back to DHT. Anime torrents without own trackers get the
//! bootstrap "best trackers" list plus the anime trackers.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::form_urlencoded;

use crate::repository::{TorrentKind, TorrentRepository};

/// Default source of the best trackers list.
pub const DEFAULT_BEST_TRACKERS_URL: &str =
    "https://raw.githubusercontent.com/ngosang/trackerslist/master/trackers_best.txt";

const ANIME_TRACKERS: &[&str] = &[
    "http://nyaa.tracker.wf:7777/announce",
    "http://anidex.moe:6969/announce",
    "http://tracker.anirena.com:80/announce",
    "udp://tracker.uw0.xyz:6969/announce",
    "http://share.camoe.cn:8080/announce",
    "http://t.nyaatracker.com:80/announce",
];

const LIMITED_SOURCES: &[&str] = &["Rutor"];

const BOOTSTRAP_RETRIES: u32 = 2;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds magnet links for info hashes.
pub struct MagnetBuilder {
    repository: Arc<dyn TorrentRepository>,
    anime_trackers: RwLock<Vec<String>>,
}

impl std::fmt::Debug for MagnetBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagnetBuilder")
            .field("anime_trackers", &self.anime_trackers().len())
            .finish_non_exhaustive()
    }
}

impl MagnetBuilder {
    /// Creates a builder reading trackers from `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn TorrentRepository>) -> Self {
        Self {
            repository,
            anime_trackers: RwLock::new(Vec::new()),
        }
    }

    /// Installs the best trackers list; anime trackers are appended.
    pub fn set_best_trackers(&self, best: Vec<String>) {
        let mut all = best;
        all.extend(ANIME_TRACKERS.iter().map(|tracker| (*tracker).to_string()));
        if let Ok(mut guard) = self.anime_trackers.write() {
            *guard = all;
        }
    }

    fn anime_trackers(&self) -> Vec<String> {
        self.anime_trackers
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Fetches the best trackers list (retrying twice) and installs it.
    ///
    /// Failure is logged and only disables anime enrichment.
    #[instrument(skip(self, client))]
    pub async fn bootstrap_best_trackers(&self, client: &Client, url: &str) {
        match fetch_best_trackers(client, url).await {
            Ok(trackers) => {
                info!(count = trackers.len(), "retrieved best trackers");
                self.set_best_trackers(trackers);
            }
            Err(error) => warn!(error = %error, "failed retrieving best trackers"),
        }
    }

    /// Magnet link for `info_hash` with whatever trackers are known.
    ///
    /// Catalog failures degrade to a bare magnet.
    pub async fn magnet_link(&self, info_hash: &str) -> String {
        let torrent = match self.repository.get_torrent_by_hash(info_hash).await {
            Ok(torrent) => torrent,
            Err(error) => {
                debug!(error = %error, "catalog lookup failed; using bare magnet");
                None
            }
        };

        let own_trackers = torrent.as_ref().and_then(|torrent| {
            let limited = torrent
                .source
                .as_deref()
                .is_some_and(|source| LIMITED_SOURCES.contains(&source));
            (!limited && !torrent.trackers.is_empty()).then(|| torrent.trackers.clone())
        });
        let trackers = own_trackers.or_else(|| {
            torrent
                .as_ref()
                .filter(|torrent| torrent.kind == TorrentKind::Anime)
                .map(|_| self.anime_trackers())
        });

        encode_magnet(info_hash, trackers.as_deref().unwrap_or_default())
    }
}

/// `magnet:?xt=urn:btih:{hash}` with one `tr` parameter per tracker.
#[must_use]
pub fn encode_magnet(info_hash: &str, trackers: &[String]) -> String {
    let mut magnet = format!("magnet:?xt=urn:btih:{}", info_hash.to_lowercase());
    if !trackers.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(trackers.iter().map(|tracker| ("tr", tracker.as_str())))
            .finish();
        magnet.push('&');
        magnet.push_str(&query);
    }
    magnet
}

async fn fetch_best_trackers(client: &Client, url: &str) -> Result<Vec<String>, reqwest::Error> {
    let mut attempt = 0;
    loop {
        let result = async {
            client
                .get(url)
                .timeout(BOOTSTRAP_TIMEOUT)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        }
        .await;

        match result {
            Ok(body) => return Ok(parse_trackers(&body)),
            Err(error) if attempt < BOOTSTRAP_RETRIES => {
                attempt += 1;
                debug!(attempt, error = %error, "retrying best trackers fetch");
            }
            Err(error) => return Err(error),
        }
    }
}

/// Trackers list bodies separate entries with blank lines.
fn parse_trackers(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
