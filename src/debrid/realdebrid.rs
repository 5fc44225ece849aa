//! Real-Debrid adapter.
//!
//! Torrent lifecycle: `addMagnet` → `magnet_conversion` → `waiting_files_selection`
//! → `selectFiles` → `downloading` → `downloaded` → `unrestrict/link`.
//! API errors come back as `{ "error": "...", "error_code": N }` with a
//! non-success status; the numeric code is kept as the [`ProviderError::Api`] code.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::MagnetBuilder;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::poll::{PollOutcome, PollSchedule, poll_until};
use super::utils::{CachedStreams, check_in_batches, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate, deep_link, form_body,
};

const KEY: ProviderKey = ProviderKey::RealDebrid;

/// Default Real-Debrid REST base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.real-debrid.com/rest/1.0";

const AVAILABILITY_BATCH: usize = 100;
const LIST_LIMIT: &str = "100";

/// Magnet conversion poll: 2 s × 10.
const CONVERSION_POLL: PollSchedule = PollSchedule::new(Duration::from_secs(2), 10);

// Real-Debrid numeric error codes.
const BAD_TOKEN: &str = "8";
const PERMISSION_DENIED: &str = "9";
const NOT_PREMIUM: &str = "20";
const TOO_MANY_ACTIVE: &str = "21";
const IP_NOT_ALLOWED: &str = "22";
const TRAFFIC_EXHAUSTED: &str = "23";
const TORRENT_TOO_BIG: &str = "29";
const INFRINGING_FILE: &str = "35";
const FAIR_USAGE_LIMIT: &str = "36";

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct RdErrorEnvelope {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
}

/// Entry of `/torrents` and body of `/torrents/info/{id}` (which adds `files`).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdTorrent {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    pub hash: String,
    #[serde(default)]
    pub bytes: u64,
    pub status: String,
    #[serde(default)]
    pub files: Vec<RdFile>,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdFile {
    /// 1-based file id.
    pub id: u32,
    pub path: String,
    pub bytes: u64,
    #[serde(default)]
    pub selected: u8,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RdAddMagnet {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RdUnrestrict {
    pub download: String,
    #[serde(default)]
    pub filename: String,
}

// ==================== Status Mapping ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TorrentState {
    Converting,
    WaitingSelection,
    Downloading,
    Ready,
    Failed,
}

fn torrent_state(status: &str) -> TorrentState {
    match status {
        "magnet_conversion" => TorrentState::Converting,
        "waiting_files_selection" => TorrentState::WaitingSelection,
        "queued" | "downloading" | "compressing" | "uploading" => TorrentState::Downloading,
        "downloaded" => TorrentState::Ready,
        _ => TorrentState::Failed,
    }
}

impl RdFile {
    fn remote(&self) -> RemoteFile {
        RemoteFile::new(Some(self.id.saturating_sub(1)), self.path.clone(), self.bytes)
    }
}

/// Expected terminal API errors reported as placeholder outcomes.
fn static_for_error(error: &ProviderError) -> Option<StaticOutcome> {
    let code = error.api_code()?;
    match code {
        TOO_MANY_ACTIVE | TRAFFIC_EXHAUSTED | FAIR_USAGE_LIMIT => Some(StaticOutcome::LimitsExceeded),
        TORRENT_TOO_BIG => Some(StaticOutcome::FailedTooBig),
        INFRINGING_FILE => Some(StaticOutcome::FailedInfringement),
        _ => None,
    }
}

/// Cached variants of one `instantAvailability` entry whose files are all
/// videos, as sets of 0-based file indexes.
fn playable_variants(entry: &serde_json::Value) -> Vec<HashSet<u32>> {
    let Some(variants) = entry.get("rd").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };
    variants
        .iter()
        .filter_map(serde_json::Value::as_object)
        .filter(|files| {
            files.values().all(|file| {
                file.get("filename")
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(files::is_video)
            })
        })
        .map(|files| {
            files
                .keys()
                .filter_map(|id| id.parse::<u32>().ok())
                .filter_map(|id| id.checked_sub(1))
                .collect::<HashSet<u32>>()
        })
        .filter(|indexes| !indexes.is_empty())
        .collect()
}

/// True when `torrent` can serve `file_index` once ready.
///
/// A torrent whose files were already selected for another episode of the
/// same pack cannot: its links only cover the earlier selection.
fn covers_file(torrent: &RdTorrent, file_index: Option<u32>) -> bool {
    let Some(index) = file_index else {
        return true;
    };
    if matches!(
        torrent_state(&torrent.status),
        TorrentState::Converting | TorrentState::WaitingSelection | TorrentState::Failed
    ) {
        return true;
    }
    !torrent
        .files
        .iter()
        .any(|file| file.id == index + 1 && file.selected != 1)
}

// ==================== Adapter ====================

/// Real-Debrid adapter.
pub struct RealDebrid {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
    conversion_poll: PollSchedule,
}

impl std::fmt::Debug for RealDebrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealDebrid")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl RealDebrid {
    /// Creates the adapter against the production API.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ClientUnavailable`] if the HTTP client cannot be built.
    pub fn new(context: &AdapterContext) -> Result<Self, ProviderError> {
        Self::with_base_url(context, DEFAULT_BASE_URL)
    }

    /// Creates the adapter with a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ClientUnavailable`] if the HTTP client cannot be built.
    pub fn with_base_url(
        context: &AdapterContext,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http: ProviderHttp::new(KEY, base_url, &context.http)?,
            known_cached: context.known_cached.clone(),
            magnets: Arc::clone(&context.magnets),
            conversion_poll: CONVERSION_POLL,
        })
    }

    /// Overrides the magnet conversion poll schedule.
    #[must_use]
    pub fn with_conversion_poll(mut self, schedule: PollSchedule) -> Self {
        self.conversion_poll = schedule;
        self
    }

    fn check(response: ApiResponse) -> Result<ApiResponse, ProviderError> {
        if response.is_success() {
            return Ok(response);
        }
        match serde_json::from_str::<RdErrorEnvelope>(&response.body) {
            Ok(RdErrorEnvelope {
                error_code: Some(code),
                error,
            }) => Err(ProviderError::api(KEY, code.to_string(), error.unwrap_or_default())),
            _ => Err(response.into_status_error(KEY)),
        }
    }

    async fn get(
        &self,
        credential: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse, ProviderError> {
        let url = self.http.endpoint(path, query)?;
        let response = self
            .http
            .execute(|client| client.get(url.clone()).bearer_auth(credential))
            .await?;
        Self::check(response)
    }

    async fn post_form(
        &self,
        credential: &str,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<ApiResponse, ProviderError> {
        let url = self.http.endpoint(path, &[])?;
        let response = self
            .http
            .execute(|client| form_body(client.post(url.clone()).bearer_auth(credential), fields))
            .await?;
        Self::check(response)
    }

    async fn list_torrents(&self, credential: &str) -> Result<Vec<RdTorrent>, ProviderError> {
        let response = self
            .get(credential, "torrents", &[("limit", LIST_LIMIT), ("page", "1")])
            .await?;
        // 204 when the account has no torrents.
        if response.body.trim().is_empty() {
            return Ok(Vec::new());
        }
        response.json(KEY)
    }

    async fn torrent_info(&self, credential: &str, id: &str) -> Result<RdTorrent, ProviderError> {
        self.get(credential, &format!("torrents/info/{id}"), &[])
            .await?
            .json(KEY)
    }

    async fn delete_torrent(&self, credential: &str, id: &str) -> Result<(), ProviderError> {
        let url = self.http.endpoint(&format!("torrents/delete/{id}"), &[])?;
        let response = self
            .http
            .execute(|client| client.delete(url.clone()).bearer_auth(credential))
            .await?;
        Self::check(response).map(|_| ())
    }

    async fn add_magnet(
        &self,
        credential: &str,
        magnet: &str,
        client_ip: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut fields = vec![("magnet", magnet)];
        if let Some(ip) = client_ip {
            fields.push(("ip", ip));
        }
        let added: RdAddMagnet = self
            .post_form(credential, "torrents/addMagnet", &fields)
            .await?
            .json(KEY)?;
        Ok(added.id)
    }

    /// Deletes the oldest torrent that is still in progress. Returns `false`
    /// when there is nothing to free.
    async fn free_active_slot(&self, credential: &str) -> Result<bool, ProviderError> {
        let torrents = self.list_torrents(credential).await?;
        // Listing is newest first.
        let oldest_active = torrents.iter().rev().find(|torrent| {
            matches!(
                torrent_state(&torrent.status),
                TorrentState::Downloading | TorrentState::Converting | TorrentState::WaitingSelection
            )
        });
        match oldest_active {
            Some(torrent) => {
                info!(id = %torrent.id, "freeing active Real-Debrid slot");
                self.delete_torrent(credential, &torrent.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_torrent(&self, request: &ResolutionRequest) -> Result<String, ProviderError> {
        let magnet = self.magnets.magnet_link(&request.info_hash).await;
        let credential = request.credential.as_str();
        let ip = request.client_ip.as_deref();
        match self.add_magnet(credential, &magnet, ip).await {
            Err(error) if error.has_code(&[TOO_MANY_ACTIVE]) => {
                if self.free_active_slot(credential).await? {
                    self.add_magnet(credential, &magnet, ip).await
                } else {
                    Err(error)
                }
            }
            other => other,
        }
    }

    /// Reuses a torrent of the same hash whose selection covers the requested
    /// file, or adds a fresh one.
    async fn find_or_create(&self, request: &ResolutionRequest) -> Result<RdTorrent, ProviderError> {
        let credential = request.credential.as_str();
        let mut matching: Vec<RdTorrent> = self
            .list_torrents(credential)
            .await?
            .into_iter()
            .filter(|torrent| torrent.hash.eq_ignore_ascii_case(&request.info_hash))
            .collect();
        matching.sort_by_key(|torrent| {
            (
                torrent_state(&torrent.status) == TorrentState::Failed,
                std::cmp::Reverse(torrent.links.len()),
            )
        });
        for candidate in matching {
            let torrent = self.torrent_info(credential, &candidate.id).await?;
            if covers_file(&torrent, request.file_index) {
                return Ok(torrent);
            }
            debug!(id = %torrent.id, file_index = ?request.file_index, "existing torrent lacks requested file");
        }
        let id = self.create_torrent(request).await?;
        self.torrent_info(credential, &id).await
    }

    /// Waits for magnet conversion. `None` means the magnet never converted.
    async fn await_conversion(
        &self,
        credential: &str,
        id: &str,
    ) -> Result<Option<RdTorrent>, ProviderError> {
        let outcome = poll_until(self.conversion_poll, move |_| async move {
            let torrent = self.torrent_info(credential, id).await?;
            Ok::<_, ProviderError>(match torrent_state(&torrent.status) {
                TorrentState::Converting => PollOutcome::StillWaiting,
                TorrentState::Failed => PollOutcome::GaveUp,
                _ => PollOutcome::Ready(torrent),
            })
        })
        .await?;
        Ok(match outcome {
            PollOutcome::Ready(torrent) => Some(torrent),
            PollOutcome::StillWaiting | PollOutcome::GaveUp => None,
        })
    }

    async fn select_files(
        &self,
        credential: &str,
        torrent: &RdTorrent,
        file_index: Option<u32>,
    ) -> Result<(), ProviderError> {
        let remote: Vec<RemoteFile> = torrent.files.iter().map(RdFile::remote).collect();
        let chosen = files::files_to_select(&remote, file_index);
        let ids = if chosen.is_empty() {
            "all".to_string()
        } else {
            chosen
                .iter()
                .filter_map(|file| file.index)
                .map(|index| (index + 1).to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        debug!(id = %torrent.id, files = %ids, "selecting Real-Debrid files");
        self.post_form(
            credential,
            &format!("torrents/selectFiles/{}", torrent.id),
            &[("files", ids.as_str())],
        )
        .await
        .map(|_| ())
    }

    async fn unrestrict(
        &self,
        request: &ResolutionRequest,
        torrent: &RdTorrent,
    ) -> Result<ResolveOutcome, ProviderError> {
        if !covers_file(torrent, request.file_index) {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        }
        let selected: Vec<RemoteFile> = torrent
            .files
            .iter()
            .filter(|file| file.selected == 1)
            .map(RdFile::remote)
            .collect();
        let file_name = request.file_name();
        let target = match files::select_target_file(&selected, request.file_index, file_name.as_deref()) {
            FileSelection::Video(file) => file,
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => {
                return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
            }
        };

        // Links follow the selected files in order; a single link means the
        // selection was packed into one archive.
        let link = if torrent.links.len() == 1 {
            torrent.links.first()
        } else {
            selected
                .iter()
                .position(|file| file == target)
                .and_then(|position| torrent.links.get(position))
        };
        let Some(link) = link else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };

        let mut fields = vec![("link", link.as_str())];
        if let Some(ip) = request.client_ip.as_deref() {
            fields.push(("ip", ip));
        }
        let unrestricted: RdUnrestrict = self
            .post_form(&request.credential, "unrestrict/link", &fields)
            .await?
            .json(KEY)?;

        if files::is_archive(&unrestricted.filename) {
            return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar));
        }
        record_unrestricted(
            &self.known_cached,
            KEY,
            &request.info_hash,
            request.file_index,
            &unrestricted.download,
        );
        Ok(ResolveOutcome::Url(unrestricted.download))
    }

    async fn resolve_torrent(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let credential = request.credential.as_str();
        let mut retried = false;
        loop {
            let mut torrent = self.find_or_create(request).await?;

            if torrent_state(&torrent.status) == TorrentState::Converting {
                match self.await_conversion(credential, &torrent.id).await? {
                    Some(converted) => torrent = converted,
                    None => return Ok(ResolveOutcome::Static(StaticOutcome::FailedOpening)),
                }
            }

            if torrent_state(&torrent.status) == TorrentState::WaitingSelection {
                self.select_files(credential, &torrent, request.file_index).await?;
                torrent = self.torrent_info(credential, &torrent.id).await?;
            }

            match torrent_state(&torrent.status) {
                TorrentState::Ready => return self.unrestrict(request, &torrent).await,
                TorrentState::Failed if !retried => {
                    warn!(id = %torrent.id, status = %torrent.status, "Real-Debrid torrent failed; retrying once");
                    self.delete_torrent(credential, &torrent.id).await?;
                    retried = true;
                }
                TorrentState::Failed => return Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload)),
                TorrentState::Converting | TorrentState::WaitingSelection | TorrentState::Downloading => {
                    return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
                }
            }
        }
    }

    async fn instant_availability(
        &self,
        credential: &str,
        hashes: Vec<String>,
    ) -> Result<CachedStreams, ProviderError> {
        let path = format!("torrents/instantAvailability/{}", hashes.join("/"));
        let body: serde_json::Value = self.get(credential, &path, &[]).await?.json(KEY)?;
        // An empty result comes back as `[]`.
        let Some(entries) = body.as_object() else {
            return Ok(CachedStreams::default());
        };
        let mut cached = CachedStreams::default();
        for (hash, entry) in entries {
            for variant in playable_variants(entry) {
                cached.insert_variant(hash, variant);
            }
        }
        Ok(cached)
    }
}

#[async_trait]
impl DebridProvider for RealDebrid {
    fn key(&self) -> ProviderKey {
        KEY
    }

    #[instrument(skip(self, streams, credential, _client_ip), fields(streams = streams.len()))]
    async fn check_availability(
        &self,
        streams: &[StreamCandidate],
        credential: &str,
        _client_ip: Option<&str>,
    ) -> Result<Option<AvailabilityMap>, ProviderError> {
        check_in_batches(
            KEY,
            &self.known_cached,
            streams,
            credential,
            AVAILABILITY_BATCH,
            |error| self.classify_error(error),
            |batch| self.instant_availability(credential, batch),
        )
        .await
    }

    #[instrument(skip(self, credential))]
    async fn list_cloud_items(
        &self,
        credential: &str,
        offset: u32,
    ) -> Result<Vec<CloudItem>, ProviderError> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .list_torrents(credential)
            .await?
            .into_iter()
            .filter(|torrent| torrent_state(&torrent.status) == TorrentState::Ready)
            .map(|torrent| CloudItem {
                id: torrent.id,
                name: torrent.filename,
                info_hash: Some(torrent.hash.to_lowercase()),
                size: Some(torrent.bytes),
            })
            .collect())
    }

    #[instrument(skip(self, credential, _client_ip))]
    async fn get_item_detail(
        &self,
        item_id: &str,
        credential: &str,
        _client_ip: Option<&str>,
    ) -> Result<CloudItemDetail, ProviderError> {
        let torrent = self.torrent_info(credential, item_id).await?;
        let info_hash = torrent.hash.to_lowercase();
        let files = torrent
            .files
            .iter()
            .filter(|file| file.selected == 1 && files::is_video(&file.path))
            .map(|file| {
                let name = files::base_name(&file.path).to_string();
                let url = deep_link(
                    credential,
                    &info_hash,
                    &urlencoding::encode(&name),
                    Some(file.id.saturating_sub(1)),
                );
                CloudFile {
                    name,
                    size: file.bytes,
                    url,
                }
            })
            .collect();
        Ok(CloudItemDetail {
            id: torrent.id,
            name: torrent.filename,
            info_hash: Some(info_hash),
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        match self.resolve_torrent(request).await {
            Err(error) => match static_for_error(&error) {
                Some(outcome) => {
                    info!(outcome = %outcome, error = %error, "Real-Debrid reported terminal state");
                    Ok(ResolveOutcome::Static(outcome))
                }
                None => Err(error),
            },
            ok => ok,
        }
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(&[BAD_TOKEN]) || error.http_status_code() == Some(401) {
            return Some(CanonicalError::BadToken);
        }
        if error.has_code(&[PERMISSION_DENIED, NOT_PREMIUM]) || error.http_status_code() == Some(403) {
            return Some(CanonicalError::AccessDenied);
        }
        if error.has_code(&[IP_NOT_ALLOWED]) {
            return Some(CanonicalError::AccessBlocked);
        }
        None
    }
}
