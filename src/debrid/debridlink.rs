//! Debrid-Link adapter (API v2, seedbox endpoints).
//!
//! Bearer authentication. Responses are `{ success, value }` on success and
//! `{ success: false, error }` otherwise, where `error` is a camelCase code
//! such as `badToken` or `maxTorrent`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::MagnetBuilder;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::http_client::form_body;
use super::poll::{PollOutcome, PollSchedule, poll_until};
use super::utils::{check_in_batches, pick_existing, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate,
};

const KEY: ProviderKey = ProviderKey::DebridLink;

/// Default Debrid-Link API base URL.
pub const DEFAULT_BASE_URL: &str = "https://debrid-link.com/api/v2";

const AVAILABILITY_BATCH: usize = 50;

/// Poll schedule while a torrent has no connected peers yet.
const OPENING_POLL: PollSchedule = PollSchedule::new(Duration::from_secs(2), 15);

const BAD_TOKEN_CODES: &[&str] = &["badToken", "hidedToken", "expired_token"];
const ACCESS_DENIED_CODES: &[&str] = &[
    "freeServerOverload",
    "maxTorrent",
    "maxLink",
    "maxLinkHost",
    "maxData",
    "maxDataHost",
    "notDebrid",
];
const ACCESS_BLOCKED_CODES: &[&str] = &["serverNotAllowed", "floodDetected"];

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct DlEnvelope<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DlTorrent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash_string: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub peers_connected: u32,
    #[serde(default)]
    pub download_percent: f64,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub files: Vec<DlFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DlFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl DlTorrent {
    fn is_ready(&self) -> bool {
        self.download_percent >= 100.0
    }

    /// Downloading but without any peer yet.
    fn is_opening(&self) -> bool {
        self.status == 2 && self.peers_connected == 0
    }

    fn is_downloading(&self) -> bool {
        matches!(self.status, 0..=4)
    }

    fn is_error(&self) -> bool {
        self.error != 0 || !(self.is_ready() || self.is_downloading())
    }

    fn remote_files(&self) -> Vec<RemoteFile> {
        self.files
            .iter()
            .zip(0_u32..)
            .map(|(file, position)| RemoteFile::new(Some(position), file.name.clone(), file.size))
            .collect()
    }
}

// ==================== Adapter ====================

/// Debrid-Link adapter.
pub struct DebridLink {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
    opening_poll: PollSchedule,
}

impl std::fmt::Debug for DebridLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebridLink")
            .field("http", &self.http)
            .field("opening_poll", &self.opening_poll)
            .finish_non_exhaustive()
    }
}

impl DebridLink {
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
            opening_poll: OPENING_POLL,
        })
    }

    /// Overrides the poll schedule used while a torrent is opening.
    #[must_use]
    pub fn with_opening_poll(mut self, schedule: PollSchedule) -> Self {
        self.opening_poll = schedule;
        self
    }

    fn unwrap_envelope<T: DeserializeOwned>(response: ApiResponse) -> Result<T, ProviderError> {
        match serde_json::from_str::<DlEnvelope<T>>(&response.body) {
            Ok(DlEnvelope {
                success: true,
                value: Some(value),
                ..
            }) => Ok(value),
            Ok(DlEnvelope {
                error: Some(code),
                error_description,
                ..
            }) => Err(ProviderError::api(KEY, code, error_description.unwrap_or_default())),
            Ok(_) => Err(ProviderError::unexpected(KEY, "envelope carried neither value nor error")),
            Err(_) if !response.is_success() => Err(response.into_status_error(KEY)),
            Err(error) => Err(ProviderError::unexpected(KEY, format!("envelope did not decode: {error}"))),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        credential: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, params)?;
        let response = self
            .http
            .execute(|client| client.get(url.clone()).bearer_auth(credential))
            .await?;
        Self::unwrap_envelope(response)
    }

    async fn list(&self, credential: &str, ids: Option<&str>) -> Result<Vec<DlTorrent>, ProviderError> {
        match ids {
            Some(ids) => self.get(credential, "seedbox/list", &[("ids", ids)]).await,
            None => self.get(credential, "seedbox/list", &[]).await,
        }
    }

    async fn torrent(&self, credential: &str, id: &str) -> Result<DlTorrent, ProviderError> {
        self.list(credential, Some(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::unexpected(KEY, format!("torrent {id} not listed")))
    }

    async fn add(&self, credential: &str, info_hash: &str) -> Result<DlTorrent, ProviderError> {
        let magnet = self.magnets.magnet_link(info_hash).await;
        let url = self.http.endpoint("seedbox/add", &[])?;
        let fields = [("url", magnet.as_str()), ("async", "true")];
        let response = self
            .http
            .execute(|client| form_body(client.post(url.clone()).bearer_auth(credential), &fields))
            .await?;
        Self::unwrap_envelope(response)
    }

    async fn remove(&self, credential: &str, id: &str) -> Result<(), ProviderError> {
        let url = self.http.endpoint(&format!("seedbox/{id}/remove"), &[])?;
        let response = self
            .http
            .execute(|client| client.delete(url.clone()).bearer_auth(credential))
            .await?;
        Self::unwrap_envelope::<serde_json::Value>(response).map(|_| ())
    }

    async fn find_or_add(&self, credential: &str, info_hash: &str) -> Result<DlTorrent, ProviderError> {
        let found: Vec<DlTorrent> = self
            .list(credential, None)
            .await?
            .into_iter()
            .filter(|torrent| torrent.hash_string.eq_ignore_ascii_case(info_hash))
            .collect();
        match pick_existing(found, DlTorrent::is_error, |torrent| torrent.files.len()) {
            Some(torrent) => Ok(torrent),
            None => self.add(credential, info_hash).await,
        }
    }

    /// Waits for the torrent to connect to peers.
    async fn await_opening(&self, credential: &str, id: &str) -> Result<bool, ProviderError> {
        let outcome = poll_until(self.opening_poll, move |_| async move {
            let torrent = self.torrent(credential, id).await?;
            Ok::<_, ProviderError>(if torrent.is_opening() {
                PollOutcome::StillWaiting
            } else if torrent.is_error() {
                PollOutcome::GaveUp
            } else {
                PollOutcome::Ready(())
            })
        })
        .await?;
        Ok(matches!(outcome, PollOutcome::Ready(())))
    }

    fn unrestrict(&self, request: &ResolutionRequest, torrent: &DlTorrent) -> Result<ResolveOutcome, ProviderError> {
        let remote = torrent.remote_files();
        let file_name = request.file_name();
        let file = match files::select_target_file(&remote, request.file_index, file_name.as_deref()) {
            FileSelection::Video(file) => file.index.and_then(|position| torrent.files.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => None,
        };
        let Some(url) = file.and_then(|file| file.download_url.clone()) else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &url);
        Ok(ResolveOutcome::Url(url))
    }

    async fn settle(&self, request: &ResolutionRequest, torrent: &DlTorrent) -> Result<Option<ResolveOutcome>, ProviderError> {
        if torrent.is_ready() {
            return self.unrestrict(request, torrent).map(Some);
        }
        if torrent.is_opening() {
            debug!(id = %torrent.id, "Debrid-Link torrent has no peers yet");
            let opened = self.await_opening(&request.credential, &torrent.id).await?;
            let outcome = if opened {
                StaticOutcome::Downloading
            } else {
                StaticOutcome::FailedOpening
            };
            return Ok(Some(ResolveOutcome::Static(outcome)));
        }
        if torrent.is_downloading() && !torrent.is_error() {
            return Ok(Some(ResolveOutcome::Static(StaticOutcome::Downloading)));
        }
        Ok(None)
    }

    async fn resolve_torrent(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let credential = request.credential.as_str();
        let torrent = self.find_or_add(credential, &request.info_hash).await?;
        if let Some(outcome) = self.settle(request, &torrent).await? {
            return Ok(outcome);
        }

        warn!(id = %torrent.id, status = torrent.status, "Debrid-Link torrent failed; retrying once");
        self.remove(credential, &torrent.id).await?;
        let retried = self.add(credential, &request.info_hash).await?;
        match self.settle(request, &retried).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload)),
        }
    }

    async fn cached_hashes(&self, credential: &str, hashes: Vec<String>) -> Result<HashSet<String>, ProviderError> {
        let joined = hashes.join(",");
        let value: serde_json::Value = self
            .get(credential, "seedbox/cached", &[("url", joined.as_str())])
            .await?;
        Ok(value
            .as_object()
            .map(|cached| cached.keys().map(|hash| hash.to_lowercase()).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DebridProvider for DebridLink {
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
            |batch| self.cached_hashes(credential, batch),
        )
        .await
    }

    #[instrument(skip(self, credential))]
    async fn list_cloud_items(&self, credential: &str, offset: u32) -> Result<Vec<CloudItem>, ProviderError> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .list(credential, None)
            .await?
            .into_iter()
            .filter(DlTorrent::is_ready)
            .map(|torrent| CloudItem {
                id: torrent.id,
                name: torrent.name,
                info_hash: Some(torrent.hash_string.to_lowercase()),
                size: Some(torrent.total_size),
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
        let torrent = self.torrent(credential, item_id).await?;
        let files = torrent
            .files
            .iter()
            .filter(|file| files::is_video(&file.name))
            .filter_map(|file| {
                file.download_url.as_ref().map(|url| CloudFile {
                    name: file.name.clone(),
                    size: file.size,
                    url: url.clone(),
                })
            })
            .collect();
        Ok(CloudItemDetail {
            id: torrent.id,
            name: torrent.name,
            info_hash: Some(torrent.hash_string.to_lowercase()),
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.resolve_torrent(request).await.inspect_err(|error| {
            info!(error = %error, "Debrid-Link resolution failed");
        })
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(BAD_TOKEN_CODES) || error.http_status_code() == Some(401) {
            Some(CanonicalError::BadToken)
        } else if error.has_code(ACCESS_DENIED_CODES) {
            Some(CanonicalError::AccessDenied)
        } else if error.has_code(ACCESS_BLOCKED_CODES) {
            Some(CanonicalError::AccessBlocked)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use crate::test_support::{adapter_context, info_hash, resolution_request};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn ok(value: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "success": true, "value": value }))
    }

    fn torrent(status: i32, peers: u32, percent: f64) -> DlTorrent {
        DlTorrent {
            id: "t".to_string(),
            status,
            peers_connected: peers,
            download_percent: percent,
            ..DlTorrent::default()
        }
    }

    #[test]
    fn test_states() {
        assert!(torrent(2, 0, 0.0).is_opening());
        assert!(!torrent(2, 3, 10.0).is_opening());
        assert!(torrent(4, 3, 10.0).is_downloading());
        assert!(torrent(6, 0, 100.0).is_ready());
        assert!(torrent(9, 0, 0.0).is_error());
    }

    #[test]
    fn test_error_codes_are_classified() {
        let adapter = DebridLink::new(&adapter_context()).unwrap();
        let response = ApiResponse {
            status: 401,
            body: r#"{"success":false,"error":"badToken"}"#.to_string(),
            retry_after: None,
        };
        let error = DebridLink::unwrap_envelope::<serde_json::Value>(response).unwrap_err();
        assert_eq!(adapter.classify_error(&error), Some(CanonicalError::BadToken));
        let limit = ProviderError::api(KEY, "maxData", "");
        assert_eq!(adapter.classify_error(&limit), Some(CanonicalError::AccessDenied));
    }

    #[tokio::test]
    async fn test_resolve_ready_torrent_returns_file_url() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('a');
        Mock::given(method("GET"))
            .and(path("/seedbox/list"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ok(serde_json::json!([{
                "id": "dl1",
                "name": "Movie",
                "hashString": hash.to_uppercase(),
                "status": 6,
                "downloadPercent": 100,
                "files": [
                    { "name": "Movie.rar", "size": 900, "downloadUrl": "https://dl/rar" },
                    { "name": "Movie.mkv", "size": 800, "downloadUrl": "https://dl/mkv" },
                ],
            }])))
            .mount(&server)
            .await;

        let adapter = DebridLink::with_base_url(&adapter_context(), server.uri()).unwrap();
        let outcome = adapter.resolve(&resolution_request(KEY, &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Url("https://dl/mkv".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_stuck_opening_reports_failed_opening() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('b');
        Mock::given(method("GET"))
            .and(path("/seedbox/list"))
            .and(query_param("ids", "dl2"))
            .respond_with(ok(serde_json::json!([{ "id": "dl2", "hashString": hash, "status": 2, "peersConnected": 0 }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/seedbox/list"))
            .respond_with(ok(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/seedbox/add"))
            .respond_with(ok(serde_json::json!({ "id": "dl2", "hashString": hash, "status": 2, "peersConnected": 0 })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = DebridLink::with_base_url(&adapter_context(), server.uri())
            .unwrap()
            .with_opening_poll(PollSchedule::new(Duration::from_millis(1), 2));
        let outcome = adapter.resolve(&resolution_request(KEY, &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Static(StaticOutcome::FailedOpening));
    }

    #[tokio::test]
    async fn test_availability_reads_cached_keys() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let cached = info_hash('c');
        let missing = info_hash('d');
        Mock::given(method("GET"))
            .and(path("/seedbox/cached"))
            .and(query_param("url", format!("{cached},{missing}").as_str()))
            .respond_with(ok(serde_json::Value::Object(
                [(cached.clone(), serde_json::json!({ "name": "Movie" }))]
                    .into_iter()
                    .collect(),
            )))
            .mount(&server)
            .await;

        let streams: Vec<StreamCandidate> = [&cached, &missing]
            .into_iter()
            .map(|hash| StreamCandidate {
                info_hash: hash.clone(),
                file_index: Some(0),
                title: "Movie.mkv".to_string(),
                size: None,
                seeders: None,
            })
            .collect();
        let adapter = DebridLink::with_base_url(&adapter_context(), server.uri()).unwrap();
        let map = adapter
            .check_availability(&streams, "tok", None)
            .await
            .unwrap()
            .unwrap();
        assert!(map[&streams[0].key()].cached);
        assert!(!map[&streams[1].key()].cached);
    }
}
