//! TorBox adapter.
//!
//! Every TorBox response is wrapped in `{ success, error, detail, data }`.
//! A `success: false` envelope becomes [`ProviderError::Api`] with the
//! `error` field (`BAD_TOKEN`, `ACTIVE_LIMIT`, ...) as the code.
//!
//! Cloud items are addressed as `{type}-{id}` (`torrents-42`). Their file
//! streams carry a `null` info hash and `{type}-{rootId}-{fileId}` in place of
//! the file name, and resolve straight to a download link.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::MagnetBuilder;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::utils::{check_in_batches, pick_existing, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate, form_body,
};

const KEY: ProviderKey = ProviderKey::TorBox;

/// Default TorBox API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.torbox.app/v1";

const AVAILABILITY_BATCH: usize = 150;

const BAD_TOKEN_CODES: &[&str] = &["BAD_TOKEN", "AUTH_ERROR"];
const ACCESS_DENIED_CODES: &[&str] = &["PLAN_RESTRICTED_FEATURE"];
const LIMIT_CODES: &[&str] = &["MONTHLY_LIMIT", "COOLDOWN_LIMIT", "ACTIVE_LIMIT"];
const ACTIVE_LIMIT: &str = "ACTIVE_LIMIT";
const TOO_LARGE: &str = "DOWNLOAD_TOO_LARGE";

const DOWNLOADING_STATES: &[&str] = &[
    "metaDL",
    "downloading",
    "stalled (no seeds)",
    "processing",
    "checking",
    "completed",
];
const SEEDING_STATES: &[&str] = &["seeding", "uploading (no peers)"];

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct TbEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TbItem {
    pub id: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub download_state: String,
    #[serde(default)]
    pub download_finished: bool,
    #[serde(default)]
    pub download_present: bool,
    #[serde(default)]
    pub files: Vec<TbFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TbFile {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub zipped: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TbCreated {
    #[serde(default)]
    pub torrent_id: Option<u64>,
    #[serde(default)]
    pub queued_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TbCached {
    pub hash: String,
}

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    torrent_id: u64,
    operation: &'a str,
}

// ==================== Status Mapping ====================

impl TbItem {
    fn is_ready(&self) -> bool {
        self.download_present
    }

    fn is_downloading(&self) -> bool {
        DOWNLOADING_STATES.contains(&self.download_state.as_str())
    }

    fn is_error(&self) -> bool {
        (!self.active && !self.download_finished) || self.download_state == "error"
    }

    fn is_seeding(&self) -> bool {
        SEEDING_STATES.contains(&self.download_state.as_str())
    }

    fn queued() -> Self {
        Self {
            download_state: "metaDL".to_string(),
            active: true,
            ..Self::default()
        }
    }
}

/// Kind of TorBox cloud item: the path segment of its API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemType {
    Torrents,
    Usenet,
    WebDl,
}

impl ItemType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "torrents" => Some(Self::Torrents),
            "usenet" => Some(Self::Usenet),
            "webdl" => Some(Self::WebDl),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Torrents => "torrents",
            Self::Usenet => "usenet",
            Self::WebDl => "webdl",
        }
    }

    fn id_param(self) -> &'static str {
        match self {
            Self::Torrents => "torrent_id",
            Self::Usenet => "usenet_id",
            Self::WebDl => "web_id",
        }
    }
}

/// Parses `{type}-{rootId}-{fileId}` (or `{type}-{rootId}` without a file).
fn parse_item_ref(value: &str) -> Option<(ItemType, &str, Option<&str>)> {
    let mut parts = value.splitn(3, '-');
    let kind = ItemType::parse(parts.next()?)?;
    let root = parts.next().filter(|id| !id.is_empty())?;
    Some((kind, root, parts.next()))
}

fn static_for_error(error: &ProviderError) -> Option<StaticOutcome> {
    if error.has_code(LIMIT_CODES) {
        Some(StaticOutcome::LimitsExceeded)
    } else if error.has_code(&[TOO_LARGE]) {
        Some(StaticOutcome::FailedTooBig)
    } else {
        None
    }
}

// ==================== Adapter ====================

/// TorBox adapter.
pub struct TorBox {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
}

impl std::fmt::Debug for TorBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorBox")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl TorBox {
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
        })
    }

    /// Unwraps the `{ success, error, detail, data }` envelope.
    fn unwrap_envelope<T: DeserializeOwned>(response: ApiResponse) -> Result<Option<T>, ProviderError> {
        match serde_json::from_str::<TbEnvelope<T>>(&response.body) {
            Ok(envelope) if envelope.success => Ok(envelope.data),
            Ok(envelope) => Err(ProviderError::api(
                KEY,
                envelope.error.unwrap_or_else(|| "UNKNOWN_ERROR".to_string()),
                envelope.detail.unwrap_or_default(),
            )),
            Err(_) if !response.is_success() => Err(response.into_status_error(KEY)),
            Err(error) => Err(ProviderError::unexpected(KEY, format!("envelope did not decode: {error}"))),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        credential: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, ProviderError> {
        let url = self.http.endpoint(path, query)?;
        let response = self
            .http
            .execute(|client| client.get(url.clone()).bearer_auth(credential))
            .await?;
        Self::unwrap_envelope(response)
    }

    async fn list_items(
        &self,
        credential: &str,
        kind: ItemType,
        offset: u32,
    ) -> Result<Vec<TbItem>, ProviderError> {
        let offset = offset.to_string();
        let mut items: Vec<TbItem> = self
            .get(credential, &format!("api/{}/mylist", kind.as_str()), &[("offset", offset.as_str())])
            .await?
            .unwrap_or_default();
        items.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(items)
    }

    async fn item(&self, credential: &str, kind: ItemType, id: &str) -> Result<TbItem, ProviderError> {
        self.get(credential, &format!("api/{}/mylist", kind.as_str()), &[("id", id)])
            .await?
            .ok_or_else(|| ProviderError::unexpected(KEY, format!("no {} item {id}", kind.as_str())))
    }

    async fn control_torrent(&self, credential: &str, torrent_id: u64, operation: &str) -> Result<(), ProviderError> {
        let url = self.http.endpoint("api/torrents/controltorrent", &[])?;
        let body = ControlRequest {
            torrent_id,
            operation,
        };
        let response = self
            .http
            .execute(|client| client.post(url.clone()).bearer_auth(credential).json(&body))
            .await?;
        Self::unwrap_envelope::<serde_json::Value>(response).map(|_| ())
    }

    async fn submit_magnet(&self, credential: &str, magnet: &str) -> Result<TbCreated, ProviderError> {
        let url = self.http.endpoint("api/torrents/createtorrent", &[])?;
        let fields = [("magnet", magnet), ("allow_zip", "false")];
        let response = self
            .http
            .execute(|client| form_body(client.post(url.clone()).bearer_auth(credential), &fields))
            .await?;
        Self::unwrap_envelope(response)?
            .ok_or_else(|| ProviderError::unexpected(KEY, "createtorrent returned no data"))
    }

    /// Stops seeding the oldest seeding torrent, else deletes the oldest downloading one.
    async fn free_last_active(&self, credential: &str) -> Result<(), ProviderError> {
        let torrents = self.list_items(credential, ItemType::Torrents, 0).await?;
        if let Some(seeding) = torrents.iter().rev().find(|torrent| torrent.is_seeding()) {
            info!(id = seeding.id, "stopping seeding to free a TorBox slot");
            return self.control_torrent(credential, seeding.id, "stop_seeding").await;
        }
        if let Some(downloading) = torrents.iter().rev().find(|torrent| torrent.is_downloading()) {
            info!(id = downloading.id, "deleting download to free a TorBox slot");
            return self.control_torrent(credential, downloading.id, "delete").await;
        }
        Err(ProviderError::api(KEY, ACTIVE_LIMIT, "no active torrent to free"))
    }

    async fn create_torrent(&self, credential: &str, info_hash: &str) -> Result<TbItem, ProviderError> {
        let magnet = self.magnets.magnet_link(info_hash).await;
        let created = match self.submit_magnet(credential, &magnet).await {
            Err(error) if error.has_code(&[ACTIVE_LIMIT]) => {
                self.free_last_active(credential).await?;
                self.submit_magnet(credential, &magnet).await?
            }
            other => other?,
        };
        match (created.torrent_id, created.queued_id) {
            (Some(id), _) => self.item(credential, ItemType::Torrents, &id.to_string()).await,
            (None, Some(_)) => Ok(TbItem::queued()),
            (None, None) => Err(ProviderError::unexpected(KEY, "createtorrent returned neither torrent nor queue id")),
        }
    }

    async fn find_or_create(&self, credential: &str, info_hash: &str) -> Result<TbItem, ProviderError> {
        let found: Vec<TbItem> = self
            .list_items(credential, ItemType::Torrents, 0)
            .await?
            .into_iter()
            .filter(|torrent| {
                torrent
                    .hash
                    .as_deref()
                    .is_some_and(|hash| hash.eq_ignore_ascii_case(info_hash))
            })
            .collect();
        match pick_existing(found, TbItem::is_error, |torrent| torrent.files.len()) {
            Some(torrent) => Ok(torrent),
            None => self.create_torrent(credential, info_hash).await,
        }
    }

    async fn request_download(
        &self,
        credential: &str,
        kind: ItemType,
        root_id: &str,
        file_id: &str,
        client_ip: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut query = vec![
            ("token", credential),
            (kind.id_param(), root_id),
            ("file_id", file_id),
        ];
        if let Some(ip) = client_ip {
            query.push(("user_ip", ip));
        }
        let url = self
            .http
            .endpoint(&format!("api/{}/requestdl", kind.as_str()), &query)?;
        let response = self.http.execute(|client| client.get(url.clone())).await?;
        Self::unwrap_envelope::<String>(response)?
            .ok_or_else(|| ProviderError::unexpected(KEY, "requestdl returned no link"))
    }

    async fn unrestrict(&self, request: &ResolutionRequest, torrent: &TbItem) -> Result<ResolveOutcome, ProviderError> {
        // TorBox file ids are not torrent indexes; files are matched by name.
        let remote: Vec<RemoteFile> = torrent
            .files
            .iter()
            .zip(0_u32..)
            .map(|(file, position)| RemoteFile::new(Some(position), file.short_name.clone(), file.size))
            .collect();
        let file_name = request.file_name();
        let target = match files::select_target_file(&remote, None, file_name.as_deref()) {
            FileSelection::Video(file) => file
                .index
                .and_then(|position| torrent.files.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => None,
        };
        let Some(target) = target else {
            if !torrent.files.is_empty() && torrent.files.iter().all(|file| file.zipped) {
                return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar));
            }
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };

        let url = self
            .request_download(
                &request.credential,
                ItemType::Torrents,
                &torrent.id.to_string(),
                &target.id.to_string(),
                request.client_ip.as_deref(),
            )
            .await?;
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &url);
        Ok(ResolveOutcome::Url(url))
    }

    async fn resolve_cloud_file(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let reference = urlencoding::decode(&request.file_name_hint)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| request.file_name_hint.clone());
        let Some((kind, root_id, Some(file_id))) = parse_item_ref(&reference) else {
            return Err(ProviderError::unexpected(KEY, format!("invalid cloud file reference '{reference}'")));
        };
        let url = self
            .request_download(&request.credential, kind, root_id, file_id, request.client_ip.as_deref())
            .await?;
        info!(kind = kind.as_str(), root_id, "unrestricted TorBox cloud file");
        Ok(ResolveOutcome::Url(url))
    }

    async fn resolve_torrent(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        if request.info_hash == "null" {
            return self.resolve_cloud_file(request).await;
        }
        let credential = request.credential.as_str();
        let torrent = self.find_or_create(credential, &request.info_hash).await?;
        if torrent.is_ready() {
            return self.unrestrict(request, &torrent).await;
        }
        if torrent.is_downloading() {
            return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
        }
        if torrent.is_error() {
            warn!(id = torrent.id, state = %torrent.download_state, "TorBox torrent failed; retrying once");
            self.control_torrent(credential, torrent.id, "delete").await?;
            let retried = self.create_torrent(credential, &request.info_hash).await?;
            return if retried.is_ready() {
                self.unrestrict(request, &retried).await
            } else {
                Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload))
            };
        }
        Err(ProviderError::torrent_failed(
            KEY,
            &request.info_hash,
            format!("unexpected download state '{}'", torrent.download_state),
        ))
    }

    async fn cached_hashes(&self, credential: &str, hashes: Vec<String>) -> Result<HashSet<String>, ProviderError> {
        let joined = hashes.join(",");
        let cached: Vec<TbCached> = self
            .get(
                credential,
                "api/torrents/checkcached",
                &[("hash", joined.as_str()), ("format", "list")],
            )
            .await?
            .unwrap_or_default();
        Ok(cached.into_iter().map(|entry| entry.hash.to_lowercase()).collect())
    }
}

#[async_trait]
impl DebridProvider for TorBox {
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
        Ok(self
            .list_items(credential, ItemType::Torrents, offset)
            .await?
            .into_iter()
            .filter(TbItem::is_ready)
            .map(|item| CloudItem {
                id: format!("{}-{}", ItemType::Torrents.as_str(), item.id),
                name: item.name,
                info_hash: item.hash.map(|hash| hash.to_lowercase()),
                size: Some(item.size),
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
        let Some((kind, root_id, _)) = parse_item_ref(item_id) else {
            return Err(ProviderError::unexpected(KEY, format!("invalid item id '{item_id}'")));
        };
        let item = self.item(credential, kind, root_id).await?;
        let files = item
            .files
            .iter()
            .filter(|file| files::is_video(&file.short_name))
            .map(|file| CloudFile {
                name: file.name.clone(),
                size: file.size,
                url: format!("{credential}/null/{item_id}-{}/null", file.id),
            })
            .collect();
        Ok(CloudItemDetail {
            id: item_id.to_string(),
            name: item.name,
            info_hash: item.hash.map(|hash| hash.to_lowercase()),
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        match self.resolve_torrent(request).await {
            Err(error) => match static_for_error(&error) {
                Some(outcome) => {
                    info!(outcome = %outcome, error = %error, "TorBox reported terminal state");
                    Ok(ResolveOutcome::Static(outcome))
                }
                None => Err(error),
            },
            ok => ok,
        }
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(BAD_TOKEN_CODES) || error.http_status_code() == Some(401) {
            Some(CanonicalError::BadToken)
        } else if error.has_code(ACCESS_DENIED_CODES) || error.http_status_code() == Some(403) {
            Some(CanonicalError::AccessDenied)
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
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn ok(data: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "success": true, "data": data }))
    }

    fn failure(code: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error": code,
            "detail": "rejected",
            "data": null,
        }))
    }

    fn torrent(id: u64, hash: &str, present: bool, state: &str, files: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "hash": hash,
            "name": "Show.S01",
            "size": 2_000_000_000_u64,
            "active": true,
            "download_state": state,
            "download_finished": present,
            "download_present": present,
            "files": files,
        })
    }

    // ==================== Pure Mapping Tests ====================

    #[test]
    fn test_status_predicates() {
        let item = TbItem {
            active: false,
            download_finished: false,
            ..TbItem::default()
        };
        assert!(item.is_error());
        let seeding = TbItem {
            active: true,
            download_state: "uploading (no peers)".to_string(),
            ..TbItem::default()
        };
        assert!(seeding.is_seeding());
        assert!(!seeding.is_error());
        assert!(TbItem::queued().is_downloading());
    }

    #[test]
    fn test_parse_item_ref() {
        assert_eq!(
            parse_item_ref("torrents-42-7"),
            Some((ItemType::Torrents, "42", Some("7")))
        );
        assert_eq!(parse_item_ref("usenet-9"), Some((ItemType::Usenet, "9", None)));
        assert_eq!(parse_item_ref("bogus-1-2"), None);
        assert_eq!(parse_item_ref("webdl-"), None);
    }

    #[test]
    fn test_error_mapping() {
        let adapter = TorBox::new(&adapter_context()).unwrap();
        let bad = ProviderError::api(KEY, "AUTH_ERROR", "");
        assert_eq!(adapter.classify_error(&bad), Some(CanonicalError::BadToken));
        let plan = ProviderError::api(KEY, "PLAN_RESTRICTED_FEATURE", "");
        assert_eq!(adapter.classify_error(&plan), Some(CanonicalError::AccessDenied));
        assert_eq!(
            static_for_error(&ProviderError::api(KEY, "COOLDOWN_LIMIT", "")),
            Some(StaticOutcome::LimitsExceeded)
        );
        assert_eq!(
            static_for_error(&ProviderError::api(KEY, "DOWNLOAD_TOO_LARGE", "")),
            Some(StaticOutcome::FailedTooBig)
        );
    }

    #[test]
    fn test_envelope_failure_keeps_error_code() {
        let response = ApiResponse {
            status: 403,
            body: r#"{"success":false,"error":"BAD_TOKEN","detail":"invalid","data":null}"#.to_string(),
            retry_after: None,
        };
        let error = TorBox::unwrap_envelope::<serde_json::Value>(response).unwrap_err();
        assert_eq!(error.api_code(), Some("BAD_TOKEN"));
    }

    // ==================== Adapter Tests (wiremock) ====================

    #[tokio::test]
    async fn test_resolve_ready_torrent_requests_video_link() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('a');
        let files = serde_json::json!([
            { "id": 0, "name": "Show/Show.S01E01.rar", "short_name": "Show.S01E01.rar", "size": 950_000_000 },
            { "id": 1, "name": "Show/Show.S01E01.mkv", "short_name": "Show.S01E01.mkv", "size": 900_000_000 },
        ]);
        Mock::given(method("GET"))
            .and(path("/api/torrents/mylist"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ok(serde_json::json!([torrent(5, &hash, true, "cached", files)])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/torrents/requestdl"))
            .and(query_param("token", "tok"))
            .and(query_param("torrent_id", "5"))
            .and(query_param("file_id", "1"))
            .and(query_param("user_ip", "203.0.113.7"))
            .respond_with(ok(serde_json::json!("https://cdn.torbox/Show.S01E01.mkv")))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = TorBox::with_base_url(&adapter_context(), server.uri()).unwrap();
        let outcome = adapter.resolve(&resolution_request(KEY, &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Url("https://cdn.torbox/Show.S01E01.mkv".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_zipped_only_torrent_is_failed_rar() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('b');
        let files = serde_json::json!([
            { "id": 0, "name": "Show.zip", "short_name": "Show.zip", "size": 950_000_000, "zipped": true },
        ]);
        Mock::given(method("GET"))
            .and(path("/api/torrents/mylist"))
            .respond_with(ok(serde_json::json!([torrent(5, &hash, true, "cached", files)])))
            .mount(&server)
            .await;

        let adapter = TorBox::with_base_url(&adapter_context(), server.uri()).unwrap();
        let outcome = adapter.resolve(&resolution_request(KEY, &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Static(StaticOutcome::FailedRar));
    }

    #[tokio::test]
    async fn test_active_limit_frees_seeding_torrent_and_resubmits() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('c');
        let other = info_hash('d');
        Mock::given(method("GET"))
            .and(path("/api/torrents/mylist"))
            .and(query_param("offset", "0"))
            .respond_with(ok(serde_json::json!([torrent(3, &other, true, "seeding", serde_json::json!([]))])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/torrents/createtorrent"))
            .respond_with(failure("ACTIVE_LIMIT"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/torrents/controltorrent"))
            .and(body_string_contains("stop_seeding"))
            .respond_with(ok(serde_json::Value::Null))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/torrents/createtorrent"))
            .and(body_string_contains("allow_zip=false"))
            .respond_with(ok(serde_json::json!({ "queued_id": 77, "hash": hash })))
            .mount(&server)
            .await;

        let adapter = TorBox::with_base_url(&adapter_context(), server.uri()).unwrap();
        let outcome = adapter.resolve(&resolution_request(KEY, &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Static(StaticOutcome::Downloading));
    }

    #[tokio::test]
    async fn test_cloud_file_reference_resolves_directly() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/api/usenet/requestdl"))
            .and(query_param("usenet_id", "12"))
            .and(query_param("file_id", "3"))
            .respond_with(ok(serde_json::json!("https://cdn.torbox/usenet.mkv")))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = TorBox::with_base_url(&adapter_context(), server.uri()).unwrap();
        let mut request = resolution_request(KEY, "null", None);
        request.file_name_hint = "usenet-12-3".to_string();
        let outcome = adapter.resolve(&request).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Url("https://cdn.torbox/usenet.mkv".to_string()));
    }

    #[tokio::test]
    async fn test_check_availability_batches_and_propagates_bad_token() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/api/torrents/checkcached"))
            .respond_with(failure("BAD_TOKEN"))
            .mount(&server)
            .await;

        let adapter = TorBox::with_base_url(&adapter_context(), server.uri()).unwrap();
        let streams = vec![StreamCandidate {
            info_hash: info_hash('e'),
            file_index: None,
            title: "Movie.mkv".to_string(),
            size: None,
            seeders: None,
        }];
        let error = adapter.check_availability(&streams, "tok", None).await.unwrap_err();
        assert_eq!(adapter.classify_error(&error), Some(CanonicalError::BadToken));
    }

    #[tokio::test]
    async fn test_item_detail_lists_video_streams() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let files = serde_json::json!([
            { "id": 4, "name": "Movie/Movie.mkv", "short_name": "Movie.mkv", "size": 10 },
            { "id": 5, "name": "Movie/readme.txt", "short_name": "readme.txt", "size": 1 },
        ]);
        Mock::given(method("GET"))
            .and(path("/api/torrents/mylist"))
            .and(query_param("id", "8"))
            .respond_with(ok(torrent(8, &info_hash('f'), true, "cached", files)))
            .mount(&server)
            .await;

        let adapter = TorBox::with_base_url(&adapter_context(), server.uri()).unwrap();
        let detail = adapter.get_item_detail("torrents-8", "tok", None).await.unwrap();
        assert_eq!(detail.files.len(), 1);
        assert_eq!(detail.files[0].url, "tok/null/torrents-8-4/null");
    }
}
