//! Offcloud adapter.
//!
//! Authenticated with a `key` query parameter. Failures come back as a JSON
//! object carrying `error` (e.g. `NOAUTH`) or `not_available`.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::MagnetBuilder;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::utils::{check_in_batches, pick_existing, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate,
};

const KEY: ProviderKey = ProviderKey::Offcloud;

/// Default Offcloud API base URL.
pub const DEFAULT_BASE_URL: &str = "https://offcloud.com/api";

const AVAILABILITY_BATCH: usize = 100;

const NOAUTH: &str = "NOAUTH";
const NOT_AVAILABLE: &str = "not_available";
const BAD_ARCHIVE: &str = "Bad archive";

#[allow(clippy::expect_used)]
static BTIH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)btih:([0-9a-f]{40})").expect("btih regex is valid") // Static pattern, safe to panic
});

// ==================== Request/Response Types ====================

#[derive(Debug, Serialize)]
struct OcCacheRequest<'a> {
    hashes: &'a [String],
}

#[derive(Debug, Serialize)]
struct OcDownloadRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OcStatusRequest<'a> {
    request_ids: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OcCacheResponse {
    #[serde(default)]
    pub cached_items: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OcRequest {
    pub request_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub original_link: String,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OcStatusResponse {
    #[serde(default)]
    pub requests: Vec<OcRequest>,
}

impl OcRequest {
    fn is_downloading(&self) -> bool {
        matches!(self.status.as_str(), "downloading" | "created")
    }

    fn is_error(&self) -> bool {
        matches!(self.status.as_str(), "error" | "canceled")
    }

    fn is_ready(&self) -> bool {
        self.status == "downloaded"
    }

    fn info_hash(&self) -> Option<String> {
        BTIH.captures(&self.original_link)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_lowercase())
    }

    /// Whole-request download URL, used when the item cannot be explored.
    fn download_url(&self) -> Option<String> {
        self.server.as_ref().map(|server| {
            format!(
                "https://{server}.offcloud.com/cloud/download/{}/{}",
                self.request_id,
                urlencoding::encode(&self.file_name)
            )
        })
    }
}

fn error_from_body(body: &serde_json::Value) -> Option<ProviderError> {
    let object = body.as_object()?;
    if let Some(error) = object.get("error").and_then(serde_json::Value::as_str) {
        return Some(ProviderError::api(KEY, error, error));
    }
    object.get(NOT_AVAILABLE).map(|detail| {
        let message = detail.as_str().map_or_else(|| detail.to_string(), str::to_string);
        ProviderError::api(KEY, NOT_AVAILABLE, message)
    })
}

// ==================== Adapter ====================

/// Offcloud adapter.
pub struct Offcloud {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
}

impl std::fmt::Debug for Offcloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offcloud")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl Offcloud {
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

    fn decode<T: DeserializeOwned>(response: ApiResponse) -> Result<T, ProviderError> {
        let value: serde_json::Value = match serde_json::from_str(&response.body) {
            Ok(value) => value,
            Err(_) if !response.is_success() => return Err(response.into_status_error(KEY)),
            Err(error) => {
                return Err(ProviderError::unexpected(KEY, format!("body did not decode: {error}")));
            }
        };
        if let Some(error) = error_from_body(&value) {
            return Err(error);
        }
        if !response.is_success() {
            return Err(response.into_status_error(KEY));
        }
        serde_json::from_value(value)
            .map_err(|error| ProviderError::unexpected(KEY, format!("body did not match: {error}")))
    }

    async fn get<T: DeserializeOwned>(&self, credential: &str, path: &str) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, &[("key", credential)])?;
        let response = self.http.execute(|client| client.get(url.clone())).await?;
        Self::decode(response)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        credential: &str,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, &[("key", credential)])?;
        let response = self
            .http
            .execute(|client| client.post(url.clone()).json(body))
            .await?;
        Self::decode(response)
    }

    async fn history(&self, credential: &str) -> Result<Vec<OcRequest>, ProviderError> {
        self.get(credential, "cloud/history").await
    }

    async fn status(&self, credential: &str, request_id: &str) -> Result<OcRequest, ProviderError> {
        let body = OcStatusRequest {
            request_ids: [request_id],
        };
        let response: OcStatusResponse = self.post(credential, "cloud/status", &body).await?;
        response
            .requests
            .into_iter()
            .find(|request| request.request_id == request_id)
            .ok_or_else(|| ProviderError::unexpected(KEY, format!("no status for request {request_id}")))
    }

    async fn create(&self, credential: &str, info_hash: &str) -> Result<OcRequest, ProviderError> {
        let magnet = self.magnets.magnet_link(info_hash).await;
        self.post(credential, "cloud", &OcDownloadRequest { url: &magnet }).await
    }

    async fn find_or_create(&self, credential: &str, info_hash: &str) -> Result<OcRequest, ProviderError> {
        let needle = info_hash.to_lowercase();
        let found: Vec<OcRequest> = self
            .history(credential)
            .await?
            .into_iter()
            .filter(|request| request.original_link.to_lowercase().contains(&needle))
            .collect();
        match pick_existing(found, OcRequest::is_error, |request| usize::from(request.is_ready())) {
            Some(existing) => {
                let mut current = self.status(credential, &existing.request_id).await?;
                if current.original_link.is_empty() {
                    current.original_link = existing.original_link;
                }
                if current.server.is_none() {
                    current.server = existing.server;
                }
                Ok(current)
            }
            None => self.create(credential, info_hash).await,
        }
    }

    /// File URLs of a finished request.
    ///
    /// Items Offcloud refuses to explore ("Bad archive") expose a single
    /// whole-request download URL instead.
    async fn file_urls(&self, credential: &str, request: &OcRequest) -> Result<Vec<String>, ProviderError> {
        let path = format!("cloud/explore/{}", request.request_id);
        match self.get::<Vec<String>>(credential, &path).await {
            Err(error) if error.api_message() == Some(BAD_ARCHIVE) => {
                debug!(request_id = %request.request_id, "explore refused; using whole-request URL");
                Ok(request.download_url().into_iter().collect())
            }
            result => result,
        }
    }

    async fn unrestrict(&self, request: &ResolutionRequest, remote: &OcRequest) -> Result<ResolveOutcome, ProviderError> {
        let urls = self.file_urls(&request.credential, remote).await?;
        let listing: Vec<RemoteFile> = urls
            .iter()
            .zip(0_u32..)
            .map(|(url, position)| RemoteFile::new(Some(position), files::base_name(url), 0))
            .collect();
        let file_name = request.file_name();
        let url = match files::select_target_file(&listing, None, file_name.as_deref()) {
            FileSelection::Video(file) => file.index.and_then(|position| urls.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => urls.last(),
        };
        let Some(url) = url.cloned() else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &url);
        Ok(ResolveOutcome::Url(url))
    }

    async fn resolve_request(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let credential = request.credential.as_str();
        let remote = self.find_or_create(credential, &request.info_hash).await?;
        if remote.is_ready() {
            return self.unrestrict(request, &remote).await;
        }
        if remote.is_downloading() {
            return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
        }
        if !remote.is_error() {
            return Err(ProviderError::torrent_failed(
                KEY,
                &request.info_hash,
                format!("unknown request status '{}'", remote.status),
            ));
        }

        warn!(request_id = %remote.request_id, "Offcloud request failed; retrying once");
        let retried = self.create(credential, &request.info_hash).await?;
        if retried.is_ready() {
            self.unrestrict(request, &retried).await
        } else {
            Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload))
        }
    }

    async fn cached_hashes(&self, credential: &str, hashes: Vec<String>) -> Result<HashSet<String>, ProviderError> {
        let response: OcCacheResponse = self
            .post(credential, "cache", &OcCacheRequest { hashes: &hashes })
            .await?;
        Ok(response
            .cached_items
            .into_iter()
            .map(|hash| hash.to_lowercase())
            .collect())
    }
}

#[async_trait]
impl DebridProvider for Offcloud {
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
            .history(credential)
            .await?
            .into_iter()
            .filter(OcRequest::is_ready)
            .map(|request| CloudItem {
                info_hash: request.info_hash(),
                id: request.request_id,
                name: request.file_name,
                size: None,
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
        let request = self
            .history(credential)
            .await?
            .into_iter()
            .find(|request| request.request_id == item_id)
            .ok_or_else(|| ProviderError::unexpected(KEY, format!("no cloud item '{item_id}'")))?;
        let files = self
            .file_urls(credential, &request)
            .await?
            .into_iter()
            .filter(|url| files::is_video(url))
            .map(|url| CloudFile {
                name: files::base_name(&url).to_string(),
                size: 0,
                url,
            })
            .collect();
        Ok(CloudItemDetail {
            id: item_id.to_string(),
            info_hash: request.info_hash(),
            name: request.file_name,
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.resolve_request(request).await.inspect_err(|error| {
            info!(error = %error, "Offcloud resolution failed");
        })
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        let premium_required = error
            .api_message()
            .is_some_and(|message| message.contains("premium membership"));
        if error.has_code(&[NOAUTH]) || error.http_status_code() == Some(401) {
            Some(CanonicalError::BadToken)
        } else if error.has_code(&[NOT_AVAILABLE]) || premium_required {
            Some(CanonicalError::AccessDenied)
        } else {
            None
        }
    }
}
