//! AllDebrid adapter (API v4).
//!
//! Requests carry `agent` and `apikey` query parameters. Responses are
//! `{ status: "success" | "error", data, error: { code, message } }`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::MagnetBuilder;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::utils::{check_in_batches, pick_existing, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate, deep_link,
};

const KEY: ProviderKey = ProviderKey::AllDebrid;

/// Default AllDebrid API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.alldebrid.com/v4";

const AGENT: &str = "debrid-resolver";
const AVAILABILITY_BATCH: usize = 100;

const BAD_TOKEN_CODES: &[&str] = &["AUTH_MISSING_APIKEY", "AUTH_BAD_APIKEY"];
const ACCESS_DENIED_CODES: &[&str] = &[
    "AUTH_USER_BANNED",
    "MUST_BE_PREMIUM",
    "MAGNET_MUST_BE_PREMIUM",
    "FREE_TRIAL_LIMIT_REACHED",
];
const ACCESS_BLOCKED_CODES: &[&str] = &["AUTH_BLOCKED", "NO_SERVER"];
const LIMIT_CODES: &[&str] = &["MAGNET_TOO_MANY_ACTIVE", "MAGNET_TOO_MANY"];
const TOO_LARGE_CODES: &[&str] = &["MAGNET_TOO_LARGE"];

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct AdEnvelope<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<AdError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AdError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AdMagnets<T> {
    pub magnets: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AdInstant {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub instant: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AdUploaded {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AdMagnet {
    pub id: u64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "statusCode")]
    pub status_code: u32,
    #[serde(default)]
    pub links: Vec<AdLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AdLink {
    pub link: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AdUnlocked {
    pub link: String,
}

impl AdMagnet {
    fn is_downloading(&self) -> bool {
        self.status_code <= 3
    }

    fn is_ready(&self) -> bool {
        self.status_code == 4
    }

    fn is_error(&self) -> bool {
        self.status_code >= 5
    }
}

fn static_for_error(error: &ProviderError) -> Option<StaticOutcome> {
    if error.has_code(LIMIT_CODES) {
        Some(StaticOutcome::LimitsExceeded)
    } else if error.has_code(TOO_LARGE_CODES) {
        Some(StaticOutcome::FailedTooBig)
    } else {
        None
    }
}

// ==================== Adapter ====================

/// AllDebrid adapter.
pub struct AllDebrid {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
}

impl std::fmt::Debug for AllDebrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllDebrid")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl AllDebrid {
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

    fn unwrap_envelope<T: DeserializeOwned>(response: ApiResponse) -> Result<T, ProviderError> {
        match serde_json::from_str::<AdEnvelope<T>>(&response.body) {
            Ok(AdEnvelope {
                status,
                data: Some(data),
                ..
            }) if status == "success" => Ok(data),
            Ok(AdEnvelope {
                error: Some(error), ..
            }) => Err(ProviderError::api(KEY, error.code, error.message)),
            Ok(_) => Err(ProviderError::unexpected(KEY, "envelope carried neither data nor error")),
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
        let mut query = vec![("agent", AGENT), ("apikey", credential)];
        query.extend_from_slice(params);
        let url = self.http.endpoint(path, &query)?;
        let response = self.http.execute(|client| client.get(url.clone())).await?;
        Self::unwrap_envelope(response)
    }

    async fn all_magnets(&self, credential: &str) -> Result<Vec<AdMagnet>, ProviderError> {
        let listed: AdMagnets<Vec<AdMagnet>> = self.get(credential, "magnet/status", &[]).await?;
        Ok(listed.magnets)
    }

    async fn magnet(&self, credential: &str, id: u64) -> Result<AdMagnet, ProviderError> {
        let id = id.to_string();
        let found: AdMagnets<AdMagnet> = self.get(credential, "magnet/status", &[("id", id.as_str())]).await?;
        Ok(found.magnets)
    }

    async fn delete_magnet(&self, credential: &str, id: u64) -> Result<(), ProviderError> {
        let id = id.to_string();
        self.get::<serde_json::Value>(credential, "magnet/delete", &[("id", id.as_str())])
            .await
            .map(|_| ())
    }

    async fn upload(&self, credential: &str, info_hash: &str) -> Result<AdMagnet, ProviderError> {
        let magnet = self.magnets.magnet_link(info_hash).await;
        let uploaded: AdMagnets<Vec<AdUploaded>> = self
            .get(credential, "magnet/upload", &[("magnets[]", magnet.as_str())])
            .await?;
        let Some(first) = uploaded.magnets.first() else {
            return Err(ProviderError::unexpected(KEY, "upload returned no magnet"));
        };
        self.magnet(credential, first.id).await
    }

    async fn find_or_create(&self, credential: &str, info_hash: &str) -> Result<AdMagnet, ProviderError> {
        let found: Vec<AdMagnet> = self
            .all_magnets(credential)
            .await?
            .into_iter()
            .filter(|magnet| magnet.hash.eq_ignore_ascii_case(info_hash))
            .collect();
        match pick_existing(found, AdMagnet::is_error, |magnet| magnet.links.len()) {
            Some(magnet) => Ok(magnet),
            None => self.upload(credential, info_hash).await,
        }
    }

    async fn unlock(&self, credential: &str, link: &str) -> Result<String, ProviderError> {
        let unlocked: AdUnlocked = self.get(credential, "link/unlock", &[("link", link)]).await?;
        Ok(unlocked.link)
    }

    async fn unrestrict(&self, request: &ResolutionRequest, magnet: &AdMagnet) -> Result<ResolveOutcome, ProviderError> {
        let remote: Vec<RemoteFile> = magnet
            .links
            .iter()
            .zip(0_u32..)
            .map(|(link, position)| RemoteFile::new(Some(position), link.filename.clone(), link.size))
            .collect();
        let file_name = request.file_name();
        let link = match files::select_target_file(&remote, None, file_name.as_deref()) {
            FileSelection::Video(file) => file
                .index
                .and_then(|position| magnet.links.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => None,
        };
        let Some(link) = link else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };
        let url = self.unlock(&request.credential, &link.link).await?;
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &url);
        Ok(ResolveOutcome::Url(url))
    }

    async fn resolve_magnet(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let credential = request.credential.as_str();
        let magnet = self.find_or_create(credential, &request.info_hash).await?;
        if magnet.is_ready() {
            return self.unrestrict(request, &magnet).await;
        }
        if magnet.is_downloading() {
            return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
        }
        warn!(id = magnet.id, status_code = magnet.status_code, "AllDebrid magnet failed; retrying once");
        self.delete_magnet(credential, magnet.id).await?;
        let retried = self.upload(credential, &request.info_hash).await?;
        if retried.is_ready() {
            self.unrestrict(request, &retried).await
        } else if retried.is_downloading() {
            Ok(ResolveOutcome::Static(StaticOutcome::Downloading))
        } else {
            Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload))
        }
    }

    async fn instant_hashes(&self, credential: &str, hashes: Vec<String>) -> Result<HashSet<String>, ProviderError> {
        let params: Vec<(&str, &str)> = hashes.iter().map(|hash| ("magnets[]", hash.as_str())).collect();
        let instant: AdMagnets<Vec<AdInstant>> = self.get(credential, "magnet/instant", &params).await?;
        Ok(instant
            .magnets
            .into_iter()
            .filter(|magnet| magnet.instant)
            .map(|magnet| magnet.hash.to_lowercase())
            .collect())
    }
}

#[async_trait]
impl DebridProvider for AllDebrid {
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
            |batch| self.instant_hashes(credential, batch),
        )
        .await
    }

    #[instrument(skip(self, credential))]
    async fn list_cloud_items(&self, credential: &str, offset: u32) -> Result<Vec<CloudItem>, ProviderError> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .all_magnets(credential)
            .await?
            .into_iter()
            .filter(AdMagnet::is_ready)
            .map(|magnet| CloudItem {
                id: magnet.id.to_string(),
                name: magnet.filename,
                info_hash: Some(magnet.hash.to_lowercase()),
                size: Some(magnet.size),
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
        let id = item_id
            .parse::<u64>()
            .map_err(|_| ProviderError::unexpected(KEY, format!("invalid magnet id '{item_id}'")))?;
        let magnet = self.magnet(credential, id).await?;
        let info_hash = magnet.hash.to_lowercase();
        let files = magnet
            .links
            .iter()
            .filter(|link| files::is_video(&link.filename))
            .map(|link| CloudFile {
                name: link.filename.clone(),
                size: link.size,
                url: deep_link(credential, &info_hash, &urlencoding::encode(&link.filename), None),
            })
            .collect();
        Ok(CloudItemDetail {
            id: item_id.to_string(),
            name: magnet.filename,
            info_hash: Some(info_hash),
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        match self.resolve_magnet(request).await {
            Err(error) => match static_for_error(&error) {
                Some(outcome) => {
                    info!(outcome = %outcome, error = %error, "AllDebrid reported terminal state");
                    Ok(ResolveOutcome::Static(outcome))
                }
                None => Err(error),
            },
            ok => ok,
        }
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(BAD_TOKEN_CODES) {
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
