//! EasyDebrid adapter.
//!
//! EasyDebrid only serves torrents it already holds: a resolution asks for
//! a generated link directly and there is no transfer to create or poll.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::cache::KnownCached;
use crate::magnet::encode_magnet;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::utils::{check_in_batches, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudItem, CloudItemDetail,
    DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest, ResolveOutcome,
    StreamCandidate,
};

const KEY: ProviderKey = ProviderKey::EasyDebrid;

/// Default EasyDebrid API base URL.
pub const DEFAULT_BASE_URL: &str = "https://easydebrid.com/api/v1";

const LOOKUP_BATCH: usize = 250;

const NOT_LOGGED_IN: &str = "not_logged_in";
const NOT_PREMIUM: &str = "not_premium";
const GENERIC_ERROR: &str = "error";

// ==================== Request/Response Types ====================

#[derive(Debug, Serialize)]
struct EdLookupRequest<'a> {
    urls: &'a [String],
}

#[derive(Debug, Serialize)]
struct EdGenerateRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EdError {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EdLookup {
    #[serde(default)]
    pub cached: Vec<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EdGenerated {
    #[serde(default)]
    pub files: Vec<EdFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EdFile {
    #[serde(default)]
    pub directory: Vec<String>,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
}

impl EdFile {
    fn path(&self) -> String {
        let mut parts = self.directory.clone();
        parts.push(self.filename.clone());
        parts.join("/")
    }
}

fn code_for_message(message: &str) -> &'static str {
    if message.contains("Not logged in") {
        NOT_LOGGED_IN
    } else if message.contains("Account not premium") {
        NOT_PREMIUM
    } else {
        GENERIC_ERROR
    }
}

// ==================== Adapter ====================

/// EasyDebrid adapter.
pub struct EasyDebrid {
    http: ProviderHttp,
    known_cached: KnownCached,
}

impl std::fmt::Debug for EasyDebrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EasyDebrid")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl EasyDebrid {
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
        })
    }

    fn decode<T: DeserializeOwned>(response: ApiResponse) -> Result<T, ProviderError> {
        if let Ok(EdError { error }) = serde_json::from_str::<EdError>(&response.body) {
            return Err(ProviderError::api(KEY, code_for_message(&error), error));
        }
        if !response.is_success() {
            return Err(response.into_status_error(KEY));
        }
        response.json(KEY)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        credential: &str,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, &[])?;
        let response = self
            .http
            .execute(|client| client.post(url.clone()).bearer_auth(credential).json(body))
            .await?;
        Self::decode(response)
    }

    async fn cached_hashes(&self, credential: &str, hashes: Vec<String>) -> Result<HashSet<String>, ProviderError> {
        let urls: Vec<String> = hashes.iter().map(|hash| encode_magnet(hash, &[])).collect();
        let lookup: EdLookup = self
            .post(credential, "link/lookup", &EdLookupRequest { urls: &urls })
            .await?;
        Ok(hashes
            .into_iter()
            .zip(lookup.cached)
            .filter_map(|(hash, cached)| cached.then_some(hash))
            .collect())
    }

    async fn generate(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let magnet = encode_magnet(&request.info_hash, &[]);
        let generated: EdGenerated = self
            .post(&request.credential, "link/generate", &EdGenerateRequest { url: &magnet })
            .await?;
        if generated.files.is_empty() {
            return Err(ProviderError::torrent_failed(KEY, &request.info_hash, "no cached entry found"));
        }

        let remote: Vec<RemoteFile> = generated
            .files
            .iter()
            .zip(0_u32..)
            .map(|(file, position)| RemoteFile::new(Some(position), file.path(), file.size))
            .collect();
        let file_name = request.file_name();
        let file = match files::select_target_file(&remote, None, file_name.as_deref()) {
            FileSelection::Video(file) => file
                .index
                .and_then(|position| generated.files.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => None,
        };
        let Some(file) = file else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &file.url);
        Ok(ResolveOutcome::Url(file.url.clone()))
    }
}

#[async_trait]
impl DebridProvider for EasyDebrid {
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
            LOOKUP_BATCH,
            |error| self.classify_error(error),
            |batch| self.cached_hashes(credential, batch),
        )
        .await
    }

    /// EasyDebrid keeps no per-user cloud.
    async fn list_cloud_items(&self, _credential: &str, _offset: u32) -> Result<Vec<CloudItem>, ProviderError> {
        Ok(Vec::new())
    }

    async fn get_item_detail(
        &self,
        item_id: &str,
        _credential: &str,
        _client_ip: Option<&str>,
    ) -> Result<CloudItemDetail, ProviderError> {
        Err(ProviderError::unexpected(
            KEY,
            format!("no cloud item '{item_id}': EasyDebrid has no cloud catalog"),
        ))
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.generate(request).await.inspect_err(|error| {
            info!(error = %error, "EasyDebrid resolution failed");
        })
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(&[NOT_LOGGED_IN]) || error.http_status_code() == Some(401) {
            Some(CanonicalError::BadToken)
        } else if error.has_code(&[NOT_PREMIUM]) {
            Some(CanonicalError::AccessDenied)
        } else {
            None
        }
    }
}
