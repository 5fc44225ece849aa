//! Premiumize adapter.
//!
//! Every call carries an `apikey` query parameter. Responses share a
//! `{ status: "success" | "error", message }` envelope; Premiumize sends no
//! error codes, so codes are derived from the message text.
//!
//! Resolution tries a direct download of the cached torrent first and only
//! falls back to the transfer lifecycle when nothing is cached.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::{MagnetBuilder, encode_magnet};
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::http_client::form_body;
use super::utils::{check_in_batches, pick_existing, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate,
};

const KEY: ProviderKey = ProviderKey::Premiumize;

/// Default Premiumize API base URL.
pub const DEFAULT_BASE_URL: &str = "https://www.premiumize.me/api";

const AVAILABILITY_BATCH: usize = 100;

const NOT_LOGGED_IN: &str = "not_logged_in";
const PURCHASE_REQUIRED: &str = "purchase_required";
const GENERIC_ERROR: &str = "error";

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct PmStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PmCacheCheck {
    #[serde(default)]
    pub response: Vec<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PmDirectFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub stream_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PmDirectDownload {
    #[serde(default)]
    pub content: Vec<PmDirectFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PmTransfer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PmTransfers {
    #[serde(default)]
    pub transfers: Vec<PmTransfer>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PmFolderEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub stream_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PmFolder {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Vec<PmFolderEntry>,
}

impl PmTransfer {
    fn is_error(&self) -> bool {
        matches!(self.status.as_str(), "deleted" | "error" | "timeout")
    }

    fn is_downloading(&self) -> bool {
        matches!(self.status.as_str(), "waiting" | "queued" | "running")
    }

    fn is_ready(&self) -> bool {
        matches!(self.status.as_str(), "finished" | "seeding")
    }
}

impl PmFolderEntry {
    fn is_folder(&self) -> bool {
        self.kind == "folder"
    }
}

/// Derives an error code from a Premiumize error message.
fn code_for_message(message: &str) -> &'static str {
    if message
        .trim()
        .starts_with("customer_id and pin parameter missing or not logged in")
    {
        NOT_LOGGED_IN
    } else if message.contains("purchase") {
        PURCHASE_REQUIRED
    } else {
        GENERIC_ERROR
    }
}

// ==================== Adapter ====================

/// Premiumize adapter.
pub struct Premiumize {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
}

impl std::fmt::Debug for Premiumize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Premiumize")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl Premiumize {
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
        let status = match serde_json::from_str::<PmStatus>(&response.body) {
            Ok(status) => status,
            Err(_) if !response.is_success() => return Err(response.into_status_error(KEY)),
            Err(error) => {
                return Err(ProviderError::unexpected(KEY, format!("envelope did not decode: {error}")));
            }
        };
        if status.status != "success" {
            let message = status.message.unwrap_or_default();
            return Err(ProviderError::api(KEY, code_for_message(&message), message));
        }
        response.json(KEY)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        credential: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let mut query = vec![("apikey", credential)];
        query.extend_from_slice(params);
        let url = self.http.endpoint(path, &query)?;
        let response = self.http.execute(|client| client.get(url.clone())).await?;
        Self::unwrap_envelope(response)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        credential: &str,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, &[("apikey", credential)])?;
        let response = self
            .http
            .execute(|client| form_body(client.post(url.clone()), fields))
            .await?;
        Self::unwrap_envelope(response)
    }

    async fn direct_download(
        &self,
        credential: &str,
        info_hash: &str,
        client_ip: Option<&str>,
    ) -> Result<Vec<PmDirectFile>, ProviderError> {
        let magnet = encode_magnet(info_hash, &[]);
        let mut fields = vec![("src", magnet.as_str())];
        if let Some(ip) = client_ip {
            fields.push(("ip", ip));
        }
        let direct: PmDirectDownload = self.post(credential, "transfer/directdl", &fields).await?;
        Ok(direct.content)
    }

    /// Link of the requested file from a direct download, or `None` when
    /// the torrent is not cached.
    async fn cached_link(&self, request: &ResolutionRequest) -> Result<Option<ResolveOutcome>, ProviderError> {
        let content = self
            .direct_download(&request.credential, &request.info_hash, request.client_ip.as_deref())
            .await?;
        if content.is_empty() {
            return Ok(None);
        }

        let remote: Vec<RemoteFile> = content
            .iter()
            .zip(0_u32..)
            .map(|(file, position)| RemoteFile::new(Some(position), file.path.clone(), file.size))
            .collect();
        let file_name = request.file_name();
        let target = match files::select_target_file(&remote, None, file_name.as_deref()) {
            FileSelection::Video(file) => file.index.and_then(|position| content.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(Some(ResolveOutcome::Static(StaticOutcome::FailedRar))),
            FileSelection::NotFound => None,
        };
        let Some(target) = target else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };

        let browser_link = request
            .is_browser
            .then(|| target.stream_link.clone())
            .flatten();
        let Some(url) = browser_link.or_else(|| target.link.clone()) else {
            return Err(ProviderError::unexpected(KEY, format!("no link for '{}'", target.path)));
        };
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &url);
        Ok(Some(ResolveOutcome::Url(url)))
    }

    async fn transfers(&self, credential: &str) -> Result<Vec<PmTransfer>, ProviderError> {
        let listed: PmTransfers = self.get(credential, "transfer/list", &[]).await?;
        Ok(listed.transfers)
    }

    async fn find_transfer(&self, credential: &str, info_hash: &str) -> Result<Option<PmTransfer>, ProviderError> {
        let needle = info_hash.to_lowercase();
        let found: Vec<PmTransfer> = self
            .transfers(credential)
            .await?
            .into_iter()
            .filter(|transfer| transfer.src.to_lowercase().contains(&needle))
            .collect();
        Ok(pick_existing(found, PmTransfer::is_error, |transfer| {
            usize::from(transfer.is_ready())
        }))
    }

    async fn create_transfer(&self, credential: &str, info_hash: &str) -> Result<PmTransfer, ProviderError> {
        let magnet = self.magnets.magnet_link(info_hash).await;
        self.post::<serde_json::Value>(credential, "transfer/create", &[("src", magnet.as_str())])
            .await?;
        self.find_transfer(credential, info_hash)
            .await?
            .ok_or_else(|| ProviderError::torrent_failed(KEY, info_hash, "created transfer not listed"))
    }

    async fn delete_transfer(&self, credential: &str, id: &str) -> Result<(), ProviderError> {
        self.post::<serde_json::Value>(credential, "transfer/delete", &[("id", id)])
            .await
            .map(|_| ())
    }

    async fn resolve_via_transfer(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let credential = request.credential.as_str();
        let transfer = match self.find_transfer(credential, &request.info_hash).await? {
            Some(transfer) => transfer,
            None => self.create_transfer(credential, &request.info_hash).await?,
        };

        if transfer.is_ready() {
            return self.ready_link(request).await;
        }
        if transfer.is_downloading() {
            debug!(id = %transfer.id, progress = ?transfer.progress, "Premiumize transfer in progress");
            return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
        }
        if !transfer.is_error() {
            return Err(ProviderError::torrent_failed(
                KEY,
                &request.info_hash,
                format!("unknown transfer status '{}'", transfer.status),
            ));
        }

        warn!(id = %transfer.id, name = %transfer.name, "Premiumize transfer failed; retrying once");
        self.delete_transfer(credential, &transfer.id).await?;
        let retried = self.create_transfer(credential, &request.info_hash).await?;
        if retried.is_ready() {
            self.ready_link(request).await
        } else {
            Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload))
        }
    }

    async fn ready_link(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.cached_link(request).await?.ok_or_else(|| {
            ProviderError::torrent_failed(KEY, &request.info_hash, "finished transfer has no direct download")
        })
    }

    async fn resolve_torrent(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        match self.cached_link(request).await {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => debug!("no cached Premiumize entry; using transfers"),
            Err(error) if self.classify_error(&error).is_some() => return Err(error),
            Err(error) => debug!(error = %error, "Premiumize direct download failed; using transfers"),
        }
        self.resolve_via_transfer(request).await
    }

    async fn cached_hashes(&self, credential: &str, hashes: Vec<String>) -> Result<HashSet<String>, ProviderError> {
        let params: Vec<(&str, &str)> = hashes.iter().map(|hash| ("items[]", hash.as_str())).collect();
        let checked: PmCacheCheck = self.get(credential, "cache/check", &params).await?;
        Ok(hashes
            .into_iter()
            .zip(checked.response)
            .filter_map(|(hash, cached)| cached.then_some(hash))
            .collect())
    }

    async fn folder(&self, credential: &str, id: Option<&str>) -> Result<PmFolder, ProviderError> {
        match id {
            Some(id) => self.get(credential, "folder/list", &[("id", id)]).await,
            None => self.get(credential, "folder/list", &[]).await,
        }
    }

    /// Video files below `root`, with paths relative to it.
    async fn folder_videos(&self, credential: &str, root: &str) -> Result<(Option<String>, Vec<CloudFile>), ProviderError> {
        let mut pending = vec![(root.to_string(), String::new())];
        let mut videos = Vec::new();
        let mut root_name = None;
        while let Some((id, prefix)) = pending.pop() {
            let folder = self.folder(credential, Some(id.as_str())).await?;
            if id == root {
                root_name = folder.name;
            }
            for entry in folder.content {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                if entry.is_folder() {
                    pending.push((entry.id, path));
                } else if files::is_video(&entry.name)
                    && let Some(url) = entry.link.or(entry.stream_link)
                {
                    videos.push(CloudFile {
                        name: path,
                        size: entry.size,
                        url,
                    });
                }
            }
        }
        Ok((root_name, videos))
    }
}

#[async_trait]
impl DebridProvider for Premiumize {
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
            .folder(credential, None)
            .await?
            .content
            .into_iter()
            .filter(PmFolderEntry::is_folder)
            .map(|entry| CloudItem {
                id: entry.id,
                name: entry.name,
                info_hash: None,
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
        let (name, files) = self.folder_videos(credential, item_id).await?;
        Ok(CloudItemDetail {
            id: item_id.to_string(),
            name: name.unwrap_or_else(|| item_id.to_string()),
            info_hash: None,
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.resolve_torrent(request).await.inspect_err(|error| {
            info!(error = %error, "Premiumize resolution failed");
        })
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(&[NOT_LOGGED_IN]) || error.http_status_code() == Some(401) {
            Some(CanonicalError::BadToken)
        } else if error.has_code(&[PURCHASE_REQUIRED]) {
            Some(CanonicalError::AccessDenied)
        } else {
            None
        }
    }
}
