//! Put.io adapter.
//!
//! Credentials have the form `clientId@token`; only the token authenticates
//! API calls. Put.io has no instant availability, so nothing is ever
//! reported cached. Finished files are played through public share links,
//! of which an account holds at most ten.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::cache::KnownCached;
use crate::magnet::encode_magnet;
use crate::outcome::StaticOutcome;

use super::files::{self, FileSelection, RemoteFile};
use super::http_client::form_body;
use super::poll::{PollOutcome, PollSchedule, poll_until};
use super::utils::{CachedStreams, availability_map, pick_existing, record_unrestricted};
use super::{
    AdapterContext, ApiResponse, AvailabilityMap, CanonicalError, CloudFile, CloudItem,
    CloudItemDetail, DebridProvider, ProviderError, ProviderHttp, ProviderKey, ResolutionRequest,
    ResolveOutcome, StreamCandidate, deep_link,
};

const KEY: ProviderKey = ProviderKey::Putio;

/// Default Put.io API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.put.io/v2";

/// Poll schedule while a new transfer is being processed.
const PROCESSING_POLL: PollSchedule = PollSchedule::new(Duration::from_secs(2), 15);

const MAX_PUBLIC_SHARES: usize = 10;

const BAD_TOKEN_TYPES: &[&str] = &["invalid_grant", "Unauthorized", "UNAUTHORIZED"];
const ACCESS_DENIED_TYPES: &[&str] = &["PAYMENT_REQUIRED", "SUBSCRIPTION_EXPIRED"];

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct PutioError {
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PutioTransfer {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub file_id: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioTransfers {
    #[serde(default)]
    pub transfers: Vec<PutioTransfer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioTransferEnvelope {
    pub transfer: PutioTransfer,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PutioFile {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub file_type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioFiles {
    #[serde(default)]
    pub files: Vec<PutioFile>,
    pub parent: Option<PutioFile>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioShares {
    #[serde(default)]
    pub links: Vec<PutioShare>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PutioShare {
    pub id: u64,
    pub token: String,
    pub user_file: PutioSharedFile,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PutioSharedFile {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioToken {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioPublicFile {
    pub parent: PutioPublicParent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutioPublicParent {
    #[serde(default)]
    pub stream_url: Option<String>,
}

impl PutioTransfer {
    fn is_error(&self) -> bool {
        self.status == "ERROR"
    }

    fn is_downloading(&self) -> bool {
        matches!(self.status.as_str(), "WAITING" | "IN_QUEUE" | "DOWNLOADING")
    }

    fn is_processing(&self) -> bool {
        matches!(self.status.as_str(), "WAITING" | "IN_QUEUE" | "COMPLETING")
    }

    fn is_ready(&self) -> bool {
        matches!(self.status.as_str(), "COMPLETED" | "SEEDING")
    }

    fn matches_hash(&self, info_hash: &str) -> bool {
        self.hash
            .as_deref()
            .is_some_and(|hash| hash.eq_ignore_ascii_case(info_hash))
            || self.source.to_lowercase().contains(&info_hash.to_lowercase())
    }
}

impl PutioFile {
    fn is_folder(&self) -> bool {
        self.file_type == "FOLDER"
    }
}

/// Splits a `clientId@token` credential and returns the token.
fn api_token(credential: &str) -> Result<&str, ProviderError> {
    match credential.split_once('@') {
        Some((client_id, token)) if !client_id.is_empty() && !token.is_empty() => Ok(token),
        _ => Err(ProviderError::invalid_credential(
            KEY,
            "expected 'clientId@token'",
        )),
    }
}

// ==================== Adapter ====================

/// Put.io adapter.
pub struct Putio {
    http: ProviderHttp,
    known_cached: KnownCached,
    processing_poll: PollSchedule,
}

impl std::fmt::Debug for Putio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Putio")
            .field("http", &self.http)
            .field("processing_poll", &self.processing_poll)
            .finish_non_exhaustive()
    }
}

impl Putio {
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
            processing_poll: PROCESSING_POLL,
        })
    }

    /// Overrides the poll schedule used after adding a transfer.
    #[must_use]
    pub fn with_processing_poll(mut self, schedule: PollSchedule) -> Self {
        self.processing_poll = schedule;
        self
    }

    fn decode<T: DeserializeOwned>(response: ApiResponse) -> Result<T, ProviderError> {
        if response.is_success() {
            return response.json(KEY);
        }
        match serde_json::from_str::<PutioError>(&response.body) {
            Ok(error) => Err(ProviderError::api(KEY, error.error_type, error.error_message)),
            Err(_) => Err(response.into_status_error(KEY)),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, params)?;
        let response = self
            .http
            .execute(|client| client.get(url.clone()).bearer_auth(token))
            .await?;
        Self::decode(response)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = self.http.endpoint(path, &[])?;
        let response = self
            .http
            .execute(|client| form_body(client.post(url.clone()).bearer_auth(token), fields))
            .await?;
        Self::decode(response)
    }

    async fn transfers(&self, token: &str) -> Result<Vec<PutioTransfer>, ProviderError> {
        let listed: PutioTransfers = self.get(token, "transfers/list", &[]).await?;
        Ok(listed.transfers)
    }

    async fn transfer(&self, token: &str, id: u64) -> Result<PutioTransfer, ProviderError> {
        let found: PutioTransferEnvelope = self.get(token, &format!("transfers/{id}"), &[]).await?;
        Ok(found.transfer)
    }

    /// Adds the magnet and waits while Put.io processes it.
    async fn add_transfer(&self, token: &str, info_hash: &str) -> Result<PutioTransfer, ProviderError> {
        let magnet = encode_magnet(info_hash, &[]);
        let added: PutioTransferEnvelope = self
            .post(token, "transfers/add", &[("url", magnet.as_str())])
            .await?;
        let id = added.transfer.id;
        let outcome = poll_until(self.processing_poll, move |_| async move {
            let transfer = self.transfer(token, id).await?;
            Ok::<_, ProviderError>(if transfer.is_processing() {
                PollOutcome::StillWaiting
            } else {
                PollOutcome::Ready(transfer)
            })
        })
        .await?;
        match outcome {
            PollOutcome::Ready(transfer) => Ok(transfer),
            PollOutcome::StillWaiting | PollOutcome::GaveUp => self.transfer(token, id).await,
        }
    }

    async fn find_or_add(&self, token: &str, info_hash: &str) -> Result<PutioTransfer, ProviderError> {
        let found: Vec<PutioTransfer> = self
            .transfers(token)
            .await?
            .into_iter()
            .filter(|transfer| transfer.matches_hash(info_hash))
            .collect();
        match pick_existing(found, PutioTransfer::is_error, |transfer| {
            usize::from(transfer.file_id.is_some())
        }) {
            Some(transfer) => Ok(transfer),
            None => self.add_transfer(token, info_hash).await,
        }
    }

    async fn list_files(&self, token: &str, parent_id: u64) -> Result<Vec<PutioFile>, ProviderError> {
        let parent = parent_id.to_string();
        let listed: PutioFiles = self
            .get(token, "files/list", &[("parent_id", parent.as_str())])
            .await?;
        if listed.files.is_empty() {
            return Ok(listed.parent.filter(|file| !file.is_folder()).into_iter().collect());
        }
        Ok(listed.files)
    }

    /// Every non-folder file below `root`, with paths relative to it.
    async fn walk_files(&self, token: &str, root: u64) -> Result<Vec<(String, PutioFile)>, ProviderError> {
        let mut pending = vec![(root, String::new())];
        let mut found = Vec::new();
        while let Some((id, prefix)) = pending.pop() {
            for file in self.list_files(token, id).await? {
                let path = if prefix.is_empty() {
                    file.name.clone()
                } else {
                    format!("{prefix}/{}", file.name)
                };
                if file.is_folder() {
                    pending.push((file.id, path));
                } else {
                    found.push((path, file));
                }
            }
        }
        Ok(found)
    }

    /// Share token for `file_id`, reusing an existing share when possible.
    async fn public_token(&self, token: &str, file_id: u64) -> Result<String, ProviderError> {
        let shares: PutioShares = self.get(token, "files/public/list", &[]).await?;
        if let Some(existing) = shares.links.iter().find(|share| share.user_file.id == file_id) {
            return Ok(existing.token.clone());
        }
        if shares.links.len() >= MAX_PUBLIC_SHARES
            && let Some(oldest) = shares.links.first()
        {
            debug!(share = oldest.id, "revoking oldest Put.io public share");
            let url = self.http.endpoint(&format!("files/public/{}", oldest.id), &[])?;
            let response = self
                .http
                .execute(|client| client.delete(url.clone()).bearer_auth(token))
                .await?;
            Self::decode::<serde_json::Value>(response)?;
        }
        let created: PutioToken = self
            .post(token, &format!("files/{file_id}/make-public"), &[])
            .await?;
        Ok(created.token)
    }

    async fn stream_url(&self, token: &str, file_id: u64) -> Result<Option<String>, ProviderError> {
        let share = self.public_token(token, file_id).await?;
        let url = self.http.endpoint("files/public", &[("oauth_token", share.as_str())])?;
        let response = self.http.execute(|client| client.get(url.clone())).await?;
        let public: PutioPublicFile = Self::decode(response)?;
        Ok(public.parent.stream_url.filter(|url| !url.is_empty()))
    }

    async fn unrestrict(
        &self,
        request: &ResolutionRequest,
        token: &str,
        transfer: &PutioTransfer,
    ) -> Result<ResolveOutcome, ProviderError> {
        let Some(root) = transfer.file_id else {
            return Err(ProviderError::torrent_failed(KEY, &request.info_hash, "finished transfer has no file"));
        };
        let walked = self.walk_files(token, root).await?;
        let remote: Vec<RemoteFile> = walked
            .iter()
            .zip(0_u32..)
            .map(|((path, file), position)| RemoteFile::new(Some(position), path.clone(), file.size))
            .collect();
        let file_name = request.file_name();
        let target = match files::select_target_file(&remote, None, file_name.as_deref()) {
            FileSelection::Video(file) => file.index.and_then(|position| walked.get(position as usize)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => None,
        };
        let Some((_, target)) = target else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };
        let Some(url) = self.stream_url(token, target.id).await? else {
            return Err(ProviderError::unexpected(KEY, format!("no stream URL for '{}'", target.name)));
        };
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &url);
        Ok(ResolveOutcome::Url(url))
    }

    async fn resolve_transfer(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let token = api_token(&request.credential)?;
        let transfer = self.find_or_add(token, &request.info_hash).await?;
        if transfer.is_ready() {
            return self.unrestrict(request, token, &transfer).await;
        }
        if transfer.is_downloading() {
            return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
        }
        if !transfer.is_error() {
            return Err(ProviderError::torrent_failed(
                KEY,
                &request.info_hash,
                format!("unknown transfer status '{}'", transfer.status),
            ));
        }

        warn!(id = transfer.id, "Put.io transfer failed; retrying once");
        let id = transfer.id.to_string();
        self.post::<serde_json::Value>(token, "transfers/remove", &[("transfer_ids", id.as_str())])
            .await?;
        let retried = self.add_transfer(token, &request.info_hash).await?;
        if retried.is_ready() {
            self.unrestrict(request, token, &retried).await
        } else {
            Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload))
        }
    }
}

#[async_trait]
impl DebridProvider for Putio {
    fn key(&self) -> ProviderKey {
        KEY
    }

    async fn check_availability(
        &self,
        streams: &[StreamCandidate],
        credential: &str,
        _client_ip: Option<&str>,
    ) -> Result<Option<AvailabilityMap>, ProviderError> {
        Ok(Some(availability_map(streams, credential, &CachedStreams::default())))
    }

    #[instrument(skip(self, credential))]
    async fn list_cloud_items(&self, credential: &str, offset: u32) -> Result<Vec<CloudItem>, ProviderError> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        let token = api_token(credential)?;
        Ok(self
            .transfers(token)
            .await?
            .into_iter()
            .filter(|transfer| transfer.is_ready() && transfer.file_id.is_some())
            .map(|transfer| CloudItem {
                id: transfer.id.to_string(),
                name: transfer.name,
                info_hash: transfer.hash.map(|hash| hash.to_lowercase()),
                size: transfer.size,
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
        let token = api_token(credential)?;
        let id = item_id
            .parse::<u64>()
            .map_err(|_| ProviderError::unexpected(KEY, format!("invalid transfer id '{item_id}'")))?;
        let transfer = self.transfer(token, id).await?;
        let info_hash = transfer.hash.as_deref().map(str::to_lowercase);
        let files = match (transfer.file_id, info_hash.as_deref()) {
            (Some(root), Some(hash)) => self
                .walk_files(token, root)
                .await?
                .into_iter()
                .filter(|(path, _)| files::is_video(path))
                .map(|(path, file)| CloudFile {
                    url: deep_link(credential, hash, &urlencoding::encode(&file.name), None),
                    name: path,
                    size: file.size,
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(CloudItemDetail {
            id: item_id.to_string(),
            name: transfer.name,
            info_hash,
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.resolve_transfer(request).await.inspect_err(|error| {
            info!(error = %error, "Put.io resolution failed");
        })
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if matches!(error, ProviderError::InvalidCredential { .. })
            || error.has_code(BAD_TOKEN_TYPES)
            || error.http_status_code() == Some(401)
        {
            Some(CanonicalError::BadToken)
        } else if error.has_code(ACCESS_DENIED_TYPES) || error.http_status_code() == Some(402) {
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
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn json(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(body)
    }

    fn putio_request(hash: &str) -> ResolutionRequest {
        let mut request = resolution_request(KEY, hash, None);
        request.credential = "client@token".to_string();
        request
    }

    #[test]
    fn test_credential_shape() {
        assert_eq!(api_token("1234@abcd").unwrap(), "abcd");
        let adapter = Putio::new(&adapter_context()).unwrap();
        for bad in ["token-only", "@token", "client@"] {
            let error = api_token(bad).unwrap_err();
            assert_eq!(adapter.classify_error(&error), Some(CanonicalError::BadToken));
        }
    }

    #[tokio::test]
    async fn test_availability_never_reports_cached() {
        let streams = vec![StreamCandidate {
            info_hash: info_hash('a'),
            file_index: Some(2),
            title: "Movie\nMovie.mkv".to_string(),
            size: None,
            seeders: None,
        }];
        let adapter = Putio::new(&adapter_context()).unwrap();
        let map = adapter
            .check_availability(&streams, "client@token", None)
            .await
            .unwrap()
            .unwrap();
        let entry = &map[&streams[0].key()];
        assert!(!entry.cached);
        assert_eq!(entry.url, format!("client@token/{}/Movie.mkv/2", info_hash('a')));
    }

    #[tokio::test]
    async fn test_resolve_completed_transfer_shares_largest_video() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('b');
        Mock::given(method("GET"))
            .and(path("/transfers/list"))
            .and(header("authorization", "Bearer token"))
            .respond_with(json(serde_json::json!({ "transfers": [{
                "id": 5, "name": "Movie", "status": "COMPLETED", "hash": hash, "file_id": 100,
            }]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/list"))
            .and(query_param("parent_id", "100"))
            .respond_with(json(serde_json::json!({ "files": [
                { "id": 101, "name": "sample.mkv", "size": 10, "file_type": "VIDEO" },
                { "id": 102, "name": "Movie.mkv", "size": 900, "file_type": "VIDEO" },
            ], "parent": { "id": 100, "name": "Movie", "file_type": "FOLDER" }})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/public/list"))
            .respond_with(json(serde_json::json!({ "links": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/files/102/make-public"))
            .respond_with(json(serde_json::json!({ "token": "share" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/public"))
            .and(query_param("oauth_token", "share"))
            .respond_with(json(serde_json::json!({ "parent": { "stream_url": "https://putio/stream/102" } })))
            .mount(&server)
            .await;

        let adapter = Putio::with_base_url(&adapter_context(), server.uri()).unwrap();
        let outcome = adapter.resolve(&putio_request(&hash)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Url("https://putio/stream/102".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_new_transfer_reports_downloading() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/transfers/list"))
            .respond_with(json(serde_json::json!({ "transfers": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transfers/add"))
            .respond_with(json(serde_json::json!({ "transfer": { "id": 9, "status": "IN_QUEUE" } })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/transfers/9"))
            .respond_with(json(serde_json::json!({ "transfer": { "id": 9, "status": "DOWNLOADING" } })))
            .mount(&server)
            .await;

        let adapter = Putio::with_base_url(&adapter_context(), server.uri())
            .unwrap()
            .with_processing_poll(PollSchedule::new(Duration::from_millis(1), 3));
        let outcome = adapter.resolve(&putio_request(&info_hash('c'))).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Static(StaticOutcome::Downloading));
    }

    #[tokio::test]
    async fn test_unauthorized_is_bad_token() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/transfers/list"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error_type": "invalid_grant", "error_message": "token expired", "status_code": 401,
            })))
            .mount(&server)
            .await;

        let adapter = Putio::with_base_url(&adapter_context(), server.uri()).unwrap();
        let error = adapter.resolve(&putio_request(&info_hash('d'))).await.unwrap_err();
        assert_eq!(adapter.classify_error(&error), Some(CanonicalError::BadToken));
    }
}
