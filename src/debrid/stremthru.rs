//! StremThru adapter.
//!
//! StremThru is a proxy in front of another debrid store. The credential is
//! `base64("{auth}@{url}")`: `url` is the StremThru instance and `auth` is
//! either `store:token` (the store name and its API token) or an opaque
//! proxy authorization. Responses are `{ "data": ... }` on success and
//! `{ "error": { "code": "...", "message": "..." } }` otherwise.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use url::Url;

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

const KEY: ProviderKey = ProviderKey::StremThru;

/// Public StremThru instance used when the credential names none.
pub const DEFAULT_BASE_URL: &str = "https://stremthru.13377001.xyz";

const UNAUTHORIZED: &str = "UNAUTHORIZED";
const FORBIDDEN: &str = "FORBIDDEN";
const PAYMENT_REQUIRED: &str = "PAYMENT_REQUIRED";
const STORE_LIMIT_EXCEEDED: &str = "STORE_LIMIT_EXCEEDED";

// ==================== Credential ====================

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreAuth {
    /// `X-StremThru-Store-Name` + `X-StremThru-Store-Authorization`.
    Store { store: String, token: String },
    /// `Proxy-Authorization: Basic ...`.
    Proxy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StremThruConf {
    url: String,
    auth: StoreAuth,
}

impl StremThruConf {
    /// Decodes `base64("{auth}@{url}")`. The URL may itself contain `@`.
    fn decode(credential: &str) -> Result<Self, ProviderError> {
        let bytes = general_purpose::STANDARD
            .decode(credential)
            .or_else(|_| general_purpose::URL_SAFE.decode(credential))
            .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(credential.trim_end_matches('=')))
            .map_err(|_| ProviderError::invalid_credential(KEY, "credential is not base64"))?;
        let decoded = String::from_utf8(bytes)
            .map_err(|_| ProviderError::invalid_credential(KEY, "credential is not UTF-8"))?;
        let Some((auth, url)) = decoded.split_once('@') else {
            return Err(ProviderError::invalid_credential(KEY, "expected '{auth}@{url}'"));
        };
        if auth.is_empty() {
            return Err(ProviderError::invalid_credential(KEY, "missing store authorization"));
        }
        let auth = match auth.split_once(':') {
            Some((store, token)) => StoreAuth::Store {
                store: store.to_string(),
                token: token.to_string(),
            },
            None => StoreAuth::Proxy(auth.to_string()),
        };
        Ok(Self {
            url: url.trim().trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            StoreAuth::Store { store, token } => builder
                .header("X-StremThru-Store-Name", store)
                .header("X-StremThru-Store-Authorization", format!("Bearer {token}")),
            StoreAuth::Proxy(auth) => builder.header("Proxy-Authorization", format!("Basic {auth}")),
        }
    }
}

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct StEnvelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<StError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StList<T> {
    #[serde(default)]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StMagnet {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub files: Vec<StFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StFile {
    /// Torrent file index; `-1` when the store does not expose it.
    #[serde(default = "unknown_index")]
    pub index: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub link: Option<String>,
}

fn unknown_index() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
pub(crate) struct StGeneratedLink {
    pub link: String,
}

#[derive(Debug, Serialize)]
struct AddMagnetRequest<'a> {
    magnet: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerateLinkRequest<'a> {
    link: &'a str,
}

// ==================== Status Mapping ====================

impl StMagnet {
    fn is_ready(&self) -> bool {
        self.status == "downloaded"
    }

    fn is_downloading(&self) -> bool {
        matches!(self.status.as_str(), "queued" | "downloading" | "processing")
    }

    fn is_error(&self) -> bool {
        matches!(self.status.as_str(), "invalid" | "failed")
    }
}

impl StFile {
    fn position(&self) -> Option<u32> {
        u32::try_from(self.index).ok()
    }

    fn has_link(&self) -> bool {
        self.link.as_deref().is_some_and(|link| !link.is_empty())
    }
}

// ==================== Adapter ====================

/// StremThru adapter.
pub struct StremThru {
    http: ProviderHttp,
    known_cached: KnownCached,
    magnets: Arc<MagnetBuilder>,
}

impl std::fmt::Debug for StremThru {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StremThru")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}

impl StremThru {
    /// Creates the adapter; instances come from each credential.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ClientUnavailable`] if the HTTP client cannot be built.
    pub fn new(context: &AdapterContext) -> Result<Self, ProviderError> {
        Self::with_base_url(context, DEFAULT_BASE_URL)
    }

    /// Creates the adapter with a custom fallback instance (for testing with wiremock).
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

    fn endpoint(&self, conf: &StremThruConf, path: &str, query: &[(&str, &str)]) -> Result<Url, ProviderError> {
        if conf.url.is_empty() {
            return self.http.endpoint(path, query);
        }
        let raw = format!("{}/{}", conf.url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|error| {
            ProviderError::invalid_credential(KEY, format!("invalid instance URL '{}': {error}", conf.url))
        })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Unwraps `{ data }` or turns `{ error: { code } }` into [`ProviderError::Api`].
    fn unwrap_envelope<T: DeserializeOwned>(response: ApiResponse) -> Result<Option<T>, ProviderError> {
        match serde_json::from_str::<StEnvelope<T>>(&response.body) {
            Ok(StEnvelope { error: Some(error), .. }) => Err(ProviderError::api(KEY, error.code, error.message)),
            _ if !response.is_success() => Err(response.into_status_error(KEY)),
            Ok(envelope) => Ok(envelope.data),
            Err(error) => Err(ProviderError::unexpected(KEY, format!("envelope did not decode: {error}"))),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        conf: &StremThruConf,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = self.endpoint(conf, path, query)?;
        let response = self
            .http
            .execute(|client| conf.authorize(client.get(url.clone())))
            .await?;
        Self::unwrap_envelope(response)?
            .ok_or_else(|| ProviderError::unexpected(KEY, format!("{path} returned no data")))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        conf: &StremThruConf,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = self.endpoint(conf, path, query)?;
        let response = self
            .http
            .execute(|client| conf.authorize(client.post(url.clone())).json(body))
            .await?;
        Self::unwrap_envelope(response)?
            .ok_or_else(|| ProviderError::unexpected(KEY, format!("{path} returned no data")))
    }

    async fn list_magnets(&self, conf: &StremThruConf) -> Result<Vec<StMagnet>, ProviderError> {
        let list: StList<StMagnet> = self.get(conf, "v0/store/magnets", &[]).await?;
        Ok(list.items)
    }

    async fn magnet(&self, conf: &StremThruConf, id: &str) -> Result<StMagnet, ProviderError> {
        self.get(conf, &format!("v0/store/magnets/{id}"), &[]).await
    }

    async fn remove_magnet(&self, conf: &StremThruConf, id: &str) -> Result<(), ProviderError> {
        let url = self.endpoint(conf, &format!("v0/store/magnets/{id}"), &[])?;
        let response = self
            .http
            .execute(|client| conf.authorize(client.delete(url.clone())))
            .await?;
        Self::unwrap_envelope::<serde_json::Value>(response).map(|_| ())
    }

    async fn create_magnet(
        &self,
        conf: &StremThruConf,
        info_hash: &str,
        client_ip: Option<&str>,
    ) -> Result<StMagnet, ProviderError> {
        let magnet = self.magnets.magnet_link(info_hash).await;
        let query: Vec<(&str, &str)> = client_ip.map(|ip| ("client_ip", ip)).into_iter().collect();
        let added: StMagnet = self
            .post(conf, "v0/store/magnets", &query, &AddMagnetRequest { magnet: &magnet })
            .await?;
        self.magnet(conf, &added.id).await
    }

    async fn find_or_create(
        &self,
        conf: &StremThruConf,
        info_hash: &str,
        client_ip: Option<&str>,
    ) -> Result<StMagnet, ProviderError> {
        let found: Vec<StMagnet> = self
            .list_magnets(conf)
            .await?
            .into_iter()
            .filter(|magnet| magnet.hash.eq_ignore_ascii_case(info_hash))
            .collect();
        match pick_existing(found, StMagnet::is_error, |_| 0) {
            Some(existing) => self.magnet(conf, &existing.id).await,
            None => self.create_magnet(conf, info_hash, client_ip).await,
        }
    }

    /// Removes the oldest in-progress magnet, then submits once more.
    async fn free_slot_and_retry(
        &self,
        conf: &StremThruConf,
        request: &ResolutionRequest,
    ) -> Result<ResolveOutcome, ProviderError> {
        let magnets = self.list_magnets(conf).await?;
        // Listing is newest first.
        let Some(oldest) = magnets.iter().rev().find(|magnet| magnet.is_downloading()) else {
            return Ok(ResolveOutcome::Static(StaticOutcome::LimitsExceeded));
        };
        info!(id = %oldest.id, "removing oldest StremThru download to free a slot");
        self.remove_magnet(conf, &oldest.id).await?;
        let retried = self
            .create_magnet(conf, &request.info_hash, request.client_ip.as_deref())
            .await?;
        if retried.is_ready() {
            self.unrestrict(conf, request, &retried).await
        } else {
            Ok(ResolveOutcome::Static(StaticOutcome::FailedDownload))
        }
    }

    async fn unrestrict(
        &self,
        conf: &StremThruConf,
        request: &ResolutionRequest,
        magnet: &StMagnet,
    ) -> Result<ResolveOutcome, ProviderError> {
        let remote: Vec<RemoteFile> = magnet
            .files
            .iter()
            .map(|file| RemoteFile::new(file.position(), file.name.clone(), file.size))
            .collect();
        let file_name = request.file_name();
        let target = match files::select_target_file(&remote, request.file_index, file_name.as_deref()) {
            FileSelection::Video(chosen) => remote
                .iter()
                .position(|file| file == chosen)
                .and_then(|position| magnet.files.get(position)),
            FileSelection::OnlyArchives => return Ok(ResolveOutcome::Static(StaticOutcome::FailedRar)),
            FileSelection::NotFound => None,
        };
        let Some(link) = target.filter(|file| file.has_link()).and_then(|file| file.link.as_deref()) else {
            return Err(ProviderError::file_not_found(KEY, &request.info_hash, request.file_index));
        };

        let query: Vec<(&str, &str)> = request
            .client_ip
            .as_deref()
            .map(|ip| ("client_ip", ip))
            .into_iter()
            .collect();
        let generated: StGeneratedLink = self
            .post(conf, "v0/store/link/generate", &query, &GenerateLinkRequest { link })
            .await?;
        record_unrestricted(&self.known_cached, KEY, &request.info_hash, request.file_index, &generated.link);
        Ok(ResolveOutcome::Url(generated.link))
    }

    async fn resolve_magnet(
        &self,
        conf: &StremThruConf,
        request: &ResolutionRequest,
    ) -> Result<ResolveOutcome, ProviderError> {
        let magnet = self
            .find_or_create(conf, &request.info_hash, request.client_ip.as_deref())
            .await?;
        if magnet.is_ready() {
            return self.unrestrict(conf, request, &magnet).await;
        }
        if magnet.is_downloading() {
            return Ok(ResolveOutcome::Static(StaticOutcome::Downloading));
        }
        if magnet.status == "invalid" {
            return Ok(ResolveOutcome::Static(StaticOutcome::FailedOpening));
        }
        Err(ProviderError::torrent_failed(
            KEY,
            &request.info_hash,
            format!("unexpected magnet status '{}'", magnet.status),
        ))
    }

    async fn cached_hashes(
        &self,
        conf: &StremThruConf,
        hashes: Vec<String>,
        client_ip: Option<&str>,
    ) -> Result<HashSet<String>, ProviderError> {
        let joined = hashes.join(",");
        let mut query = vec![("magnet", joined.as_str())];
        if let Some(ip) = client_ip {
            query.push(("client_ip", ip));
        }
        let checked: StList<StMagnet> = self.get(conf, "v0/store/magnets/check", &query).await?;
        Ok(checked
            .items
            .into_iter()
            .filter(|magnet| magnet.status == "cached")
            .map(|magnet| magnet.hash.to_lowercase())
            .collect())
    }
}

#[async_trait]
impl DebridProvider for StremThru {
    fn key(&self) -> ProviderKey {
        KEY
    }

    #[instrument(skip(self, streams, credential, client_ip), fields(streams = streams.len()))]
    async fn check_availability(
        &self,
        streams: &[StreamCandidate],
        credential: &str,
        client_ip: Option<&str>,
    ) -> Result<Option<AvailabilityMap>, ProviderError> {
        let conf = StremThruConf::decode(credential)?;
        check_in_batches(
            KEY,
            &self.known_cached,
            streams,
            credential,
            streams.len(),
            |error| self.classify_error(error),
            |batch| self.cached_hashes(&conf, batch, client_ip),
        )
        .await
    }

    #[instrument(skip(self, credential))]
    async fn list_cloud_items(&self, credential: &str, offset: u32) -> Result<Vec<CloudItem>, ProviderError> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        let conf = StremThruConf::decode(credential)?;
        Ok(self
            .list_magnets(&conf)
            .await?
            .into_iter()
            .filter(StMagnet::is_ready)
            .map(|magnet| CloudItem {
                id: magnet.id,
                name: magnet.name,
                info_hash: Some(magnet.hash.to_lowercase()),
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
        let conf = StremThruConf::decode(credential)?;
        let magnet = self.magnet(&conf, item_id).await?;
        let info_hash = magnet.hash.to_lowercase();
        let files = magnet
            .files
            .iter()
            .filter(|file| files::is_video(&file.name) && file.has_link())
            .map(|file| CloudFile {
                name: file.name.clone(),
                size: file.size,
                url: deep_link(credential, &info_hash, &urlencoding::encode(&file.name), file.position()),
            })
            .collect();
        Ok(CloudItemDetail {
            id: magnet.id,
            name: magnet.name,
            info_hash: Some(info_hash),
            files,
        })
    }

    #[instrument(skip(self, request), fields(info_hash = %request.info_hash, file_index = ?request.file_index))]
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        let conf = StremThruConf::decode(&request.credential)?;
        match self.resolve_magnet(&conf, request).await {
            Err(error) if error.has_code(&[PAYMENT_REQUIRED]) => {
                info!(error = %error, "StremThru store requires payment");
                Ok(ResolveOutcome::Static(StaticOutcome::FailedAccess))
            }
            Err(error) if error.has_code(&[STORE_LIMIT_EXCEEDED]) => {
                warn!("StremThru store limit exceeded; freeing a slot");
                self.free_slot_and_retry(&conf, request).await
            }
            other => other,
        }
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        if error.has_code(&[UNAUTHORIZED])
            || error.http_status_code() == Some(401)
            || matches!(error, ProviderError::InvalidCredential { .. })
        {
            Some(CanonicalError::BadToken)
        } else if error.has_code(&[FORBIDDEN]) || error.http_status_code() == Some(403) {
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

    fn credential(auth: &str, url: &str) -> String {
        general_purpose::STANDARD.encode(format!("{auth}@{url}"))
    }

    fn ok(data: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data }))
    }

    fn failure(status: u16, code: &str) -> ResponseTemplate {
        ResponseTemplate::new(status).set_body_json(serde_json::json!({
            "error": { "code": code, "message": "rejected", "status_code": status }
        }))
    }

    fn magnet(id: &str, hash: &str, status: &str, files: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "id": id, "hash": hash, "name": "Show.S01", "status": status, "files": files })
    }

    fn request_for(server_uri: &str, hash: &str, file_index: Option<u32>) -> ResolutionRequest {
        let mut request = resolution_request(KEY, hash, file_index);
        request.credential = credential("realdebrid:rdtoken", server_uri);
        request
    }

    // ==================== Credential Tests ====================

    #[test]
    fn test_decode_store_token_credential() {
        let conf = StremThruConf::decode(&credential("torbox:abc", "https://st.example/")).unwrap();
        assert_eq!(conf.url, "https://st.example");
        assert_eq!(
            conf.auth,
            StoreAuth::Store {
                store: "torbox".to_string(),
                token: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_decode_keeps_at_signs_in_url() {
        let conf = StremThruConf::decode(&credential("cHJveHk=", "https://user@st.example")).unwrap();
        assert_eq!(conf.url, "https://user@st.example");
        assert_eq!(conf.auth, StoreAuth::Proxy("cHJveHk=".to_string()));
    }

    #[test]
    fn test_decode_rejects_junk() {
        let adapter = StremThru::new(&adapter_context()).unwrap();
        let error = StremThruConf::decode("%%%").unwrap_err();
        assert_eq!(adapter.classify_error(&error), Some(CanonicalError::BadToken));
        let no_separator = general_purpose::STANDARD.encode("justatoken");
        assert!(StremThruConf::decode(&no_separator).is_err());
    }

    #[test]
    fn test_error_mapping() {
        let adapter = StremThru::new(&adapter_context()).unwrap();
        let unauthorized = ProviderError::api(KEY, "UNAUTHORIZED", "");
        assert_eq!(adapter.classify_error(&unauthorized), Some(CanonicalError::BadToken));
        let forbidden = ProviderError::api(KEY, "FORBIDDEN", "");
        assert_eq!(adapter.classify_error(&forbidden), Some(CanonicalError::AccessDenied));
        let other = ProviderError::api(KEY, "STORE_LIMIT_EXCEEDED", "");
        assert_eq!(adapter.classify_error(&other), None);
    }

    // ==================== Adapter Tests (wiremock) ====================

    #[tokio::test]
    async fn test_resolve_downloaded_magnet_generates_link_for_index() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('a');
        let files = serde_json::json!([
            { "index": 0, "name": "Show.S01E01.mkv", "size": 900_000_000, "link": "st://l0" },
            { "index": 1, "name": "Show.S01E02.mkv", "size": 950_000_000, "link": "st://l1" },
        ]);
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets"))
            .and(header("X-StremThru-Store-Name", "realdebrid"))
            .and(header("X-StremThru-Store-Authorization", "Bearer rdtoken"))
            .respond_with(ok(serde_json::json!({ "items": [magnet("m1", &hash, "downloaded", serde_json::json!([]))] })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets/m1"))
            .respond_with(ok(magnet("m1", &hash, "downloaded", files)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v0/store/link/generate"))
            .and(query_param("client_ip", "203.0.113.7"))
            .and(body_string_contains("st://l0"))
            .respond_with(ok(serde_json::json!({ "link": "https://cdn.st/Show.S01E01.mkv" })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = StremThru::new(&adapter_context()).unwrap();
        let outcome = adapter.resolve(&request_for(&server.uri(), &hash, Some(0))).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Url("https://cdn.st/Show.S01E01.mkv".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_new_magnet_reports_downloading() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('b');
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets"))
            .respond_with(ok(serde_json::json!({ "items": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v0/store/magnets"))
            .and(body_string_contains("magnet:?xt=urn:btih:"))
            .respond_with(ok(magnet("m2", &hash, "queued", serde_json::json!([]))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets/m2"))
            .respond_with(ok(magnet("m2", &hash, "downloading", serde_json::json!([]))))
            .mount(&server)
            .await;

        let adapter = StremThru::new(&adapter_context()).unwrap();
        let outcome = adapter.resolve(&request_for(&server.uri(), &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Static(StaticOutcome::Downloading));
    }

    #[tokio::test]
    async fn test_invalid_magnet_is_failed_opening() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('c');
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets"))
            .respond_with(ok(serde_json::json!({ "items": [magnet("m3", &hash, "invalid", serde_json::json!([]))] })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets/m3"))
            .respond_with(ok(magnet("m3", &hash, "invalid", serde_json::json!([]))))
            .mount(&server)
            .await;

        let adapter = StremThru::new(&adapter_context()).unwrap();
        let outcome = adapter.resolve(&request_for(&server.uri(), &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Static(StaticOutcome::FailedOpening));
    }

    #[tokio::test]
    async fn test_store_limit_removes_oldest_download_and_retries() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let hash = info_hash('d');
        let files = serde_json::json!([{ "index": 0, "name": "Movie.mkv", "size": 900_000_000, "link": "st://movie" }]);
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets"))
            .respond_with(ok(serde_json::json!({ "items": [
                magnet("new", &info_hash('e'), "downloading", serde_json::json!([])),
                magnet("old", &info_hash('f'), "downloading", serde_json::json!([])),
            ] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v0/store/magnets"))
            .respond_with(failure(429, "STORE_LIMIT_EXCEEDED"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v0/store/magnets/old"))
            .respond_with(ok(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v0/store/magnets"))
            .respond_with(ok(magnet("m4", &hash, "downloaded", serde_json::json!([]))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets/m4"))
            .respond_with(ok(magnet("m4", &hash, "downloaded", files)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v0/store/link/generate"))
            .respond_with(ok(serde_json::json!({ "link": "https://cdn.st/Movie.mkv" })))
            .mount(&server)
            .await;

        let adapter = StremThru::new(&adapter_context()).unwrap();
        let outcome = adapter.resolve(&request_for(&server.uri(), &hash, None)).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Url("https://cdn.st/Movie.mkv".to_string()));
    }

    #[tokio::test]
    async fn test_check_availability_reads_cached_status() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let cached = info_hash('a');
        let missing = info_hash('b');
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets/check"))
            .and(query_param("magnet", format!("{cached},{missing}").as_str()))
            .respond_with(ok(serde_json::json!({ "items": [
                { "hash": cached, "status": "cached", "files": [] },
                { "hash": missing, "status": "unknown", "files": [] },
            ] })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = StremThru::new(&adapter_context()).unwrap();
        let token = credential("alldebrid:adtoken", &server.uri());
        let streams: Vec<StreamCandidate> = [&cached, &missing]
            .into_iter()
            .map(|hash| StreamCandidate {
                info_hash: hash.clone(),
                file_index: Some(0),
                title: "Movie\nMovie.mkv".to_string(),
                size: None,
                seeders: Some(5),
            })
            .collect();
        let map = adapter
            .check_availability(&streams, &token, None)
            .await
            .unwrap()
            .unwrap();
        assert!(map[&format!("{cached}@0")].cached);
        assert_eq!(map[&format!("{cached}@0")].url, format!("{token}/{cached}/Movie.mkv/0"));
        assert!(!map[&format!("{missing}@0")].cached);
    }

    #[tokio::test]
    async fn test_unauthorized_check_propagates_as_bad_token() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/v0/store/magnets/check"))
            .respond_with(failure(401, "UNAUTHORIZED"))
            .mount(&server)
            .await;

        let adapter = StremThru::new(&adapter_context()).unwrap();
        let streams = vec![StreamCandidate {
            info_hash: info_hash('c'),
            file_index: None,
            title: "Movie.mkv".to_string(),
            size: None,
            seeders: None,
        }];
        let error = adapter
            .check_availability(&streams, &credential("torbox:bad", &server.uri()), None)
            .await
            .unwrap_err();
        assert_eq!(adapter.classify_error(&error), Some(CanonicalError::BadToken));
    }
}
