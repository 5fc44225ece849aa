//! Debrid provider adapters behind one capability contract.
//!
//! # Architecture
//!
//! - [`DebridProvider`] - async trait every provider adapter implements
//! - [`ProviderRegistry`] - provider key to adapter lookup table built at startup
//! - [`ProviderError`] / [`CanonicalError`] - raw and canonical error layers
//! - [`ProviderHttp`] - shared client policy with transient retries
//! - [`files`] - video/archive detection and target file selection
//! - [`poll`] - bounded poll loop used while a remote torrent settles
//!
//! One module per provider: [`RealDebrid`], [`Premiumize`], [`AllDebrid`],
//! [`DebridLink`], [`Offcloud`], [`TorBox`], [`EasyDebrid`], [`Putio`],
//! [`StremThru`].

mod alldebrid;
mod debridlink;
mod easydebrid;
mod error;
pub mod files;
mod http_client;
mod offcloud;
pub mod poll;
mod premiumize;
mod putio;
mod realdebrid;
mod registry;
mod retry;
mod stremthru;
mod torbox;
mod utils;

pub use alldebrid::AllDebrid;
pub use debridlink::DebridLink;
pub use easydebrid::EasyDebrid;
pub use error::{CanonicalError, ProviderError};
pub use http_client::{
    ApiResponse, ProviderHttp, ProviderHttpSettings, build_provider_http_client, form_body,
};
pub use offcloud::Offcloud;
pub use premiumize::Premiumize;
pub use putio::Putio;
pub use realdebrid::RealDebrid;
pub use registry::{ProviderRegistry, build_default_provider_registry};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after,
};
pub use stremthru::StremThru;
pub use torbox::TorBox;
pub use utils::CachedStreams;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::KnownCached;
use crate::magnet::MagnetBuilder;
use crate::outcome::StaticOutcome;

/// Closed set of supported debrid providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKey {
    /// Real-Debrid.
    RealDebrid,
    /// Premiumize.
    Premiumize,
    /// AllDebrid.
    AllDebrid,
    /// Debrid-Link.
    DebridLink,
    /// Offcloud.
    Offcloud,
    /// TorBox.
    TorBox,
    /// EasyDebrid.
    EasyDebrid,
    /// Put.io.
    Putio,
    /// StremThru proxy in front of another store.
    StremThru,
}

impl ProviderKey {
    /// Every provider, in registry order.
    pub const ALL: [Self; 9] = [
        Self::RealDebrid,
        Self::Premiumize,
        Self::AllDebrid,
        Self::DebridLink,
        Self::EasyDebrid,
        Self::Offcloud,
        Self::TorBox,
        Self::Putio,
        Self::StremThru,
    ];

    /// URL path key, e.g. `realdebrid`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RealDebrid => "realdebrid",
            Self::Premiumize => "premiumize",
            Self::AllDebrid => "alldebrid",
            Self::DebridLink => "debridlink",
            Self::Offcloud => "offcloud",
            Self::TorBox => "torbox",
            Self::EasyDebrid => "easydebrid",
            Self::Putio => "putio",
            Self::StremThru => "stremthru",
        }
    }

    /// Short label used in stream names, e.g. `RD`.
    #[must_use]
    pub fn short_name(self) -> &'static str {
        match self {
            Self::RealDebrid => "RD",
            Self::Premiumize => "PM",
            Self::AllDebrid => "AD",
            Self::DebridLink => "DL",
            Self::Offcloud => "OC",
            Self::TorBox => "TB",
            Self::EasyDebrid => "ED",
            Self::Putio => "Putio",
            Self::StremThru => "ST",
        }
    }

    /// Display name.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::RealDebrid => "RealDebrid",
            Self::Premiumize => "Premiumize",
            Self::AllDebrid => "AllDebrid",
            Self::DebridLink => "DebridLink",
            Self::Offcloud => "Offcloud",
            Self::TorBox => "TorBox",
            Self::EasyDebrid => "EasyDebrid",
            Self::Putio => "Put.io",
            Self::StremThru => "StremThru",
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown provider key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown debrid provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKey {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownProvider(value.to_string()))
    }
}

/// A torrent file offered to the user, as produced by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCandidate {
    /// 40-hex-char torrent info hash (lowercase).
    pub info_hash: String,
    /// Index of the file inside the torrent, when known.
    pub file_index: Option<u32>,
    /// Display title: file name line, then a seeders line and anything after it.
    pub title: String,
    /// Size of the file in bytes, when known.
    pub size: Option<u64>,
    /// Seeder count, when known.
    pub seeders: Option<u32>,
}

#[allow(clippy::expect_used)]
static SEEDERS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\n👤.*").expect("seeders regex is valid") // Static pattern, safe to panic
});

impl StreamCandidate {
    /// Identity of the candidate inside one availability batch: `{infoHash}@{fileIndex}`.
    #[must_use]
    pub fn key(&self) -> String {
        stream_key(&self.info_hash, self.file_index)
    }

    /// Percent-encoded file name derived from the title.
    ///
    /// The seeders line is stripped and the last remaining line is used. For
    /// multi-line titles only the part after the last `/` is kept.
    #[must_use]
    pub fn file_name_hint(&self) -> String {
        let title = SEEDERS_LINE.replace_all(&self.title, "");
        let lines: Vec<&str> = title.lines().collect();
        let last = lines.last().copied().unwrap_or_default();
        let name = if lines.len() > 1 {
            last.rsplit('/').next().unwrap_or(last)
        } else {
            last
        };
        urlencoding::encode(name.trim()).into_owned()
    }
}

/// Availability map key for `(info_hash, file_index)`.
#[must_use]
pub fn stream_key(info_hash: &str, file_index: Option<u32>) -> String {
    match file_index {
        Some(index) => format!("{info_hash}@{index}"),
        None => format!("{info_hash}@none"),
    }
}

/// Provider-relative deep link: `{credential}/{infoHash}/{encodedFileName}/{fileIndex}`.
///
/// Prefixed with `{host}/{provider}/` it addresses the resolution endpoint.
#[must_use]
pub fn deep_link(credential: &str, info_hash: &str, encoded_file_name: &str, file_index: Option<u32>) -> String {
    let index = file_index.map_or_else(|| "null".to_string(), |i| i.to_string());
    let name = if encoded_file_name.is_empty() {
        "null"
    } else {
        encoded_file_name
    };
    format!("{credential}/{info_hash}/{name}/{index}")
}

/// One resolution request, built per incoming redirect request.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    /// Provider to resolve through.
    pub provider: ProviderKey,
    /// Opaque provider credential.
    pub credential: String,
    /// Torrent info hash (lowercase).
    pub info_hash: String,
    /// Explicit file index inside the torrent.
    pub file_index: Option<u32>,
    /// Percent-encoded file name hint.
    pub file_name_hint: String,
    /// Caller IP, forwarded to providers that restrict links by IP.
    pub client_ip: Option<String>,
    /// Public host used for placeholder URLs.
    pub host: String,
    /// Whether the caller is a web browser.
    pub is_browser: bool,
}

impl fmt::Debug for ResolutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionRequest")
            .field("provider", &self.provider)
            .field("credential", &credential_fingerprint(&self.credential))
            .field("info_hash", &self.info_hash)
            .field("file_index", &self.file_index)
            .field("file_name_hint", &self.file_name_hint)
            .field("client_ip", &self.client_ip)
            .field("host", &self.host)
            .field("is_browser", &self.is_browser)
            .finish()
    }
}

impl ResolutionRequest {
    /// Deterministic identity: `clientIp|provider|credential|infoHash|fileIndex`.
    #[must_use]
    pub fn key(&self) -> ResolutionKey {
        ResolutionKey::new(
            self.client_ip.as_deref(),
            self.provider,
            &self.credential,
            &self.info_hash,
            self.file_index,
        )
    }

    /// Decoded file name hint, or `None` when the hint carries no name.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        let decoded = urlencoding::decode(&self.file_name_hint).ok()?;
        let decoded = decoded.trim();
        if decoded.is_empty() || decoded == "null" || decoded == "undefined" {
            return None;
        }
        Some(decoded.to_string())
    }
}

/// Identity of a resolution for both the cache and the dedup queue.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey(String);

impl ResolutionKey {
    /// Builds the key from its parts.
    #[must_use]
    pub fn new(
        client_ip: Option<&str>,
        provider: ProviderKey,
        credential: &str,
        info_hash: &str,
        file_index: Option<u32>,
    ) -> Self {
        let index = file_index.map_or_else(|| "none".to_string(), |i| i.to_string());
        Self(format!(
            "{}|{provider}|{credential}|{info_hash}|{index}",
            client_ip.unwrap_or_default()
        ))
    }

    /// Raw key string. Contains the credential; never log it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResolutionKey({})", credential_fingerprint(&self.0))
    }
}

/// Short SHA-256 fingerprint for logging secrets.
#[must_use]
pub fn credential_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{digest:x}").chars().take(12).collect()
}

/// Result of a provider resolve: a playable URL or a placeholder outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// Directly fetchable media URL.
    Url(String),
    /// Expected terminal state without a link.
    Static(StaticOutcome),
}

/// Per-candidate availability answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityEntry {
    /// Provider-relative deep link (see [`deep_link`]).
    pub url: String,
    /// Whether the provider holds a ready copy.
    pub cached: bool,
}

/// Availability answers keyed by [`StreamCandidate::key`].
pub type AvailabilityMap = HashMap<String, AvailabilityEntry>;

/// An item already present in the user's provider cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudItem {
    /// Provider-side identifier.
    pub id: String,
    /// Item name.
    pub name: String,
    /// Info hash, when the provider exposes it.
    pub info_hash: Option<String>,
    /// Total size in bytes, when known.
    pub size: Option<u64>,
}

/// Detail of a cloud item with its playable files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudItemDetail {
    /// Provider-side identifier.
    pub id: String,
    /// Item name.
    pub name: String,
    /// Info hash, when the provider exposes it.
    pub info_hash: Option<String>,
    /// Video files of the item.
    pub files: Vec<CloudFile>,
}

/// One playable file of a cloud item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFile {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Provider-relative deep link or direct URL.
    pub url: String,
}

/// Collaborators shared by every adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Network settings for provider clients.
    pub http: ProviderHttpSettings,
    /// Known-cached store fed after successful unrestrictions.
    pub known_cached: KnownCached,
    /// Magnet construction with tracker enrichment.
    pub magnets: Arc<MagnetBuilder>,
}

/// Capability contract implemented by every debrid provider adapter.
///
/// Uses `async_trait` so registries can hold `Box<dyn DebridProvider>`.
///
/// Canonical conditions (bad token, access denied, blocked) are raised as
/// [`ProviderError`]s and recognized with [`classify_error`](Self::classify_error).
/// Expected terminal states are returned as [`ResolveOutcome::Static`].
#[async_trait]
pub trait DebridProvider: Send + Sync {
    /// The provider this adapter serves.
    fn key(&self) -> ProviderKey;

    /// Reports, per candidate, a deep link and whether the provider has it cached.
    ///
    /// Returns `Ok(None)` when the batch check fails for a non-authentication
    /// reason. Authentication failures are returned as errors.
    async fn check_availability(
        &self,
        streams: &[StreamCandidate],
        credential: &str,
        client_ip: Option<&str>,
    ) -> Result<Option<AvailabilityMap>, ProviderError>;

    /// Lists ready items in the user's cloud. Past the end an empty page is returned.
    async fn list_cloud_items(
        &self,
        credential: &str,
        offset: u32,
    ) -> Result<Vec<CloudItem>, ProviderError>;

    /// Returns an item with its playable files.
    async fn get_item_detail(
        &self,
        item_id: &str,
        credential: &str,
        client_ip: Option<&str>,
    ) -> Result<CloudItemDetail, ProviderError>;

    /// Drives the remote torrent lifecycle to a playable URL or static outcome.
    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError>;

    /// Translates a raw error into a canonical one. Pure.
    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError>;
}
