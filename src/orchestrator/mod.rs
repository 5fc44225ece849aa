//! Resolution orchestrator: validates a request, short-circuits blacklisted
//! credentials and routes the provider call through the per-provider dedup
//! queue, the two-tier cache and a hard timeout.
//!
//! Never log a [`ResolutionKey`] or credential verbatim; use
//! [`credential_fingerprint`] for correlation.

pub mod availability;
pub mod blacklist;
pub mod options;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Tier, TwoTierCache};
use crate::debrid::{
    CanonicalError, CloudItem, CloudItemDetail, DebridProvider, ProviderError, ProviderKey,
    ProviderRegistry, ResolutionKey, ResolutionRequest, ResolveOutcome, credential_fingerprint,
};
use crate::outcome::StaticOutcome;
use crate::queue::{DEFAULT_QUEUE_CONCURRENCY, DedupQueue, QueueError};

pub use availability::{
    AvailabilityChecker, DebridStream, ProviderReport, StreamKind, merge_availability,
};
pub use blacklist::CredentialBlacklist;
pub use options::{DEBRID_OPTIONS_KEY, DebridOptions};

/// Default ceiling for one orchestrated resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Durable TTL of a resolved URL.
pub const RESOLVED_URL_DURABLE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Memory TTL of a resolved URL.
pub const RESOLVED_URL_MEMORY_TTL: Duration = Duration::from_secs(30 * 60);

/// TTL of a static outcome in both tiers.
pub const STATIC_OUTCOME_TTL: Duration = Duration::from_secs(60);

const RESOLVED_KEY_PREFIX: &str = "resolved";

type QueuedResolve = Result<ResolveOutcome, ProviderError>;

/// Orchestrator failures answered without a redirect.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A required request field is missing.
    #[error("invalid resolution request: {0}\n  Suggestion: Regenerate the stream link")]
    Validation(String),

    /// No adapter is registered for the provider.
    #[error("provider '{0}' is not available on this resolver")]
    UnknownProvider(ProviderKey),

    /// The dedup queue lost the in-flight operation.
    #[error("resolution could not complete: {0}")]
    Queue(#[from] QueueError),
}

/// Tunables for [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Ceiling for one resolution before a placeholder is returned.
    pub resolve_timeout: Duration,
    /// Concurrent operations per provider queue.
    pub queue_concurrency: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
        }
    }
}

/// A finished resolution: the outcome and where to redirect the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// What the provider produced.
    pub outcome: ResolveOutcome,
    /// Redirect target: the URL itself, or the placeholder under the caller's host.
    pub location: String,
}

impl Resolution {
    fn new(outcome: ResolveOutcome, host: &str) -> Self {
        let location = match &outcome {
            ResolveOutcome::Url(url) => url.clone(),
            ResolveOutcome::Static(outcome) => outcome.url(host),
        };
        Self { outcome, location }
    }

    fn placeholder(outcome: StaticOutcome, host: &str) -> Self {
        Self::new(ResolveOutcome::Static(outcome), host)
    }
}

/// Cache lifetime of a resolve outcome in `tier`.
///
/// Static outcomes (including `Downloading`) live briefly so a finished
/// download is picked up on the next attempt.
#[must_use]
pub fn resolution_ttl(outcome: &ResolveOutcome, tier: Tier) -> Option<Duration> {
    Some(match (outcome, tier) {
        (ResolveOutcome::Url(_), Tier::Durable) => RESOLVED_URL_DURABLE_TTL,
        (ResolveOutcome::Url(_), Tier::Memory) => RESOLVED_URL_MEMORY_TTL,
        (ResolveOutcome::Static(_), _) => STATIC_OUTCOME_TTL,
    })
}

/// Resolution orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    registry: ProviderRegistry,
    cache: TwoTierCache,
    blacklist: CredentialBlacklist,
    queues: Arc<HashMap<ProviderKey, DedupQueue<QueuedResolve>>>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("cache_enabled", &self.cache.is_enabled())
            .field("blacklisted", &self.blacklist.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over `registry`, with one dedup queue per provider.
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        cache: TwoTierCache,
        blacklist: CredentialBlacklist,
        settings: OrchestratorSettings,
    ) -> Self {
        let queues = ProviderKey::ALL
            .into_iter()
            .map(|key| (key, DedupQueue::new(key.as_str(), settings.queue_concurrency)))
            .collect();
        Self {
            registry,
            cache,
            blacklist,
            queues: Arc::new(queues),
            settings,
        }
    }

    /// Shared credential blacklist.
    #[must_use]
    pub fn blacklist(&self) -> &CredentialBlacklist {
        &self.blacklist
    }

    /// Availability checker sharing this orchestrator's adapters and blacklist.
    #[must_use]
    pub fn availability_checker(&self, host: impl Into<String>) -> AvailabilityChecker {
        AvailabilityChecker::new(self.registry.clone(), self.blacklist.clone(), host)
    }

    /// Resolves `request` to a redirect location.
    ///
    /// Provider failures never surface as errors: canonical conditions map to
    /// their placeholder and anything else to `FailedUnexpected`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] for invalid requests, providers without an
    /// adapter, and lost queue operations.
    #[instrument(
        skip(self, request),
        fields(
            provider = %request.provider,
            credential = %credential_fingerprint(&request.credential),
            info_hash = %request.info_hash,
            file_index = ?request.file_index
        )
    )]
    pub async fn resolve(&self, request: ResolutionRequest) -> Result<Resolution, OrchestratorError> {
        validate(&request)?;
        let adapter = self
            .registry
            .get(request.provider)
            .ok_or(OrchestratorError::UnknownProvider(request.provider))?;

        if self.blacklist.contains(request.provider, &request.credential) {
            debug!("credential blacklisted; skipping provider");
            return Ok(Resolution::placeholder(StaticOutcome::FailedAccess, &request.host));
        }

        let queue = self
            .queues
            .get(&request.provider)
            .ok_or(OrchestratorError::UnknownProvider(request.provider))?;
        let key = request.key();
        let operation = timed_resolve(
            Arc::clone(&adapter),
            self.cache.clone(),
            key.clone(),
            request.clone(),
            self.settings.resolve_timeout,
        );
        let result = queue.wrap(key.as_str(), operation).await?;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => self.outcome_for_error(adapter.as_ref(), &request, &error),
        };
        if let ResolveOutcome::Static(outcome) = &outcome {
            info!(outcome = %outcome, "resolved to placeholder");
        }
        Ok(Resolution::new(outcome, &request.host))
    }

    /// Lists cloud items through `provider`.
    ///
    /// # Errors
    ///
    /// Returns the adapter error, after blacklisting a rejected credential.
    pub async fn list_cloud_items(
        &self,
        provider: ProviderKey,
        credential: &str,
        offset: u32,
    ) -> Result<Vec<CloudItem>, CatalogError> {
        let adapter = self.catalog_adapter(provider, credential)?;
        adapter
            .list_cloud_items(credential, offset)
            .await
            .map_err(|error| self.catalog_error(adapter.as_ref(), credential, error))
    }

    /// Fetches one cloud item with its files through `provider`.
    ///
    /// # Errors
    ///
    /// Returns the adapter error, after blacklisting a rejected credential.
    pub async fn get_item_detail(
        &self,
        provider: ProviderKey,
        item_id: &str,
        credential: &str,
        client_ip: Option<&str>,
    ) -> Result<CloudItemDetail, CatalogError> {
        let adapter = self.catalog_adapter(provider, credential)?;
        adapter
            .get_item_detail(item_id, credential, client_ip)
            .await
            .map_err(|error| self.catalog_error(adapter.as_ref(), credential, error))
    }

    fn catalog_adapter(
        &self,
        provider: ProviderKey,
        credential: &str,
    ) -> Result<Arc<dyn DebridProvider>, CatalogError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or(CatalogError::UnknownProvider(provider))?;
        if self.blacklist.contains(provider, credential) {
            return Err(CatalogError::Rejected(provider, CanonicalError::BadToken));
        }
        Ok(adapter)
    }

    fn catalog_error(
        &self,
        adapter: &dyn DebridProvider,
        credential: &str,
        error: ProviderError,
    ) -> CatalogError {
        match adapter.classify_error(&error) {
            Some(canonical) => {
                if canonical == CanonicalError::BadToken {
                    self.blacklist.insert(adapter.key(), credential);
                }
                CatalogError::Rejected(adapter.key(), canonical)
            }
            None => CatalogError::Provider(error),
        }
    }

    fn outcome_for_error(
        &self,
        adapter: &dyn DebridProvider,
        request: &ResolutionRequest,
        error: &ProviderError,
    ) -> ResolveOutcome {
        let outcome = match adapter.classify_error(error) {
            Some(CanonicalError::BadToken) => {
                self.blacklist.insert(request.provider, &request.credential);
                StaticOutcome::FailedAccess
            }
            Some(CanonicalError::AccessDenied) => StaticOutcome::FailedAccess,
            Some(CanonicalError::AccessBlocked) => StaticOutcome::BlockedAccess,
            None => {
                warn!(error = %error, "provider resolve failed");
                StaticOutcome::FailedUnexpected
            }
        };
        ResolveOutcome::Static(outcome)
    }
}

/// Catalog failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No adapter is registered for the provider.
    #[error("provider '{0}' is not available on this resolver")]
    UnknownProvider(ProviderKey),

    /// The provider refused the credential.
    #[error("{0} refused the credential: {1}")]
    Rejected(ProviderKey, CanonicalError),

    /// Any other provider failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn validate(request: &ResolutionRequest) -> Result<(), OrchestratorError> {
    if request.credential.trim().is_empty() {
        return Err(OrchestratorError::Validation("missing credential".to_string()));
    }
    if request.info_hash.trim().is_empty() {
        return Err(OrchestratorError::Validation("missing info hash".to_string()));
    }
    // `null` addresses a cloud file by reference rather than by torrent.
    if request.info_hash != "null" && !is_info_hash(&request.info_hash) {
        return Err(OrchestratorError::Validation(format!(
            "malformed info hash '{}'",
            request.info_hash
        )));
    }
    if request.file_name_hint.trim().is_empty() {
        return Err(OrchestratorError::Validation("missing file name".to_string()));
    }
    Ok(())
}

/// 40 hex characters.
fn is_info_hash(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// Cache-wrapped adapter call bounded by `timeout`.
///
/// The provider call runs on its own task: after a timeout it keeps going and
/// may still populate the cache for the next attempt.
async fn timed_resolve(
    adapter: Arc<dyn DebridProvider>,
    cache: TwoTierCache,
    key: ResolutionKey,
    request: ResolutionRequest,
    timeout: Duration,
) -> QueuedResolve {
    let provider = adapter.key();
    let task = tokio::spawn(async move {
        let cache_key = format!("{RESOLVED_KEY_PREFIX}|{}", key.as_str());
        cache
            .wrap(&cache_key, || adapter.resolve(&request), resolution_ttl)
            .await
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(ProviderError::unexpected(
            provider,
            format!("resolve task failed: {join_error}"),
        )),
        Err(_) => {
            warn!(provider = %provider, timeout_secs = timeout.as_secs(), "resolution timed out");
            Ok(ResolveOutcome::Static(StaticOutcome::FailedUnexpected))
        }
    }
}
