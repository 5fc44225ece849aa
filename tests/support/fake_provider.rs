//! Scriptable in-process provider adapter counting its invocations.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use debrid_core::debrid::{
    AvailabilityEntry, AvailabilityMap, CanonicalError, CloudItem, CloudItemDetail, DebridProvider,
    ProviderError, ProviderKey, ResolutionRequest, ResolveOutcome, StreamCandidate, deep_link,
};
use debrid_core::StaticOutcome;

/// Error codes the fake classifies as canonical.
pub const BAD_TOKEN: &str = "bad_token";
pub const ACCESS_DENIED: &str = "access_denied";
pub const ACCESS_BLOCKED: &str = "access_blocked";

/// What `resolve` does.
#[derive(Debug, Clone)]
pub enum Behavior {
    Url(String),
    Static(StaticOutcome),
    Fail(&'static str),
    Hang,
}

#[derive(Debug)]
pub struct FakeProvider {
    key: ProviderKey,
    behavior: Behavior,
    delay: Duration,
    cached: HashSet<String>,
    availability_error: Option<&'static str>,
    resolves: AtomicUsize,
    availability_checks: AtomicUsize,
    last_request: Mutex<Option<ResolutionRequest>>,
}

impl FakeProvider {
    pub fn new(key: ProviderKey, behavior: Behavior) -> Self {
        Self {
            key,
            behavior,
            delay: Duration::ZERO,
            cached: HashSet::new(),
            availability_error: None,
            resolves: AtomicUsize::new(0),
            availability_checks: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cached(mut self, hashes: &[&str]) -> Self {
        self.cached = hashes.iter().map(|hash| (*hash).to_string()).collect();
        self
    }

    pub fn with_availability_error(mut self, code: &'static str) -> Self {
        self.availability_error = Some(code);
        self
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn availability_checks(&self) -> usize {
        self.availability_checks.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ResolutionRequest> {
        self.last_request.lock().expect("request lock").clone()
    }
}

#[async_trait]
impl DebridProvider for FakeProvider {
    fn key(&self) -> ProviderKey {
        self.key
    }

    async fn check_availability(
        &self,
        streams: &[StreamCandidate],
        credential: &str,
        _client_ip: Option<&str>,
    ) -> Result<Option<AvailabilityMap>, ProviderError> {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.availability_error {
            return Err(ProviderError::api(self.key, code, "availability refused"));
        }
        Ok(Some(
            streams
                .iter()
                .map(|stream| {
                    let entry = AvailabilityEntry {
                        url: deep_link(
                            credential,
                            &stream.info_hash,
                            &stream.file_name_hint(),
                            stream.file_index,
                        ),
                        cached: self.cached.contains(&stream.info_hash),
                    };
                    (stream.key(), entry)
                })
                .collect(),
        ))
    }

    async fn list_cloud_items(
        &self,
        _credential: &str,
        offset: u32,
    ) -> Result<Vec<CloudItem>, ProviderError> {
        if let Behavior::Fail(code) = self.behavior {
            return Err(ProviderError::api(self.key, code, "catalog refused"));
        }
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(vec![CloudItem {
            id: "item-1".to_string(),
            name: "Movie".to_string(),
            info_hash: None,
            size: Some(1024),
        }])
    }

    async fn get_item_detail(
        &self,
        item_id: &str,
        _credential: &str,
        _client_ip: Option<&str>,
    ) -> Result<CloudItemDetail, ProviderError> {
        Err(ProviderError::unexpected(self.key, format!("no item {item_id}")))
    }

    async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolveOutcome, ProviderError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().expect("request lock") = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::Url(url) => Ok(ResolveOutcome::Url(url.clone())),
            Behavior::Static(outcome) => Ok(ResolveOutcome::Static(*outcome)),
            Behavior::Fail(code) => Err(ProviderError::api(self.key, *code, "provider refused")),
            Behavior::Hang => std::future::pending().await,
        }
    }

    fn classify_error(&self, error: &ProviderError) -> Option<CanonicalError> {
        match error.api_code()? {
            BAD_TOKEN => Some(CanonicalError::BadToken),
            ACCESS_DENIED => Some(CanonicalError::AccessDenied),
            ACCESS_BLOCKED => Some(CanonicalError::AccessBlocked),
            _ => None,
        }
    }
}
