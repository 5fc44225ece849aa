//! Helpers shared by in-crate unit tests.

pub mod socket_guard;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::KnownCached;
use crate::debrid::{AdapterContext, ProviderHttpSettings};
use crate::magnet::MagnetBuilder;
use crate::repository::InMemoryTorrentRepository;

/// Adapter collaborators for mock-server tests: no retries, no cache, empty catalog.
pub fn adapter_context() -> AdapterContext {
    AdapterContext {
        http: ProviderHttpSettings {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            retry_attempts: 1,
        },
        known_cached: KnownCached::default(),
        magnets: Arc::new(MagnetBuilder::new(Arc::new(InMemoryTorrentRepository::new()))),
    }
}

/// A 40-char info hash built from `seed`.
pub fn info_hash(seed: char) -> String {
    seed.to_string().repeat(40)
}

/// A resolution request against `provider` with credential `tok`.
pub fn resolution_request(
    provider: crate::debrid::ProviderKey,
    info_hash: &str,
    file_index: Option<u32>,
) -> crate::debrid::ResolutionRequest {
    crate::debrid::ResolutionRequest {
        provider,
        credential: "tok".to_string(),
        info_hash: info_hash.to_string(),
        file_index,
        file_name_hint: "null".to_string(),
        client_ip: Some("203.0.113.7".to_string()),
        host: "resolver.test".to_string(),
        is_browser: false,
    }
}
