//! In-memory blacklist of credentials a provider rejected as bad tokens.
//!
//! Process-local: a restart forgets every entry.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::warn;

use crate::debrid::{ProviderKey, credential_fingerprint};

/// Credentials known to be rejected, keyed by `(provider, credential)`.
#[derive(Debug, Clone, Default)]
pub struct CredentialBlacklist {
    entries: Arc<DashSet<(ProviderKey, String)>>,
}

impl CredentialBlacklist {
    /// Creates an empty blacklist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blacklists `credential` for `provider`.
    pub fn insert(&self, provider: ProviderKey, credential: &str) {
        if self.entries.insert((provider, credential.to_string())) {
            warn!(
                provider = %provider,
                credential = %credential_fingerprint(credential),
                "blacklisted rejected credential"
            );
        }
    }

    /// True when `credential` is blacklisted for `provider`.
    #[must_use]
    pub fn contains(&self, provider: ProviderKey, credential: &str) -> bool {
        self.entries.contains(&(provider, credential.to_string()))
    }

    /// Number of blacklisted credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is blacklisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
