//! Provider registry: provider key to adapter lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    AdapterContext, AllDebrid, DebridLink, DebridProvider, EasyDebrid, Offcloud, Premiumize,
    ProviderError, ProviderKey, Putio, RealDebrid, StremThru, TorBox,
};

/// Registry of the adapters available to the orchestrator.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKey, Arc<dyn DebridProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.keys())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own key, replacing any previous adapter.
    pub fn register(&mut self, provider: Arc<dyn DebridProvider>) {
        self.providers.insert(provider.key(), provider);
    }

    /// Adapter registered for `key`.
    #[must_use]
    pub fn get(&self, key: ProviderKey) -> Option<Arc<dyn DebridProvider>> {
        self.providers.get(&key).cloned()
    }

    /// Registered keys, in [`ProviderKey::ALL`] order.
    #[must_use]
    pub fn keys(&self) -> Vec<ProviderKey> {
        ProviderKey::ALL
            .into_iter()
            .filter(|key| self.providers.contains_key(key))
            .collect()
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when no adapter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn build(key: ProviderKey, context: &AdapterContext) -> Result<Arc<dyn DebridProvider>, ProviderError> {
    Ok(match key {
        ProviderKey::RealDebrid => Arc::new(RealDebrid::new(context)?),
        ProviderKey::Premiumize => Arc::new(Premiumize::new(context)?),
        ProviderKey::AllDebrid => Arc::new(AllDebrid::new(context)?),
        ProviderKey::DebridLink => Arc::new(DebridLink::new(context)?),
        ProviderKey::Offcloud => Arc::new(Offcloud::new(context)?),
        ProviderKey::TorBox => Arc::new(TorBox::new(context)?),
        ProviderKey::EasyDebrid => Arc::new(EasyDebrid::new(context)?),
        ProviderKey::Putio => Arc::new(Putio::new(context)?),
        ProviderKey::StremThru => Arc::new(StremThru::new(context)?),
    })
}

/// Builds the registry with every production adapter.
///
/// Adapters whose client cannot be built are skipped with a warning.
#[must_use]
pub fn build_default_provider_registry(context: &AdapterContext) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for key in ProviderKey::ALL {
        match build(key, context) {
            Ok(provider) => registry.register(provider),
            Err(error) => warn!(provider = %key, error = %error, "skipping provider adapter"),
        }
    }
    debug!(providers = ?registry.keys(), "provider registry ready");
    registry
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::adapter_context;

    #[test]
    fn test_default_registry_has_every_provider() {
        let registry = build_default_provider_registry(&adapter_context());
        assert_eq!(registry.len(), ProviderKey::ALL.len());
        for key in ProviderKey::ALL {
            assert_eq!(registry.get(key).unwrap().key(), key);
        }
        assert_eq!(registry.keys(), ProviderKey::ALL.to_vec());
    }

    #[test]
    fn test_empty_registry_lookup() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(ProviderKey::TorBox).is_none());
        assert!(format!("{registry:?}").contains("ProviderRegistry"));
    }
}
