//! Explicit provider registry.
//!
//! One registry per engine instance, passed by reference. Exactly one
//! provider is active at a time.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::provider::Provider;

/// Registered providers and the active one.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
    active: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a provider under its id.
    ///
    /// A provider registered under an existing id replaces the old one (with
    /// a warning). The first provider registered becomes active.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        if self.providers.insert(id.clone(), provider).is_some() {
            tracing::warn!(provider = %id, "Provider re-registered, replacing previous instance");
        } else {
            tracing::info!(provider = %id, "Provider registered");
        }

        let mut active = self.active.write();
        if active.is_none() {
            *active = Some(id);
        }
    }

    /// The active provider.
    pub fn active(&self) -> Result<Arc<dyn Provider>> {
        let active = self.active.read();
        let id = active.as_deref().ok_or(SyncError::NoProvider)?;
        self.get(id).ok_or(SyncError::NoProvider)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Make a registered provider the active one.
    pub fn set_active(&self, id: &str) -> Result<()> {
        if !self.providers.contains_key(id) {
            return Err(SyncError::UnknownProvider(id.to_string()));
        }
        let previous = self.active.write().replace(id.to_string());
        if previous.as_deref() != Some(id) {
            tracing::info!(provider = %id, ?previous, "Active provider switched");
        }
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    #[test]
    fn first_registered_becomes_active() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.active(), Err(SyncError::NoProvider)));

        registry.register(Arc::new(MemoryProvider::new("primary")));
        registry.register(Arc::new(MemoryProvider::new("secondary")));
        assert_eq!(registry.active().unwrap().id(), "primary");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn set_active_requires_registration() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MemoryProvider::new("primary")));
        assert!(matches!(
            registry.set_active("missing"),
            Err(SyncError::UnknownProvider(_))
        ));

        registry.register(Arc::new(MemoryProvider::new("secondary")));
        registry.set_active("secondary").unwrap();
        assert_eq!(registry.active_id().as_deref(), Some("secondary"));
    }

    #[test]
    fn reregistering_replaces_instance() {
        let registry = ProviderRegistry::new();
        let first = Arc::new(MemoryProvider::new("primary"));
        let second = Arc::new(MemoryProvider::new("primary"));
        registry.register(first.clone());
        registry.register(second.clone());

        assert_eq!(registry.len(), 1);
        let active = registry.active().unwrap();
        let second_dyn: Arc<dyn Provider> = second;
        assert!(Arc::ptr_eq(&active, &second_dyn));
    }

    #[test]
    fn separate_registries_are_isolated() {
        let a = ProviderRegistry::new();
        let b = ProviderRegistry::new();
        a.register(Arc::new(MemoryProvider::new("primary")));
        assert!(b.active().is_err());
    }
}
