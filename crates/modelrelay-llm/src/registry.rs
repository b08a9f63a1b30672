//! Provider registry
//!
//! Name to provider catalog. Registration also creates the provider's rate
//! limiter, so the limiter lives exactly as long as the registration.

use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::provider::LlmProvider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// A provider together with its limiter
#[derive(Clone)]
pub struct RegisteredProvider {
    /// The adapter
    pub provider: Arc<dyn LlmProvider>,
    /// The adapter's limiter
    pub limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("provider", &self.provider.name())
            .field("limiter", &self.limiter.stats())
            .finish()
    }
}

/// Catalog of registered providers
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, RegisteredProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`
    ///
    /// Fails with [`Error::ProviderAlreadyRegistered`] if the name is taken.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Result<()> {
        self.insert(name.into(), provider, false)
    }

    /// Register a provider, replacing any previous registration
    ///
    /// Calls already queued on the old limiter finish against the old
    /// provider.
    pub fn replace(&self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Result<()> {
        self.insert(name.into(), provider, true)
    }

    fn insert(&self, name: String, provider: Arc<dyn LlmProvider>, replace: bool) -> Result<()> {
        let descriptor = provider.descriptor();
        descriptor.rate_limit.validate()?;
        let limiter = Arc::new(RateLimiter::new(name.clone(), descriptor.rate_limit.clone()));

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !replace && entries.contains_key(&name) {
            return Err(Error::ProviderAlreadyRegistered(name));
        }

        info!(
            provider = %name,
            max_concurrent = descriptor.rate_limit.max_concurrent,
            replaced = entries.contains_key(&name),
            "Registered provider"
        );
        entries.insert(name, RegisteredProvider { provider, limiter });
        Ok(())
    }

    /// Remove a provider, returning whether it was present
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(name).is_some()
    }

    /// Look up a provider
    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>> {
        self.entry(name).map(|e| e.provider)
    }

    /// Look up a provider with its limiter
    pub fn entry(&self, name: &str) -> Result<RegisteredProvider> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    /// Whether `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;

    #[test]
    fn test_register_and_get() {
        let registry = ProviderRegistry::new();
        registry.register("a", Arc::new(MockProvider::new("a"))).unwrap();
        registry.register("b", Arc::new(MockProvider::new("b"))).unwrap();

        assert_eq!(registry.list(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.get("a").unwrap().name(), "a");
        assert!(registry.contains("b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected_unless_replaced() {
        let registry = ProviderRegistry::new();
        registry.register("a", Arc::new(MockProvider::new("a"))).unwrap();

        let err = registry
            .register("a", Arc::new(MockProvider::new("a")))
            .unwrap_err();
        assert!(matches!(err, Error::ProviderAlreadyRegistered(ref n) if n == "a"));

        registry.replace("a", Arc::new(MockProvider::new("a"))).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_provider() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("nope"),
            Err(Error::ProviderNotFound(ref n)) if n == "nope"
        ));
        assert!(!registry.remove("nope"));
    }
}
