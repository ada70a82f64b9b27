//! Provider registry — resolves `provider_id/model` strings to adapters.

use std::collections::HashMap;
use std::sync::Arc;

use strand_domain::error::{Error, Result};

use crate::traits::Provider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_id: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. The first registration becomes the default.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let id = provider.provider_id().to_string();
        if self.default_id.is_none() {
            self.default_id = Some(id.clone());
        }
        self.providers.insert(id, provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve a model spec:
    /// - `"openai/gpt-4o"` → the `openai` provider with model `gpt-4o`;
    /// - `"gpt-4o"` → the default provider with that model;
    /// - `None` → the default provider with its default model.
    pub fn resolve(
        &self,
        spec: Option<&str>,
    ) -> Result<(Arc<dyn Provider>, Option<String>)> {
        match spec {
            Some(spec) => {
                if let Some((provider_id, model)) = spec.split_once('/') {
                    if let Some(p) = self.get(provider_id) {
                        return Ok((p, Some(model.to_string())));
                    }
                }
                let default = self.default_provider()?;
                Ok((default, Some(spec.to_string())))
            }
            None => Ok((self.default_provider()?, None)),
        }
    }

    fn default_provider(&self) -> Result<Arc<dyn Provider>> {
        self.default_id
            .as_ref()
            .and_then(|id| self.get(id))
            .ok_or(Error::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[test]
    fn empty_registry_is_not_configured() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.resolve(None), Err(Error::NotConfigured)));
    }

    #[test]
    fn resolves_provider_slash_model() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::named("scripted")));

        let (p, model) = registry.resolve(Some("scripted/fast-model")).unwrap();
        assert_eq!(p.provider_id(), "scripted");
        assert_eq!(model.as_deref(), Some("fast-model"));
    }

    #[test]
    fn bare_model_uses_default_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::named("scripted")));

        let (p, model) = registry.resolve(Some("some-model")).unwrap();
        assert_eq!(p.provider_id(), "scripted");
        assert_eq!(model.as_deref(), Some("some-model"));

        let (_, model) = registry.resolve(None).unwrap();
        assert!(model.is_none());
    }
}
