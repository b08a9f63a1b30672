//! Provider wiring
//!
//! Builds every enabled provider, registers it and assembles the router.

use anyhow::{Context, Result};
use modelrelay_llm::{build_provider, ProviderRegistry, RelaySettings, Router};
use std::sync::Arc;
use tracing::{info, warn};

/// A provider that was enabled but could not be built
#[derive(Debug)]
pub struct SkippedProvider {
    pub name: String,
    pub reason: String,
}

/// Everything a command needs
pub struct Relay {
    pub settings: RelaySettings,
    pub router: Arc<Router>,
    pub skipped: Vec<SkippedProvider>,
}

/// Build providers, registry and router from validated settings
///
/// A provider that fails to build (usually a missing credential) is skipped
/// with a warning; the router then refuses any role that points at it.
pub fn build_relay(settings: RelaySettings) -> Result<Relay> {
    let registry = Arc::new(ProviderRegistry::new());
    let mut skipped = Vec::new();

    for (name, provider_settings) in settings.enabled_providers() {
        match build_provider(name, provider_settings) {
            Ok(provider) => {
                registry
                    .register(name.clone(), provider)
                    .with_context(|| format!("Failed to register provider {name}"))?;
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "Provider skipped");
                skipped.push(SkippedProvider {
                    name: name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if registry.is_empty() {
        return Err(anyhow::anyhow!(
            "No LLM provider could be initialized.\n\n\
             Enable at least one provider in config/local.toml and set its API key\n\
             (HF_TOKEN, DEEPSEEK_API_KEY, GEMINI_API_KEY or GITHUB_TOKEN)."
        ));
    }

    let router = Router::from_settings(Arc::clone(&registry), &settings)
        .context("Role table references a provider that is not available")?;
    info!(
        providers = registry.len(),
        roles = settings.roles.len(),
        "Relay ready"
    );

    Ok(Relay {
        settings,
        router: Arc::new(router),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DEFAULT_CONFIG;
    use tokio_test::assert_ok;

    #[test]
    fn test_defaults_build_offline() {
        let settings: RelaySettings = toml::from_str(DEFAULT_CONFIG).unwrap();
        let relay = build_relay(settings).unwrap();

        assert!(relay.skipped.is_empty());
        assert_eq!(relay.router.registry().list(), vec!["local"]);
        assert!(relay.router.resolve("default").is_ok());
    }

    #[tokio::test]
    async fn test_default_role_answers() {
        let settings: RelaySettings = toml::from_str(DEFAULT_CONFIG).unwrap();
        let relay = build_relay(settings).unwrap();

        let response = relay
            .router
            .call_by_role(
                "default",
                vec![modelrelay_llm::Message::user("ping")],
                modelrelay_llm::CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.content, "ping");
        assert_eq!(response.provider, "local");
    }

    #[test]
    fn test_provider_without_key_is_skipped() {
        let mut settings: RelaySettings = toml::from_str(DEFAULT_CONFIG).unwrap();
        let hf = settings.providers.get_mut("huggingface").unwrap();
        hf.enabled = true;
        hf.api_key = None;
        hf.api_key_env = Some("MODELRELAY_TEST_UNSET_HF_KEY".to_string());

        let relay = assert_ok!(build_relay(settings));
        assert_eq!(relay.skipped.len(), 1);
        assert_eq!(relay.skipped[0].name, "huggingface");
        assert!(relay.skipped[0].reason.contains("MODELRELAY_TEST_UNSET_HF_KEY"));
        assert!(!relay.router.registry().contains("huggingface"));
    }

    #[test]
    fn test_no_usable_provider_is_an_error() {
        let mut settings: RelaySettings = toml::from_str(DEFAULT_CONFIG).unwrap();
        for provider in settings.providers.values_mut() {
            provider.enabled = false;
        }

        match build_relay(settings) {
            Err(err) => assert!(err.to_string().contains("No LLM provider")),
            Ok(_) => panic!("relay built without any provider"),
        }
    }
}
