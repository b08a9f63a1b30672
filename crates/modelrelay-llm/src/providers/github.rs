//! GitHub Models
//!
//! OpenAI-compatible inference endpoint authenticated with a GitHub token.

use super::OpenAiCompatProvider;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::pricing::{self, table, PricingTable};
use crate::provider::ProviderDescriptor;
use crate::secrets::mask_api_key;
use std::fmt;
use std::time::Duration;

/// GitHub Models base URL
pub const GITHUB_MODELS_API_BASE: &str = "https://models.inference.ai.azure.com";

/// Default model
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Upstream OpenAI prices for the models GitHub hosts
#[must_use]
pub fn default_pricing() -> PricingTable {
    table(&[
        ("gpt-4o-mini", pricing::GPT4O_MINI_INPUT_COST, pricing::GPT4O_MINI_OUTPUT_COST),
        ("gpt-4o", pricing::GPT4O_INPUT_COST, pricing::GPT4O_OUTPUT_COST),
    ])
}

/// GitHub Models configuration
#[derive(Clone)]
pub struct GitHubConfig {
    /// GitHub token with models access
    pub token: String,
    /// Base URL
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug to mask the token
impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &mask_api_key(&self.token))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GitHubConfig {
    /// Create a configuration with a token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: GITHUB_MODELS_API_BASE.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from `GITHUB_TOKEN`
    pub fn from_env() -> Result<Self> {
        std::env::var("GITHUB_TOKEN")
            .map(Self::new)
            .map_err(|_| Error::NotConfigured("GITHUB_TOKEN not set".to_string()))
    }

    /// Build the adapter under the given registry name
    pub fn into_provider(self, name: &str, pool: &PoolConfig) -> Result<OpenAiCompatProvider> {
        let descriptor = ProviderDescriptor::new(name, self.base_url)
            .with_api_key(self.token)
            .with_pricing(default_pricing())
            .with_timeout(self.timeout);
        OpenAiCompatProvider::new(descriptor, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_masks_token() {
        let config = GitHubConfig::new("ghp_abcdefghijklmnopqrstuvwxyz");
        assert!(!format!("{config:?}").contains("efghijklmnop"));
    }

    #[test]
    fn test_default_pricing() {
        let prices = default_pricing();
        assert!(prices.contains_key(DEFAULT_MODEL));
        assert!(prices["gpt-4o"].input_cost_per_million > prices["gpt-4o-mini"].input_cost_per_million);
    }
}
