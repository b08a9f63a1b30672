//! DeepSeek through an OpenAI-compatible relay
//!
//! Defaults to the public endpoint; set `base_url` (or `DEEPSEEK_BASE_URL`)
//! to route through a relay instead.

use super::OpenAiCompatProvider;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::pricing::{self, table, PricingTable};
use crate::provider::ProviderDescriptor;
use crate::secrets::mask_api_key;
use std::fmt;
use std::time::Duration;

/// DeepSeek API base URL
pub const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com/v1";

/// Default DeepSeek model (V3 Chat)
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// DeepSeek list prices
#[must_use]
pub fn default_pricing() -> PricingTable {
    table(&[
        (
            "deepseek-chat",
            pricing::DEEPSEEK_CHAT_INPUT_COST,
            pricing::DEEPSEEK_CHAT_OUTPUT_COST,
        ),
        (
            "deepseek-reasoner",
            pricing::DEEPSEEK_REASONER_INPUT_COST,
            pricing::DEEPSEEK_REASONER_OUTPUT_COST,
        ),
    ])
}

/// DeepSeek provider configuration
#[derive(Clone)]
pub struct DeepSeekConfig {
    /// API key
    pub api_key: String,
    /// Base URL (public API or relay)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug to mask the API key
impl fmt::Debug for DeepSeekConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepSeekConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DeepSeekConfig {
    /// Create a configuration with an API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEEPSEEK_API_BASE.to_string(),
            timeout: Duration::from_secs(120), // reasoner responses are slow
        }
    }

    /// Create configuration from `DEEPSEEK_API_KEY` and `DEEPSEEK_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .map_err(|_| Error::NotConfigured("DEEPSEEK_API_KEY not set".to_string()))?;
        let config = Self::new(api_key);
        Ok(match std::env::var("DEEPSEEK_BASE_URL") {
            Ok(url) if !url.is_empty() => config.with_base_url(url),
            _ => config,
        })
    }

    /// Route through a relay
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the adapter under the given registry name
    pub fn into_provider(self, name: &str, pool: &PoolConfig) -> Result<OpenAiCompatProvider> {
        let descriptor = ProviderDescriptor::new(name, self.base_url)
            .with_api_key(self.api_key)
            .with_pricing(default_pricing())
            .with_timeout(self.timeout);
        OpenAiCompatProvider::new(descriptor, pool)
    }
}
