//! HuggingFace inference router
//!
//! The router exposes hosted open-weight models behind an OpenAI-compatible
//! endpoint, so the adapter is an [`OpenAiCompatProvider`] with HF defaults.

use super::OpenAiCompatProvider;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::pricing::{self, table, PricingTable};
use crate::provider::ProviderDescriptor;
use crate::secrets::mask_api_key;
use std::fmt;
use std::time::Duration;

/// HuggingFace router base URL
pub const HF_API_BASE: &str = "https://router.huggingface.co/v1";

/// Default model
pub const DEFAULT_MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct";

/// Known prices for popular router models
#[must_use]
pub fn default_pricing() -> PricingTable {
    table(&[
        (
            "meta-llama/Llama-3.1-8B-Instruct",
            pricing::HF_LLAMA_8B_INPUT_COST,
            pricing::HF_LLAMA_8B_OUTPUT_COST,
        ),
        (
            "Qwen/Qwen2.5-Coder-32B-Instruct",
            pricing::HF_QWEN_CODER_INPUT_COST,
            pricing::HF_QWEN_CODER_OUTPUT_COST,
        ),
    ])
}

/// HuggingFace provider configuration
#[derive(Clone)]
pub struct HuggingFaceConfig {
    /// Access token
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug to mask the token
impl fmt::Debug for HuggingFaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuggingFaceConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HuggingFaceConfig {
    /// Create a configuration with an access token
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: HF_API_BASE.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from `HF_TOKEN`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("HF_TOKEN")
            .map_err(|_| Error::NotConfigured("HF_TOKEN not set".to_string()))?;
        Ok(Self::new(api_key))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LlmProvider;

    #[test]
    fn test_config_debug_masks_key() {
        let config = HuggingFaceConfig::new("hf_abcdefghijklmnopqrstuvwxyz");
        let debug = format!("{config:?}");
        assert!(!debug.contains("ghijklmnop"));
    }

    #[test]
    fn test_into_provider() {
        let provider = HuggingFaceConfig::new("hf_abcdefghijklmnop")
            .with_timeout(Duration::from_secs(5))
            .into_provider("hf", &PoolConfig::default())
            .unwrap();
        assert_eq!(provider.name(), "hf");
        assert_eq!(provider.descriptor().timeout, Duration::from_secs(5));
        assert!(provider.calculate_cost(1_000_000, 0, DEFAULT_MODEL) > 0.0);
    }
}
