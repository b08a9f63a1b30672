//! Provider capability interface
//!
//! Every remote backend implements [`LlmProvider`]. The router only ever
//! talks to providers through this trait and the immutable
//! [`ProviderDescriptor`] each one exposes.

use crate::completion::{ChatRequest, ChatResponse};
use crate::error::{Error, Result};
use crate::limiter::RateLimitConfig;
use crate::pool::PoolStats;
use crate::pricing::{cost_for, PricingTable};
use crate::streaming::ChatStream;
use crate::secrets::mask_api_key;
use std::fmt;
use std::time::Duration;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default retry count per provider
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Static description of a registered provider
#[derive(Clone)]
pub struct ProviderDescriptor {
    /// Registry name
    pub name: String,
    /// Credential
    pub api_key: String,
    /// Base endpoint
    pub base_url: String,
    /// Per-model pricing
    pub pricing: PricingTable,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Limiter parameters
    pub rate_limit: RateLimitConfig,
}

// Custom Debug to mask the credential
impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("pricing", &self.pricing)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

impl ProviderDescriptor {
    /// Descriptor with defaults for everything but identity and endpoint
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: String::new(),
            base_url: base_url.into(),
            pricing: PricingTable::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// Set the credential
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Replace the pricing table
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry count
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the limiter parameters
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}

/// Trait for LLM providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Static description
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Single request/response call
    ///
    /// Must fill `tokens`; may leave `cost` unset. Errors carry provider,
    /// model and latency in their context.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Streaming call, finished by a [`crate::streaming::StreamChunk::Done`]
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream>;

    /// Cost of a call from the pricing table, 0 for unpriced models
    fn calculate_cost(&self, input_tokens: u32, output_tokens: u32, model: &str) -> f64 {
        cost_for(&self.descriptor().pricing, model, input_tokens, output_tokens)
    }

    /// Whether the retry wrapper may try this error again on the same provider
    fn is_retryable_error(&self, error: &Error) -> bool {
        error.is_connection_class()
    }

    /// Socket usage, for providers backed by a connection pool
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{table, ModelPricing};

    #[test]
    fn test_descriptor_debug_masks_key() {
        let descriptor =
            ProviderDescriptor::new("hf", "https://example.test").with_api_key("hf_secretsecretsecret");
        let debug = format!("{descriptor:?}");
        assert!(!debug.contains("secretsecret"));
        assert!(debug.contains("hf_…cret"));
    }

    #[test]
    fn test_descriptor_builders() {
        let descriptor = ProviderDescriptor::new("p", "u")
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(0)
            .with_pricing(table(&[("m", 1.0, 2.0)]));
        assert_eq!(descriptor.timeout, Duration::from_secs(5));
        assert_eq!(descriptor.max_retries, 0);
        assert_eq!(descriptor.pricing.get("m"), Some(&ModelPricing::new(1.0, 2.0)));
    }
}
