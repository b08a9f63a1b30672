//! Provider adapters
//!
//! - HuggingFace, DeepSeek (relay) and GitHub Models speak the OpenAI chat
//!   completions dialect and share [`OpenAiCompatProvider`]
//! - Gemini has its own wire format
//! - [`MockProvider`] is a scripted in-process provider for tests and dry runs
//!
//! [`build_provider`] turns a [`ProviderSettings`] entry into a ready adapter.

pub mod deepseek;
pub mod gemini;
pub mod github;
pub mod huggingface;
pub mod mock;
pub mod openai_compat;

pub use deepseek::DeepSeekConfig;
pub use gemini::{GeminiConfig, GeminiProvider};
pub use github::GitHubConfig;
pub use huggingface::HuggingFaceConfig;
pub use mock::{MockOutcome, MockProvider};
pub use openai_compat::OpenAiCompatProvider;

use crate::config::{ProviderKind, ProviderSettings};
use crate::error::{Error, ErrorContext, Result};
use crate::message::Message;
use crate::pricing::PricingTable;
use crate::provider::{LlmProvider, ProviderDescriptor};
use crate::secrets::key_warning;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rough characters-per-token ratio used when a provider omits usage
const CHARS_PER_TOKEN: usize = 4;

/// Build the adapter for one configured provider
///
/// # Errors
/// Returns [`Error::NotConfigured`] when a credential is missing, or
/// [`Error::Config`] when the HTTP client cannot be built.
pub fn build_provider(name: &str, settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    settings.validate(name)?;

    let provider: Arc<dyn LlmProvider> = match settings.kind {
        ProviderKind::Mock => Arc::new(MockProvider::from_descriptor(descriptor_from(
            name,
            settings,
            "mock://local",
            PricingTable::new(),
            "",
        ))),
        ProviderKind::Huggingface => Arc::new(OpenAiCompatProvider::new(
            descriptor_from(
                name,
                settings,
                huggingface::HF_API_BASE,
                huggingface::default_pricing(),
                &require_key(name, settings)?,
            ),
            &settings.pool,
        )?),
        ProviderKind::Deepseek => Arc::new(OpenAiCompatProvider::new(
            descriptor_from(
                name,
                settings,
                deepseek::DEEPSEEK_API_BASE,
                deepseek::default_pricing(),
                &require_key(name, settings)?,
            ),
            &settings.pool,
        )?),
        ProviderKind::Github => Arc::new(OpenAiCompatProvider::new(
            descriptor_from(
                name,
                settings,
                github::GITHUB_MODELS_API_BASE,
                github::default_pricing(),
                &require_key(name, settings)?,
            ),
            &settings.pool,
        )?),
        ProviderKind::OpenaiCompat => {
            let base_url = settings.base_url.as_deref().ok_or_else(|| {
                Error::Config(format!("provider {name}: openai_compat requires base_url"))
            })?;
            Arc::new(OpenAiCompatProvider::new(
                descriptor_from(
                    name,
                    settings,
                    base_url,
                    PricingTable::new(),
                    &require_key(name, settings)?,
                ),
                &settings.pool,
            )?)
        }
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            descriptor_from(
                name,
                settings,
                gemini::GEMINI_API_BASE,
                gemini::default_pricing(),
                &require_key(name, settings)?,
            ),
            &settings.pool,
        )?),
    };

    info!(provider = %name, kind = settings.kind.as_str(), "Provider built");
    Ok(provider)
}

fn require_key(name: &str, settings: &ProviderSettings) -> Result<String> {
    let api_key = settings.resolve_api_key().ok_or_else(|| {
        let var = settings
            .api_key_env
            .as_deref()
            .or_else(|| settings.kind.default_api_key_env())
            .unwrap_or("api_key");
        Error::NotConfigured(format!("{var} not set (provider {name})"))
    })?;
    if let Some(problem) = key_warning(&api_key, settings.kind, name) {
        warn!(provider = %name, "{problem}");
    }
    Ok(api_key)
}

/// Descriptor from settings; configured pricing entries override the defaults
fn descriptor_from(
    name: &str,
    settings: &ProviderSettings,
    default_base_url: &str,
    mut pricing: PricingTable,
    api_key: &str,
) -> ProviderDescriptor {
    pricing.extend(settings.pricing.iter().map(|(k, v)| (k.clone(), *v)));
    ProviderDescriptor::new(name, settings.base_url.as_deref().unwrap_or(default_base_url))
        .with_api_key(api_key)
        .with_pricing(pricing)
        .with_timeout(settings.timeout())
        .with_max_retries(settings.max_retries)
        .with_rate_limit(settings.rate_limit.clone())
}

/// Approximate token count for text whose usage was not reported
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Approximate prompt tokens for a conversation
#[must_use]
pub fn estimate_prompt_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content))
        .fold(0u32, u32::saturating_add)
}

/// Join a base URL and a path without doubling the slash
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Seconds from a `Retry-After` header
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Consume a non-2xx response into a typed error
pub(crate) async fn error_from_response(
    context: ErrorContext,
    response: reqwest::Response,
    started: Instant,
) -> Error {
    let status = response.status().as_u16();
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Error::from_status(context.with_latency(started.elapsed()), status, &body, retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPricing;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(
            estimate_prompt_tokens(&[Message::system("abcd"), Message::user("abcdefgh")]),
            3
        );
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            endpoint("https://api.example.test/v1/", "/chat/completions"),
            "https://api.example.test/v1/chat/completions"
        );
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_build_mock_provider() {
        let provider = build_provider("offline", &ProviderSettings::of_kind(ProviderKind::Mock)).unwrap();
        assert_eq!(provider.name(), "offline");
    }

    #[test]
    fn test_build_requires_credential() {
        let settings = ProviderSettings {
            api_key_env: Some("MODELRELAY_TEST_UNSET_KEY".to_string()),
            ..ProviderSettings::of_kind(ProviderKind::Deepseek)
        };
        let err = build_provider("deepseek", &settings).err().unwrap();
        assert!(matches!(err, Error::NotConfigured(msg) if msg.contains("MODELRELAY_TEST_UNSET_KEY")));
    }

    #[test]
    fn test_build_openai_compat_requires_base_url() {
        let settings = ProviderSettings {
            api_key: Some("sk-test-1234567890".to_string()),
            ..ProviderSettings::of_kind(ProviderKind::OpenaiCompat)
        };
        assert!(matches!(build_provider("local", &settings), Err(Error::Config(_))));
    }

    #[test]
    fn test_configured_pricing_overrides_defaults() {
        let mut settings = ProviderSettings {
            api_key: Some("sk-test-1234567890".to_string()),
            ..ProviderSettings::of_kind(ProviderKind::Deepseek)
        };
        settings
            .pricing
            .insert("deepseek-chat".to_string(), ModelPricing::new(1.0, 1.0));

        let provider = build_provider("deepseek", &settings).unwrap();
        let pricing = &provider.descriptor().pricing;
        assert_eq!(pricing["deepseek-chat"], ModelPricing::new(1.0, 1.0));
        assert!(pricing.contains_key("deepseek-reasoner"));
        assert_eq!(provider.descriptor().base_url, deepseek::DEEPSEEK_API_BASE);
    }
}
