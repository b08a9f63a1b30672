//! Relay configuration
//!
//! Provider table, role table and the thresholds the router, health monitor
//! and cost tracker run with. Everything here is plain `serde` data; the
//! binary layers files and environment variables into a [`RelaySettings`]
//! and hands it to the library once at startup.

use crate::cost::CostLimits;
use crate::error::{Error, Result};
use crate::health::HealthConfig;
use crate::limiter::RateLimitConfig;
use crate::pool::PoolConfig;
use crate::pricing::PricingTable;
use crate::provider::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use crate::retry::BackoffSettings;
use crate::secrets::mask_api_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Provider Configuration
// ============================================================================

/// Adapter implementation behind a provider entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// HuggingFace inference router
    #[serde(alias = "hf")]
    Huggingface,
    /// DeepSeek through a relay endpoint
    Deepseek,
    /// Google Gemini
    Gemini,
    /// GitHub Models
    Github,
    /// Any OpenAI-compatible chat completions endpoint
    OpenaiCompat,
    /// In-process scripted provider
    Mock,
}

impl ProviderKind {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Huggingface => "huggingface",
            Self::Deepseek => "deepseek",
            Self::Gemini => "gemini",
            Self::Github => "github",
            Self::OpenaiCompat => "openai_compat",
            Self::Mock => "mock",
        }
    }

    /// Environment variable holding the credential by default
    #[must_use]
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Huggingface => Some("HF_TOKEN"),
            Self::Deepseek => Some("DEEPSEEK_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Github => Some("GITHUB_TOKEN"),
            Self::OpenaiCompat => Some("OPENAI_API_KEY"),
            Self::Mock => None,
        }
    }
}

/// Configuration for a provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Whether the provider is enabled
    pub enabled: bool,
    /// Adapter to build
    pub kind: ProviderKind,
    /// Inline API key
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Limiter parameters
    pub rate_limit: RateLimitConfig,
    /// Prices merged over the adapter's defaults
    pub pricing: PricingTable,
    /// Keep-alive parameters
    pub pool: PoolConfig,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProviderKind::OpenaiCompat,
            api_key: None,
            api_key_env: None,
            base_url: None,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limit: RateLimitConfig::default(),
            pricing: PricingTable::new(),
            pool: PoolConfig::default(),
        }
    }
}

// Custom Debug to mask the inline key
impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("api_key", &self.api_key.as_deref().map(mask_api_key))
            .field("api_key_env", &self.api_key_env)
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("rate_limit", &self.rate_limit)
            .field("pricing", &self.pricing)
            .field("pool", &self.pool)
            .finish()
    }
}

impl ProviderSettings {
    /// Settings for an adapter kind with defaults everywhere else
    #[must_use]
    pub fn of_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Per-attempt timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Inline key, else the configured or default environment variable
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        let var = self
            .api_key_env
            .as_deref()
            .or_else(|| self.kind.default_api_key_env())?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }

    /// Check the entry is usable
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config(format!("provider {name}: timeout_ms must be positive")));
        }
        self.rate_limit
            .validate()
            .map_err(|e| Error::Config(format!("provider {name}: {e}")))?;
        for (model, price) in &self.pricing {
            if price.input_cost_per_million < 0.0 || price.output_cost_per_million < 0.0 {
                return Err(Error::Config(format!(
                    "provider {name}: negative price for {model}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Role Configuration
// ============================================================================

/// A concrete provider/model pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTarget {
    /// Provider name (e.g., "huggingface", "deepseek")
    pub provider: String,
    /// Model name (e.g., "meta-llama/Llama-3.1-8B-Instruct")
    pub model: String,
}

impl ModelTarget {
    /// Create a new target
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Primary target and ordered fallbacks for one role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleMapping {
    /// First choice
    pub primary: Option<ModelTarget>,
    /// Tried in this order after a connection-class failure
    pub fallbacks: Vec<ModelTarget>,
}

impl RoleMapping {
    /// Mapping with a primary and no fallbacks
    #[must_use]
    pub fn new(primary: ModelTarget) -> Self {
        Self {
            primary: Some(primary),
            fallbacks: Vec::new(),
        }
    }

    /// Append a fallback
    #[must_use]
    pub fn with_fallback(mut self, target: ModelTarget) -> Self {
        self.fallbacks.push(target);
        self
    }

    /// Every referenced target, primary first
    pub fn targets(&self) -> impl Iterator<Item = &ModelTarget> {
        self.primary.iter().chain(self.fallbacks.iter())
    }
}

/// Role name to mapping
pub type RoleTable = BTreeMap<String, RoleMapping>;

/// Check every target in `roles` names a provider accepted by `is_usable`
pub fn validate_roles(roles: &RoleTable, is_usable: impl Fn(&str) -> bool) -> Result<()> {
    for (role, mapping) in roles {
        if role.is_empty() {
            return Err(Error::Config("role names must not be empty".into()));
        }
        for target in mapping.targets() {
            if target.provider.is_empty() || target.model.is_empty() {
                return Err(Error::Config(format!(
                    "role {role}: provider and model must not be empty"
                )));
            }
            if !is_usable(&target.provider) {
                return Err(Error::Config(format!(
                    "role {role} references unknown or disabled provider {}",
                    target.provider
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Top-level settings
// ============================================================================

/// Environment overrides read by [`RelaySettings::apply_env_overrides`]
pub const ENV_HEALTH_ERROR_RATE_THRESHOLD: &str = "MODELRELAY_HEALTH_ERROR_RATE_THRESHOLD";
/// Average latency threshold override (ms)
pub const ENV_HEALTH_LATENCY_THRESHOLD_MS: &str = "MODELRELAY_HEALTH_LATENCY_THRESHOLD_MS";
/// Recovery threshold override
pub const ENV_HEALTH_RECOVERY_THRESHOLD: &str = "MODELRELAY_HEALTH_RECOVERY_THRESHOLD";
/// Per-call cost cap override (USD)
pub const ENV_COST_MAX_PER_CALL: &str = "MODELRELAY_COST_MAX_PER_CALL";
/// Total budget override (USD)
pub const ENV_COST_TOTAL_BUDGET: &str = "MODELRELAY_COST_TOTAL_BUDGET";

/// Everything the relay needs at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Provider table
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Role table
    pub roles: RoleTable,
    /// Health thresholds
    pub health: HealthConfig,
    /// Retry backoff
    pub retry: BackoffSettings,
    /// Spend caps
    pub costs: CostLimits,
}

impl RelaySettings {
    /// Validate the whole configuration
    ///
    /// Any error here is meant to abort startup.
    pub fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            provider.validate(name)?;
        }
        validate_roles(&self.roles, |name| {
            self.providers.get(name).is_some_and(|p| p.enabled)
        })?;
        for (role, mapping) in &self.roles {
            if mapping.primary.is_none() {
                warn!(role = %role, "Role has no primary; calls to it will fail");
            }
        }
        self.health.validate()?;
        self.retry.validate()?;
        self.costs.validate()?;
        Ok(())
    }

    /// Enabled providers only
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderSettings)> {
        self.providers.iter().filter(|(_, p)| p.enabled)
    }

    /// Apply `MODELRELAY_*` threshold overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply threshold overrides from any key/value source
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key} has invalid value {raw:?}")))
        }

        if let Some(raw) = lookup(ENV_HEALTH_ERROR_RATE_THRESHOLD) {
            self.health.error_rate_threshold = parse(ENV_HEALTH_ERROR_RATE_THRESHOLD, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HEALTH_LATENCY_THRESHOLD_MS) {
            self.health.latency_threshold_ms = parse(ENV_HEALTH_LATENCY_THRESHOLD_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HEALTH_RECOVERY_THRESHOLD) {
            self.health.recovery_threshold = parse(ENV_HEALTH_RECOVERY_THRESHOLD, &raw)?;
        }
        if let Some(raw) = lookup(ENV_COST_MAX_PER_CALL) {
            self.costs.max_cost_per_call = Some(parse(ENV_COST_MAX_PER_CALL, &raw)?);
        }
        if let Some(raw) = lookup(ENV_COST_TOTAL_BUDGET) {
            self.costs.total_budget = Some(parse(ENV_COST_TOTAL_BUDGET, &raw)?);
        }

        info!(
            error_rate_threshold = self.health.error_rate_threshold,
            latency_threshold_ms = self.health.latency_threshold_ms,
            recovery_threshold = self.health.recovery_threshold,
            "Threshold overrides applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn settings() -> RelaySettings {
        let mut s = RelaySettings::default();
        s.providers
            .insert("hf".into(), ProviderSettings::of_kind(ProviderKind::Huggingface));
        s.providers
            .insert("ds".into(), ProviderSettings::of_kind(ProviderKind::Deepseek));
        s.roles.insert(
            "code-generator".into(),
            RoleMapping::new(ModelTarget::new("hf", "llama")).with_fallback(ModelTarget::new("ds", "deepseek-chat")),
        );
        s
    }

    #[test]
    fn test_valid_settings() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_unknown_provider_in_role_is_fatal() {
        let mut s = settings();
        s.roles
            .insert("reviewer".into(), RoleMapping::new(ModelTarget::new("nope", "m")));
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_disabled_provider_in_role_is_fatal() {
        let mut s = settings();
        if let Some(ds) = s.providers.get_mut("ds") {
            ds.enabled = false;
        }
        assert!(matches!(s.validate(), Err(Error::Config(_))));
        assert_eq!(s.enabled_providers().count(), 1);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_HEALTH_ERROR_RATE_THRESHOLD, "0.25"),
            (ENV_HEALTH_LATENCY_THRESHOLD_MS, "2500"),
            (ENV_COST_TOTAL_BUDGET, "10"),
        ]
        .into_iter()
        .collect();

        let mut s = settings();
        s.apply_overrides(|k| env.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(s.health.error_rate_threshold, 0.25);
        assert_eq!(s.health.latency_threshold_ms, 2500);
        assert_eq!(s.costs.total_budget, Some(10.0));
        assert_eq!(s.costs.max_cost_per_call, None);
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut s = settings();
        let result = s.apply_overrides(|k| (k == ENV_HEALTH_RECOVERY_THRESHOLD).then(|| "high".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_settings_from_toml() {
        let raw = r#"
            [providers.hf]
            kind = "huggingface"
            api_key = "hf_abcdefghijklmnop"
            [providers.hf.rate_limit]
            max_concurrent = 3
            min_time_ms = 200
            [providers.hf.pricing."meta-llama/Llama-3.1-8B-Instruct"]
            input = 0.05
            output = 0.08

            [roles.writer]
            primary = { provider = "hf", model = "meta-llama/Llama-3.1-8B-Instruct" }
        "#;
        let s: RelaySettings = toml::from_str(raw).unwrap();
        let hf = &s.providers["hf"];
        assert_eq!(hf.kind, ProviderKind::Huggingface);
        assert_eq!(hf.rate_limit.max_concurrent, 3);
        assert_eq!(hf.max_retries, DEFAULT_MAX_RETRIES);
        assert!(s.roles["writer"].fallbacks.is_empty());
        assert!(!format!("{hf:?}").contains("efghijkl"));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_role_targets_order() {
        let mapping = RoleMapping::new(ModelTarget::new("a", "1"))
            .with_fallback(ModelTarget::new("b", "2"))
            .with_fallback(ModelTarget::new("c", "3"));
        let order: Vec<String> = mapping.targets().map(ToString::to_string).collect();
        assert_eq!(order, vec!["a/1", "b/2", "c/3"]);
    }
}
