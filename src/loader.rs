//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use modelrelay_llm::RelaySettings;
use std::path::Path;
use tracing::debug;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Load, override and validate the relay settings
///
/// Layers, lowest priority first: embedded defaults, `config/default.toml`,
/// `config/{MODELRELAY_ENV}.toml`, `config/local.toml`, the `--config` file,
/// then `MODELRELAY_*` variables.
pub fn load_settings(extra: Option<&Path>) -> Result<RelaySettings> {
    let env_name = std::env::var("MODELRELAY_ENV").unwrap_or_else(|_| "development".to_string());

    let mut builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{env_name}")).required(false))
        .add_source(File::with_name("config/local").required(false));

    if let Some(path) = extra {
        builder = builder.add_source(File::from(path).required(true));
    }

    // 3. Environment variables (highest priority)
    // MODELRELAY_RETRY__BASE_DELAY_MS -> retry.base_delay_ms
    let config = builder
        .add_source(
            Environment::with_prefix("MODELRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut settings: RelaySettings = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    settings
        .apply_env_overrides()
        .context("Invalid threshold override")?;
    settings.validate().context("Invalid configuration")?;

    debug!(
        env = %env_name,
        providers = settings.providers.len(),
        roles = settings.roles.len(),
        "Configuration loaded"
    );
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_embedded_defaults_are_valid() {
        let settings: RelaySettings = assert_ok!(toml::from_str(DEFAULT_CONFIG));
        assert_ok!(settings.validate());

        assert!(settings.providers["local"].enabled);
        assert!(!settings.providers["huggingface"].enabled);
        assert_eq!(
            settings.roles["default"].primary.as_ref().map(|t| t.provider.as_str()),
            Some("local")
        );
        assert_eq!(settings.health.min_calls_for_health, 5);
        assert_eq!(settings.retry.base_delay_ms, 1000);
    }

    #[test]
    fn test_missing_extra_file_is_an_error() {
        let err = assert_err!(load_settings(Some(Path::new("does/not/exist.toml"))));
        assert!(format!("{err:#}").contains("configuration"));
    }
}
