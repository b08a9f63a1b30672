//! `check`, `providers` and `roles`

use crate::loader::load_settings;
use crate::relay::build_relay;
use anyhow::Result;
use modelrelay_llm::{build_provider, LlmProvider};
use std::path::Path;

pub fn check(config: Option<&Path>) -> Result<()> {
    println!("ModelRelay configuration check\n");

    let settings = match load_settings(config) {
        Ok(settings) => {
            println!("✅ Configuration valid");
            settings
        }
        Err(e) => {
            println!("❌ {e:#}");
            std::process::exit(1);
        }
    };

    let mut all_ok = true;
    for (name, provider) in &settings.providers {
        if !provider.enabled {
            println!("   {name:<16} disabled");
            continue;
        }
        match build_provider(name, provider) {
            Ok(_) => println!("✅ {name:<16} {}", provider.kind.as_str()),
            Err(e) => {
                println!("❌ {name:<16} {e}");
                all_ok = false;
            }
        }
    }

    println!();
    if all_ok {
        println!("✅ All enabled providers initialized.");
    } else {
        println!("⚠️  Some providers failed. Roles that use them cannot be served.");
        std::process::exit(1);
    }
    Ok(())
}

pub fn providers(config: Option<&Path>) -> Result<()> {
    let relay = build_relay(load_settings(config)?)?;
    let registry = relay.router.registry();

    println!(
        "{:<16} {:<14} {:>10} {:>8} {:>10} {:>10}",
        "PROVIDER", "KIND", "TIMEOUT", "RETRIES", "MAX_CONC", "MIN_TIME"
    );
    for name in registry.list() {
        let entry = registry.entry(&name)?;
        let descriptor = entry.provider.descriptor();
        let kind = relay
            .settings
            .providers
            .get(&name)
            .map_or("-", |p| p.kind.as_str());
        let limit = entry.limiter.config();
        println!(
            "{:<16} {:<14} {:>9}s {:>8} {:>10} {:>8}ms",
            name,
            kind,
            descriptor.timeout.as_secs(),
            descriptor.max_retries,
            limit.max_concurrent,
            limit.min_time_ms,
        );
    }
    for skipped in &relay.skipped {
        println!("{:<16} skipped: {}", skipped.name, skipped.reason);
    }
    Ok(())
}

pub fn roles(config: Option<&Path>) -> Result<()> {
    let settings = load_settings(config)?;

    for (role, mapping) in &settings.roles {
        let primary = mapping
            .primary
            .as_ref()
            .map_or_else(|| "(none)".to_string(), ToString::to_string);
        println!("{role}");
        println!("  primary:  {primary}");
        for (i, fallback) in mapping.fallbacks.iter().enumerate() {
            println!("  fallback {}: {fallback}", i + 1);
        }
    }
    Ok(())
}
