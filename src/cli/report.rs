//! `health` and `metrics`
//!
//! Health and usage live in process memory, so both commands can first send
//! a probe prompt through every role to have something to report on.

use crate::loader::load_settings;
use crate::relay::{build_relay, Relay};
use anyhow::Result;
use clap::Args;
use modelrelay_llm::{format_report, CallOptions, Message, UsageFilter};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Send this prompt through every role before reporting
    #[arg(long)]
    pub probe: Option<String>,

    /// Probe rounds
    #[arg(long, default_value_t = 1)]
    pub rounds: u32,
}

#[derive(Args, Debug)]
pub struct MetricsArgs {
    #[command(flatten)]
    pub probe: ProbeArgs,

    /// Only this provider
    #[arg(long)]
    pub provider: Option<String>,

    /// Only this role
    #[arg(long)]
    pub role: Option<String>,

    /// Only this project
    #[arg(long)]
    pub project: Option<String>,

    /// Print raw statistics as JSON
    #[arg(long)]
    pub raw: bool,
}

impl MetricsArgs {
    fn filter(&self) -> UsageFilter {
        UsageFilter {
            provider: self.provider.clone(),
            role: self.role.clone(),
            project: self.project.clone(),
            ..Default::default()
        }
    }
}

/// Run the probe rounds, logging failures instead of stopping
async fn probe(relay: &Relay, args: &ProbeArgs) {
    let Some(prompt) = &args.probe else { return };
    let roles: Vec<String> = relay.router.roles().into_keys().collect();

    for round in 1..=args.rounds {
        for role in &roles {
            let result = relay
                .router
                .call_by_role(role, vec![Message::user(prompt.clone())], CallOptions::default())
                .await;
            if let Err(e) = result {
                warn!(role = %role, round, error = %e, "Probe failed");
            }
        }
    }
}

pub async fn health(config: Option<&Path>, args: ProbeArgs) -> Result<()> {
    let relay = build_relay(load_settings(config)?)?;

    let cancel = CancellationToken::new();
    let recovery = relay
        .router
        .health()
        .map(|monitor| std::sync::Arc::clone(monitor).spawn_recovery_loop(cancel.clone()));

    probe(&relay, &args).await;

    println!(
        "{:<16} {:<10} {:>6} {:>8} {:>10}  LAST ERROR",
        "PROVIDER", "STATUS", "CALLS", "ERRORS", "AVG_MS"
    );
    for (name, health) in relay.router.get_provider_health() {
        println!(
            "{:<16} {:<10} {:>6} {:>7.0}% {:>10.0}  {}",
            name,
            health.status.as_str(),
            health.stats.total_calls,
            health.stats.error_rate * 100.0,
            health.stats.avg_latency_ms,
            health.last_error.as_deref().unwrap_or("-"),
        );
    }

    cancel.cancel();
    if let Some(handle) = recovery {
        let _ = handle.await;
    }
    Ok(())
}

pub async fn metrics(config: Option<&Path>, args: MetricsArgs) -> Result<()> {
    let relay = build_relay(load_settings(config)?)?;
    probe(&relay, &args.probe).await;

    let filter = args.filter();
    if args.raw {
        let stats = relay.router.get_metrics(&filter).await;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    match relay.router.tracker() {
        Some(tracker) => println!("{}", format_report(&tracker.report(&filter).await)),
        None => println!("Cost tracking is not enabled."),
    }
    Ok(())
}
