//! Provider health monitor
//!
//! Keeps a bounded FIFO window of recent call outcomes per provider and
//! derives a healthy/unhealthy status from it. Stats are recomputed from the
//! window on every change, so they never drift from its contents.
//!
//! Status rules:
//!
//! - `healthy -> unhealthy` once the window holds at least
//!   `min_calls_for_health` samples and either the error rate exceeds
//!   `error_rate_threshold` or the average latency exceeds
//!   `latency_threshold_ms`.
//! - `unhealthy -> healthy` once the window's success rate reaches
//!   `recovery_threshold`.
//!
//! A provider with no samples is [`HealthStatus::Unknown`], never healthy.
//! Status changes are published on a broadcast channel (see
//! [`HealthMonitor::subscribe`]).

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the health event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Health monitor thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Window capacity per provider
    pub window_size: usize,
    /// Samples required before a provider can be marked unhealthy
    pub min_calls_for_health: usize,
    /// Error rate above which a provider is unhealthy (0.0 - 1.0)
    pub error_rate_threshold: f64,
    /// Average latency above which a provider is unhealthy
    pub latency_threshold_ms: u64,
    /// Success rate required to recover (0.0 - 1.0)
    pub recovery_threshold: f64,
    /// Period of the background recovery check
    pub recovery_check_interval_ms: u64,
    /// Recent samples inspected by the recovery check
    pub recovery_sample_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_calls_for_health: 5,
            error_rate_threshold: 0.5,
            latency_threshold_ms: 10_000,
            recovery_threshold: 0.8,
            recovery_check_interval_ms: 60_000,
            recovery_sample_size: 10,
        }
    }
}

impl HealthConfig {
    /// Check thresholds are in range
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Config("health window_size must be positive".into()));
        }
        if self.recovery_sample_size == 0 {
            return Err(Error::Config(
                "health recovery_sample_size must be positive".into(),
            ));
        }
        if self.recovery_check_interval_ms == 0 {
            return Err(Error::Config(
                "health recovery_check_interval_ms must be positive".into(),
            ));
        }
        for (name, value) in [
            ("error_rate_threshold", self.error_rate_threshold),
            ("recovery_threshold", self.recovery_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "health {name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Recovery check period
    #[must_use]
    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_check_interval_ms)
    }
}

/// Provider health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Within thresholds
    Healthy,
    /// Over an error or latency threshold
    Unhealthy,
    /// No data yet
    Unknown,
}

impl HealthStatus {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one provider call as seen by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct HealthOutcome {
    /// Whether the call succeeded
    pub success: bool,
    /// Call latency
    pub latency_ms: u64,
    /// Error description for failures
    pub error: Option<String>,
}

impl HealthOutcome {
    /// A successful call
    #[must_use]
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            error: None,
        }
    }

    /// A failed call
    #[must_use]
    pub fn failure(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct HealthSample {
    success: bool,
    latency_ms: u64,
    timestamp: DateTime<Utc>,
    error: Option<String>,
}

/// Aggregates over the current window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStats {
    /// Samples in the window
    pub total_calls: usize,
    /// Successful samples
    pub successes: usize,
    /// Failed samples
    pub failures: usize,
    /// successes / total
    pub success_rate: f64,
    /// failures / total
    pub error_rate: f64,
    /// Mean latency
    pub avg_latency_ms: f64,
}

impl HealthStats {
    fn from_samples<'a>(samples: impl Iterator<Item = &'a HealthSample>) -> Self {
        let mut stats = Self::default();
        let mut latency_sum: u128 = 0;
        for sample in samples {
            stats.total_calls += 1;
            if sample.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            latency_sum += u128::from(sample.latency_ms);
        }
        if stats.total_calls > 0 {
            let total = stats.total_calls as f64;
            stats.success_rate = stats.successes as f64 / total;
            stats.error_rate = stats.failures as f64 / total;
            stats.avg_latency_ms = latency_sum as f64 / total;
        }
        stats
    }
}

/// Health snapshot for one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    /// Provider name
    pub provider: String,
    /// Current status
    pub status: HealthStatus,
    /// Window aggregates
    pub stats: HealthStats,
    /// When the provider last became unhealthy
    pub unhealthy_since: Option<DateTime<Utc>>,
    /// Most recent error in the window
    pub last_error: Option<String>,
    /// Timestamp of the most recent sample
    pub last_call_at: Option<DateTime<Utc>>,
    /// Status was set by an operator and has not been re-evaluated yet
    pub manual_override: bool,
}

impl ProviderHealth {
    fn unknown(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: HealthStatus::Unknown,
            stats: HealthStats::default(),
            unhealthy_since: None,
            last_error: None,
            last_call_at: None,
            manual_override: false,
        }
    }
}

/// Published whenever a provider changes status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEvent {
    /// Provider name
    pub provider: String,
    /// Previous status
    pub from: HealthStatus,
    /// New status
    pub to: HealthStatus,
    /// Human-readable cause
    pub reason: String,
    /// When the change happened
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct HealthRecord {
    window: VecDeque<HealthSample>,
    stats: HealthStats,
    status: HealthStatus,
    unhealthy_since: Option<DateTime<Utc>>,
    manual_override: bool,
}

impl HealthRecord {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            stats: HealthStats::default(),
            status: HealthStatus::Healthy,
            unhealthy_since: None,
            manual_override: false,
        }
    }

    fn push(&mut self, sample: HealthSample, capacity: usize) {
        self.window.push_back(sample);
        self.trim(capacity);
    }

    fn trim(&mut self, capacity: usize) {
        while self.window.len() > capacity {
            self.window.pop_front();
        }
        self.stats = HealthStats::from_samples(self.window.iter());
    }

    fn recent_success_rate(&self, n: usize) -> Option<f64> {
        let skip = self.window.len().saturating_sub(n);
        let stats = HealthStats::from_samples(self.window.iter().skip(skip));
        (stats.total_calls > 0).then_some(stats.success_rate)
    }

    /// Apply the status rules, returning the reason if the status changed
    fn evaluate(&mut self, config: &HealthConfig) -> Option<String> {
        let stats = &self.stats;
        let over_errors = stats.error_rate > config.error_rate_threshold;
        let over_latency = stats.avg_latency_ms > config.latency_threshold_ms as f64;

        if stats.total_calls >= config.min_calls_for_health && (over_errors || over_latency) {
            if self.status == HealthStatus::Unhealthy {
                return None;
            }
            self.status = HealthStatus::Unhealthy;
            self.unhealthy_since = Some(Utc::now());
            return Some(if over_errors {
                format!(
                    "error rate {:.2} exceeds {:.2}",
                    stats.error_rate, config.error_rate_threshold
                )
            } else {
                format!(
                    "average latency {:.0}ms exceeds {}ms",
                    stats.avg_latency_ms, config.latency_threshold_ms
                )
            });
        }

        if self.status == HealthStatus::Unhealthy && stats.success_rate >= config.recovery_threshold {
            self.status = HealthStatus::Healthy;
            self.unhealthy_since = None;
            return Some(format!(
                "success rate {:.2} reached {:.2}",
                stats.success_rate, config.recovery_threshold
            ));
        }

        None
    }

    fn snapshot(&self, provider: &str) -> ProviderHealth {
        let last = self.window.back();
        ProviderHealth {
            provider: provider.to_string(),
            status: self.status,
            stats: self.stats.clone(),
            unhealthy_since: self.unhealthy_since,
            last_error: self.window.iter().rev().find_map(|s| s.error.clone()),
            last_call_at: last.map(|s| s.timestamp),
            manual_override: self.manual_override,
        }
    }
}

/// Sliding-window health tracker shared by the router and operators
#[derive(Debug)]
pub struct HealthMonitor {
    config: RwLock<HealthConfig>,
    records: Mutex<HashMap<String, HealthRecord>>,
    events: broadcast::Sender<HealthEvent>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: RwLock::new(HealthConfig::default()),
            records: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl HealthMonitor {
    /// Create a monitor with validated thresholds
    pub fn new(config: HealthConfig) -> Result<Self> {
        config.validate()?;
        let monitor = Self::default();
        *monitor.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(monitor)
    }

    /// Current thresholds
    #[must_use]
    pub fn config(&self) -> HealthConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the thresholds
    ///
    /// The new config is validated first; on failure the old one stays.
    /// A smaller window trims existing windows immediately.
    pub fn update_config(&self, config: HealthConfig) -> Result<()> {
        config.validate()?;
        let capacity = config.window_size;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        for record in records.values_mut() {
            record.trim(capacity);
        }
        info!(window_size = capacity, "Health config updated");
        Ok(())
    }

    /// Receive status change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Record one call outcome and re-evaluate the provider
    ///
    /// Clears any manual override. Returns the resulting status.
    pub fn track_health(&self, provider: &str, outcome: HealthOutcome) -> HealthStatus {
        let config = self.config();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(provider.to_string())
            .or_insert_with(|| HealthRecord::new(config.window_size));

        record.push(
            HealthSample {
                success: outcome.success,
                latency_ms: outcome.latency_ms,
                timestamp: Utc::now(),
                error: outcome.error,
            },
            config.window_size,
        );

        let before = record.status;
        record.manual_override = false;
        if let Some(reason) = record.evaluate(&config) {
            self.publish(provider, before, record.status, reason);
        }
        record.status
    }

    /// Health of one provider, [`HealthStatus::Unknown`] without data
    #[must_use]
    pub fn get_provider_health(&self, provider: &str) -> ProviderHealth {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(provider)
            .map(|r| r.snapshot(provider))
            .unwrap_or_else(|| ProviderHealth::unknown(provider))
    }

    /// Status of one provider
    #[must_use]
    pub fn status(&self, provider: &str) -> HealthStatus {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(provider)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Whether the provider is known to be unhealthy
    #[must_use]
    pub fn is_unhealthy(&self, provider: &str) -> bool {
        self.status(provider) == HealthStatus::Unhealthy
    }

    /// Snapshots of every tracked provider
    #[must_use]
    pub fn all_health(&self) -> BTreeMap<String, ProviderHealth> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .map(|(name, record)| (name.clone(), record.snapshot(name)))
            .collect()
    }

    /// Force a provider healthy until its next tracked call
    pub fn mark_healthy(&self, provider: &str) {
        self.set_manual(provider, HealthStatus::Healthy, "marked healthy by operator");
    }

    /// Force a provider unhealthy until its next tracked call
    pub fn mark_unhealthy(&self, provider: &str, reason: &str) {
        self.set_manual(provider, HealthStatus::Unhealthy, reason);
    }

    fn set_manual(&self, provider: &str, status: HealthStatus, reason: &str) {
        let capacity = self.config().window_size;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(provider.to_string())
            .or_insert_with(|| HealthRecord::new(capacity));

        let before = record.status;
        record.status = status;
        record.manual_override = true;
        record.unhealthy_since = match status {
            HealthStatus::Unhealthy => record.unhealthy_since.or_else(|| Some(Utc::now())),
            _ => None,
        };
        info!(provider, status = %status, reason, "Manual health override");
        if before != status {
            self.publish(provider, before, status, reason.to_string());
        }
    }

    /// Drop all samples for a provider; it reads as unknown afterwards
    pub fn reset(&self, provider: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.remove(provider).is_some() {
            debug!(provider, "Health window reset");
        }
    }

    /// Drop all samples for every provider
    pub fn reset_all(&self) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// One pass of the recovery check
    ///
    /// For each unhealthy provider without a manual override, if the most
    /// recent samples meet the recovery threshold the full window is
    /// re-evaluated. Returns the providers that recovered.
    pub fn check_recovery(&self) -> Vec<String> {
        let config = self.config();
        let mut recovered = Vec::new();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

        for (name, record) in records.iter_mut() {
            if record.status != HealthStatus::Unhealthy || record.manual_override {
                continue;
            }
            let Some(recent) = record.recent_success_rate(config.recovery_sample_size) else {
                continue;
            };
            if recent < config.recovery_threshold {
                continue;
            }

            debug!(provider = %name, recent_success_rate = recent, "Recent calls look healthy, re-evaluating");
            if let Some(reason) = record.evaluate(&config) {
                self.publish(name, HealthStatus::Unhealthy, record.status, reason);
                if record.status == HealthStatus::Healthy {
                    recovered.push(name.clone());
                }
            }
        }

        recovered.sort();
        recovered
    }

    /// Run [`Self::check_recovery`] periodically until `cancel` fires
    pub fn spawn_recovery_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config().recovery_check_interval();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health recovery loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let recovered = self.check_recovery();
                        if !recovered.is_empty() {
                            info!(providers = ?recovered, "Providers recovered");
                        }
                    }
                }
            }
        })
    }

    fn publish(&self, provider: &str, from: HealthStatus, to: HealthStatus, reason: String) {
        match to {
            HealthStatus::Unhealthy => {
                warn!(provider, from = %from, reason = %reason, "Provider marked unhealthy")
            }
            _ => info!(provider, from = %from, to = %to, reason = %reason, "Provider health changed"),
        }
        // No receivers is fine
        let _ = self.events.send(HealthEvent {
            provider: provider.to_string(),
            from,
            to,
            reason,
            at: Utc::now(),
        });
    }
}
