//! Cost tracker for routed calls
//!
//! Totals are kept as running tallies per provider, model, role and project
//! and are never trimmed. Only the list of raw records is bounded; it backs
//! correlation lookups, recent-record listings and time-windowed metrics.

use super::record::{NewUsage, Tally, UsageFilter, UsageKey, UsageRecord, UsageStats};
use super::report::{BudgetStatus, CostReport};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Raw records kept in memory by default
const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Records included in a report
const REPORT_RECENT_RECORDS: usize = 20;

/// Spend caps; crossing one logs a warning, it never blocks a call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostLimits {
    /// Cost above which a single call is flagged (USD)
    pub max_cost_per_call: Option<f64>,
    /// Total spend above which every call is flagged (USD)
    pub total_budget: Option<f64>,
}

impl CostLimits {
    /// Check the caps are usable
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_cost_per_call", self.max_cost_per_call),
            ("total_budget", self.total_budget),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(Error::Config(format!("{name} must be non-negative, got {v}")));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ledger {
    /// Retained raw records, oldest first
    records: VecDeque<UsageRecord>,
    /// Running sums per provider/model/role/project
    tallies: BTreeMap<UsageKey, Tally>,
    /// Timestamp of the newest record dropped from `records`
    trimmed_through: Option<DateTime<Utc>>,
}

impl Ledger {
    fn stats(&self, filter: &UsageFilter) -> UsageStats {
        let Some(since) = filter.since else {
            return UsageStats::from_tallies(self.tallies.iter().filter(|(key, _)| filter.matches_key(key)));
        };
        if self.trimmed_through.is_some_and(|trimmed| trimmed >= since) {
            debug!(%since, "Time window starts before the oldest retained record");
        }
        UsageStats::from_records(self.records.iter().filter(|r| filter.matches(r)))
    }
}

/// Per-attempt token and spend accounting
#[derive(Debug)]
pub struct CostTracker {
    ledger: RwLock<Ledger>,
    /// Record ID counter
    next_id: AtomicU64,
    /// Raw records kept in memory
    max_records: usize,
    /// Spend caps
    limits: CostLimits,
    /// Spend since creation, including trimmed records
    lifetime_cost: Mutex<f64>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    /// Create a new cost tracker without limits
    #[must_use]
    pub fn new() -> Self {
        Self {
            ledger: RwLock::new(Ledger::default()),
            next_id: AtomicU64::new(1),
            max_records: DEFAULT_MAX_RECORDS,
            limits: CostLimits::default(),
            lifetime_cost: Mutex::new(0.0),
        }
    }

    /// Bound the raw record list; totals are unaffected
    #[must_use]
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max.max(1);
        self
    }

    /// Set spend caps
    #[must_use]
    pub fn with_limits(mut self, limits: CostLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Active spend caps
    #[must_use]
    pub fn limits(&self) -> &CostLimits {
        &self.limits
    }

    /// Record a usage event
    ///
    /// Fails with [`Error::Validation`] if provider or token counts are
    /// missing; nothing is recorded in that case.
    pub async fn track(&self, usage: NewUsage) -> Result<UsageRecord> {
        let record = usage.validate(self.next_id.fetch_add(1, Ordering::SeqCst))?;

        let total = {
            let mut lifetime = self.lifetime_cost.lock().unwrap_or_else(|e| e.into_inner());
            *lifetime += record.cost;
            *lifetime
        };
        self.check_limits(&record, total);

        debug!(
            provider = %record.provider,
            model = %record.model,
            tokens = record.total_tokens,
            cost = record.cost,
            "Usage recorded"
        );

        let mut ledger = self.ledger.write().await;
        ledger
            .tallies
            .entry(UsageKey::of(&record))
            .or_default()
            .add(&record);
        ledger.records.push_back(record.clone());
        while ledger.records.len() > self.max_records {
            if let Some(dropped) = ledger.records.pop_front() {
                ledger.trimmed_through = Some(dropped.timestamp);
            }
        }

        Ok(record)
    }

    fn check_limits(&self, record: &UsageRecord, total: f64) {
        if let Some(cap) = self.limits.max_cost_per_call {
            if record.cost > cap {
                warn!(
                    provider = %record.provider,
                    model = %record.model,
                    cost = record.cost,
                    cap,
                    "Call cost exceeds per-call limit"
                );
            }
        }
        if let Some(budget) = self.limits.total_budget {
            if total > budget {
                warn!(total, budget, "Total spend exceeds budget");
            }
        }
    }

    /// Aggregated statistics over records matching `filter`
    ///
    /// Exact over every record ever tracked. A `since` bound is answered
    /// from the retained raw records.
    pub async fn metrics(&self, filter: &UsageFilter) -> UsageStats {
        self.ledger.read().await.stats(filter)
    }

    /// Spend since creation
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        *self.lifetime_cost.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get recent records
    pub async fn recent_records(&self, limit: usize) -> Vec<UsageRecord> {
        let ledger = self.ledger.read().await;
        let skip = ledger.records.len().saturating_sub(limit);
        ledger.records.iter().skip(skip).cloned().collect()
    }

    /// Records of one logical call
    pub async fn records_for(&self, correlation_id: &str) -> Vec<UsageRecord> {
        self.ledger
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect()
    }

    /// Generate a cost report
    pub async fn report(&self, filter: &UsageFilter) -> CostReport {
        let (stats, recent_records) = {
            let ledger = self.ledger.read().await;
            let matching: Vec<&UsageRecord> =
                ledger.records.iter().filter(|r| filter.matches(r)).collect();
            let start = matching.len().saturating_sub(REPORT_RECENT_RECORDS);
            (
                ledger.stats(filter),
                matching[start..].iter().map(|r| (*r).clone()).collect::<Vec<_>>(),
            )
        };

        // Find most expensive model
        let most_expensive_model = stats
            .by_model
            .iter()
            .max_by(|a, b| {
                a.1.total_cost
                    .partial_cmp(&b.1.total_cost)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.clone());

        // Find most used provider
        let most_used_provider = stats
            .by_provider
            .iter()
            .max_by_key(|(_, s)| s.request_count)
            .map(|(name, _)| name.clone());

        let budget = self.limits.total_budget.map(|budget| {
            let spent = self.total_cost();
            BudgetStatus {
                budget,
                spent,
                remaining: (budget - spent).max(0.0),
                exceeded: spent > budget,
            }
        });

        CostReport {
            generated_at: Utc::now(),
            filter: filter.clone(),
            stats,
            recent_records,
            most_expensive_model,
            most_used_provider,
            budget,
        }
    }

    /// Drop every record and reset the running total
    pub async fn clear(&self) {
        *self.ledger.write().await = Ledger::default();
        *self.lifetime_cost.lock().unwrap_or_else(|e| e.into_inner()) = 0.0;
    }
}
