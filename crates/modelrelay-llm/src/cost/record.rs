//! Usage records and the aggregates built from them
//!
//! A record is one routed attempt: which provider and model served it, the
//! role and project it was made for, and whether a fallback answered.
//! Failed attempts are error records; they carry no token counts and stay
//! out of the per-call token and cost means.

use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A call record as submitted to the tracker
///
/// Provider and token counts are optional here so a caller that forgot them
/// gets a validation error instead of a silent zero.
#[derive(Debug, Clone, Default)]
pub struct NewUsage {
    /// Provider name
    pub provider: Option<String>,
    /// Model name
    pub model: String,
    /// Role the call was made for
    pub role: Option<String>,
    /// Project the call belongs to
    pub project: Option<String>,
    /// Input tokens
    pub input_tokens: Option<u32>,
    /// Output tokens
    pub output_tokens: Option<u32>,
    /// Cost in USD
    pub cost: f64,
    /// Latency in milliseconds
    pub latency_ms: u64,
    /// Was the request successful?
    pub success: bool,
    /// Correlation ID of the logical call
    pub correlation_id: Option<String>,
    /// Whether the attempt was against a fallback target
    pub fallback_used: bool,
    /// 0 for the primary, n for the n-th fallback
    pub fallback_index: usize,
    /// Why the attempt failed; token counts are optional only when set
    pub error: Option<ErrorKind>,
}

impl NewUsage {
    /// Start a record for a provider/model pair
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set token counts
    #[must_use]
    pub fn with_tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self
    }

    /// Set the cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Set the latency and outcome
    #[must_use]
    pub fn with_outcome(mut self, success: bool, latency_ms: u64) -> Self {
        self.success = success;
        self.latency_ms = latency_ms;
        self
    }

    /// Mark as a failed attempt
    ///
    /// Failed attempts do not need token counts; when absent they are
    /// stored as zero and excluded from per-call means.
    #[must_use]
    pub fn with_failure(mut self, kind: ErrorKind, latency_ms: u64) -> Self {
        self.success = false;
        self.error = Some(kind);
        self.latency_ms = latency_ms;
        self
    }

    /// Tag with a role
    #[must_use]
    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    /// Tag with a project
    #[must_use]
    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    /// Tag with a correlation ID
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Mark as a fallback attempt
    #[must_use]
    pub fn with_fallback(mut self, index: usize) -> Self {
        self.fallback_used = index > 0;
        self.fallback_index = index;
        self
    }

    pub(crate) fn validate(self, id: u64) -> Result<UsageRecord> {
        let provider = self
            .provider
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Validation("usage record is missing provider".into()))?;
        let (input_tokens, output_tokens) = match (self.input_tokens, self.output_tokens, self.error) {
            (Some(input), Some(output), _) => (input, output),
            (None, None, Some(_)) => (0, 0),
            (None, _, _) => {
                return Err(Error::Validation("usage record is missing input_tokens".into()))
            }
            (_, None, _) => {
                return Err(Error::Validation("usage record is missing output_tokens".into()))
            }
        };
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(Error::Validation(format!(
                "usage record has invalid cost {}",
                self.cost
            )));
        }

        Ok(UsageRecord {
            id,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            provider,
            model: self.model,
            role: self.role,
            project: self.project,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cost: self.cost,
            latency_ms: self.latency_ms,
            success: self.success && self.error.is_none(),
            error: self.error,
            fallback_used: self.fallback_used,
            fallback_index: self.fallback_index,
        })
    }
}

/// A single usage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record ID
    pub id: u64,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Correlation ID of the logical call
    pub correlation_id: Option<String>,
    /// Provider name
    pub provider: String,
    /// Model name
    pub model: String,
    /// Role the call was made for
    pub role: Option<String>,
    /// Project the call belongs to
    pub project: Option<String>,
    /// Input tokens
    pub input_tokens: u32,
    /// Output tokens
    pub output_tokens: u32,
    /// Input + output
    pub total_tokens: u32,
    /// Cost (USD)
    pub cost: f64,
    /// Latency in milliseconds
    pub latency_ms: u64,
    /// Was the request successful?
    pub success: bool,
    /// Failure kind of an error record
    pub error: Option<ErrorKind>,
    /// Whether the attempt was against a fallback target
    pub fallback_used: bool,
    /// 0 for the primary, n for the n-th fallback
    pub fallback_index: usize,
}

/// Point filters over usage records; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageFilter {
    /// Only this provider
    pub provider: Option<String>,
    /// Only this role
    pub role: Option<String>,
    /// Only this project
    pub project: Option<String>,
    /// Only this model
    pub model: Option<String>,
    /// Only records at or after this time
    pub since: Option<DateTime<Utc>>,
}

impl UsageFilter {
    /// Filter on provider
    #[must_use]
    pub fn provider(name: impl Into<String>) -> Self {
        Self {
            provider: Some(name.into()),
            ..Default::default()
        }
    }

    /// Filter on role
    #[must_use]
    pub fn role(name: impl Into<String>) -> Self {
        Self {
            role: Some(name.into()),
            ..Default::default()
        }
    }

    /// Filter on project
    #[must_use]
    pub fn project(name: impl Into<String>) -> Self {
        Self {
            project: Some(name.into()),
            ..Default::default()
        }
    }

    /// Whether a record passes every set field
    #[must_use]
    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.matches_key(&UsageKey::of(record))
            && self.since.map_or(true, |since| record.timestamp >= since)
    }

    /// Same as [`matches`](Self::matches) without the time bound
    pub(crate) fn matches_key(&self, key: &UsageKey) -> bool {
        fn eq(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |w| have == Some(w))
        }

        eq(&self.provider, Some(key.provider.as_str()))
            && eq(&self.model, Some(key.model.as_str()))
            && eq(&self.role, key.role.as_deref())
            && eq(&self.project, key.project.as_deref())
    }
}

/// The dimensions a record can be filtered and grouped on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct UsageKey {
    provider: String,
    model: String,
    role: Option<String>,
    project: Option<String>,
}

impl UsageKey {
    pub(crate) fn of(record: &UsageRecord) -> Self {
        Self {
            provider: record.provider.clone(),
            model: record.model.clone(),
            role: record.role.clone(),
            project: record.project.clone(),
        }
    }
}

/// Running sums over a set of records
///
/// Only ever grows; merging two tallies gives the tally of the union.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Tally {
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    cost: f64,
    requests: u64,
    successes: u64,
    fallback_successes: u64,
    success_tokens: u64,
    success_cost: f64,
    latency_ms: u128,
}

impl Tally {
    pub(crate) fn add(&mut self, record: &UsageRecord) {
        self.input_tokens += u64::from(record.input_tokens);
        self.output_tokens += u64::from(record.output_tokens);
        self.total_tokens += u64::from(record.total_tokens);
        self.cost += record.cost;
        self.requests += 1;
        self.latency_ms += u128::from(record.latency_ms);
        if record.success {
            self.successes += 1;
            self.success_tokens += u64::from(record.total_tokens);
            self.success_cost += record.cost;
            if record.fallback_used {
                self.fallback_successes += 1;
            }
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
        self.requests += other.requests;
        self.successes += other.successes;
        self.fallback_successes += other.fallback_successes;
        self.success_tokens += other.success_tokens;
        self.success_cost += other.success_cost;
        self.latency_ms += other.latency_ms;
    }

    fn avg_tokens(&self) -> f64 {
        mean(self.success_tokens as f64, self.successes)
    }

    fn avg_cost(&self) -> f64 {
        mean(self.success_cost, self.successes)
    }

    fn group(&self, name: String) -> GroupStats {
        GroupStats {
            name,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            total_cost: self.cost,
            request_count: self.requests,
            failed_count: self.requests - self.successes,
            avg_tokens_per_call: self.avg_tokens(),
        }
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Totals for one provider, role, project or model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Group key
    pub name: String,
    /// Total input tokens
    pub input_tokens: u64,
    /// Total output tokens
    pub output_tokens: u64,
    /// Total tokens
    pub total_tokens: u64,
    /// Total cost
    pub total_cost: f64,
    /// Request count
    pub request_count: u64,
    /// Failed request count
    pub failed_count: u64,
    /// Mean tokens per successful request
    pub avg_tokens_per_call: f64,
}

/// Aggregated usage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Total input tokens
    pub total_input_tokens: u64,
    /// Total output tokens
    pub total_output_tokens: u64,
    /// Total tokens
    pub total_tokens: u64,
    /// Total cost (USD)
    pub total_cost: f64,
    /// Total requests, failed attempts included
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Requests answered by a fallback target
    pub fallback_requests: u64,
    /// Average latency over every request (ms)
    pub avg_latency_ms: f64,
    /// Average tokens per successful request
    pub avg_tokens_per_call: f64,
    /// Average cost per successful request
    pub avg_cost_per_call: f64,
    /// Usage by provider
    pub by_provider: BTreeMap<String, GroupStats>,
    /// Usage by role
    pub by_role: BTreeMap<String, GroupStats>,
    /// Usage by project
    pub by_project: BTreeMap<String, GroupStats>,
    /// Usage by model
    pub by_model: BTreeMap<String, GroupStats>,
}

impl UsageStats {
    /// Aggregate the given records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut tallies: BTreeMap<UsageKey, Tally> = BTreeMap::new();
        for record in records {
            tallies.entry(UsageKey::of(record)).or_default().add(record);
        }
        Self::from_tallies(&tallies)
    }

    pub(crate) fn from_tallies<'a>(tallies: impl IntoIterator<Item = (&'a UsageKey, &'a Tally)>) -> Self {
        let mut overall = Tally::default();
        let mut by_provider = BTreeMap::new();
        let mut by_model = BTreeMap::new();
        let mut by_role = BTreeMap::new();
        let mut by_project = BTreeMap::new();

        for (key, tally) in tallies {
            overall.merge(tally);
            group(&mut by_provider, Some(&key.provider), tally);
            group(&mut by_model, Some(&key.model), tally);
            group(&mut by_role, key.role.as_ref(), tally);
            group(&mut by_project, key.project.as_ref(), tally);
        }

        Self {
            total_input_tokens: overall.input_tokens,
            total_output_tokens: overall.output_tokens,
            total_tokens: overall.total_tokens,
            total_cost: overall.cost,
            total_requests: overall.requests,
            successful_requests: overall.successes,
            failed_requests: overall.requests - overall.successes,
            fallback_requests: overall.fallback_successes,
            avg_latency_ms: mean(overall.latency_ms as f64, overall.requests),
            avg_tokens_per_call: overall.avg_tokens(),
            avg_cost_per_call: overall.avg_cost(),
            by_provider: finish(by_provider),
            by_role: finish(by_role),
            by_project: finish(by_project),
            by_model: finish(by_model),
        }
    }
}

fn group(map: &mut BTreeMap<String, Tally>, key: Option<&String>, tally: &Tally) {
    let Some(key) = key else { return };
    map.entry(key.clone()).or_default().merge(tally);
}

fn finish(groups: BTreeMap<String, Tally>) -> BTreeMap<String, GroupStats> {
    groups
        .into_iter()
        .map(|(name, tally)| {
            let stats = tally.group(name.clone());
            (name, stats)
        })
        .collect()
}
