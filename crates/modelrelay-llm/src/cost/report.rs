//! Cost Reporting
//!
//! This module contains the cost report type and its text rendering.

use super::record::{UsageFilter, UsageRecord, UsageStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Cost report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReport {
    /// When report was generated
    pub generated_at: DateTime<Utc>,
    /// Filter the report was built with
    pub filter: UsageFilter,
    /// Usage statistics
    pub stats: UsageStats,
    /// Recent records
    pub recent_records: Vec<UsageRecord>,
    /// Most expensive model
    pub most_expensive_model: Option<String>,
    /// Provider with the most requests
    pub most_used_provider: Option<String>,
    /// Budget position, when a budget is configured
    pub budget: Option<BudgetStatus>,
}

/// Spend against the configured budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// Configured budget (USD)
    pub budget: f64,
    /// Spend so far (USD)
    pub spent: f64,
    /// Budget left, never negative
    pub remaining: f64,
    /// Spend is over budget
    pub exceeded: bool,
}

/// Format report as text
#[must_use]
pub fn format_report(report: &CostReport) -> String {
    let mut output = String::new();
    let stats = &report.stats;

    output.push_str("LLM Cost Report\n\n");
    let _ = writeln!(
        output,
        "Generated: {}",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let filter = &report.filter;
    for (label, value) in [
        ("Provider", &filter.provider),
        ("Role", &filter.role),
        ("Project", &filter.project),
        ("Model", &filter.model),
    ] {
        if let Some(value) = value {
            let _ = writeln!(output, "{label}: {value}");
        }
    }
    if let Some(since) = filter.since {
        let _ = writeln!(output, "Period: {} to now", since.format("%Y-%m-%d"));
    }

    output.push_str("\nSummary:\n");
    let _ = writeln!(
        output,
        "  Total Requests: {} ({} success, {} failed, {} via fallback)",
        stats.total_requests, stats.successful_requests, stats.failed_requests, stats.fallback_requests
    );
    let _ = writeln!(
        output,
        "  Total Tokens: {} input, {} output",
        stats.total_input_tokens, stats.total_output_tokens
    );
    let _ = writeln!(output, "  Total Cost: ${:.4}", stats.total_cost);
    let _ = writeln!(output, "  Avg Tokens/Call: {:.1}", stats.avg_tokens_per_call);
    let _ = writeln!(output, "  Avg Latency: {:.0}ms", stats.avg_latency_ms);

    if let Some(provider) = &report.most_used_provider {
        let _ = writeln!(output, "  Most Used Provider: {provider}");
    }
    if let Some(model) = &report.most_expensive_model {
        let _ = writeln!(output, "  Most Expensive Model: {model}");
    }

    for (title, groups) in [
        ("By Provider", &stats.by_provider),
        ("By Role", &stats.by_role),
        ("By Project", &stats.by_project),
    ] {
        if groups.is_empty() {
            continue;
        }
        let _ = writeln!(output, "\n{title}:");
        for (name, group) in groups {
            let _ = writeln!(
                output,
                "  {}: {} requests, {} tokens, ${:.4}",
                name, group.request_count, group.total_tokens, group.total_cost
            );
        }
    }

    if let Some(budget) = &report.budget {
        let _ = writeln!(
            output,
            "\nBudget: ${:.2} spent of ${:.2} ({})",
            budget.spent,
            budget.budget,
            if budget.exceeded {
                "EXCEEDED".to_string()
            } else {
                format!("${:.2} remaining", budget.remaining)
            }
        );
    }

    output
}
