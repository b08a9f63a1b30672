//! Cost Tracking - token and spend accounting
//!
//! Every provider attempt the router makes ends up here as a
//! [`UsageRecord`]. Accounting is append-only: running tallies grow with
//! every record and are never trimmed, and the means are derived from them
//! at read time.
//!
//! # Module Structure
//!
//! - `record`: usage records, filters and aggregated statistics
//! - `tracker`: the [`CostTracker`] and its spend limits
//! - `report`: cost reports and their text rendering

mod record;
mod report;
mod tracker;

#[cfg(test)]
mod tests;

pub use record::{GroupStats, NewUsage, UsageFilter, UsageRecord, UsageStats};
pub use report::{format_report, BudgetStatus, CostReport};
pub use tracker::{CostLimits, CostTracker};
