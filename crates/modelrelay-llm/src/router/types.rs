//! Router types
//!
//! Per-call options and the call record handed to metrics sinks.

use crate::completion::{ChatOptions, TokenUsage};
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Options for one logical call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Generation parameters passed to the provider
    pub chat: ChatOptions,
    /// Project tag used in accounting
    pub project: Option<String>,
    /// Correlation ID; generated when absent
    pub correlation_id: Option<String>,
    /// Aborts the whole call, fallbacks included
    pub cancel: Option<CancellationToken>,
    /// Point after which the whole call is abandoned
    pub deadline: Option<Instant>,
}

impl CallOptions {
    /// Set generation parameters
    #[must_use]
    pub fn with_chat(mut self, chat: ChatOptions) -> Self {
        self.chat = chat;
        self
    }

    /// Tag with a project
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Use a caller-supplied correlation ID
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Abandon the call after `timeout` from now
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Outcome of one attempt against one provider/model pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    /// Provider tried
    pub provider: String,
    /// Model tried
    pub model: String,
    /// Role being served, if any
    pub role: Option<String>,
    /// Project tag
    pub project: Option<String>,
    /// Correlation ID of the logical call
    pub correlation_id: String,
    /// Wall-clock time of the attempt, retries included
    pub latency_ms: u64,
    /// Token usage (zero for failures)
    pub tokens: TokenUsage,
    /// Cost in USD (zero for failures)
    pub cost: f64,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Failure kind
    pub error: Option<ErrorKind>,
    /// Provider invocations, retries included
    pub invocations: u32,
    /// Whether the target was a fallback
    pub fallback_used: bool,
    /// 0 for the primary, n for the n-th fallback
    pub fallback_index: usize,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
}

/// Receives a [`CallRecord`] for every attempt the router makes
pub trait MetricsSink: Send + Sync {
    /// Handle one record; must not block
    fn record(&self, record: &CallRecord);
}
