//! Router implementation
//!
//! One logical call walks an attempt plan: the primary (or, when the primary
//! is unhealthy, its first fallback) and then the remaining fallbacks in
//! configured order. Each attempt goes through the provider's rate limiter
//! inside a bounded retry loop. Attempts are strictly sequential.

use super::classify::classify;
use super::types::{CallOptions, CallRecord, MetricsSink};
use crate::completion::{ChatRequest, ChatResponse, TokenUsage};
use crate::config::{validate_roles, ModelTarget, RelaySettings, RoleTable};
use crate::cost::{CostTracker, NewUsage, UsageFilter, UsageStats};
use crate::error::{AttemptFailure, Error, ErrorContext, Result};
use crate::health::{HealthMonitor, HealthOutcome, ProviderHealth};
use crate::limiter::LimiterPermit;
use crate::message::Message;
use crate::provider::LlmProvider;
use crate::registry::ProviderRegistry;
use crate::retry::{retry_with_hint, BackoffSettings, RetryPolicy};
use crate::streaming::{ChatStream, ChunkSender, StreamChunk, STREAM_BUFFER};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Internal types
// ============================================================================

#[derive(Debug, Clone)]
struct PlannedAttempt {
    target: ModelTarget,
    /// 0 for the primary, n for the n-th configured fallback
    fallback_index: usize,
}

#[derive(Debug)]
struct Plan {
    attempts: Vec<PlannedAttempt>,
    has_fallbacks: bool,
    health_substituted: bool,
}

/// Identity shared by every attempt of one logical call
#[derive(Debug, Clone)]
struct CallScope {
    role: Option<String>,
    project: Option<String>,
    correlation_id: String,
}

impl CallScope {
    fn new(role: Option<&str>, options: &CallOptions) -> Self {
        Self {
            role: role.map(str::to_string),
            project: options.project.clone(),
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }

    fn record(
        &self,
        step: &PlannedAttempt,
        result: std::result::Result<&ChatResponse, &Error>,
        latency: Duration,
        invocations: u32,
    ) -> CallRecord {
        let (tokens, cost, error) = match result {
            Ok(response) => (response.tokens, response.cost_or_zero(), None),
            Err(error) => (TokenUsage::default(), 0.0, Some(error.kind())),
        };
        CallRecord {
            provider: step.target.provider.clone(),
            model: step.target.model.clone(),
            role: self.role.clone(),
            project: self.project.clone(),
            correlation_id: self.correlation_id.clone(),
            latency_ms: latency.as_millis() as u64,
            tokens,
            cost,
            success: error.is_none(),
            error,
            invocations,
            fallback_used: step.fallback_index > 0,
            fallback_index: step.fallback_index,
            timestamp: Utc::now(),
        }
    }
}

/// Health monitor, cost tracker and sinks that receive call outcomes
#[derive(Clone, Default)]
struct Accounting {
    health: Option<Arc<HealthMonitor>>,
    tracker: Option<Arc<CostTracker>>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl Accounting {
    /// One provider invocation, for the health window
    fn invocation(&self, provider: &str, error: Option<&Error>, latency: Duration) {
        let Some(health) = &self.health else { return };
        let latency_ms = latency.as_millis() as u64;
        let outcome = match error {
            None => HealthOutcome::success(latency_ms),
            Some(error) => HealthOutcome::failure(latency_ms, error.to_string()),
        };
        health.track_health(provider, outcome);
    }

    /// Terminal outcome of one attempt, for cost tracking and sinks
    async fn attempt(&self, record: CallRecord) {
        if let Some(tracker) = &self.tracker {
            let usage = NewUsage::new(&record.provider, &record.model);
            let usage = match record.error {
                None => usage
                    .with_tokens(record.tokens.input, record.tokens.output)
                    .with_cost(record.cost)
                    .with_outcome(true, record.latency_ms),
                Some(kind) => usage.with_failure(kind, record.latency_ms),
            };
            let usage = usage
                .with_role(record.role.clone())
                .with_project(record.project.clone())
                .with_correlation_id(&record.correlation_id)
                .with_fallback(record.fallback_index);
            if let Err(e) = tracker.track(usage).await {
                warn!(provider = %record.provider, error = %e, "Failed to record usage");
            }
        }
        for sink in &self.sinks {
            sink.record(&record);
        }
    }
}

struct AttemptOutcome {
    result: Result<ChatResponse>,
    invocations: u32,
}

// ============================================================================
// Router
// ============================================================================

/// Role-based LLM router with retry, health-aware substitution and fallback
pub struct Router {
    registry: Arc<ProviderRegistry>,
    roles: RwLock<RoleTable>,
    backoff: BackoffSettings,
    accounting: Accounting,
}

impl Router {
    /// Create a router over a registry, with no roles and no accounting
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            roles: RwLock::new(RoleTable::new()),
            backoff: BackoffSettings::default(),
            accounting: Accounting::default(),
        }
    }

    /// Build a fully wired router from validated settings
    ///
    /// Creates the health monitor and cost tracker from the settings and
    /// checks every role against the registry.
    pub fn from_settings(registry: Arc<ProviderRegistry>, settings: &RelaySettings) -> Result<Self> {
        let health = Arc::new(HealthMonitor::new(settings.health.clone())?);
        let tracker = Arc::new(CostTracker::new().with_limits(settings.costs.clone()));
        Self::new(registry)
            .with_backoff(settings.retry.clone())
            .with_health(health)
            .with_tracker(tracker)
            .with_roles(settings.roles.clone())
    }

    /// Install the role table, validating it against the registry
    pub fn with_roles(self, roles: RoleTable) -> Result<Self> {
        self.update_roles(roles)?;
        Ok(self)
    }

    /// Attach a health monitor
    #[must_use]
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.accounting.health = Some(health);
        self
    }

    /// Attach a cost tracker
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.accounting.tracker = Some(tracker);
        self
    }

    /// Attach a metrics sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.accounting.sinks.push(sink);
        self
    }

    /// Set the retry backoff
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    /// The provider registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The attached health monitor
    #[must_use]
    pub fn health(&self) -> Option<&Arc<HealthMonitor>> {
        self.accounting.health.as_ref()
    }

    /// The attached cost tracker
    #[must_use]
    pub fn tracker(&self) -> Option<&Arc<CostTracker>> {
        self.accounting.tracker.as_ref()
    }

    /// Snapshot of the role table
    #[must_use]
    pub fn roles(&self) -> RoleTable {
        self.roles.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the role table
    ///
    /// Every target must name a registered provider. On failure the current
    /// table stays in place.
    pub fn update_roles(&self, roles: RoleTable) -> Result<()> {
        validate_roles(&roles, |name| self.registry.contains(name))?;
        let count = roles.len();
        *self.roles.write().unwrap_or_else(|e| e.into_inner()) = roles;
        info!(roles = count, "Role table updated");
        Ok(())
    }

    /// Primary target and ordered fallbacks for a role
    pub fn resolve(&self, role: &str) -> Result<(ModelTarget, Vec<ModelTarget>)> {
        let roles = self.roles.read().unwrap_or_else(|e| e.into_inner());
        let mapping = roles
            .get(role)
            .ok_or_else(|| Error::RoleNotMapped(role.to_string()))?;
        let primary = mapping
            .primary
            .clone()
            .ok_or_else(|| Error::RoleHasNoPrimary(role.to_string()))?;
        Ok((primary, mapping.fallbacks.clone()))
    }

    /// Call the provider/model mapped to `role`, falling back on
    /// connection-class failures
    #[instrument(skip(self, messages, options), fields(role = %role))]
    pub async fn call_by_role(
        &self,
        role: &str,
        messages: Vec<Message>,
        options: CallOptions,
    ) -> Result<ChatResponse> {
        let (primary, fallbacks) = self.resolve(role)?;
        let plan = self.plan(role, primary, fallbacks);
        let scope = CallScope::new(Some(role), &options);
        let request = base_request(messages, &options, &scope);

        guarded(&options, self.execute(&scope, plan, &request)).await
    }

    /// Call an explicit provider/model
    ///
    /// Rate limiting, retry and accounting apply; role resolution, health
    /// substitution and fallback do not.
    #[instrument(skip(self, messages, options), fields(provider = %provider, model = %model))]
    pub async fn call(
        &self,
        provider: &str,
        model: &str,
        messages: Vec<Message>,
        options: CallOptions,
    ) -> Result<ChatResponse> {
        let plan = Plan {
            attempts: vec![PlannedAttempt {
                target: ModelTarget::new(provider, model),
                fallback_index: 0,
            }],
            has_fallbacks: false,
            health_substituted: false,
        };
        let scope = CallScope::new(None, &options);
        let request = base_request(messages, &options, &scope);

        guarded(&options, self.execute(&scope, plan, &request)).await
    }

    /// Stream from the primary target of `role`
    ///
    /// No retry and no fallback: partial output cannot be replayed against
    /// another provider. The final chunk carries the cost. The provider's
    /// limiter slot is held until the stream ends or the consumer drops it.
    #[instrument(skip(self, messages, options), fields(role = %role))]
    pub async fn stream(
        &self,
        role: &str,
        messages: Vec<Message>,
        options: CallOptions,
    ) -> Result<ChatStream> {
        let (primary, _) = self.resolve(role)?;
        let scope = CallScope::new(Some(role), &options);
        let entry = self.registry.entry(&primary.provider)?;
        let request = ChatRequest {
            model: primary.model.clone(),
            ..base_request(messages, &options, &scope)
        };
        let step = PlannedAttempt {
            target: primary,
            fallback_index: 0,
        };

        let started = Instant::now();
        let provider = entry.provider.as_ref();
        let limiter = entry.limiter.as_ref();
        let opened = guarded(&options, async {
            let permit = limiter.acquire().await?;
            let upstream = provider.stream(&request).await?;
            Ok::<_, Error>((permit, upstream))
        })
        .await;

        let (permit, upstream) = match opened {
            Ok(opened) => opened,
            Err(error) => {
                if !matches!(error, Error::Cancelled) {
                    self.accounting
                        .invocation(&step.target.provider, Some(&error), started.elapsed());
                    let record = scope.record(&step, Err(&error), started.elapsed(), 1);
                    self.accounting.attempt(record).await;
                }
                return Err(error);
            }
        };

        debug!(provider = %step.target.provider, model = %step.target.model, "Stream opened");
        let (tx, stream) = ChatStream::channel(STREAM_BUFFER);
        let relay = StreamRelay {
            accounting: self.accounting.clone(),
            provider: Arc::clone(&entry.provider),
            scope,
            step,
            started,
            cancel: options.cancel.clone().unwrap_or_default(),
            deadline: options.deadline,
            _permit: permit,
        };
        tokio::spawn(relay.run(upstream, tx));

        Ok(stream)
    }

    /// Health snapshot of every registered provider
    ///
    /// Providers without data report `unknown`. Empty when no monitor is
    /// attached.
    #[must_use]
    pub fn get_provider_health(&self) -> BTreeMap<String, ProviderHealth> {
        let Some(health) = &self.accounting.health else {
            return BTreeMap::new();
        };
        let mut snapshot = health.all_health();
        for name in self.registry.list() {
            if !snapshot.contains_key(&name) {
                let entry = health.get_provider_health(&name);
                snapshot.insert(name, entry);
            }
        }
        snapshot
    }

    /// Aggregated usage for records matching `filter`
    pub async fn get_metrics(&self, filter: &UsageFilter) -> UsageStats {
        match &self.accounting.tracker {
            Some(tracker) => tracker.metrics(filter).await,
            None => UsageStats::default(),
        }
    }

    // ========================================================================
    // Orchestration
    // ========================================================================

    fn plan(&self, role: &str, primary: ModelTarget, fallbacks: Vec<ModelTarget>) -> Plan {
        let has_fallbacks = !fallbacks.is_empty();
        let primary_unhealthy = self
            .accounting
            .health
            .as_ref()
            .is_some_and(|health| health.is_unhealthy(&primary.provider));

        let mut attempts: Vec<PlannedAttempt> = std::iter::once(primary)
            .chain(fallbacks)
            .enumerate()
            .map(|(fallback_index, target)| PlannedAttempt {
                target,
                fallback_index,
            })
            .collect();

        let mut health_substituted = false;
        if primary_unhealthy {
            let primary = attempts[0].target.clone();
            match attempts.get(1).map(|first| first.target.clone()) {
                Some(substitute) if substitute.provider != primary.provider => {
                    info!(
                        role,
                        primary = %primary,
                        substitute = %substitute,
                        "Primary unhealthy, starting with first fallback"
                    );
                    attempts.remove(0);
                    health_substituted = true;
                }
                Some(_) => warn!(
                    role,
                    primary = %primary,
                    "Primary unhealthy and first fallback uses the same provider, using primary"
                ),
                None => warn!(
                    role,
                    primary = %primary,
                    "Primary unhealthy and no fallback configured, using primary"
                ),
            }
        }

        Plan {
            attempts,
            has_fallbacks,
            health_substituted,
        }
    }

    async fn execute(&self, scope: &CallScope, plan: Plan, base: &ChatRequest) -> Result<ChatResponse> {
        let mut trail: Vec<AttemptFailure> = Vec::with_capacity(plan.attempts.len());
        let mut invocations = 0u32;

        for (position, step) in plan.attempts.iter().enumerate() {
            let outcome = self.attempt(scope, step, base).await;
            invocations = invocations.saturating_add(outcome.invocations);

            let error = match outcome.result {
                Ok(mut response) => {
                    response.metadata.fallback_used = step.fallback_index > 0;
                    response.metadata.fallback_index = step.fallback_index;
                    response.metadata.health_substituted = plan.health_substituted;
                    response.metadata.attempts = invocations;
                    if step.fallback_index > 0 {
                        info!(
                            provider = %step.target.provider,
                            model = %step.target.model,
                            fallback_index = step.fallback_index,
                            "Served by fallback"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !classify(&error).is_connection() {
                debug!(
                    provider = %step.target.provider,
                    kind = ?error.kind(),
                    "Non-connection failure, not falling back"
                );
                return Err(error);
            }

            if let Some(next) = plan.attempts.get(position + 1) {
                warn!(
                    failed = %step.target,
                    next = %next.target,
                    error = %error,
                    "Connection-class failure, falling back"
                );
            }
            trail.push(AttemptFailure {
                provider: step.target.provider.clone(),
                model: step.target.model.clone(),
                error,
            });
        }

        if !plan.has_fallbacks {
            if let Some(only) = trail.pop() {
                return Err(only.error);
            }
        }

        let role = scope.role.clone().unwrap_or_default();
        warn!(role = %role, attempts = trail.len(), "Every provider failed");
        Err(Error::FallbackExhausted {
            role,
            attempts: trail,
        })
    }

    /// One target: limiter + retry, then accounting for the outcome
    async fn attempt(&self, scope: &CallScope, step: &PlannedAttempt, base: &ChatRequest) -> AttemptOutcome {
        let entry = match self.registry.entry(&step.target.provider) {
            Ok(entry) => entry,
            Err(error) => {
                return AttemptOutcome {
                    result: Err(error),
                    invocations: 0,
                }
            }
        };

        let provider: &dyn LlmProvider = entry.provider.as_ref();
        let limiter = entry.limiter.as_ref();
        let policy = RetryPolicy::new(provider.descriptor().max_retries, self.backoff.clone());
        let timeout = provider.descriptor().timeout;
        let request = ChatRequest {
            model: step.target.model.clone(),
            ..base.clone()
        };
        let request = &request;
        let name = step.target.provider.as_str();
        let accounting = &self.accounting;

        let started = Instant::now();
        let retried = retry_with_hint(
            &policy,
            move |attempt| async move {
                debug!(provider = name, model = %request.model, attempt, "Dispatching");
                limiter
                    .schedule(move || async move {
                        let sent = Instant::now();
                        let result = match tokio::time::timeout(timeout, provider.chat(request)).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::Timeout {
                                context: ErrorContext::new(name, &request.model)
                                    .with_latency(sent.elapsed()),
                                status: None,
                            }),
                        };
                        accounting.invocation(name, result.as_ref().err(), sent.elapsed());
                        result
                    })
                    .await
            },
            |error| provider.is_retryable_error(error),
            Error::retry_after,
        )
        .await;
        let latency = started.elapsed();

        let (result, invocations) = match retried {
            Ok(done) => {
                let response = finish_response(done.value, provider, scope, step);
                (Ok(response), done.attempts)
            }
            Err(failed) => (Err(failed.last_error), failed.attempts),
        };

        let record = scope.record(step, result.as_ref(), latency, invocations);
        self.accounting.attempt(record).await;

        AttemptOutcome {
            result,
            invocations,
        }
    }
}

fn base_request(messages: Vec<Message>, options: &CallOptions, scope: &CallScope) -> ChatRequest {
    ChatRequest::new(String::new())
        .with_messages(messages)
        .with_options(options.chat.clone())
        .with_correlation_id(scope.correlation_id.clone())
}

/// Stamp routing identity and cost onto an adapter response
fn finish_response(
    mut response: ChatResponse,
    provider: &dyn LlmProvider,
    scope: &CallScope,
    step: &PlannedAttempt,
) -> ChatResponse {
    if response.cost.is_none() {
        response.cost = Some(provider.calculate_cost(
            response.tokens.input,
            response.tokens.output,
            &step.target.model,
        ));
    }
    response.provider = step.target.provider.clone();
    response.model = step.target.model.clone();
    response.role = scope.role.clone();
    response.correlation_id = scope.correlation_id.clone();
    response
}

/// Run `call` unless the caller cancels or the deadline passes first
async fn guarded<T>(options: &CallOptions, call: impl Future<Output = Result<T>>) -> Result<T> {
    let cancel = options.cancel.clone().unwrap_or_default();
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            info!("Call cancelled by caller");
            Err(Error::Cancelled)
        }
        () = until(options.deadline) => {
            info!("Call deadline passed");
            Err(Error::Cancelled)
        }
        result = call => result,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Streaming relay
// ============================================================================

/// Forwards provider chunks to the caller, prices the final chunk and does
/// the accounting once the stream ends
struct StreamRelay {
    accounting: Accounting,
    provider: Arc<dyn LlmProvider>,
    scope: CallScope,
    step: PlannedAttempt,
    started: Instant,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    _permit: LimiterPermit,
}

impl StreamRelay {
    async fn run(self, mut upstream: ChatStream, tx: ChunkSender) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Some(Err(Error::Cancelled)),
                () = until(self.deadline) => Some(Err(Error::Cancelled)),
                () = tx.closed() => {
                    self.abandon().await;
                    return;
                }
                chunk = upstream.next_chunk() => chunk,
            };

            match next {
                Some(Ok(StreamChunk::Done {
                    tokens,
                    cost,
                    latency_ms,
                    finish_reason,
                    ..
                })) => {
                    let cost = cost.unwrap_or_else(|| {
                        self.provider
                            .calculate_cost(tokens.input, tokens.output, &self.step.target.model)
                    });
                    let done = StreamChunk::Done {
                        tokens,
                        cost: Some(cost),
                        provider: self.step.target.provider.clone(),
                        model: self.step.target.model.clone(),
                        latency_ms,
                        finish_reason,
                    };
                    let response = ChatResponse {
                        tokens,
                        cost: Some(cost),
                        ..Default::default()
                    };
                    self.finish(Ok(&response)).await;
                    let _ = tx.send(Ok(done)).await;
                    return;
                }
                Some(Ok(delta)) => {
                    if tx.send(Ok(delta)).await.is_err() {
                        self.abandon().await;
                        return;
                    }
                }
                Some(Err(error)) => {
                    self.finish(Err(&error)).await;
                    let _ = tx.send(Err(error)).await;
                    return;
                }
                None => {
                    let error = Error::InvalidResponse {
                        context: ErrorContext::new(&self.step.target.provider, &self.step.target.model)
                            .with_latency(self.started.elapsed()),
                        message: "stream ended without a final chunk".to_string(),
                    };
                    self.finish(Err(&error)).await;
                    let _ = tx.send(Err(error)).await;
                    return;
                }
            }
        }
    }

    async fn abandon(&self) {
        debug!(provider = %self.step.target.provider, "Stream consumer went away");
        self.finish(Err(&Error::Cancelled)).await;
    }

    async fn finish(&self, result: std::result::Result<&ChatResponse, &Error>) {
        let latency = self.started.elapsed();
        // cancellation and abandonment say nothing about provider health
        if !matches!(result, Err(Error::Cancelled)) {
            self.accounting
                .invocation(&self.step.target.provider, result.err(), latency);
        }
        let record = self.scope.record(&self.step, result, latency, 1);
        self.accounting.attempt(record).await;
    }
}
