//! Mock LLM provider
//!
//! Plays back a queue of scripted outcomes, then a default outcome (echo of
//! the last user message unless changed). Counts calls and concurrent
//! invocations so tests can check retry and limiter behavior.

use super::{estimate_prompt_tokens, estimate_tokens};
use crate::completion::{ChatRequest, ChatResponse, ResponseMetadata, TokenUsage};
use crate::error::{Error, ErrorContext, Result};
use crate::limiter::RateLimitConfig;
use crate::message::MessageRole;
use crate::pricing::PricingTable;
use crate::provider::{LlmProvider, ProviderDescriptor};
use crate::streaming::{ChatStream, StreamChunk};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// What the next call should do
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Answer with fixed content; usage is estimated when `tokens` is `None`
    Reply {
        /// Response text
        content: String,
        /// Reported usage
        tokens: Option<TokenUsage>,
    },
    /// Answer with the last user message
    Echo,
    /// Fail as if the provider returned this HTTP status
    Status(u16),
    /// Fail with a transport error code such as `ECONNRESET`
    Network(String),
    /// Fail with this exact error
    Fail(Error),
}

impl MockOutcome {
    /// Fixed reply with estimated usage
    #[must_use]
    pub fn reply(content: impl Into<String>) -> Self {
        Self::Reply {
            content: content.into(),
            tokens: None,
        }
    }

    /// Fixed reply with explicit usage
    #[must_use]
    pub fn reply_with_usage(content: impl Into<String>, input: u32, output: u32) -> Self {
        Self::Reply {
            content: content.into(),
            tokens: Some(TokenUsage::new(input, output)),
        }
    }

    /// Transport failure
    #[must_use]
    pub fn network(code: impl Into<String>) -> Self {
        Self::Network(code.into())
    }
}

/// Scripted provider for tests and offline runs
#[derive(Debug)]
pub struct MockProvider {
    descriptor: ProviderDescriptor,
    script: Mutex<VecDeque<MockOutcome>>,
    default: Mutex<MockOutcome>,
    delay: Option<Duration>,
    chunk_delay: Option<Duration>,
    streams: Arc<StreamGauge>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl MockProvider {
    /// Create a mock provider under a registry name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_descriptor(ProviderDescriptor::new(name, "mock://local"))
    }

    /// Create a mock provider with a prepared descriptor
    #[must_use]
    pub fn from_descriptor(descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(MockOutcome::Echo),
            delay: None,
            chunk_delay: None,
            streams: Arc::new(StreamGauge::default()),
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Pace streamed chunks; the body is then produced by a background task
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Set the pricing table
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.descriptor.pricing = pricing;
        self
    }

    /// Set the retry count
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.descriptor.max_retries = max_retries;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    /// Set the limiter parameters
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.descriptor.rate_limit = rate_limit;
        self
    }

    /// Outcome once the script is exhausted
    #[must_use]
    pub fn with_default(self, outcome: MockOutcome) -> Self {
        self.set_default(outcome);
        self
    }

    /// Queue outcomes in order
    #[must_use]
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        for outcome in outcomes {
            self.push(outcome);
        }
        self
    }

    /// Queue one outcome
    pub fn push(&self, outcome: MockOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Replace the default outcome
    pub fn set_default(&self, outcome: MockOutcome) {
        *self.default.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
    }

    /// Calls made so far (chat and stream)
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls running at once
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of stream bodies being produced at once
    #[must_use]
    pub fn peak_open_streams(&self) -> usize {
        self.streams.peak.load(Ordering::SeqCst)
    }

    /// Model names requested, in call order
    #[must_use]
    pub fn models_seen(&self) -> Vec<String> {
        self.models.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| self.default.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let started = Instant::now();
        let _gauge = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.model.clone());

        let outcome = self.next_outcome();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let latency = started.elapsed();
        let context = ErrorContext::new(&self.descriptor.name, &request.model).with_latency(latency);
        let (content, tokens) = match outcome {
            MockOutcome::Reply { content, tokens } => (content, tokens),
            MockOutcome::Echo => {
                let content = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .map_or_else(|| "ok".to_string(), |m| m.content.clone());
                (content, None)
            }
            MockOutcome::Status(status) => {
                return Err(Error::from_status(context, status, "mock failure", None))
            }
            MockOutcome::Network(code) => {
                return Err(Error::Network {
                    context,
                    code,
                    message: "mock network failure".to_string(),
                })
            }
            MockOutcome::Fail(error) => return Err(error),
        };

        let tokens = tokens.unwrap_or_else(|| {
            TokenUsage::new(
                estimate_prompt_tokens(&request.messages),
                estimate_tokens(&content),
            )
        });
        let cost = self.calculate_cost(tokens.input, tokens.output, &request.model);

        Ok(ChatResponse {
            content,
            tokens,
            cost: Some(cost),
            provider: self.descriptor.name.clone(),
            model: request.model.clone(),
            latency_ms: latency.as_millis() as u64,
            cached: false,
            correlation_id: request.correlation_id.clone(),
            role: None,
            metadata: ResponseMetadata {
                finish_reason: Some("stop".to_string()),
                ..Default::default()
            },
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.invoke(request).await
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.invoke(request).await?;
        let mut chunks: Vec<StreamChunk> = response
            .content
            .split_inclusive(' ')
            .map(|piece| StreamChunk::Delta {
                content: piece.to_string(),
            })
            .collect();
        chunks.push(StreamChunk::Done {
            tokens: response.tokens,
            cost: None,
            provider: response.provider,
            model: response.model,
            latency_ms: response.latency_ms,
            finish_reason: response.metadata.finish_reason,
        });

        let open = OpenStream::enter(Arc::clone(&self.streams));
        let Some(delay) = self.chunk_delay else {
            let (tx, stream) = ChatStream::channel(chunks.len());
            // Capacity covers every chunk, so nothing here can block
            for chunk in chunks {
                let _ = tx.try_send(Ok(chunk));
            }
            drop(open);
            return Ok(stream);
        };

        let (tx, stream) = ChatStream::channel(1);
        tokio::spawn(async move {
            let _open = open;
            for chunk in chunks {
                tokio::time::sleep(delay).await;
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(stream)
    }
}

#[derive(Debug, Default)]
struct StreamGauge {
    open: AtomicUsize,
    peak: AtomicUsize,
}

struct OpenStream(Arc<StreamGauge>);

impl OpenStream {
    fn enter(gauge: Arc<StreamGauge>) -> Self {
        let now = gauge.open.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::pricing::table;

    fn request() -> ChatRequest {
        ChatRequest::new("m").with_message(Message::user("hello there"))
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockProvider::new("p").with_script([
            MockOutcome::Status(503),
            MockOutcome::reply_with_usage("first", 10, 2),
        ]);

        let err = mock.chat(&request()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.provider(), Some("p"));

        let ok = mock.chat(&request()).await.unwrap();
        assert_eq!(ok.content, "first");
        assert_eq!(ok.tokens, TokenUsage::new(10, 2));

        let echo = mock.chat(&request()).await.unwrap();
        assert_eq!(echo.content, "hello there");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.models_seen(), vec!["m", "m", "m"]);
    }

    #[tokio::test]
    async fn test_cost_from_pricing() {
        let mock = MockProvider::new("p")
            .with_pricing(table(&[("m", 1.0, 2.0)]))
            .with_default(MockOutcome::reply_with_usage("x", 1_000_000, 1_000_000));
        let response = mock.chat(&request()).await.unwrap();
        assert_eq!(response.cost, Some(3.0));
    }

    #[tokio::test]
    async fn test_network_outcome_is_connection_class() {
        let mock = MockProvider::new("p").with_default(MockOutcome::network("ECONNRESET"));
        let err = mock.chat(&request()).await.unwrap_err();
        assert!(err.is_connection_class());
    }

    #[tokio::test]
    async fn test_stream_splits_words() {
        let mock = MockProvider::new("p").with_default(MockOutcome::reply("a b c"));
        let (text, done) = mock.stream(&request()).await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "a b c");
        assert!(matches!(done, Some(StreamChunk::Done { cost: None, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_stream_stays_open() {
        let mock = MockProvider::new("p")
            .with_default(MockOutcome::reply("a b"))
            .with_chunk_delay(Duration::from_millis(100));
        let started = Instant::now();
        let (text, done) = mock.stream(&request()).await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "a b");
        assert!(done.is_some());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(mock.peak_open_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_in_flight() {
        let mock = std::sync::Arc::new(MockProvider::new("p").with_delay(Duration::from_millis(50)));
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let mock = mock.clone();
                tokio::spawn(async move { mock.chat(&request()).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(mock.peak_in_flight(), 3);
    }
}
