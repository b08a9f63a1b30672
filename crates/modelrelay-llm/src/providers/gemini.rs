//! Google Gemini
//!
//! Native `generateContent` API. System messages become the
//! `systemInstruction`; assistant turns use the `model` role.

use super::{endpoint, error_from_response, estimate_prompt_tokens, estimate_tokens};
use crate::completion::{ChatRequest, ChatResponse, ResponseMetadata, TokenUsage};
use crate::error::{Error, ErrorContext, Result};
use crate::message::MessageRole;
use crate::pool::{ConnectionPool, PoolConfig, PoolLease, PoolStats};
use crate::pricing::{self, table, PricingTable};
use crate::provider::{LlmProvider, ProviderDescriptor};
use crate::streaming::{ChatStream, ChunkSender, SseLineBuffer, StreamChunk, STREAM_BUFFER};
use crate::secrets::mask_api_key;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Gemini API base URL
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Gemini list prices
#[must_use]
pub fn default_pricing() -> PricingTable {
    table(&[
        ("gemini-2.5-flash", pricing::GEMINI_FLASH_INPUT_COST, pricing::GEMINI_FLASH_OUTPUT_COST),
        ("gemini-2.5-pro", pricing::GEMINI_PRO_INPUT_COST, pricing::GEMINI_PRO_OUTPUT_COST),
    ])
}

/// Gemini provider configuration
#[derive(Clone)]
pub struct GeminiConfig {
    /// API key
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug to mask the API key
impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GeminiConfig {
    /// Create a configuration with an API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from `GEMINI_API_KEY` (or `GOOGLE_API_KEY`)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| Error::NotConfigured("GEMINI_API_KEY not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the adapter under the given registry name
    pub fn into_provider(self, name: &str, pool: &PoolConfig) -> Result<GeminiProvider> {
        let descriptor = ProviderDescriptor::new(name, self.base_url)
            .with_api_key(self.api_key)
            .with_pricing(default_pricing())
            .with_timeout(self.timeout);
        GeminiProvider::new(descriptor, pool)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    candidates_token_count: Option<u32>,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<String> {
        self.candidates.first().and_then(|c| c.finish_reason.clone())
    }
}

fn convert_request(request: &ChatRequest) -> GeminiRequest {
    let mut system = Vec::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        let part = GeminiPart {
            text: message.content.clone(),
        };
        match message.role {
            MessageRole::System => system.push(part),
            MessageRole::User => contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: vec![part],
            }),
            MessageRole::Assistant => contents.push(GeminiContent {
                role: Some("model".to_string()),
                parts: vec![part],
            }),
        }
    }

    let options = &request.options;
    let generation_config = (options.temperature.is_some()
        || options.max_tokens.is_some()
        || options.stop.is_some())
    .then(|| GenerationConfig {
        temperature: options.temperature,
        max_output_tokens: options.max_tokens,
        stop_sequences: options.stop.clone(),
    });

    GeminiRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system,
        }),
        generation_config,
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Gemini provider
#[derive(Debug)]
pub struct GeminiProvider {
    descriptor: ProviderDescriptor,
    pool: ConnectionPool,
}

impl GeminiProvider {
    /// Create an adapter with its own connection pool
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(descriptor: ProviderDescriptor, pool: &PoolConfig) -> Result<Self> {
        let pool = ConnectionPool::new(&descriptor.name, pool, descriptor.timeout)?;
        Ok(Self { descriptor, pool })
    }

    fn context(&self, request: &ChatRequest) -> ErrorContext {
        ErrorContext::new(&self.descriptor.name, &request.model)
    }

    async fn send(
        &self,
        request: &ChatRequest,
        method: &str,
        started: Instant,
    ) -> Result<(reqwest::Response, PoolLease)> {
        let lease = self.pool.lease();
        let url = endpoint(
            &self.descriptor.base_url,
            &format!("models/{}:{method}", request.model),
        );

        let response = self
            .pool
            .client()
            .post(url)
            .header("x-goog-api-key", &self.descriptor.api_key)
            .json(&convert_request(request))
            .send()
            .await
            .map_err(|e| {
                lease.fail();
                Error::from_transport(self.context(request).with_latency(started.elapsed()), &e)
            })?;

        if !response.status().is_success() {
            lease.fail();
            return Err(error_from_response(self.context(request), response, started).await);
        }

        Ok((response, lease))
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self, request), fields(provider = %self.descriptor.name, model = %request.model))]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let started = Instant::now();
        debug!("Sending request to Gemini");

        let (response, lease) = self.send(request, "generateContent", started).await?;
        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            lease.fail();
            Error::InvalidResponse {
                context: self.context(request).with_latency(started.elapsed()),
                message: e.to_string(),
            }
        })?;
        drop(lease);

        if parsed.candidates.is_empty() {
            return Err(Error::InvalidResponse {
                context: self.context(request).with_latency(started.elapsed()),
                message: "No candidates in response".to_string(),
            });
        }

        let content = parsed.text();
        let tokens = match &parsed.usage_metadata {
            Some(usage) => TokenUsage::new(
                usage.prompt_token_count,
                usage
                    .candidates_token_count
                    .unwrap_or_else(|| estimate_tokens(&content)),
            ),
            None => TokenUsage::new(
                estimate_prompt_tokens(&request.messages),
                estimate_tokens(&content),
            ),
        };
        let cost = self.calculate_cost(tokens.input, tokens.output, &request.model);

        Ok(ChatResponse {
            content,
            tokens,
            cost: Some(cost),
            provider: self.descriptor.name.clone(),
            model: request.model.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            correlation_id: request.correlation_id.clone(),
            role: None,
            metadata: ResponseMetadata {
                finish_reason: parsed.finish_reason(),
                ..Default::default()
            },
        })
    }

    #[instrument(skip(self, request), fields(provider = %self.descriptor.name, model = %request.model))]
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let started = Instant::now();
        debug!("Sending streaming request to Gemini");

        let (response, lease) = self
            .send(request, "streamGenerateContent?alt=sse", started)
            .await?;
        let (tx, stream) = ChatStream::channel(STREAM_BUFFER);
        tokio::spawn(read_events(
            response,
            lease,
            tx,
            self.context(request),
            estimate_prompt_tokens(&request.messages),
            started,
        ));
        Ok(stream)
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.pool.stats())
    }
}

/// Each SSE event is a complete `GeminiResponse` holding the next text slice
async fn read_events(
    response: reqwest::Response,
    lease: PoolLease,
    tx: ChunkSender,
    context: ErrorContext,
    prompt_tokens: u32,
    started: Instant,
) {
    let mut body = response.bytes_stream();
    let mut lines = SseLineBuffer::new();
    let mut text = String::new();
    let mut usage = None;
    let mut finish_reason = None;

    while let Some(bytes) = body.next().await {
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                lease.fail();
                let err = Error::from_transport(context.with_latency(started.elapsed()), &e);
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        for payload in lines.push(&bytes) {
            let event: GeminiResponse = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(provider = %context.provider, error = %e, "Skipping malformed stream event");
                    continue;
                }
            };
            if let Some(meta) = &event.usage_metadata {
                usage = Some((meta.prompt_token_count, meta.candidates_token_count));
            }
            if let Some(reason) = event.finish_reason() {
                finish_reason = Some(reason);
            }
            let content = event.text();
            if content.is_empty() {
                continue;
            }
            text.push_str(&content);
            if tx.send(Ok(StreamChunk::Delta { content })).await.is_err() {
                debug!("Stream receiver dropped");
                return;
            }
        }
    }
    drop(lease);

    let tokens = match usage {
        Some((input, output)) => {
            TokenUsage::new(input, output.unwrap_or_else(|| estimate_tokens(&text)))
        }
        None => TokenUsage::new(prompt_tokens, estimate_tokens(&text)),
    };
    let _ = tx
        .send(Ok(StreamChunk::Done {
            tokens,
            cost: None,
            provider: context.provider,
            model: context.model,
            latency_ms: started.elapsed().as_millis() as u64,
            finish_reason,
        }))
        .await;
}
