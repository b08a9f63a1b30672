//! OpenAI-compatible chat completions adapter
//!
//! Used for every backend that accepts `POST {base}/chat/completions` with a
//! bearer token: the HuggingFace router, DeepSeek relays, GitHub Models and
//! any self-hosted gateway.

use super::{endpoint, error_from_response, estimate_prompt_tokens, estimate_tokens};
use crate::completion::{ChatRequest, ChatResponse, ResponseMetadata, TokenUsage};
use crate::error::{Error, ErrorContext, Result};
use crate::message::Message;
use crate::pool::{ConnectionPool, PoolConfig, PoolLease, PoolStats};
use crate::provider::{LlmProvider, ProviderDescriptor};
use crate::streaming::{ChatStream, ChunkSender, SseLineBuffer, StreamChunk, SSE_DONE, STREAM_BUFFER};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Provider speaking the OpenAI chat completions dialect
#[derive(Debug)]
pub struct OpenAiCompatProvider {
    descriptor: ProviderDescriptor,
    pool: ConnectionPool,
}

// OpenAI-compatible request/response types
#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
}

impl OpenAiCompatProvider {
    /// Create an adapter with its own connection pool
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(descriptor: ProviderDescriptor, pool: &PoolConfig) -> Result<Self> {
        let pool = ConnectionPool::new(&descriptor.name, pool, descriptor.timeout)?;
        Ok(Self { descriptor, pool })
    }

    fn wire_request<'a>(request: &'a ChatRequest, stream: bool) -> WireRequest<'a> {
        WireRequest {
            model: &request.model,
            messages: request.messages.iter().map(convert_message).collect(),
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            stop: request.options.stop.as_deref(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn context(&self, request: &ChatRequest) -> ErrorContext {
        ErrorContext::new(&self.descriptor.name, &request.model)
    }

    /// Send the request, returning the 2xx response and the lease covering it
    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
        started: Instant,
    ) -> Result<(reqwest::Response, PoolLease)> {
        let lease = self.pool.lease();
        let body = Self::wire_request(request, stream);

        let response = self
            .pool
            .client()
            .post(endpoint(&self.descriptor.base_url, "chat/completions"))
            .bearer_auth(&self.descriptor.api_key)
            .json(&body)
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

fn convert_message(message: &Message) -> WireMessage<'_> {
    WireMessage {
        role: message.role.as_str(),
        content: &message.content,
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self, request), fields(provider = %self.descriptor.name, model = %request.model))]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let started = Instant::now();
        debug!("Sending chat completion request");

        let (response, lease) = self.send(request, false, started).await?;
        let parsed: WireResponse = response.json().await.map_err(|e| {
            lease.fail();
            Error::InvalidResponse {
                context: self.context(request).with_latency(started.elapsed()),
                message: e.to_string(),
            }
        })?;
        drop(lease);

        let choice = parsed.choices.into_iter().next().ok_or_else(|| Error::InvalidResponse {
            context: self.context(request).with_latency(started.elapsed()),
            message: "No choices in response".to_string(),
        })?;
        let content = choice.message.content.unwrap_or_default();

        let tokens = match parsed.usage {
            Some(usage) => TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
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
                finish_reason: choice.finish_reason,
                ..Default::default()
            },
        })
    }

    #[instrument(skip(self, request), fields(provider = %self.descriptor.name, model = %request.model))]
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let started = Instant::now();
        debug!("Sending streaming chat completion request");

        let (response, lease) = self.send(request, true, started).await?;
        let (tx, stream) = ChatStream::channel(STREAM_BUFFER);
        let task = SseTask {
            context: self.context(request),
            prompt_tokens: estimate_prompt_tokens(&request.messages),
            started,
        };
        tokio::spawn(task.run(response, lease, tx));

        Ok(stream)
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.pool.stats())
    }
}

/// Reader turning an SSE body into stream chunks
struct SseTask {
    context: ErrorContext,
    prompt_tokens: u32,
    started: Instant,
}

impl SseTask {
    async fn run(self, response: reqwest::Response, lease: PoolLease, tx: ChunkSender) {
        let mut body = response.bytes_stream();
        let mut lines = SseLineBuffer::new();
        let mut text = String::new();
        let mut usage = None;
        let mut finish_reason = None;

        'read: while let Some(bytes) = body.next().await {
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(e) => {
                    lease.fail();
                    let context = self.context.clone().with_latency(self.started.elapsed());
                    let _ = tx.send(Err(Error::from_transport(context, &e))).await;
                    return;
                }
            };

            for payload in lines.push(&bytes) {
                if payload == SSE_DONE {
                    break 'read;
                }
                let chunk: WireStreamChunk = match serde_json::from_str(&payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(provider = %self.context.provider, error = %e, "Skipping malformed stream event");
                        continue;
                    }
                };
                if let Some(u) = chunk.usage {
                    usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                }
                for choice in chunk.choices {
                    if choice.finish_reason.is_some() {
                        finish_reason = choice.finish_reason;
                    }
                    let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) else {
                        continue;
                    };
                    text.push_str(&content);
                    if tx.send(Ok(StreamChunk::Delta { content })).await.is_err() {
                        debug!("Stream receiver dropped");
                        return;
                    }
                }
            }
        }
        drop(lease);

        let tokens =
            usage.unwrap_or_else(|| TokenUsage::new(self.prompt_tokens, estimate_tokens(&text)));
        let _ = tx
            .send(Ok(StreamChunk::Done {
                tokens,
                cost: None,
                provider: self.context.provider,
                model: self.context.model,
                latency_ms: self.started.elapsed().as_millis() as u64,
                finish_reason,
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ChatOptions;

    #[test]
    fn test_wire_request_shape() {
        let request = ChatRequest::new("meta-llama/Llama-3.1-8B-Instruct")
            .with_message(Message::system("be brief"))
            .with_message(Message::user("hi"))
            .with_options(ChatOptions {
                max_tokens: Some(64),
                temperature: None,
                stop: Some(vec!["\n\n".to_string()]),
            });

        let json = serde_json::to_value(OpenAiCompatProvider::wire_request(&request, false)).unwrap();
        assert_eq!(json["model"], "meta-llama/Llama-3.1-8B-Instruct");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 64);
        assert!(json.get("temperature").is_none());
        assert!(json.get("stream").is_none());

        let json = serde_json::to_value(OpenAiCompatProvider::wire_request(&request, true)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "id": "x",
            "model": "deepseek-chat",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: WireResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 3);
    }

    #[test]
    fn test_parse_stream_chunks() {
        let delta: WireStreamChunk =
            serde_json::from_str(r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(delta.choices[0].delta.content.as_deref(), Some("Hi"));

        let usage_only: WireStreamChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#,
        )
        .unwrap();
        assert!(usage_only.choices.is_empty());
        assert_eq!(usage_only.usage.unwrap().prompt_tokens, 5);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_class() {
        let descriptor = ProviderDescriptor::new("local", "http://127.0.0.1:9")
            .with_api_key("sk-test-1234567890")
            .with_timeout(std::time::Duration::from_secs(2));
        let provider = OpenAiCompatProvider::new(descriptor, &PoolConfig::default()).unwrap();

        let err = provider
            .chat(&ChatRequest::new("m").with_message(Message::user("hi")))
            .await
            .unwrap_err();
        assert!(err.is_connection_class(), "{err:?}");
        assert_eq!(err.provider(), Some("local"));

        let stats = provider.pool_stats().unwrap();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.active, 0);
    }
}
