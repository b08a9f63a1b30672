//! Chat request and standardized response types
//!
//! [`ChatResponse`] is the only shape the router hands back, whichever
//! provider answered.

use crate::message::Message;
use serde::{Deserialize, Serialize};

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input: u32,
    /// Completion tokens
    pub output: u32,
    /// Total tokens
    pub total: u32,
}

impl TokenUsage {
    /// Build usage from input/output counts
    #[must_use]
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input.saturating_add(output),
        }
    }
}

/// Generation parameters forwarded to the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// A request as seen by a single provider
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model to use (provider-specific)
    pub model: String,
    /// Messages in the conversation
    pub messages: Vec<Message>,
    /// Generation parameters
    pub options: ChatOptions,
    /// Correlation ID of the logical call
    pub correlation_id: String,
}

impl ChatRequest {
    /// Create a new request for a model
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Add a message
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Add messages
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// Set generation options
    #[must_use]
    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the correlation ID
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

/// Routing details attached to a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Provider finish reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Whether a fallback target answered
    pub fallback_used: bool,
    /// 0 for the primary, n for the n-th configured fallback
    pub fallback_index: usize,
    /// Whether the primary was skipped because it was unhealthy
    pub health_substituted: bool,
    /// Provider invocations made for this logical call, retries included
    pub attempts: u32,
}

/// Standardized chat response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated content
    pub content: String,
    /// Token usage
    pub tokens: TokenUsage,
    /// Cost in USD; adapters may leave it empty, the router always fills it
    pub cost: Option<f64>,
    /// Provider that answered
    pub provider: String,
    /// Model that answered
    pub model: String,
    /// Wall-clock latency of the successful attempt
    pub latency_ms: u64,
    /// Served from a provider-side cache
    pub cached: bool,
    /// Correlation ID of the logical call
    pub correlation_id: String,
    /// Role the call was made for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Routing details
    pub metadata: ResponseMetadata,
}

impl ChatResponse {
    /// Cost, treating an unset value as free
    #[must_use]
    pub fn cost_or_zero(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_builder() {
        let request = ChatRequest::new("deepseek-chat")
            .with_message(Message::system("You are helpful"))
            .with_message(Message::user("Hello"))
            .with_options(ChatOptions {
                max_tokens: Some(100),
                temperature: Some(0.7),
                stop: None,
            })
            .with_correlation_id("abc");

        assert_eq!(request.model, "deepseek-chat");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.options.max_tokens, Some(100));
        assert_eq!(request.correlation_id, "abc");
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total, 150);
        assert_eq!(TokenUsage::new(u32::MAX, 1).total, u32::MAX);
    }
}
