//! ModelRelay LLM - role-based routing over LLM providers
//!
//! This crate routes chat requests to LLM providers by logical role:
//! - Registry: named providers, each paired with its own rate limiter
//! - Router: role resolution, retry with backoff, fallback on connection-class failures
//! - Health: sliding-window error rate and latency per provider
//! - Cost: per-attempt token and spend accounting with filtered aggregates
//! - Providers: HuggingFace, DeepSeek, GitHub Models, Gemini, any
//!   OpenAI-compatible endpoint, and a scripted mock
//!
//! ```no_run
//! use modelrelay_llm::{
//!     CallOptions, Message, MockProvider, ModelTarget, ProviderRegistry, RoleMapping, Router,
//! };
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn demo() -> modelrelay_llm::Result<()> {
//! let registry = Arc::new(ProviderRegistry::new());
//! registry.register("local", Arc::new(MockProvider::new("local")))?;
//!
//! let roles = BTreeMap::from([(
//!     "chat".to_string(),
//!     RoleMapping::new(ModelTarget::new("local", "echo")),
//! )]);
//! let router = Router::new(registry).with_roles(roles)?;
//!
//! let response = router
//!     .call_by_role("chat", vec![Message::user("hello")], CallOptions::default())
//!     .await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod completion;
pub mod config;
pub mod cost;
pub mod error;
pub mod health;
pub mod limiter;
pub mod message;
pub mod pool;
pub mod pricing;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod router;
pub mod secrets;
pub mod streaming;

pub use completion::{ChatOptions, ChatRequest, ChatResponse, ResponseMetadata, TokenUsage};
pub use config::{
    ModelTarget, ProviderKind, ProviderSettings, RelaySettings, RoleMapping, RoleTable,
};
pub use cost::{
    format_report, CostLimits, CostReport, CostTracker, UsageFilter, UsageRecord, UsageStats,
};
pub use error::{AttemptFailure, Error, ErrorKind, Result};
pub use health::{HealthConfig, HealthMonitor, HealthStatus, ProviderHealth};
pub use limiter::{LimiterPermit, RateLimitConfig, RateLimiter};
pub use message::{Message, MessageRole};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use pricing::{ModelPricing, PricingTable};
pub use provider::{LlmProvider, ProviderDescriptor};
pub use registry::ProviderRegistry;
pub use retry::BackoffSettings;
pub use router::{classify, CallOptions, CallRecord, FailureClass, MetricsSink, Router};
pub use streaming::{ChatStream, StreamChunk};

// Re-export provider types
pub use providers::{
    build_provider, DeepSeekConfig, GeminiConfig, GeminiProvider, GitHubConfig,
    HuggingFaceConfig, MockOutcome, MockProvider, OpenAiCompatProvider,
};
