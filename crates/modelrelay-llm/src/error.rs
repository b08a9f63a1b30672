//! Error types for modelrelay-llm
//!
//! Adapters turn transport failures and non-2xx responses into the typed
//! variants below (see [`Error::from_status`] and [`Error::from_transport`]),
//! so nothing provider-native ever crosses the router boundary.

use crate::secrets::redact_secrets;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Longest provider error body kept in an error message
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Where a provider-side failure happened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    /// Provider name as registered
    pub provider: String,
    /// Model the request targeted
    pub model: String,
    /// Time spent before the failure surfaced
    pub latency_ms: u64,
}

impl ErrorContext {
    /// Create a context with zero latency
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            latency_ms: 0,
        }
    }

    /// Attach the elapsed time
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Transient network failure codes
///
/// The string forms match the codes reported by common HTTP stacks
/// (`ETIMEDOUT`, `ECONNRESET`, ...), which is also what configuration and
/// relays use when they forward a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkCode {
    /// Socket or connect timeout
    TimedOut,
    /// Peer reset or aborted the connection
    ConnectionReset,
    /// Nothing listening on the remote side
    ConnectionRefused,
    /// No route to the host
    HostUnreachable,
    /// No route to the network
    NetworkUnreachable,
    /// Temporary DNS failure, worth retrying
    DnsRetry,
}

impl NetworkCode {
    /// Parse a code string, `None` for codes that are not transient
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "ETIMEDOUT" | "ESOCKETTIMEDOUT" => Some(Self::TimedOut),
            "ECONNRESET" | "ECONNABORTED" => Some(Self::ConnectionReset),
            "ECONNREFUSED" => Some(Self::ConnectionRefused),
            "EHOSTUNREACH" => Some(Self::HostUnreachable),
            "ENETUNREACH" => Some(Self::NetworkUnreachable),
            "EAI_AGAIN" => Some(Self::DnsRetry),
            _ => None,
        }
    }

    /// Canonical code string
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimedOut => "ETIMEDOUT",
            Self::ConnectionReset => "ECONNRESET",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::HostUnreachable => "EHOSTUNREACH",
            Self::NetworkUnreachable => "ENETUNREACH",
            Self::DnsRetry => "EAI_AGAIN",
        }
    }

    fn from_io(err: &std::io::Error) -> Option<Self> {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => Some(Self::TimedOut),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Some(Self::ConnectionReset)
            }
            ErrorKind::ConnectionRefused => Some(Self::ConnectionRefused),
            ErrorKind::HostUnreachable => Some(Self::HostUnreachable),
            ErrorKind::NetworkUnreachable => Some(Self::NetworkUnreachable),
            _ => {
                let msg = err.to_string().to_lowercase();
                if msg.contains("temporary failure in name resolution") {
                    Some(Self::DnsRetry)
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for NetworkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt inside a logical call
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// Provider that was tried
    pub provider: String,
    /// Model that was tried
    pub model: String,
    /// What went wrong
    pub error: Error,
}

/// Discriminant of [`Error`], handy for logs and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::RateLimit`]
    RateLimit,
    /// See [`Error::Authentication`]
    Authentication,
    /// See [`Error::ProviderUnavailable`]
    ProviderUnavailable,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::InvalidRequest`]
    InvalidRequest,
    /// See [`Error::Network`]
    Network,
    /// See [`Error::Api`]
    Api,
    /// See [`Error::InvalidResponse`]
    InvalidResponse,
    /// See [`Error::FallbackExhausted`]
    FallbackExhausted,
    /// See [`Error::RoleNotMapped`]
    RoleNotMapped,
    /// See [`Error::RoleHasNoPrimary`]
    RoleHasNoPrimary,
    /// See [`Error::ProviderNotFound`]
    ProviderNotFound,
    /// See [`Error::ProviderAlreadyRegistered`]
    ProviderAlreadyRegistered,
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::Config`]
    Config,
    /// See [`Error::NotConfigured`]
    NotConfigured,
    /// See [`Error::Cancelled`]
    Cancelled,
}

/// LLM routing error type
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Provider throttled the request (HTTP 429)
    #[error("rate limit exceeded at {context}: {message}")]
    RateLimit {
        /// Failure location
        context: ErrorContext,
        /// Provider's retry-after hint
        retry_after: Option<Duration>,
        /// Sanitized provider message
        message: String,
    },

    /// Credentials rejected (HTTP 401/403)
    #[error("authentication failed at {context} (status {status})")]
    Authentication {
        /// Failure location
        context: ErrorContext,
        /// HTTP status
        status: u16,
        /// Sanitized provider message
        message: String,
    },

    /// Provider infrastructure failure (HTTP 500/502/503)
    #[error("provider unavailable at {context}: {message}")]
    ProviderUnavailable {
        /// Failure location
        context: ErrorContext,
        /// HTTP status, if any
        status: Option<u16>,
        /// Sanitized provider message
        message: String,
    },

    /// Request did not complete in time
    #[error("request to {context} timed out after {}ms", .context.latency_ms)]
    Timeout {
        /// Failure location
        context: ErrorContext,
        /// HTTP status (408/504) when the timeout was reported by the server
        status: Option<u16>,
    },

    /// Request or model problem another provider cannot fix (HTTP 400/404/422)
    #[error("invalid request to {context} (status {status}): {detail}")]
    InvalidRequest {
        /// Failure location
        context: ErrorContext,
        /// HTTP status
        status: u16,
        /// Provider-supplied detail
        detail: String,
    },

    /// Transport failure carrying an OS/DNS error code
    #[error("network error at {context} [{code}]: {message}")]
    Network {
        /// Failure location
        context: ErrorContext,
        /// Error code such as `ECONNRESET`
        code: String,
        /// Underlying message
        message: String,
    },

    /// Any other provider failure
    #[error("api error at {context}: {message}")]
    Api {
        /// Failure location
        context: ErrorContext,
        /// HTTP status, if any
        status: Option<u16>,
        /// Sanitized provider message
        message: String,
    },

    /// Provider answered with something we could not parse
    #[error("invalid response from {context}: {message}")]
    InvalidResponse {
        /// Failure location
        context: ErrorContext,
        /// Parse failure
        message: String,
    },

    /// Primary and every fallback failed with connection-class errors
    #[error("all {} attempts for role '{role}' failed", .attempts.len())]
    FallbackExhausted {
        /// Role being served
        role: String,
        /// Every attempt in the order it was made
        attempts: Vec<AttemptFailure>,
    },

    /// No mapping for the requested role
    #[error("role not mapped: {0}")]
    RoleNotMapped(String),

    /// Role mapping lacks a primary target
    #[error("role has no primary provider: {0}")]
    RoleHasNoPrimary(String),

    /// Provider missing from the registry
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Registration would overwrite an existing provider
    #[error("provider already registered: {0}")]
    ProviderAlreadyRegistered(String),

    /// Input rejected before doing any work
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Provider not configured (missing credential etc.)
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// Caller cancelled the call or its deadline passed
    #[error("call cancelled")]
    Cancelled,
}

impl Error {
    /// Map an HTTP status and body to a typed error
    #[must_use]
    pub fn from_status(
        context: ErrorContext,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = clean_body(body);
        match status {
            429 => Self::RateLimit {
                context,
                retry_after,
                message,
            },
            401 | 403 => Self::Authentication {
                context,
                status,
                message,
            },
            400 | 404 | 422 => Self::InvalidRequest {
                context,
                status,
                detail: message,
            },
            408 | 504 => Self::Timeout {
                context,
                status: Some(status),
            },
            500 | 502 | 503 => Self::ProviderUnavailable {
                context,
                status: Some(status),
                message,
            },
            _ => Self::Api {
                context,
                status: Some(status),
                message,
            },
        }
    }

    /// Map a reqwest transport failure to a typed error
    #[must_use]
    pub fn from_transport(context: ErrorContext, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                context,
                status: None,
            };
        }
        if let Some(code) = network_code_in_chain(err) {
            return Self::Network {
                context,
                code: code.as_str().to_string(),
                message: clean_body(&err.to_string()),
            };
        }
        if err.is_connect() {
            return Self::Network {
                context,
                code: NetworkCode::ConnectionRefused.as_str().to_string(),
                message: clean_body(&err.to_string()),
            };
        }
        if let Some(status) = err.status() {
            return Self::from_status(context, status.as_u16(), &err.to_string(), None);
        }
        Self::Api {
            context,
            status: None,
            message: clean_body(&err.to_string()),
        }
    }

    /// Discriminant for logging
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Network { .. } => ErrorKind::Network,
            Self::Api { .. } => ErrorKind::Api,
            Self::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            Self::FallbackExhausted { .. } => ErrorKind::FallbackExhausted,
            Self::RoleNotMapped(_) => ErrorKind::RoleNotMapped,
            Self::RoleHasNoPrimary(_) => ErrorKind::RoleHasNoPrimary,
            Self::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            Self::ProviderAlreadyRegistered(_) => ErrorKind::ProviderAlreadyRegistered,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Config,
            Self::NotConfigured(_) => ErrorKind::NotConfigured,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Provider-side context, if this error came from a provider
    #[must_use]
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimit { context, .. }
            | Self::Authentication { context, .. }
            | Self::ProviderUnavailable { context, .. }
            | Self::Timeout { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Network { context, .. }
            | Self::Api { context, .. }
            | Self::InvalidResponse { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Provider name, if known
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.context().map(|c| c.provider.as_str())
    }

    /// HTTP-equivalent status
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimit { .. } => Some(429),
            Self::Authentication { status, .. } | Self::InvalidRequest { status, .. } => {
                Some(*status)
            }
            Self::ProviderUnavailable { status, .. }
            | Self::Timeout { status, .. }
            | Self::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Recognized transient network code, if any
    #[must_use]
    pub fn network_code(&self) -> Option<NetworkCode> {
        match self {
            Self::Network { code, .. } => NetworkCode::parse(code),
            _ => None,
        }
    }

    /// Retry-after hint from a rate limit response
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the failure is attributable to network or provider infrastructure
    ///
    /// Shorthand for [`crate::router::classify`].
    #[must_use]
    pub fn is_connection_class(&self) -> bool {
        crate::router::classify(self).is_connection()
    }

    /// Copy of this error with the latency in its context replaced
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.latency_ms = latency.as_millis() as u64;
        }
        self
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::RateLimit { context, .. }
            | Self::Authentication { context, .. }
            | Self::ProviderUnavailable { context, .. }
            | Self::Timeout { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Network { context, .. }
            | Self::Api { context, .. }
            | Self::InvalidResponse { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

fn clean_body(body: &str) -> String {
    let redacted = redact_secrets(body.trim());
    if redacted.len() > MAX_ERROR_BODY_CHARS {
        format!(
            "{}...(truncated)",
            truncate_on_char(&redacted, MAX_ERROR_BODY_CHARS)
        )
    } else {
        redacted.into_owned()
    }
}

/// At most `max_bytes`, backing off to a UTF-8 boundary
fn truncate_on_char(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn network_code_in_chain(err: &(dyn std::error::Error + 'static)) -> Option<NetworkCode> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if let Some(code) = NetworkCode::from_io(io) {
                return Some(code);
            }
        }
        source = inner.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ErrorContext {
        ErrorContext::new("huggingface", "mistral-7b")
    }

    #[test]
    fn test_from_status_mapping() {
        assert_eq!(
            Error::from_status(ctx(), 429, "slow down", None).kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            Error::from_status(ctx(), 401, "bad key", None).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            Error::from_status(ctx(), 422, "bad schema", None).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            Error::from_status(ctx(), 503, "overloaded", None).kind(),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            Error::from_status(ctx(), 504, "", None).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::from_status(ctx(), 418, "teapot", None).kind(),
            ErrorKind::Api
        );
    }

    #[test]
    fn test_status_is_preserved() {
        for status in [400u16, 401, 403, 404, 422, 429, 500, 502, 503, 504] {
            let err = Error::from_status(ctx(), status, "x", None);
            assert_eq!(err.status(), Some(status), "status {status}");
        }
    }

    #[test]
    fn test_context_attached() {
        let err = Error::from_status(ctx(), 500, "boom", None)
            .with_latency(Duration::from_millis(250));
        let context = err.context().unwrap();
        assert_eq!(context.provider, "huggingface");
        assert_eq!(context.model, "mistral-7b");
        assert_eq!(context.latency_ms, 250);
        assert_eq!(err.provider(), Some("huggingface"));
    }

    #[test]
    fn test_body_is_redacted_and_truncated() {
        let err = Error::from_status(ctx(), 401, "invalid api_key sk-123", None);
        assert!(!err.to_string().contains("sk-123"));

        let multibyte = "é".repeat(400);
        match Error::from_status(ctx(), 500, &multibyte, None) {
            Error::ProviderUnavailable { message, .. } => assert!(message.ends_with("...(truncated)")),
            other => panic!("unexpected {other:?}"),
        }

        let long = "x".repeat(1000);
        match Error::from_status(ctx(), 500, &long, None) {
            Error::ProviderUnavailable { message, .. } => {
                assert!(message.ends_with("...(truncated)"));
                assert!(message.len() < 400);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_network_code_parse() {
        assert_eq!(NetworkCode::parse("ECONNRESET"), Some(NetworkCode::ConnectionReset));
        assert_eq!(NetworkCode::parse("etimedout"), Some(NetworkCode::TimedOut));
        assert_eq!(NetworkCode::parse("EAI_AGAIN"), Some(NetworkCode::DnsRetry));
        assert_eq!(NetworkCode::parse("ENOENT"), None);
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::from_status(ctx(), 429, "", Some(Duration::from_secs(7)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_fallback_exhausted_display() {
        let err = Error::FallbackExhausted {
            role: "code-generator".to_string(),
            attempts: vec![AttemptFailure {
                provider: "p1".to_string(),
                model: "m1".to_string(),
                error: Error::from_status(ErrorContext::new("p1", "m1"), 503, "", None),
            }],
        };
        assert_eq!(
            err.to_string(),
            "all 1 attempts for role 'code-generator' failed"
        );
        assert!(err.context().is_none());
    }
}
