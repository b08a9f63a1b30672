//! Failure classification
//!
//! Decides whether a failed attempt may move on to the next fallback.

use crate::error::Error;
use serde::Serialize;

/// Statuses that point at the network or provider infrastructure
pub const CONNECTION_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Statuses that point at the request or model itself
pub const NON_CONNECTION_STATUSES: [u16; 5] = [400, 401, 403, 404, 422];

/// Fallback eligibility of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient; another provider may succeed
    Connection,
    /// Request- or model-specific; another provider would fail the same way
    NonConnection,
}

impl FailureClass {
    /// Whether fallback is allowed
    #[must_use]
    pub fn is_connection(self) -> bool {
        self == Self::Connection
    }
}

/// Classify an error
///
/// A request-level status always wins. After that, a recognized transient
/// network code, a transient error kind or a connection status makes the
/// failure connection-class. Anything else is non-connection-class.
#[must_use]
pub fn classify(error: &Error) -> FailureClass {
    let status = error.status();
    if status.is_some_and(|s| NON_CONNECTION_STATUSES.contains(&s)) {
        return FailureClass::NonConnection;
    }
    if error.network_code().is_some() {
        return FailureClass::Connection;
    }
    if matches!(
        error,
        Error::RateLimit { .. } | Error::Timeout { .. } | Error::ProviderUnavailable { .. }
    ) {
        return FailureClass::Connection;
    }
    if status.is_some_and(|s| CONNECTION_STATUSES.contains(&s)) {
        return FailureClass::Connection;
    }
    FailureClass::NonConnection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;

    fn ctx() -> ErrorContext {
        ErrorContext::new("p", "m")
    }

    fn network(code: &str) -> Error {
        Error::Network {
            context: ctx(),
            code: code.to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_connection_statuses() {
        for status in CONNECTION_STATUSES {
            let err = Error::from_status(ctx(), status, "", None);
            assert_eq!(classify(&err), FailureClass::Connection, "status {status}");
        }
    }

    #[test]
    fn test_non_connection_statuses() {
        for status in NON_CONNECTION_STATUSES {
            let err = Error::from_status(ctx(), status, "", None);
            assert_eq!(classify(&err), FailureClass::NonConnection, "status {status}");
        }
    }

    #[test]
    fn test_network_codes() {
        for code in ["ETIMEDOUT", "ECONNRESET", "ECONNREFUSED", "EHOSTUNREACH", "ENETUNREACH", "EAI_AGAIN"] {
            assert!(classify(&network(code)).is_connection(), "{code}");
        }
        assert!(!classify(&network("EPERM")).is_connection());
    }

    #[test]
    fn test_transient_kinds_without_status() {
        let timeout = Error::Timeout {
            context: ctx(),
            status: None,
        };
        let unavailable = Error::ProviderUnavailable {
            context: ctx(),
            status: None,
            message: String::new(),
        };
        assert!(classify(&timeout).is_connection());
        assert!(classify(&unavailable).is_connection());
    }

    #[test]
    fn test_unclassified_defaults_to_non_connection() {
        let unknown = Error::Api {
            context: ctx(),
            status: Some(418),
            message: String::new(),
        };
        let parse = Error::InvalidResponse {
            context: ctx(),
            message: String::new(),
        };
        assert_eq!(classify(&unknown), FailureClass::NonConnection);
        assert_eq!(classify(&parse), FailureClass::NonConnection);
        assert_eq!(classify(&Error::Cancelled), FailureClass::NonConnection);
        assert_eq!(
            classify(&Error::ProviderNotFound("x".into())),
            FailureClass::NonConnection
        );
    }
}
