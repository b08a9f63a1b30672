//! Per-provider connection pool
//!
//! Each provider owns one keep-alive [`reqwest::Client`]; reqwest keeps the
//! idle sockets, this type keeps the accounting. Adapters send every request
//! through [`ConnectionPool::client`] while holding a [`PoolLease`], so the
//! counters reflect real socket usage.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Keep-alive parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle sockets kept per host
    pub max_idle_per_host: usize,
    /// Idle socket lifetime in milliseconds
    pub idle_timeout_ms: u64,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// TCP keep-alive probe interval in milliseconds
    pub tcp_keepalive_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout_ms: 90_000,
            connect_timeout_ms: 10_000,
            tcp_keepalive_ms: 60_000,
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Requests sent through the pool
    pub requests: u64,
    /// Requests currently holding a socket
    pub active: usize,
    /// Highest concurrent usage observed
    pub peak_active: usize,
    /// Requests that ended in a transport or provider error
    pub errors: u64,
    /// When the pool was created
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PoolStatsAtomic {
    requests: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    errors: AtomicU64,
}

/// Shared HTTP agent for one provider
#[derive(Debug)]
pub struct ConnectionPool {
    name: String,
    client: reqwest::Client,
    stats: Arc<PoolStatsAtomic>,
    created_at: DateTime<Utc>,
}

impl ConnectionPool {
    /// Build a pool whose client applies `request_timeout` to every request
    pub fn new(name: impl Into<String>, config: &PoolConfig, request_timeout: Duration) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_millis(config.idle_timeout_ms))
            .tcp_keepalive(Duration::from_millis(config.tcp_keepalive_ms))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client for {name}: {e}")))?;

        debug!(provider = %name, max_idle = config.max_idle_per_host, "Connection pool created");

        Ok(Self {
            name,
            client,
            stats: Arc::default(),
            created_at: Utc::now(),
        })
    }

    /// Provider this pool serves
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared client; never build a separate one for the same provider
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Account for one request until the lease is dropped
    ///
    /// The lease does not borrow the pool, so a streaming task can keep it
    /// until the body is fully read.
    #[must_use]
    pub fn lease(&self) -> PoolLease {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let now = self.stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.peak_active.fetch_max(now, Ordering::Relaxed);
        PoolLease {
            stats: Arc::clone(&self.stats),
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            requests: self.stats.requests.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
            peak_active: self.stats.peak_active.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }
}

/// In-use marker for one pooled request
#[derive(Debug)]
pub struct PoolLease {
    stats: Arc<PoolStatsAtomic>,
}

impl PoolLease {
    /// Record that the request failed
    pub fn fail(&self) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_accounting() {
        let pool = ConnectionPool::new("p", &PoolConfig::default(), Duration::from_secs(5)).unwrap();
        {
            let a = pool.lease();
            let _b = pool.lease();
            a.fail();
            assert_eq!(pool.stats().active, 2);
        }

        let stats = pool.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.peak_active, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(pool.name(), "p");
    }
}
