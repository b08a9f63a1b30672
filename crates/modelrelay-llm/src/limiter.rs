//! Per-provider rate limiter
//!
//! Combines a concurrency ceiling, a minimum spacing between dispatches and
//! a refillable call budget (the reservoir). Calls are admitted strictly in
//! arrival order and are only ever delayed, never rejected.
//!
//! Admission is a three-step gate held by one caller at a time:
//!
//! ```text
//! FIFO gate ──> concurrency slot ──> min_time spacing ──> reservoir > 0 ──> dispatch
//! ```
//!
//! [`RateLimiter::acquire`] hands out the dispatched slot as a
//! [`LimiterPermit`] for work that outlives a single future, such as a
//! stream whose body is read by another task.
//!
//! The reservoir is refilled lazily from elapsed time instead of by a
//! background timer, so a limiter needs no runtime to be constructed.

use crate::error::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Rate limit parameters for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Hard ceiling on in-flight calls (0 means unlimited)
    pub max_concurrent: usize,
    /// Minimum spacing between two dispatches, in milliseconds
    pub min_time_ms: u64,
    /// Initial call budget; `None` disables the reservoir
    pub reservoir: Option<u32>,
    /// Calls added back on each refresh
    pub reservoir_refresh_amount: Option<u32>,
    /// Refresh period in milliseconds
    pub reservoir_refresh_interval_ms: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            min_time_ms: 0,
            reservoir: None,
            reservoir_refresh_amount: None,
            reservoir_refresh_interval_ms: None,
        }
    }
}

impl RateLimitConfig {
    /// Set the concurrency ceiling
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the minimum dispatch spacing
    #[must_use]
    pub fn with_min_time(mut self, min_time: Duration) -> Self {
        self.min_time_ms = min_time.as_millis() as u64;
        self
    }

    /// Enable the reservoir with a periodic top-up
    #[must_use]
    pub fn with_reservoir(mut self, size: u32, refresh_amount: u32, interval: Duration) -> Self {
        self.reservoir = Some(size);
        self.reservoir_refresh_amount = Some(refresh_amount);
        self.reservoir_refresh_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Check the parameters are usable
    pub fn validate(&self) -> Result<()> {
        if self.reservoir_refresh_amount.is_some() && self.reservoir.is_none() {
            return Err(Error::Config(
                "reservoir_refresh_amount requires reservoir".to_string(),
            ));
        }
        if let (Some(_), Some(0)) = (
            self.reservoir_refresh_amount,
            self.reservoir_refresh_interval_ms,
        ) {
            return Err(Error::Config(
                "reservoir_refresh_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn min_time(&self) -> Duration {
        Duration::from_millis(self.min_time_ms)
    }

    fn refresh_interval(&self) -> Option<Duration> {
        match (self.reservoir_refresh_amount, self.reservoir_refresh_interval_ms) {
            (Some(_), Some(ms)) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

/// Limiter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Calls waiting for admission
    pub queued: usize,
    /// Calls currently dispatched
    pub running: usize,
    /// Calls that finished
    pub done: u64,
    /// Remaining budget, `None` when unlimited
    pub reservoir: Option<u32>,
}

#[derive(Debug)]
struct DispatchState {
    last_dispatch: Option<Instant>,
    reservoir: Option<u32>,
    last_refill: Instant,
}

impl DispatchState {
    fn refill(&mut self, now: Instant, config: &RateLimitConfig) {
        let (Some(interval), Some(amount), Some(cap)) = (
            config.refresh_interval(),
            config.reservoir_refresh_amount,
            config.reservoir,
        ) else {
            return;
        };

        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = (elapsed.as_millis() / interval.as_millis()) as u32;
        if periods == 0 {
            return;
        }

        let current = self.reservoir.unwrap_or(cap);
        let topped = current.saturating_add(amount.saturating_mul(periods));
        self.reservoir = Some(topped.min(cap));
        self.last_refill += interval * periods;
    }
}

/// A dispatched call's hold on a concurrency slot
///
/// The slot is freed and the call counted as done when the permit drops.
#[derive(Debug)]
pub struct LimiterPermit {
    _slot: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
    done: Arc<AtomicU64>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        self.done.fetch_add(1, Ordering::Relaxed);
    }
}

enum Admission {
    Dispatch,
    WaitFor(Duration),
    WaitForTopUp,
}

/// Rate limiter for a single provider
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    gate: tokio::sync::Mutex<()>,
    slots: Arc<Semaphore>,
    state: Mutex<DispatchState>,
    topped_up: Notify,
    queued: AtomicUsize,
    running: Arc<AtomicUsize>,
    done: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create a limiter for the named provider
    #[must_use]
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let permits = if config.max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_concurrent
        };
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(permits)),
            state: Mutex::new(DispatchState {
                last_dispatch: None,
                reservoir: config.reservoir,
                last_refill: Instant::now(),
            }),
            config,
            gate: tokio::sync::Mutex::new(()),
            topped_up: Notify::new(),
            queued: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            done: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Provider this limiter guards
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Run `task` once admitted
    ///
    /// Waits in FIFO order until a concurrency slot is free, `min_time` has
    /// passed since the previous dispatch and the reservoir is non-empty.
    /// The slot is held until `task` completes. Dropping the returned future
    /// while it waits gives up the place in the queue.
    pub async fn schedule<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire().await?;
        let result = task().await;
        drop(permit);
        result
    }

    /// Wait for admission and take the slot
    ///
    /// Same admission rules as [`schedule`](Self::schedule); the slot stays
    /// taken until the returned permit is dropped.
    pub async fn acquire(&self) -> Result<LimiterPermit> {
        let slot = {
            let _queued = CountGuard::enter(&self.queued);
            let _turn = self.gate.lock().await;

            let slot = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| Error::ProviderUnavailable {
                    context: ErrorContext::new(self.name.clone(), String::new()),
                    status: None,
                    message: "rate limiter closed".to_string(),
                })?;

            self.wait_for_dispatch().await;
            slot
        };

        self.running.fetch_add(1, Ordering::Relaxed);
        Ok(LimiterPermit {
            _slot: slot,
            running: Arc::clone(&self.running),
            done: Arc::clone(&self.done),
        })
    }

    /// Overwrite the remaining budget
    pub fn update_reservoir(&self, value: u32) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.reservoir = Some(value);
        }
        debug!(provider = %self.name, reservoir = value, "Reservoir updated");
        self.topped_up.notify_one();
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        let reservoir = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.refill(Instant::now(), &self.config);
            state.reservoir
        };
        LimiterStats {
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            reservoir,
        }
    }

    async fn wait_for_dispatch(&self) {
        loop {
            match self.try_dispatch() {
                Admission::Dispatch => return,
                Admission::WaitFor(delay) => {
                    trace!(provider = %self.name, delay_ms = delay.as_millis() as u64, "Delaying dispatch");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.topped_up.notified() => {}
                    }
                }
                Admission::WaitForTopUp => {
                    debug!(provider = %self.name, "Reservoir empty with no refresh, waiting for top-up");
                    self.topped_up.notified().await;
                }
            }
        }
    }

    fn try_dispatch(&self) -> Admission {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.refill(now, &self.config);

        if let Some(last) = state.last_dispatch {
            let ready_at = last + self.config.min_time();
            if ready_at > now {
                return Admission::WaitFor(ready_at - now);
            }
        }

        match state.reservoir {
            Some(0) => match self.config.refresh_interval() {
                Some(interval) => {
                    let next = state.last_refill + interval;
                    Admission::WaitFor(next.saturating_duration_since(now).max(Duration::from_millis(1)))
                }
                None => Admission::WaitForTopUp,
            },
            Some(left) => {
                state.reservoir = Some(left - 1);
                state.last_dispatch = Some(now);
                Admission::Dispatch
            }
            None => {
                state.last_dispatch = Some(now);
                Admission::Dispatch
            }
        }
    }
}

struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let limiter = Arc::new(RateLimiter::new(
            "p",
            RateLimitConfig::default().with_max_concurrent(5),
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(move || async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(peak.load(Ordering::SeqCst), 5);
        assert_eq!(limiter.stats().done, 20);
        assert_eq!(limiter.stats().running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_time_spacing() {
        let limiter = RateLimiter::new(
            "p",
            RateLimitConfig::default()
                .with_max_concurrent(10)
                .with_min_time(Duration::from_millis(100)),
        );
        let stamps = Mutex::new(Vec::new());

        join_all((0..5).map(|_| {
            let stamps = &stamps;
            limiter.schedule(move || async move {
                stamps.lock().unwrap().push(Instant::now());
                Ok(())
            })
        }))
        .await;

        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 5);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission() {
        let limiter = RateLimiter::new("p", RateLimitConfig::default().with_max_concurrent(1));
        let order = Mutex::new(Vec::new());

        join_all((0..6).map(|i| {
            let order = &order;
            limiter.schedule(move || async move {
                order.lock().unwrap().push(i);
                sleep(Duration::from_millis(5)).await;
                Ok(())
            })
        }))
        .await;

        assert_eq!(order.into_inner().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservoir_delays_until_refresh() {
        let limiter = RateLimiter::new(
            "p",
            RateLimitConfig::default()
                .with_max_concurrent(10)
                .with_reservoir(2, 1, Duration::from_secs(1)),
        );
        let start = Instant::now();
        let stamps = Mutex::new(Vec::new());

        join_all((0..3).map(|_| {
            let stamps = &stamps;
            limiter.schedule(move || async move {
                stamps.lock().unwrap().push(Instant::now() - start);
                Ok(())
            })
        }))
        .await;

        let stamps = stamps.into_inner().unwrap();
        assert!(stamps[0] < Duration::from_millis(1));
        assert!(stamps[1] < Duration::from_millis(1));
        assert!(stamps[2] >= Duration::from_secs(1));
        assert_eq!(limiter.stats().reservoir, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservoir_refill_is_capped() {
        let limiter = RateLimiter::new(
            "p",
            RateLimitConfig::default().with_reservoir(3, 2, Duration::from_millis(100)),
        );
        limiter.schedule(|| async { Ok(()) }).await.unwrap();
        assert_eq!(limiter.stats().reservoir, Some(2));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.stats().reservoir, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_reservoir_wakes_waiter() {
        let limiter = Arc::new(RateLimiter::new(
            "p",
            RateLimitConfig {
                reservoir: Some(0),
                ..RateLimitConfig::default()
            },
        ));

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.schedule(|| async { Ok(42) }).await })
        };
        sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.stats().queued, 1);

        limiter.update_reservoir(1);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_holds_slot_until_dropped() {
        let limiter = Arc::new(RateLimiter::new(
            "p",
            RateLimitConfig::default().with_max_concurrent(1),
        ));

        let first = limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().running, 1);

        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| Instant::now()) })
        };
        sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.stats().queued, 1);

        let released = Instant::now();
        drop(first);
        let admitted = second.await.unwrap().unwrap();
        assert!(admitted >= released);

        let stats = limiter.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.done, 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().validate().is_ok());
        let bad = RateLimitConfig {
            reservoir_refresh_amount: Some(1),
            ..RateLimitConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
