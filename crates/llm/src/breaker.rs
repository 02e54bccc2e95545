//! Per-upstream circuit breaker.
//!
//! CLOSED counts consecutive failures and opens at the failure threshold.
//! OPEN rejects immediately until the open timeout elapses, then HALF_OPEN
//! admits a single probe at a time; consecutive probe successes close the
//! breaker, any probe failure reopens it.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use lynkr_config::CircuitBreakerConfig;

/// Breaker state machine variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow; failures are counted.
    Closed,
    /// Requests are rejected until the open timeout elapses.
    Open,
    /// One probe at a time is admitted.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Lifetime counters, updated atomically.
#[derive(Debug, Default)]
struct Stats {
    requests: AtomicU64,
    failures: AtomicU64,
    successes: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of a breaker for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: String,
    /// Lifetime admitted requests.
    pub requests: u64,
    /// Lifetime recorded failures.
    pub failures: u64,
    /// Lifetime recorded successes.
    pub successes: u64,
    /// Lifetime rejections while open.
    pub rejected: u64,
}

/// Circuit breaker guarding one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    stats: Stats,
}

impl CircuitBreaker {
    /// A closed breaker with the given thresholds.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                next_attempt_at: None,
                probe_in_flight: false,
            }),
            stats: Stats::default(),
        }
    }

    /// Ask to admit a request. Returns the remaining open time when rejected.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => {
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            BreakerState::Open => {
                let now = Instant::now();
                let reopen_at = inner.next_attempt_at.unwrap_or(now);

                if now < reopen_at {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(reopen_at - now);
                }

                inner.state = BreakerState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.probe_in_flight = true;
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(self.config.open_timeout);
                }

                inner.probe_in_flight = true;
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.stats.successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        inner.consecutive_failures = 0;

        match inner.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;

                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_successes = 0;
                    inner.next_attempt_at = None;
                }
            }
            // A success reported while open can only come from a call that
            // was admitted before the breaker tripped; ignore it.
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        inner.consecutive_successes = 0;

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                self.trip(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    /// Record a call that was cancelled mid-flight. Counts neither success
    /// nor failure; only releases a half-open probe slot.
    pub fn record_cancelled(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    /// Current state, advancing OPEN to HALF_OPEN eligibility lazily.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Counters for health reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock().state;

        BreakerSnapshot {
            state: state.to_string(),
            requests: self.stats.requests.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.consecutive_failures = 0;
        inner.next_attempt_at = Some(Instant::now() + self.config.open_timeout);
        log::warn!("circuit breaker opened for {}", self.config.open_timeout.as_secs());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means another thread panicked mid-transition;
        // the counters are still coherent, so continue with the data.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Process-wide registry of breakers, one per upstream. Constructed at
/// startup and passed into the dispatcher; not an ambient global.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// An empty registry creating breakers with the given thresholds.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for an upstream, created closed on first use.
    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }

    /// Snapshots of every known breaker.
    pub fn snapshots(&self) -> Vec<(String, BreakerSnapshot)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}
