//! Circuit breaker guarding calls to the durable store.
//!
//! Closed -> (N consecutive failures) -> Open -> (reset timeout) -> HalfOpen
//! -> one trial call -> Closed on success, Open again on failure.
//!
//! All transitions happen under a single lock, so concurrent failures are
//! counted exactly and only one caller ever holds the HalfOpen trial. Time is
//! read from `tokio::time::Instant` so paused-clock tests drive the timeout.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use recall_types::config::BreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward threshold.
    Closed { consecutive_failures: u32 },
    /// Calls fail fast until `reset_timeout` has elapsed since `opened_at`.
    Open { opened_at: Instant },
    /// A single trial call is in flight; everyone else is rejected until it
    /// settles.
    HalfOpen,
}

/// State name without timing detail, for metrics and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    /// Numeric encoding for gauges: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(self) -> u64 {
        match self {
            CircuitStateKind::Closed => 0,
            CircuitStateKind::HalfOpen => 1,
            CircuitStateKind::Open => 2,
        }
    }
}

impl fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitStateKind::Closed => write!(f, "closed"),
            CircuitStateKind::Open => write!(f, "open"),
            CircuitStateKind::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl From<CircuitState> for CircuitStateKind {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed { .. } => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen => CircuitStateKind::HalfOpen,
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the underlying call was not attempted.
    #[error("circuit '{0}' is open")]
    Open(String),

    /// The underlying call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

/// Point-in-time view of a breaker, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    last_error: Option<String>,
}

/// Supervises one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed {
                    consecutive_failures: 0,
                },
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
                last_error: None,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.reset_timeout())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (without forcing an Open -> HalfOpen transition).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn state_kind(&self) -> CircuitStateKind {
        self.state().into()
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        let consecutive_failures = match inner.state {
            CircuitState::Closed {
                consecutive_failures,
            } => consecutive_failures,
            _ => self.failure_threshold,
        };
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state.into(),
            consecutive_failures,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            last_error: inner.last_error.clone(),
        }
    }

    /// Ask for permission to make one call.
    ///
    /// Moves Open -> HalfOpen once the reset timeout has elapsed; the caller
    /// that triggers that move holds the single trial.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed { .. } => false,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() < self.reset_timeout {
                    inner.total_rejections += 1;
                    return None;
                }
                info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                inner.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::HalfOpen => {
                inner.total_rejections += 1;
                return None;
            }
        };
        inner.total_calls += 1;
        Some(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Run `call` through the breaker.
    ///
    /// Returns `BreakerError::Open` without invoking `call` while the circuit
    /// is open (or a trial is already in flight).
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(BreakerError::Open(self.name.clone()));
        };
        match call().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure(&err.to_string());
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed { .. } => {
                inner.state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            CircuitState::HalfOpen if trial => {
                info!(breaker = %self.name, "Trial call succeeded, circuit closed");
                inner.state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            // Stale non-trial results do not move an open or probing circuit.
            CircuitState::HalfOpen | CircuitState::Open { .. } => {}
        }
    }

    fn record_failure(&self, trial: bool, error: &str) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let new_count = consecutive_failures + 1;
                if new_count >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = new_count,
                        error,
                        "Failure threshold reached, circuit opened"
                    );
                    inner.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    inner.state = CircuitState::Closed {
                        consecutive_failures: new_count,
                    };
                }
            }
            CircuitState::HalfOpen if trial => {
                warn!(breaker = %self.name, error, "Trial call failed, circuit reopened");
                inner.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => {}
        }
    }
}

/// Permission to make one call; settle it with [`success`](Self::success) or
/// [`failure`](Self::failure).
///
/// A trial permit dropped unsettled (the caller was cancelled) counts as a
/// failed trial, so the circuit cannot stay half-open forever.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self, error: &str) {
        self.settled = true;
        self.breaker.record_failure(self.trial, error);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record_failure(true, "trial call abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("store", 3, Duration::from_secs(30))
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.call(|| async { Err::<(), _>("down".to_string()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.call(|| async { Ok::<(), String>(()) }).await
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let b = breaker();
        assert_eq!(
            b.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
        assert_eq!(b.state_kind().to_string(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let b = breaker();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state_kind(), CircuitStateKind::Closed);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state_kind(), CircuitStateKind::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = b
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.status().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        assert_eq!(
            b.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state_kind(), CircuitStateKind::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens_and_resets_clock() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        fail(&b).await.unwrap_err();
        assert_eq!(b.state_kind(), CircuitStateKind::Open);

        // Clock restarted at the failed trial: still open 20s later.
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(succeed(&b).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state_kind(), CircuitStateKind::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let first = b.try_acquire().expect("trial permit");
        assert!(first.is_trial());
        assert!(b.try_acquire().is_none());
        assert!(b.try_acquire().is_none());
        assert_eq!(b.state_kind(), CircuitStateKind::HalfOpen);
        assert_eq!(b.status().total_rejections, 2);

        first.success();
        assert!(b.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_reopens() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        drop(b.try_acquire().expect("trial permit"));
        assert_eq!(b.state_kind(), CircuitStateKind::Open);
        assert_eq!(b.status().last_error.as_deref(), Some("trial call abandoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_counted_exactly() {
        let b = Arc::new(CircuitBreaker::new("store", 100, Duration::from_secs(30)));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let b = Arc::clone(&b);
            handles.push(tokio::spawn(async move { fail(&b).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap_err();
        }
        assert_eq!(
            b.state(),
            CircuitState::Closed {
                consecutive_failures: 50
            }
        );
        assert_eq!(b.status().total_failures, 50);
    }

    #[test]
    fn test_state_kind_gauge_encoding() {
        assert_eq!(CircuitStateKind::Closed.as_gauge(), 0);
        assert_eq!(CircuitStateKind::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitStateKind::Open.as_gauge(), 2);
    }
}
