// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-store circuit breakers on the repair write path, built on `recloser`.
//!
//! When a replica keeps failing its breaker opens and the remaining repairs
//! for that store fail fast, so an unreachable store costs one timeout
//! instead of one per issue. Other stores keep repairing.
//!
//! States:
//! - Closed: Normal operation, writes pass through
//! - Open: Store unhealthy, writes are rejected without reaching it
//! - HalfOpen: Probing whether the store recovered

use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::retry::Retryable;

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the store was not called
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// An open circuit is not worth retrying against.
impl<E: Retryable> Retryable for CircuitError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            CircuitError::Rejected => false,
            CircuitError::Inner(e) => e.is_retryable(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures in the closed window that trip the breaker
    pub failure_threshold: u32,
    /// Successful probes in half-open before closing again
    pub success_threshold: u32,
    /// Time spent open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    fn build(&self) -> AsyncRecloser {
        let window = self.failure_threshold.max(1);
        Recloser::custom()
            .error_rate(window as f32 / 100.0)
            .closed_len(window as usize)
            .half_open_len(self.success_threshold.max(1) as usize)
            .open_wait(self.recovery_timeout)
            .build()
            .into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Rejected,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
        }
    }
}

/// Call accounting for one store's breaker, as reported by [`StoreCircuits::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub store: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Default)]
struct Counters {
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.successes,
            Outcome::Failure => &self.failures,
            Outcome::Rejected => &self.rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Breaker guarding writes to one store.
pub struct CircuitBreaker {
    store: String,
    inner: AsyncRecloser,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(store: impl Into<String>, config: &CircuitConfig) -> Self {
        Self {
            store: store.into(),
            inner: config.build(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Run `f` unless the breaker is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (outcome, result) = match self.inner.call(f()).await {
            Ok(value) => (Outcome::Success, Ok(value)),
            Err(RecloserError::Inner(e)) => (Outcome::Failure, Err(CircuitError::Inner(e))),
            Err(RecloserError::Rejected) => (Outcome::Rejected, Err(CircuitError::Rejected)),
        };

        self.counters.record(outcome);
        crate::metrics::record_circuit_breaker_call(&self.store, outcome.as_str());
        match outcome {
            Outcome::Rejected => warn!(store = %self.store, "Circuit open, write rejected"),
            _ => debug!(store = %self.store, outcome = outcome.as_str(), "Circuit call"),
        }
        result
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let failures = self.counters.failures.load(Ordering::Relaxed);
        let rejections = self.counters.rejections.load(Ordering::Relaxed);
        CircuitSnapshot {
            store: self.store.clone(),
            calls: successes + failures + rejections,
            successes,
            failures,
            rejections,
        }
    }
}

/// Lazily created breaker per store name.
pub struct StoreCircuits {
    config: CircuitConfig,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
}

impl StoreCircuits {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Breaker for `store`, created on first use.
    pub fn for_store(&self, store: &str) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(store.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(store, &self.config)))
            .clone()
    }

    /// Accounting for every breaker created so far, ordered by store.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = self.circuits.iter().map(|e| e.snapshot()).collect();
        out.sort_by(|a, b| a.store.cmp(&b.store));
        out
    }
}

impl Default for StoreCircuits {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_through() {
        let cb = CircuitBreaker::new("housing", &CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        let snap = cb.snapshot();
        assert_eq!((snap.calls, snap.successes, snap.failures), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_and_counted() {
        let cb = CircuitBreaker::new("housing", &CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.snapshot().failures, 1);
    }

    #[tokio::test]
    async fn test_opens_and_rejects_without_calling() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("legal", &config);
        let reached = AtomicU64::new(0);

        for _ in 0..4 {
            let _: Result<(), CircuitError<&str>> = cb
                .call(|| async {
                    reached.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                })
                .await;
        }

        let snap = cb.snapshot();
        assert_eq!(snap.calls, 4);
        assert!(snap.rejections >= 1, "{:?}", snap);
        assert_eq!(reached.load(Ordering::SeqCst), snap.failures);
    }

    #[test]
    fn test_rejection_is_not_retryable() {
        use crate::storage::traits::StoreError;

        assert!(!CircuitError::<StoreError>::Rejected.is_retryable());
        assert!(CircuitError::Inner(StoreError::unavailable("legal", "timeout")).is_retryable());
        assert!(!CircuitError::Inner(StoreError::Validation("bad".into())).is_retryable());
    }

    #[tokio::test]
    async fn test_store_circuits_are_per_store() {
        let circuits = StoreCircuits::new(CircuitConfig::test());

        let a = circuits.for_store("legal");
        let again = circuits.for_store("legal");
        let b = circuits.for_store("housing");
        assert!(Arc::ptr_eq(&a, &again));

        let _: Result<i32, CircuitError<&str>> = a.call(|| async { Err("down") }).await;
        let _: Result<i32, CircuitError<&str>> = b.call(|| async { Ok(1) }).await;

        let snap = circuits.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].store, "housing");
        assert_eq!((snap[0].successes, snap[0].failures), (1, 0));
        assert_eq!((snap[1].successes, snap[1].failures), (0, 1));
    }
}
