// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding the local store.
//!
//! When the store starts failing batch writes, hammering it with the same
//! batch on every tick only makes things worse. The breaker (built on
//! `recloser`) fails fast while open; the inserter keeps the batch pending
//! and the checkpoint stays put until a write goes through again.
//!
//! # States
//!
//! - **Closed**: calls pass through
//! - **Open**: calls are rejected without touching the store
//! - **HalfOpen**: a few probe calls decide whether to close again
//!
//! # Usage
//!
//! ```rust,no_run
//! # use pull_replicator::circuit_breaker::{StoreCircuit, CircuitError};
//! # async fn example() {
//! let circuit = StoreCircuit::new();
//!
//! match circuit.writes.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* committed */ }
//!     Err(CircuitError::Rejected) => { /* open, keep batch pending */ }
//!     Err(CircuitError::Inner(e)) => { /* store error */ }
//! }
//! # }
//! ```

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a call through a breaker that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Open breaker; the store was not touched.
    #[error("store circuit open")]
    Rejected,

    #[error("{0}")]
    Inner(#[source] E),
}

/// Tuning for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio (0.0 - 1.0) over the window that trips the breaker.
    pub error_rate: f32,
    /// Number of recent calls considered while closed.
    pub window: usize,
    /// Probe calls allowed while half-open.
    pub probe_calls: usize,
    /// How long to stay open before probing.
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 10,
            probe_calls: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Batch writes: trip after a handful of failures, recover within seconds.
    #[must_use]
    pub fn store_writes() -> Self {
        Self {
            error_rate: 0.5,
            window: 4,
            probe_calls: 1,
            open_wait: Duration::from_secs(5),
        }
    }

    /// Fast recovery for tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            error_rate: 0.5,
            window: 2,
            probe_calls: 1,
            open_wait: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy)]
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

/// Per-breaker call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// A recloser breaker labelled for metrics.
pub struct CircuitBreaker {
    label: &'static str,
    inner: AsyncRecloser,
    counts: [AtomicU64; 3],
}

impl CircuitBreaker {
    pub fn new(label: &'static str, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.probe_calls.max(1))
            .open_wait(config.open_wait)
            .build();

        Self {
            label,
            inner: recloser.into(),
            counts: Default::default(),
        }
    }

    /// Run a store operation through the breaker. The future returned by
    /// `f` is only polled when the breaker lets the call through.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (outcome, result) = match self.inner.call(f()).await {
            Ok(value) => (Outcome::Success, Ok(value)),
            Err(RecloserError::Rejected) => {
                warn!(circuit = self.label, "Store circuit open, call rejected");
                metrics::set_circuit_state(self.label, "open");
                (Outcome::Rejected, Err(CircuitError::Rejected))
            }
            Err(RecloserError::Inner(e)) => {
                debug!(circuit = self.label, "Store call failed");
                (Outcome::Failure, Err(CircuitError::Inner(e)))
            }
        };
        self.counts[outcome as usize].fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_call(self.label, outcome.as_str());
        result
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let load = |o: Outcome| self.counts[o as usize].load(Ordering::Relaxed);
        CircuitStats {
            successes: load(Outcome::Success),
            failures: load(Outcome::Failure),
            rejections: load(Outcome::Rejected),
        }
    }
}

/// Breakers for the two kinds of store traffic.
pub struct StoreCircuit {
    /// Batch inserts.
    pub writes: CircuitBreaker,
    /// `find_missing`, `winning_revs`, `possible_ancestors`.
    pub reads: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuit {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::store_writes(), CircuitConfig::default())
    }

    pub fn with_configs(writes: CircuitConfig, reads: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("store_writes", writes),
            reads: CircuitBreaker::new("store_reads", reads),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_wait: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitConfig {
                open_wait,
                ..CircuitConfig::testing()
            },
        )
    }

    #[tokio::test]
    async fn test_success_and_failure_are_counted() {
        let cb = breaker(Duration::from_secs(60));
        let ok: Result<u32, CircuitError<&str>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        let err: Result<u32, CircuitError<&str>> = cb.call(|| async { Err("disk full") }).await;
        assert!(matches!(err, Err(CircuitError::Inner("disk full"))));

        assert_eq!(
            cb.stats(),
            CircuitStats {
                successes: 1,
                failures: 1,
                rejections: 0
            }
        );
    }

    #[tokio::test]
    async fn test_open_breaker_skips_the_store() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..6 {
            let _: Result<u32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }
        assert!(cb.stats().rejections >= 1);

        let touched = AtomicU64::new(0);
        let result: Result<u32, CircuitError<&str>> = cb
            .call(|| async {
                touched.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_recovers_after_open_wait() {
        let cb = breaker(Duration::from_millis(20));
        for _ in 0..6 {
            let _: Result<u32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result: Result<u32, CircuitError<&str>> = cb.call(|| async { Ok(3) }).await;
        assert_eq!(result.unwrap(), 3);
    }
}
