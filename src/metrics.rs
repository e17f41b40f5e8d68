// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change intake and queue depths
//! - Connection budget usage and fetch latency
//! - Dropped, rejected and conflicted revisions
//! - Batch inserts and checkpoint persistence
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `pull_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use pull_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_change_received("bulk_diff");
//! metrics::record_batch_insert(100, 97, 2, 1, Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a change taken from the feed, by the queue it was routed to.
pub fn record_change_received(queue: &str) {
    counter!("pull_changes_received_total", "queue" => queue.to_string()).increment(1);
}

/// Set the number of revisions waiting in a queue.
pub fn set_queue_depth(queue: &str, depth: usize) {
    gauge!("pull_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

/// Set the number of fetches holding a connection.
pub fn set_outstanding_connections(count: usize) {
    gauge!("pull_outstanding_connections").set(count as f64);
}

/// Set the number of fetch jobs waiting for a connection.
pub fn set_admission_queue_depth(count: usize) {
    gauge!("pull_admission_queue_depth").set(count as f64);
}

/// Record how long a fetch job held its connection (including retries).
pub fn record_fetch_latency(kind: &str, duration: Duration) {
    histogram!("pull_fetch_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a fetch retry after a transient failure.
pub fn record_fetch_retry(kind: &str) {
    counter!("pull_fetch_retries_total", "kind" => kind.to_string()).increment(1);
}

/// Record revisions fetched and validated.
pub fn record_revisions_fetched(count: usize) {
    counter!("pull_revisions_fetched_total").increment(count as u64);
}

/// Record a revision dropped without insertion.
pub fn record_revision_dropped(reason: &str) {
    counter!("pull_revisions_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record revisions the local store refused.
pub fn record_revisions_rejected(count: usize) {
    if count > 0 {
        counter!("pull_revisions_rejected_total").increment(count as u64);
    }
}

/// Record revisions stored as competing branches.
pub fn record_conflicts(count: usize) {
    if count > 0 {
        counter!("pull_conflicts_total").increment(count as u64);
    }
}

/// Record the remote lacking a bulk GET endpoint.
pub fn record_bulk_get_disabled() {
    counter!("pull_bulk_get_disabled_total").increment(1);
}

/// Record a revision already held locally (skipped before fetch).
pub fn record_revisions_already_local(count: usize) {
    if count > 0 {
        counter!("pull_revisions_already_local_total").increment(count as u64);
    }
}

// =============================================================================
// Insert Metrics
// =============================================================================

/// Record a committed batch insert.
pub fn record_batch_insert(
    total: usize,
    inserted: usize,
    conflicted: usize,
    rejected: usize,
    duration: Duration,
) {
    counter!("pull_batch_revisions_total").increment(total as u64);
    counter!("pull_batch_inserted_total").increment(inserted as u64);
    record_conflicts(conflicted);
    record_revisions_rejected(rejected);
    histogram!("pull_batch_insert_duration_seconds").record(duration.as_secs_f64());
    histogram!("pull_batch_size").record(total as f64);
}

/// Record a batch insert that did not commit (kept pending for retry).
pub fn record_batch_insert_failure(reason: &str) {
    counter!("pull_batch_insert_failures_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a checkpoint write to SQLite.
pub fn record_checkpoint_persist(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("pull_checkpoint_persists_total", "status" => status).increment(1);
}

/// Record an SQLITE_BUSY retry.
pub fn record_checkpoint_retry(operation: &str) {
    counter!("pull_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record the safe checkpoint moving forward in memory.
pub fn record_checkpoint_advanced() {
    counter!("pull_checkpoint_advances_total").increment(1);
}

/// Set the number of sequences not yet covered by the checkpoint.
pub fn set_pending_sequences(count: usize) {
    gauge!("pull_pending_sequences").set(count as f64);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Record a change feed reconnect attempt.
pub fn record_tracker_reconnect() {
    counter!("pull_tracker_reconnects_total").increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Suspended" => 3.0,
        "Stopping" => 4.0,
        "Stopped" => 5.0,
        "Error" => 6.0,
        _ => -1.0,
    };
    gauge!("pull_engine_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "pull_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("pull_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics facade is a no-op without a recorder installed, so these
    // only check that every entry point accepts edge-case inputs.

    #[test]
    fn test_intake_metrics() {
        record_change_received("plain");
        record_change_received("deleted");
        set_queue_depth("bulk_diff", 0);
        set_queue_depth("bulk_diff", 500);
    }

    #[test]
    fn test_fetch_metrics() {
        set_outstanding_connections(12);
        set_admission_queue_depth(0);
        record_fetch_latency("single", Duration::from_millis(40));
        record_fetch_latency("bulk", Duration::ZERO);
        record_fetch_retry("single");
        record_revisions_fetched(10);
        record_revisions_already_local(0);
        record_bulk_get_disabled();
    }

    #[test]
    fn test_outcome_metrics() {
        record_revision_dropped("not_found");
        record_revisions_rejected(0);
        record_revisions_rejected(3);
        record_conflicts(1);
    }

    #[test]
    fn test_batch_metrics() {
        record_batch_insert(10, 8, 1, 1, Duration::from_millis(5));
        record_batch_insert(0, 0, 0, 0, Duration::ZERO);
        record_batch_insert_failure("circuit_open");
    }

    #[test]
    fn test_checkpoint_metrics() {
        record_checkpoint_persist(true);
        record_checkpoint_persist(false);
        record_checkpoint_retry("flush");
        record_checkpoint_advanced();
        set_pending_sequences(42);
    }

    #[test]
    fn test_set_engine_state_all_states() {
        for state in ["Idle", "Starting", "Running", "Suspended", "Stopping", "Stopped", "Error", "Bogus"] {
            set_engine_state(state);
        }
        record_tracker_reconnect();
    }

    #[test]
    fn test_circuit_metrics() {
        record_circuit_call("store_writes", "success");
        record_circuit_call("store_writes", "rejected");
        set_circuit_state("store_writes", "open");
        set_circuit_state("store_writes", "unknown");
    }
}
