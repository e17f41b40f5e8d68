// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded-concurrency revision fetching.
//!
//! The scheduler owns the connection budget. A submitted [`FetchJob`] starts
//! immediately if fewer than `max_connections` fetches are outstanding,
//! otherwise it waits in a FIFO admission queue. Each running job is a
//! spawned task that retries transient failures with exponential backoff and
//! reports a [`FetchCompletion`] back to the control loop.
//!
//! ```text
//! submit ──▶ [admission FIFO] ──(outstanding < max)──▶ spawn ──▶ remote
//!                  ▲                                              │
//!                  └──── release() + admit() ◀── completion ◀─────┘
//! ```
//!
//! # Single Writer
//!
//! Only the control loop calls into the scheduler. The budget is released
//! when the control loop *processes* a completion, not when the task ends,
//! so `0 <= outstanding <= max_connections` holds at every observation.
//!
//! # Cancellation
//!
//! Flipping the cancel watch stops every retry loop at its next backoff
//! wait. A network call already in flight finishes or times out on its own.

use crate::error::PullError;
use crate::metrics;
use crate::remote::{RemotePeer, RevisionRequest};
use crate::resilience::RetryConfig;
use crate::revision::PulledRevision;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// A unit of network work. Occupies one connection while running.
#[derive(Debug)]
pub enum FetchJob {
    /// GET one revision, hinting the ancestors we already hold.
    Single {
        rev: PulledRevision,
        known_ancestors: Vec<String>,
    },
    /// Bulk GET of several single-revision changes.
    Bulk { revs: Vec<PulledRevision> },
}

impl FetchJob {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single { .. } => "single",
            Self::Bulk { .. } => "bulk",
        }
    }

    /// Revisions this job is responsible for.
    pub fn into_revisions(self) -> Vec<PulledRevision> {
        match self {
            Self::Single { rev, .. } => vec![rev],
            Self::Bulk { revs } => revs,
        }
    }
}

/// What became of one revision (or of the whole job, for `Fatal`).
#[derive(Debug)]
pub enum FetchOutcome {
    /// Body attached and validated, ready for insertion.
    Fetched(PulledRevision),
    /// Permanently unfetchable. Its sequence still completes.
    Dropped { rev: PulledRevision, error: PullError },
    /// Needs an individual GET (bulk item failed transiently or went unanswered).
    Requeue(PulledRevision),
    /// The remote has no bulk GET endpoint. Reroute and stop using it.
    BulkUnsupported(Vec<PulledRevision>),
    /// Retry abandoned because the job is stopping. Never completes.
    Cancelled(PulledRevision),
    /// Systemic failure; the engine must stop.
    Fatal(PullError),
}

/// Report from a finished fetch task. Releases one connection.
#[derive(Debug)]
pub struct FetchCompletion {
    pub kind: &'static str,
    pub elapsed: Duration,
    pub outcomes: Vec<FetchOutcome>,
}

#[derive(Debug, Clone)]
struct AttemptPolicy {
    retry: RetryConfig,
    timeout: Duration,
}

/// Connection budget plus FIFO admission.
pub struct FetchScheduler<R: RemotePeer> {
    remote: Arc<R>,
    policy: AttemptPolicy,
    max_connections: usize,
    outstanding: Arc<AtomicUsize>,
    waiting: VecDeque<FetchJob>,
    completions: mpsc::UnboundedSender<FetchCompletion>,
    cancel: watch::Receiver<bool>,
}

impl<R: RemotePeer> FetchScheduler<R> {
    pub fn new(
        remote: Arc<R>,
        max_connections: usize,
        retry: RetryConfig,
        request_timeout: Duration,
        completions: mpsc::UnboundedSender<FetchCompletion>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote,
            policy: AttemptPolicy {
                retry,
                timeout: request_timeout,
            },
            max_connections: max_connections.max(1),
            outstanding: Arc::new(AtomicUsize::new(0)),
            waiting: VecDeque::new(),
            completions,
            cancel,
        }
    }

    /// Shared view of the outstanding count for observers outside the loop.
    pub fn outstanding_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.outstanding)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Jobs waiting for a connection.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Nothing running and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0 && self.waiting.is_empty()
    }

    /// Queue a job and start it if the budget allows.
    pub fn submit(&mut self, job: FetchJob) {
        trace!(kind = job.kind(), waiting = self.waiting.len(), "Fetch submitted");
        self.waiting.push_back(job);
        self.admit();
    }

    /// Give back the connection of a processed completion and admit the next job.
    pub fn release(&mut self) {
        let previous = self.outstanding.load(Ordering::SeqCst);
        debug_assert!(previous > 0, "released a connection that was never taken");
        self.outstanding.store(previous.saturating_sub(1), Ordering::SeqCst);
        metrics::set_outstanding_connections(previous.saturating_sub(1));
        self.admit();
    }

    /// Remove every job still waiting for admission.
    pub fn drain_waiting(&mut self) -> Vec<FetchJob> {
        let drained: Vec<FetchJob> = self.waiting.drain(..).collect();
        metrics::set_admission_queue_depth(0);
        drained
    }

    fn admit(&mut self) {
        if *self.cancel.borrow() {
            return;
        }
        while self.outstanding() < self.max_connections {
            let Some(job) = self.waiting.pop_front() else {
                break;
            };
            let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_outstanding_connections(now);
            self.spawn(job);
        }
        metrics::set_admission_queue_depth(self.waiting.len());
    }

    fn spawn(&self, job: FetchJob) {
        let remote = Arc::clone(&self.remote);
        let policy = self.policy.clone();
        let cancel = self.cancel.clone();
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let kind = job.kind();
            let start = Instant::now();
            let outcomes = match job {
                FetchJob::Single { rev, known_ancestors } => {
                    vec![fetch_single(remote.as_ref(), rev, known_ancestors, &policy, cancel).await]
                }
                FetchJob::Bulk { revs } => fetch_bulk(remote.as_ref(), revs, &policy, cancel).await,
            };
            let elapsed = start.elapsed();
            metrics::record_fetch_latency(kind, elapsed);
            // Receiver gone means the engine is gone; nothing to report to.
            let _ = completions.send(FetchCompletion {
                kind,
                elapsed,
                outcomes,
            });
        });
    }
}

/// Sleep for `delay` unless cancelled first. Returns `true` if cancelled.
async fn backoff_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *cancel.borrow(),
        changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
    }
}

async fn fetch_single<R: RemotePeer>(
    remote: &R,
    mut rev: PulledRevision,
    known_ancestors: Vec<String>,
    policy: &AttemptPolicy,
    mut cancel: watch::Receiver<bool>,
) -> FetchOutcome {
    let request = RevisionRequest {
        doc_id: rev.doc_id.clone(),
        rev_id: rev.rev_id.clone(),
        known_ancestors,
    };
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(policy.timeout, remote.get_revision(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(PullError::transient(
                format!("GET {}", rev.doc_id),
                format!("attempt timed out after {:?}", policy.timeout),
            )),
        };

        let error = match result {
            Ok(fetched) => {
                return match rev.apply_fetched(fetched) {
                    Ok(()) => FetchOutcome::Fetched(rev),
                    Err(error) => FetchOutcome::Dropped { rev, error },
                };
            }
            Err(error) => error,
        };

        if error.is_fatal() {
            return FetchOutcome::Fatal(error);
        }
        if !error.is_retryable() {
            return FetchOutcome::Dropped { rev, error };
        }
        if !policy.retry.allows_attempt(attempt + 1) {
            let error = PullError::PermanentFetch {
                doc_id: rev.doc_id.clone(),
                rev_id: rev.rev_id.clone(),
                message: format!("gave up after {} attempts: {}", attempt, error),
            };
            return FetchOutcome::Dropped { rev, error };
        }

        let delay = policy.retry.delay_for_attempt(attempt);
        warn!(
            doc_id = %rev.doc_id,
            rev_id = %rev.rev_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Fetch failed, retrying"
        );
        metrics::record_fetch_retry("single");
        if backoff_or_cancel(delay, &mut cancel).await {
            debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "Retry cancelled");
            return FetchOutcome::Cancelled(rev);
        }
        attempt += 1;
    }
}

async fn fetch_bulk<R: RemotePeer>(
    remote: &R,
    revs: Vec<PulledRevision>,
    policy: &AttemptPolicy,
    mut cancel: watch::Receiver<bool>,
) -> Vec<FetchOutcome> {
    let requests: Vec<RevisionRequest> = revs
        .iter()
        .map(|r| RevisionRequest::new(r.doc_id.clone(), r.rev_id.clone()))
        .collect();
    let mut attempt = 1;

    let results = loop {
        let result = match tokio::time::timeout(policy.timeout, remote.bulk_get(requests.clone())).await {
            Ok(result) => result,
            Err(_) => Err(PullError::transient(
                "POST _bulk_get",
                format!("attempt timed out after {:?}", policy.timeout),
            )),
        };

        let error = match result {
            Ok(results) => break results,
            Err(error) => error,
        };

        if matches!(error, PullError::Unsupported { .. }) {
            return vec![FetchOutcome::BulkUnsupported(revs)];
        }
        if error.is_fatal() {
            return vec![FetchOutcome::Fatal(error)];
        }
        if !error.is_retryable() || !policy.retry.allows_attempt(attempt + 1) {
            let message = format!("bulk GET failed after {} attempts: {}", attempt, error);
            return revs
                .into_iter()
                .map(|rev| FetchOutcome::Dropped {
                    error: PullError::PermanentFetch {
                        doc_id: rev.doc_id.clone(),
                        rev_id: rev.rev_id.clone(),
                        message: message.clone(),
                    },
                    rev,
                })
                .collect();
        }

        let delay = policy.retry.delay_for_attempt(attempt);
        warn!(count = revs.len(), attempt, error = %error, "Bulk fetch failed, retrying");
        metrics::record_fetch_retry("bulk");
        if backoff_or_cancel(delay, &mut cancel).await {
            return revs.into_iter().map(FetchOutcome::Cancelled).collect();
        }
        attempt += 1;
    };

    let mut by_key: HashMap<(String, String), _> = results
        .into_iter()
        .map(|item| ((item.doc_id, item.rev_id), item.result))
        .collect();

    revs.into_iter()
        .map(|mut rev| {
            match by_key.remove(&(rev.doc_id.clone(), rev.rev_id.clone())) {
                Some(Ok(fetched)) => match rev.apply_fetched(fetched) {
                    Ok(()) => FetchOutcome::Fetched(rev),
                    Err(error) => FetchOutcome::Dropped { rev, error },
                },
                Some(Err(error)) if error.is_fatal() => FetchOutcome::Fatal(error),
                Some(Err(error)) if error.is_retryable() => FetchOutcome::Requeue(rev),
                Some(Err(error)) => FetchOutcome::Dropped { rev, error },
                None => FetchOutcome::Requeue(rev),
            }
        })
        .collect()
}
