// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Three-way routing of discovered revisions.
//!
//! ```text
//!                    ┌── deleted ──────────────▶ Deleted  ──▶ stub insert (no fetch)
//! Change ──classify──┼── one rev, bulk GET ok ─▶ BulkDiff ──▶ find_missing ──▶ bulk GET
//!                    └── otherwise ────────────▶ Plain    ──▶ find_missing ──▶ GET per rev
//! ```
//!
//! Each queue flushes when it reaches the size threshold or when its oldest
//! entry has waited for the flush delay, whichever comes first.

use crate::revision::{Change, PulledRevision};
use crate::sequence_map::SeqToken;
use std::time::{Duration, Instant};

/// Which queue a revision waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Individual GET per revision (conflicts, multi-rev changes, no bulk support).
    Plain,
    /// Deletions, inserted as stubs.
    Deleted,
    /// Single-revision changes, diffed and fetched in bulk.
    BulkDiff,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Plain, QueueKind::Deleted, QueueKind::BulkDiff];

    /// Label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Deleted => "deleted",
            Self::BulkDiff => "bulk_diff",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Deleted => 1,
            Self::BulkDiff => 2,
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide where a change goes.
pub fn classify(change: &Change, bulk_get: bool) -> QueueKind {
    if change.deleted {
        QueueKind::Deleted
    } else if bulk_get && change.revs.len() == 1 {
        QueueKind::BulkDiff
    } else {
        QueueKind::Plain
    }
}

#[derive(Debug, Default)]
struct Queue {
    revs: Vec<PulledRevision>,
    oldest: Option<Instant>,
}

/// The three disjoint queues between the change feed and the fetcher.
#[derive(Debug)]
pub struct RevisionQueues {
    queues: [Queue; 3],
    flush_threshold: usize,
    flush_delay: Duration,
}

impl RevisionQueues {
    pub fn new(flush_threshold: usize, flush_delay: Duration) -> Self {
        Self {
            queues: Default::default(),
            flush_threshold: flush_threshold.max(1),
            flush_delay,
        }
    }

    /// Route every candidate revision of `change` into its queue.
    ///
    /// Returns the queue used and the number of revisions queued.
    pub fn enqueue(&mut self, change: &Change, token: SeqToken, bulk_get: bool) -> (QueueKind, usize) {
        let kind = classify(change, bulk_get);
        for rev_id in &change.revs {
            let rev = PulledRevision::new(
                change.doc_id.clone(),
                rev_id.clone(),
                change.deleted,
                change.remote_seq.clone(),
                token,
            );
            self.push(kind, rev);
        }
        (kind, change.revs.len())
    }

    /// Add one revision to a queue.
    pub fn push(&mut self, kind: QueueKind, rev: PulledRevision) {
        let queue = &mut self.queues[kind.index()];
        if queue.oldest.is_none() {
            queue.oldest = Some(Instant::now());
        }
        queue.revs.push(rev);
    }

    /// Whether `kind` has hit its size or time threshold.
    pub fn should_flush(&self, kind: QueueKind) -> bool {
        let queue = &self.queues[kind.index()];
        if queue.revs.len() >= self.flush_threshold {
            return true;
        }
        queue
            .oldest
            .is_some_and(|oldest| oldest.elapsed() >= self.flush_delay)
    }

    /// Queues that are due for a flush.
    pub fn ready(&self) -> Vec<QueueKind> {
        QueueKind::ALL
            .into_iter()
            .filter(|kind| self.should_flush(*kind))
            .collect()
    }

    /// Remove and return everything in `kind`.
    pub fn take(&mut self, kind: QueueKind) -> Vec<PulledRevision> {
        let queue = &mut self.queues[kind.index()];
        queue.oldest = None;
        std::mem::take(&mut queue.revs)
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queues[kind.index()].revs.len()
    }

    /// Revisions waiting across all queues.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(|q| q.revs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.revs.is_empty())
    }
}
