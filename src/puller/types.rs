// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull engine state, events and progress counters.
//!
//! # State Transitions
//!
//! ```text
//!          start()
//! Idle ─────────────→ Starting ──(checkpoint loaded, feed started)──→ Running
//!  │                     │                                             │  ↑
//!  │ stop()              │ (auth / corrupt checkpoint)          pause()│  │resume()
//!  ↓                     ↓                                             ↓  │
//! Stopped              Error ←──────(unrecoverable fault)────────── Suspended
//!    ↑                                                                 │
//!    └──────────────── Stopping ←───── stop() / one-shot feed done ────┘
//! ```
//!
//! - **Idle**: created, nothing running.
//! - **Starting**: loading the checkpoint and starting the change feed.
//! - **Running**: changes flow through queues, fetches and inserts.
//! - **Suspended**: feed paused, in-flight fetches drain, nothing new is fetched.
//! - **Stopping**: feed stopped, retries cancelled, waiting for outstanding
//!   fetches, final insert flush and checkpoint write.
//! - **Stopped**: clean stop. The persisted checkpoint is safe to resume from.
//! - **Error**: terminal. A single `Failed` event carries the cause.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of a pull replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PullerState {
    Idle,
    Starting,
    Running,
    Suspended,
    Stopping,
    Stopped,
    Error,
}

impl PullerState {
    /// No further transitions happen from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for PullerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Incident and progress reports for the job controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PullEvent {
    /// A revision could not be fetched (or failed validation). Its sequence
    /// still completed.
    RevisionDropped {
        doc_id: String,
        rev_id: String,
        remote_seq: String,
        kind: &'static str,
        reason: String,
    },
    /// The local store refused a revision.
    RevisionRejected {
        doc_id: String,
        rev_id: String,
        reason: String,
    },
    /// A revision was stored as a competing branch.
    Conflict { doc_id: String, rev_id: String },
    /// The safe checkpoint moved forward.
    CheckpointAdvanced { remote_seq: String },
    /// The change feed dropped; a reconnect is scheduled.
    TrackerDisconnected { reason: String, attempt: usize },
    /// The change feed delivered everything up to the remote's head.
    CaughtUp,
    /// The job hit an unrecoverable fault. Sent exactly once.
    Failed { kind: &'static str, message: String },
}

/// Snapshot of progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullStats {
    pub changes_received: u64,
    pub revisions_fetched: u64,
    pub revisions_inserted: u64,
    pub revisions_dropped: u64,
    pub revisions_rejected: u64,
    pub conflicts: u64,
}

/// Live counters shared between the control loop and the handle.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub changes_received: AtomicU64,
    pub revisions_fetched: AtomicU64,
    pub revisions_inserted: AtomicU64,
    pub revisions_dropped: AtomicU64,
    pub revisions_rejected: AtomicU64,
    pub conflicts: AtomicU64,
}

impl StatsCounters {
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PullStats {
        PullStats {
            changes_received: self.changes_received.load(Ordering::Relaxed),
            revisions_fetched: self.revisions_fetched.load(Ordering::Relaxed),
            revisions_inserted: self.revisions_inserted.load(Ordering::Relaxed),
            revisions_dropped: self.revisions_dropped.load(Ordering::Relaxed),
            revisions_rejected: self.revisions_rejected.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}
