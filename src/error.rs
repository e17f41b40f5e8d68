// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the pull replicator.
//!
//! Errors fall into two groups. **Per-revision faults** are absorbed by the
//! pipeline: the revision is dropped (or inserted as a conflict) and its
//! sequence still completes, so one bad revision never stalls the stream.
//! **Systemic faults** stop the job and put the engine into `Error`.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Pipeline reaction |
//! |------------|-----------|-------|-------------------|
//! | `Transient` | Yes | No | Retry with backoff, then drop |
//! | `NotFound` | No | No | Drop revision, complete sequence |
//! | `PermanentFetch` | No | No | Drop revision, complete sequence |
//! | `InvalidRevision` | No | No | Drop revision, complete sequence |
//! | `Unsupported` | No | No | Fall back to a simpler request |
//! | `StoreConflict` | No | No | Insert as competing branch |
//! | `StoreRejected` | No | No | Drop revision, complete sequence |
//! | `Store` | Yes | No | Keep batch pending, retry flush |
//! | `TrackerDisconnected` | Yes | No | Reconnect tracker, keep state |
//! | `CheckpointCorruption` | No | Yes | Engine enters `Error` |
//! | `CheckpointStore` | No | Yes | Engine enters `Error` |
//! | `Auth` | No | Yes | Engine enters `Error` |
//! | `Config` | No | Yes | Rejected at construction |
//! | `InvalidState` | No | No | Caller bug |
//! | `Shutdown` | No | No | Engine is stopping |
//! | `Internal` | No | Yes | Unexpected internal error |

use thiserror::Error;

/// Result type alias for pull operations.
pub type Result<T> = std::result::Result<T, PullError>;

/// Errors that can occur while pulling from a remote peer.
#[derive(Error, Debug)]
pub enum PullError {
    /// Timeout, 5xx, connection reset and friends.
    ///
    /// Retried with exponential backoff up to the configured attempt count.
    #[error("Transient network error ({operation}): {message}")]
    Transient { operation: String, message: String },

    /// The remote no longer has this revision (purged or compacted away).
    #[error("Revision not found on remote: {doc_id} {rev_id}")]
    NotFound { doc_id: String, rev_id: String },

    /// The fetch failed in a way retrying will not fix (4xx, retries exhausted).
    #[error("Permanent fetch error ({doc_id} {rev_id}): {message}")]
    PermanentFetch {
        doc_id: String,
        rev_id: String,
        message: String,
    },

    /// The fetched body does not match what was requested.
    #[error("Invalid revision {doc_id} {rev_id}: {reason}")]
    InvalidRevision {
        doc_id: String,
        rev_id: String,
        reason: String,
    },

    /// The remote does not implement an optional endpoint (e.g. `_bulk_get`).
    #[error("Remote does not support {operation}")]
    Unsupported { operation: String },

    /// The revision extends a branch other than the current winner.
    #[error("Store conflict: {doc_id} {rev_id}")]
    StoreConflict { doc_id: String, rev_id: String },

    /// The store refused the revision (malformed, failed validation).
    #[error("Store rejected {doc_id} {rev_id}: {reason}")]
    StoreRejected {
        doc_id: String,
        rev_id: String,
        reason: String,
    },

    /// The store failed to apply a whole batch. Nothing from the batch is visible.
    #[error("Store error: {0}")]
    Store(String),

    /// The change feed connection dropped.
    #[error("Change tracker disconnected: {0}")]
    TrackerDisconnected(String),

    /// The persisted checkpoint failed its integrity check.
    #[error("Checkpoint corrupted for {replication_id}: {message}")]
    CheckpointCorruption {
        replication_id: String,
        message: String,
    },

    /// SQLite error while reading or writing checkpoints.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// The remote rejected our credentials.
    #[error("Authentication rejected by remote ({status})")]
    Auth { status: u16 },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PullError {
    /// Create a transient error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Classify an HTTP status returned while fetching a revision.
    ///
    /// 401/403 are systemic (bad credentials stop the job), 404/410 mean the
    /// revision is gone, 408/429/5xx are worth retrying, everything else is
    /// a permanent per-revision failure.
    pub fn from_status(status: u16, doc_id: &str, rev_id: &str) -> Self {
        match status {
            401 | 403 => Self::Auth { status },
            404 | 410 => Self::NotFound {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
            },
            408 | 429 | 500..=599 => {
                Self::transient(format!("GET {}", doc_id), format!("HTTP {}", status))
            }
            _ => Self::PermanentFetch {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
                message: format!("HTTP {}", status),
            },
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Store(_) => true,
            Self::TrackerDisconnected(_) => true,
            Self::NotFound { .. } => false,
            Self::PermanentFetch { .. } => false,
            Self::InvalidRevision { .. } => false,
            Self::Unsupported { .. } => false,
            Self::StoreConflict { .. } => false,
            Self::StoreRejected { .. } => false,
            Self::CheckpointCorruption { .. } => false,
            Self::CheckpointStore(_) => false,
            Self::Auth { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must stop the whole job.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CheckpointCorruption { .. }
                | Self::CheckpointStore(_)
                | Self::Auth { .. }
                | Self::Config(_)
                | Self::Internal(_)
        )
    }

    /// Short label for metrics and drop reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::NotFound { .. } => "not_found",
            Self::PermanentFetch { .. } => "permanent_fetch",
            Self::InvalidRevision { .. } => "invalid_revision",
            Self::Unsupported { .. } => "unsupported",
            Self::StoreConflict { .. } => "store_conflict",
            Self::StoreRejected { .. } => "store_rejected",
            Self::Store(_) => "store",
            Self::TrackerDisconnected(_) => "tracker_disconnected",
            Self::CheckpointCorruption { .. } => "checkpoint_corruption",
            Self::CheckpointStore(_) => "checkpoint_store",
            Self::Auth { .. } => "auth",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
