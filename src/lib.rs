// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Pull Replicator
//!
//! The pull side of a revision-tree document replicator: it follows a
//! remote's change feed, fetches the revisions the local store is missing
//! and inserts them, checkpointing progress so an interrupted job resumes
//! without skipping anything.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                pull engine                                  │
//! │                                                                             │
//! │  ┌───────────────┐   ┌──────────────────┐   ┌──────────────┐               │
//! │  │ ChangeTracker │──►│ RevisionQueues   │──►│FetchScheduler│──► RemotePeer  │
//! │  │ (_changes)    │   │ deleted/plain/   │   │ (bounded,    │    (GET,       │
//! │  └───────────────┘   │ bulk_diff        │   │  retrying)   │     _bulk_get) │
//! │          │           └──────────────────┘   └──────────────┘               │
//! │          ▼                    │ deletion stubs       │ bodies               │
//! │  ┌───────────────┐            ▼                      ▼                      │
//! │  │ SequenceMap   │◄──── ┌─────────────────────────────────┐                 │
//! │  │ (safe prefix) │      │ InsertBatcher ──► RevisionStore │                 │
//! │  └───────────────┘      │ (ordered, conflict-tagged)      │                 │
//! │          │              └─────────────────────────────────┘                 │
//! │          ▼                                                                  │
//! │  ┌───────────────┐                                                          │
//! │  │CheckpointStore│                                                          │
//! │  │ (SQLite)      │                                                          │
//! │  └───────────────┘                                                          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Checkpoint Safety
//!
//! Changes complete out of order, but the checkpoint only ever names a
//! sequence such that it and every change registered before it are finished
//! (stored, already present, or permanently dropped). Resuming from it never
//! loses a revision.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pull_replicator::{MemoryChangeTracker, MemoryRevisionStore, HttpRemotePeer, PullEngine, PullerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PullerConfig::default();
//!     let remote = HttpRemotePeer::new("http://peer:5984/db", Duration::from_secs(30))
//!         .expect("valid URL");
//!     let engine = PullEngine::new(
//!         config,
//!         Arc::new(MemoryChangeTracker::one_shot(vec![])),
//!         Arc::new(remote),
//!         Arc::new(MemoryRevisionStore::new()),
//!     )
//!     .expect("valid config");
//!
//!     engine.start().await.expect("Failed to start");
//!     engine.wait().await;
//! }
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fetch;
pub mod inserter;
pub mod metrics;
pub mod puller;
pub mod queues;
pub mod remote;
pub mod resilience;
pub mod revision;
pub mod sequence_map;
pub mod store;
pub mod tracker;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitStats, StoreCircuit};
pub use config::{CheckpointConfig, FetchConfig, InsertConfig, PullerConfig, QueueConfig, TrackerConfig};
pub use error::{PullError, Result};
pub use puller::{PullEngine, PullEvent, PullStats, PullerState};
pub use remote::{BulkGetResult, HttpRemotePeer, RemotePeer, RemoteRevision, RevisionRequest};
pub use revision::{Change, PulledRevision};
pub use sequence_map::{SeqToken, SequenceMap};
pub use store::{BoxFuture, InsertOutcome, MemoryRevisionStore, RevisionStore, WinningRevision};
pub use tracker::{ChangeTracker, MemoryChangeTracker, TrackerEvent};
