// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A mock RemotePeer with failure injection
//! - Change and stored-revision builders
//! - Engine construction and wait helpers

#![allow(dead_code)] // Each test binary uses a different subset

pub mod mock_remote;

pub use mock_remote::*;

use pull_replicator::circuit_breaker::CircuitConfig;
use pull_replicator::{
    Change, MemoryChangeTracker, MemoryRevisionStore, PullEngine, PullEvent, PullerConfig, PullerState,
    PulledRevision, RevisionStore, SeqToken, StoreCircuit,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub type TestEngine = PullEngine<MemoryChangeTracker, MockRemote, MemoryRevisionStore>;

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A change carrying the given leaf revisions.
pub fn change(doc_id: &str, seq: &str, revs: &[&str]) -> Change {
    Change::new(doc_id, seq, revs.iter().map(|s| s.to_string()).collect(), false)
}

/// A change reporting that the document was deleted at `rev`.
pub fn deleted_change(doc_id: &str, seq: &str, rev: &str) -> Change {
    Change::new(doc_id, seq, vec![rev.to_string()], true)
}

/// Write revisions straight into the store, as if replicated earlier.
pub async fn seed_store(store: &MemoryRevisionStore, revs: &[(&str, &str, &[&str])]) {
    let batch: Vec<PulledRevision> = revs
        .iter()
        .map(|(doc_id, rev_id, history)| {
            let mut rev = PulledRevision::new(*doc_id, *rev_id, false, "0", SeqToken::new(0));
            rev.history = history.iter().map(|s| s.to_string()).collect();
            rev.body = Some(json!({ "_id": doc_id, "_rev": rev_id }));
            rev
        })
        .collect();
    store.insert_batch(&batch).await.expect("seed batch");
}

/// Fast timers, in-memory checkpoints.
pub fn test_config(replication_id: &str) -> PullerConfig {
    PullerConfig::for_testing(replication_id)
}

/// Build an engine with fast-recovering store circuits.
pub fn build_engine(
    config: PullerConfig,
    tracker: Arc<MemoryChangeTracker>,
    remote: Arc<MockRemote>,
    store: Arc<MemoryRevisionStore>,
) -> TestEngine {
    PullEngine::new(config, tracker, remote, store)
        .expect("valid config")
        .with_circuit(StoreCircuit::with_configs(CircuitConfig::testing(), CircuitConfig::testing()))
}

/// Start the engine and wait until it stops by itself.
pub async fn run_to_completion(engine: &TestEngine) -> PullerState {
    engine.start().await.expect("engine starts");
    tokio::time::timeout(TEST_TIMEOUT, engine.wait())
        .await
        .expect("engine finished in time")
}

/// Poll until the engine's checkpoint equals `seq`.
pub async fn wait_for_checkpoint(engine: &TestEngine, seq: &str) {
    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        while engine.current_checkpoint().as_deref() != Some(seq) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "checkpoint never reached {} (at {:?})",
        seq,
        engine.current_checkpoint()
    );
}

/// Wait for a particular state.
pub async fn wait_for_state(engine: &TestEngine, state: PullerState) {
    let mut rx = engine.state_receiver();
    let result = tokio::time::timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == state)).await;
    assert!(
        matches!(result, Ok(Ok(_))),
        "engine never reached {} (at {})",
        state,
        engine.state()
    );
}

/// Everything received so far.
pub fn drain_events(rx: &mut broadcast::Receiver<PullEvent>) -> Vec<PullEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
