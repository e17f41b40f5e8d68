// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched insertion of fetched revisions.
//!
//! Fetches complete in any order, so a batch can hold a child revision ahead
//! of its parent. Before each flush the batch is reordered (stable by first
//! appearance of the document, then by ascending generation) so the store
//! always sees a document's revisions oldest first.
//!
//! # Flush
//!
//! ```text
//! pending ──▶ order_for_insert ──▶ conflict pre-pass ──▶ circuit ──▶ store.insert_batch
//!                                  (winning_revs)                     (atomic)
//! ```
//!
//! The conflict pre-pass compares every revision against the document's
//! current winner (as it will be after the earlier revisions of the same
//! batch): a revision whose ancestry does not include the winner is tagged
//! `conflicted` so the store records it as a competing branch, unless the
//! winner itself descends from it. Ordering only covers one batch, so a
//! parent can still land a batch after its child.
//!
//! A flush that fails (store error or open circuit) leaves the batch pending
//! and undecided. Nothing from it reached the store, so its sequences stay
//! incomplete and the checkpoint cannot move past it.

use crate::circuit_breaker::{CircuitError, StoreCircuit};
use crate::error::{PullError, Result};
use crate::metrics;
use crate::revision::{parse_generation, PulledRevision};
use crate::store::{InsertOutcome, RevisionStore, WinningRevision};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Reorder a batch so parents precede children.
///
/// Stable: documents keep the order of their first appearance, revisions of
/// one document are sorted by generation, ties keep arrival order.
pub fn order_for_insert(batch: &mut [PulledRevision]) {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (i, rev) in batch.iter().enumerate() {
        first_seen.entry(rev.doc_id.clone()).or_insert(i);
    }
    batch.sort_by_key(|rev| (first_seen.get(&rev.doc_id).copied().unwrap_or(usize::MAX), rev.generation()));
}

/// Decide `conflicted` for every revision not yet decided, and graft
/// deletion stubs onto the branch they delete.
///
/// `winners` holds the store's current winner per document. A revision the
/// winner already descends from (a parent that lost the race to its child)
/// fills in ancestry and is never a conflict.
pub fn tag_conflicts(batch: &mut [PulledRevision], mut winners: HashMap<String, WinningRevision>) {
    for rev in batch.iter_mut() {
        let winner = winners.get(&rev.doc_id);

        if let Some(winner) = winner {
            let is_stub = rev.deleted && rev.history.len() == 1;
            let winner_generation = parse_generation(&winner.rev_id).unwrap_or(0);
            if is_stub && winner.rev_id != rev.rev_id && winner_generation < rev.generation() {
                trace!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, parent = %winner.rev_id, "Grafting deletion stub");
                rev.history.push(winner.rev_id.clone());
            }
        }

        let backfill = winner.is_some_and(|w| w.has_ancestor(&rev.rev_id));
        if !rev.conflict_decided() {
            let conflicted = match winner {
                None => false,
                Some(w) if backfill || w.rev_id == rev.rev_id => false,
                Some(w) => !rev.history.iter().skip(1).any(|a| *a == w.rev_id),
            };
            rev.set_conflicted(conflicted);
        }

        if backfill {
            if let Some(winner) = winners.get_mut(&rev.doc_id) {
                winner.extend_ancestry(&rev.rev_id);
            }
        } else if !rev.conflicted() {
            if let Some(winner) = WinningRevision::from_history(&rev.history) {
                winners.insert(rev.doc_id.clone(), winner);
            }
        }
    }
}

/// Result of a committed flush.
#[derive(Debug, Default)]
pub struct InsertReport {
    /// Every revision of the batch with what the store did with it.
    pub outcomes: Vec<(PulledRevision, InsertOutcome)>,
    pub duration: Duration,
}

impl InsertReport {
    pub fn inserted(&self) -> usize {
        self.count(|o| matches!(o, InsertOutcome::Inserted))
    }

    pub fn conflicted(&self) -> usize {
        self.count(|o| matches!(o, InsertOutcome::Conflicted))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, InsertOutcome::Rejected(_)))
    }

    fn count(&self, f: impl Fn(&InsertOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Buffers validated revisions and writes them to the store in batches.
pub struct InsertBatcher<S: RevisionStore> {
    store: Arc<S>,
    circuit: Arc<StoreCircuit>,
    pending: Vec<PulledRevision>,
    batch_start: Option<Instant>,
    batch_size: usize,
    batch_delay: Duration,
}

impl<S: RevisionStore> InsertBatcher<S> {
    pub fn new(store: Arc<S>, circuit: Arc<StoreCircuit>, batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            store,
            circuit,
            pending: Vec::new(),
            batch_start: None,
            batch_size: batch_size.max(1),
            batch_delay,
        }
    }

    /// Add a fetched (or stubbed) revision to the pending batch.
    pub fn add(&mut self, rev: PulledRevision) {
        if self.batch_start.is_none() {
            self.batch_start = Some(Instant::now());
        }
        self.pending.push(rev);
    }

    /// Size or time threshold reached.
    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.batch_size {
            return true;
        }
        self.batch_start
            .is_some_and(|start| start.elapsed() >= self.batch_delay)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write the pending batch as one unit.
    ///
    /// On error the batch stays pending and nothing was written.
    pub async fn flush(&mut self) -> Result<InsertReport> {
        if self.pending.is_empty() {
            return Ok(InsertReport::default());
        }

        let start = Instant::now();
        let mut batch = std::mem::take(&mut self.pending);
        match self.write(&mut batch).await {
            Ok((batch, outcomes)) => {
                self.batch_start = None;
                let mut outcomes = outcomes.into_iter();
                let paired: Vec<(PulledRevision, InsertOutcome)> = batch
                    .into_iter()
                    .map(|rev| {
                        let outcome = outcomes.next().unwrap_or_else(|| {
                            warn!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "Store reported no outcome");
                            InsertOutcome::Rejected("store reported no outcome".to_string())
                        });
                        (rev, outcome)
                    })
                    .collect();

                let report = InsertReport {
                    outcomes: paired,
                    duration: start.elapsed(),
                };
                metrics::record_batch_insert(
                    report.outcomes.len(),
                    report.inserted(),
                    report.conflicted(),
                    report.rejected(),
                    report.duration,
                );
                debug!(
                    count = report.outcomes.len(),
                    inserted = report.inserted(),
                    conflicted = report.conflicted(),
                    rejected = report.rejected(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Batch inserted"
                );
                Ok(report)
            }
            Err(e) => {
                // Nothing was applied; keep the batch (plus anything added since) for the next attempt.
                batch.append(&mut self.pending);
                self.pending = batch;
                metrics::record_batch_insert_failure(e.kind());
                Err(e)
            }
        }
    }

    /// Order and decide one attempt. Conflict decisions are made on a copy
    /// and returned only with a committed write, so a retry after a failure
    /// decides again against the winners as they are then.
    async fn write(&self, pending: &mut [PulledRevision]) -> Result<(Vec<PulledRevision>, Vec<InsertOutcome>)> {
        order_for_insert(pending);

        let mut doc_ids: Vec<String> = pending.iter().map(|r| r.doc_id.clone()).collect();
        doc_ids.dedup();
        let store = &self.store;
        let winners = match self.circuit.reads.call(|| store.winning_revs(doc_ids)).await {
            Ok(winners) => winners,
            Err(CircuitError::Rejected) => return Err(PullError::Store("store read circuit open".into())),
            Err(CircuitError::Inner(e)) => return Err(e),
        };
        let mut batch = pending.to_vec();
        tag_conflicts(&mut batch, winners);

        let written: &[PulledRevision] = &batch;
        let result = self.circuit.writes.call(|| store.insert_batch(written)).await;
        match result {
            Ok(outcomes) => Ok((batch, outcomes)),
            Err(CircuitError::Rejected) => {
                warn!(count = batch.len(), "Store write circuit open, batch kept pending");
                Err(PullError::Store("store write circuit open".into()))
            }
            Err(CircuitError::Inner(e)) => {
                warn!(count = batch.len(), error = %e, "Batch insert failed, batch kept pending");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitConfig;
    use crate::sequence_map::SeqToken;
    use crate::store::MemoryRevisionStore;
    use serde_json::json;

    fn loaded(doc: &str, rev: &str, history: &[&str]) -> PulledRevision {
        let mut r = PulledRevision::new(doc, rev, false, "1", SeqToken::new(0));
        r.history = history.iter().map(|s| s.to_string()).collect();
        r.body = Some(json!({"_id": doc, "_rev": rev}));
        r
    }

    fn batcher(store: Arc<MemoryRevisionStore>, size: usize) -> InsertBatcher<MemoryRevisionStore> {
        let circuit = Arc::new(StoreCircuit::with_configs(
            CircuitConfig::testing(),
            CircuitConfig::testing(),
        ));
        InsertBatcher::new(store, circuit, size, Duration::from_secs(60))
    }

    fn winners(doc: &str, history: &[&str]) -> HashMap<String, WinningRevision> {
        let history: Vec<String> = history.iter().map(|s| s.to_string()).collect();
        let winner = WinningRevision::from_history(&history).unwrap();
        HashMap::from([(doc.to_string(), winner)])
    }

    fn ids(batch: &[PulledRevision]) -> Vec<String> {
        batch.iter().map(|r| format!("{}:{}", r.doc_id, r.rev_id)).collect()
    }

    #[test]
    fn test_order_puts_parents_first() {
        let mut batch = vec![
            loaded("a", "3-c", &["3-c", "2-b", "1-a"]),
            loaded("b", "1-x", &["1-x"]),
            loaded("a", "1-a", &["1-a"]),
            loaded("a", "2-b", &["2-b", "1-a"]),
        ];
        order_for_insert(&mut batch);
        assert_eq!(ids(&batch), vec!["a:1-a", "a:2-b", "a:3-c", "b:1-x"]);
    }

    #[test]
    fn test_order_is_stable_for_same_generation() {
        let mut batch = vec![
            loaded("a", "2-y", &["2-y", "1-a"]),
            loaded("a", "2-x", &["2-x", "1-a"]),
        ];
        order_for_insert(&mut batch);
        assert_eq!(ids(&batch), vec!["a:2-y", "a:2-x"]);
    }

    #[test]
    fn test_tag_conflicts_against_winner() {
        let mut batch = vec![
            loaded("a", "3-c", &["3-c", "2-b"]),
            loaded("a", "2-z", &["2-z", "1-a"]),
            loaded("new", "1-n", &["1-n"]),
        ];
        let winners = winners("a", &["2-b", "1-a"]);
        tag_conflicts(&mut batch, winners);
        assert!(!batch[0].conflicted());
        // 3-c became the winner, so 2-z branches off.
        assert!(batch[1].conflicted());
        assert!(!batch[2].conflicted());
    }

    #[test]
    fn test_tag_conflicts_keeps_existing_decision() {
        let mut rev = loaded("a", "2-b", &["2-b", "1-a"]);
        rev.set_conflicted(true);
        let mut batch = vec![rev];
        tag_conflicts(&mut batch, winners("a", &["1-a"]));
        assert!(batch[0].conflicted());
    }

    #[test]
    fn test_deletion_stub_is_grafted_onto_winner() {
        let mut stub = PulledRevision::new("a", "3-d", true, "7", SeqToken::new(0));
        stub.make_deletion_stub();
        let mut batch = vec![stub];
        tag_conflicts(&mut batch, winners("a", &["2-b", "1-a"]));
        assert_eq!(batch[0].history, vec!["3-d".to_string(), "2-b".to_string()]);
        assert!(!batch[0].conflicted());
    }

    #[test]
    fn test_late_parent_is_not_tagged_conflicted() {
        let mut batch = vec![loaded("a", "1-a", &["1-a"]), loaded("b", "1-x", &["1-x"])];
        let mut known = winners("a", &["2-a", "1-a"]);
        known.extend(winners("b", &["2-b", "1-b"]));
        tag_conflicts(&mut batch, known);
        assert!(!batch[0].conflicted());
        // 1-x is not in 2-b's ancestry.
        assert!(batch[1].conflicted());
    }

    #[test]
    fn test_revision_below_parentless_winner_is_backfill() {
        let mut batch = vec![loaded("a", "1-a", &["1-a"]), loaded("a", "1-z", &["1-z"])];
        tag_conflicts(&mut batch, winners("a", &["2-d"]));
        assert!(!batch[0].conflicted());
        // 2-d now descends from 1-a, so a second root is a branch.
        assert!(batch[1].conflicted());
    }

    #[tokio::test]
    async fn test_flush_inserts_in_dependency_order() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut batcher = batcher(Arc::clone(&store), 10);
        batcher.add(loaded("a", "2-b", &["2-b", "1-a"]));
        batcher.add(loaded("a", "1-a", &["1-a"]));

        let report = batcher.flush().await.unwrap();
        assert_eq!(report.inserted(), 2);
        assert_eq!(report.conflicted(), 0);
        assert!(batcher.is_empty());
        assert_eq!(store.winning_rev("a").await.as_deref(), Some("2-b"));
    }

    #[tokio::test]
    async fn test_conflicting_revision_does_not_replace_winner() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut batcher = batcher(Arc::clone(&store), 10);
        batcher.add(loaded("a", "1-a", &["1-a"]));
        batcher.add(loaded("a", "2-a", &["2-a", "1-a"]));
        batcher.flush().await.unwrap();

        batcher.add(loaded("a", "2-x", &["2-x", "1-a"]));
        let report = batcher.flush().await.unwrap();
        assert_eq!(report.conflicted(), 1);
        assert!(report.outcomes[0].0.conflicted());
        assert_eq!(store.winning_rev("a").await.as_deref(), Some("2-a"));
        assert!(store.is_conflicted("a", "2-x").await);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch_pending() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut batcher = batcher(Arc::clone(&store), 10);
        batcher.add(loaded("a", "1-a", &["1-a"]));
        store.fail_next_batches(1);

        let err = batcher.flush().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(batcher.len(), 1);
        assert_eq!(store.revision_count().await, 0);

        let report = batcher.flush().await.unwrap();
        assert_eq!(report.inserted(), 1);
        assert!(store.contains("a", "1-a").await);
    }

    #[tokio::test]
    async fn test_retry_after_failed_write_decides_conflicts_again() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut batcher = batcher(Arc::clone(&store), 10);
        batcher.add(loaded("a", "2-a", &["2-a", "1-a"]));
        store.fail_next_batches(1);
        assert!(batcher.flush().await.is_err());

        // A competing root lands between attempts.
        store.insert_batch(&[loaded("a", "1-b", &["1-b"])]).await.unwrap();
        let report = batcher.flush().await.unwrap();
        assert_eq!(report.conflicted(), 1);
        assert!(report.outcomes[0].0.conflicted());
        assert_eq!(store.winning_rev("a").await.as_deref(), Some("1-b"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_conflicts_undecided() {
        let store = Arc::new(MemoryRevisionStore::new());
        store.insert_batch(&[loaded("a", "1-b", &["1-b"])]).await.unwrap();
        let mut batcher = batcher(Arc::clone(&store), 10);
        batcher.add(loaded("a", "2-a", &["2-a", "1-a"]));
        store.fail_next_batches(1);
        assert!(batcher.flush().await.is_err());
        assert!(batcher.pending.iter().all(|r| !r.conflict_decided()));
    }

    #[tokio::test]
    async fn test_rejected_revision_is_reported() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut batcher = batcher(Arc::clone(&store), 10);
        batcher.add(PulledRevision::new("a", "1-a", false, "1", SeqToken::new(0)));
        let report = batcher.flush().await.unwrap();
        assert_eq!(report.rejected(), 1);
    }

    #[tokio::test]
    async fn test_should_flush_by_size_and_time() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut by_size = batcher(Arc::clone(&store), 2);
        by_size.add(loaded("a", "1-a", &["1-a"]));
        assert!(!by_size.should_flush());
        by_size.add(loaded("b", "1-b", &["1-b"]));
        assert!(by_size.should_flush());

        let circuit = Arc::new(StoreCircuit::new());
        let mut by_time = InsertBatcher::new(store, circuit, 100, Duration::from_millis(5));
        assert!(!by_time.should_flush());
        by_time.add(loaded("c", "1-c", &["1-c"]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(by_time.should_flush());
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let store = Arc::new(MemoryRevisionStore::new());
        let mut batcher = batcher(Arc::clone(&store), 10);
        let report = batcher.flush().await.unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(store.batches_applied(), 0);
    }
}
