// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The pull control loop.
//!
//! One task owns every piece of mutable pipeline state: the sequence map,
//! the revision queues, the fetch scheduler, the insert batcher and the
//! checkpoint store. It wakes on four sources:
//!
//! ```text
//!   change feed ──┐
//!   completions ──┼──▶ select! ──▶ route / release / insert / checkpoint
//!   commands ─────┤
//!   tick ─────────┘
//! ```
//!
//! Fetch tasks never touch this state; they only send completions back.

use super::types::{PullEvent, PullerState, StatsCounters};
use crate::checkpoint::CheckpointStore;
use crate::circuit_breaker::{CircuitError, StoreCircuit};
use crate::config::PullerConfig;
use crate::error::{PullError, Result};
use crate::fetch::{FetchCompletion, FetchJob, FetchOutcome, FetchScheduler};
use crate::inserter::InsertBatcher;
use crate::metrics;
use crate::queues::{QueueKind, RevisionQueues};
use crate::remote::RemotePeer;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::revision::{Change, PulledRevision};
use crate::sequence_map::{SeqToken, SequenceMap};
use crate::store::{InsertOutcome, RevisionStore};
use crate::tracker::{ChangeTracker, TrackerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Requests from the engine handle.
#[derive(Debug)]
pub(crate) enum Command {
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    Stop,
}

/// Channels the handle observes.
#[derive(Clone)]
pub(crate) struct Shared {
    pub state: Arc<watch::Sender<PullerState>>,
    pub checkpoint: Arc<watch::Sender<Option<String>>>,
    pub events: broadcast::Sender<PullEvent>,
    pub stats: Arc<StatsCounters>,
}

impl Shared {
    pub fn state(&self) -> PullerState {
        *self.state.borrow()
    }

    pub fn publish_state(&self, state: PullerState) {
        self.state.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    pub fn emit(&self, event: PullEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Report an unrecoverable fault. Callers guarantee this runs once per job.
    pub fn report_failure(&self, error: &PullError) {
        self.emit(PullEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.publish_state(PullerState::Error);
    }
}

enum Wake {
    Command(Option<Command>),
    Feed(Option<TrackerEvent>),
    Fetched(FetchCompletion),
    Tick,
}

async fn next_event(feed: &mut Option<mpsc::Receiver<TrackerEvent>>) -> Option<TrackerEvent> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Puller<T: ChangeTracker, R: RemotePeer, S: RevisionStore> {
    config: PullerConfig,
    shared: Shared,
    tracker: Arc<T>,
    store: Arc<S>,
    circuit: Arc<StoreCircuit>,

    sequences: SequenceMap,
    /// Revisions of each tracked change still in the pipeline.
    remaining: HashMap<SeqToken, usize>,
    queues: RevisionQueues,
    scheduler: FetchScheduler<R>,
    inserter: InsertBatcher<S>,
    checkpoints: CheckpointStore,

    feed: Option<mpsc::Receiver<TrackerEvent>>,
    commands: mpsc::Receiver<Command>,
    completions: mpsc::UnboundedReceiver<FetchCompletion>,
    cancel: watch::Sender<bool>,
    rate_limiter: Option<RateLimiter>,

    bulk_get: bool,
    /// Where the feed restarts after a pause or a disconnect.
    resume_seq: Option<String>,
    feed_ended: bool,
    reconnect_policy: RetryConfig,
    reconnect_attempts: usize,
    reconnect_at: Option<Instant>,
    persist_interval: Duration,
    last_persist: Instant,
}

impl<T: ChangeTracker, R: RemotePeer, S: RevisionStore> Puller<T, R, S> {
    /// Open the checkpoint store, load the resume point and start the feed.
    ///
    /// Returns the loop ready to [`run`](Self::run) plus the shared
    /// outstanding-connection counter.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        config: PullerConfig,
        shared: Shared,
        tracker: Arc<T>,
        remote: Arc<R>,
        store: Arc<S>,
        circuit: Arc<StoreCircuit>,
        commands: mpsc::Receiver<Command>,
    ) -> Result<(Self, Arc<AtomicUsize>)> {
        let checkpoints = CheckpointStore::open(&config.checkpoint).await?;
        let checkpoint = match checkpoints.load(&config.replication_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                checkpoints.close().await;
                return Err(e);
            }
        };
        info!(checkpoint = ?checkpoint, "Loaded checkpoint");
        shared.checkpoint.send_replace(checkpoint.clone());

        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let scheduler = FetchScheduler::new(
            remote,
            config.fetch.max_connections,
            config.fetch.retry_config(),
            config.fetch.request_timeout_duration(),
            completions_tx,
            cancel_rx,
        );
        let outstanding = scheduler.outstanding_handle();
        let inserter = InsertBatcher::new(
            Arc::clone(&store),
            Arc::clone(&circuit),
            config.insert.batch_size,
            config.insert.batch_delay_duration(),
        );

        let mut puller = Self {
            sequences: SequenceMap::resuming_from(checkpoint.clone()),
            remaining: HashMap::new(),
            queues: RevisionQueues::new(config.queues.flush_threshold, config.queues.flush_delay_duration()),
            scheduler,
            inserter,
            checkpoints,
            feed: None,
            commands,
            completions,
            cancel,
            rate_limiter: config.tracker.rate_limit_config().map(RateLimiter::new),
            bulk_get: config.fetch.bulk_get,
            resume_seq: checkpoint,
            feed_ended: false,
            reconnect_policy: config.tracker.reconnect_config(),
            reconnect_attempts: 0,
            reconnect_at: None,
            persist_interval: config.checkpoint.persist_interval_duration(),
            last_persist: Instant::now(),
            config,
            shared,
            tracker,
            store,
            circuit,
        };

        if let Err(e) = puller.start_feed().await {
            puller.checkpoints.close().await;
            return Err(e);
        }
        Ok((puller, outstanding))
    }

    /// Drive the pipeline until stopped, finished or failed.
    pub async fn run(mut self) {
        let result = match self.event_loop().await {
            Ok(()) => self.shutdown().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    checkpoint = ?self.sequences.current_safe_checkpoint(),
                    "Pull replication stopped"
                );
                self.shared.publish_state(PullerState::Stopped);
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn event_loop(&mut self) -> Result<()> {
        let period = self
            .config
            .queues
            .flush_delay_duration()
            .min(self.config.insert.batch_delay_duration())
            .max(Duration::from_millis(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = next_event(&mut self.feed) => Wake::Feed(event),
                Some(completion) = self.completions.recv() => Wake::Fetched(completion),
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Stop)) => {
                    info!("Stop requested");
                    return Ok(());
                }
                Wake::Command(Some(Command::Pause(reply))) => {
                    let _ = reply.send(self.pause().await);
                }
                Wake::Command(Some(Command::Resume(reply))) => {
                    let result = self.resume().await;
                    let _ = reply.send(result);
                }
                Wake::Feed(Some(event)) => self.handle_feed_event(event).await?,
                Wake::Feed(None) => {
                    self.feed = None;
                    if self.shared.state() == PullerState::Running {
                        self.schedule_reconnect("change feed closed".to_string())?;
                    }
                }
                Wake::Fetched(completion) => self.handle_completion(completion).await?,
                Wake::Tick => self.on_tick().await?,
            }

            if self.feed_ended && self.is_drained() {
                info!("Change feed ended and all work drained");
                return Ok(());
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change feed
    // ─────────────────────────────────────────────────────────────────────────

    async fn start_feed(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.tracker.channel_capacity);
        self.tracker.start(self.resume_seq.clone(), tx).await?;
        self.feed = Some(rx);
        self.feed_ended = false;
        debug!(since = ?self.resume_seq, "Change feed started");
        Ok(())
    }

    async fn stop_feed(&mut self) {
        if let Err(e) = self.tracker.stop().await {
            warn!(error = %e, "Change tracker did not stop cleanly");
        }
        // Dropping the receiver discards anything the old session buffered.
        self.feed = None;
    }

    fn schedule_reconnect(&mut self, reason: String) -> Result<()> {
        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        if !self.reconnect_policy.allows_attempt(attempt) {
            return Err(PullError::TrackerDisconnected(format!(
                "gave up after {} reconnect attempts: {}",
                attempt - 1,
                reason
            )));
        }

        let delay = self.reconnect_policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Change feed disconnected, reconnecting"
        );
        self.shared.emit(PullEvent::TrackerDisconnected { reason, attempt });
        self.reconnect_at = Some(Instant::now() + delay);
        Ok(())
    }

    async fn reconnect_if_due(&mut self) -> Result<()> {
        if !self.reconnect_at.is_some_and(|at| Instant::now() >= at) {
            return Ok(());
        }
        self.reconnect_at = None;
        metrics::record_tracker_reconnect();
        info!(since = ?self.resume_seq, attempt = self.reconnect_attempts, "Reconnecting change feed");

        match self.start_feed().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.schedule_reconnect(e.to_string()),
        }
    }

    async fn handle_feed_event(&mut self, event: TrackerEvent) -> Result<()> {
        match event {
            TrackerEvent::Change(change) => self.accept_change(change).await,
            TrackerEvent::CaughtUp => {
                self.reconnect_attempts = 0;
                debug!(pending = self.sequences.pending_count(), "Change feed caught up");
                self.shared.emit(PullEvent::CaughtUp);
                Ok(())
            }
            TrackerEvent::Disconnected(reason) => {
                self.feed = None;
                self.schedule_reconnect(reason)
            }
            TrackerEvent::Ended => {
                self.feed = None;
                if self.config.continuous {
                    self.schedule_reconnect("continuous change feed ended".to_string())
                } else {
                    info!(pending = self.sequences.pending_count(), "Change feed ended");
                    self.feed_ended = true;
                    Ok(())
                }
            }
        }
    }

    async fn accept_change(&mut self, change: Change) -> Result<()> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        self.reconnect_attempts = 0;
        StatsCounters::add(&self.shared.stats.changes_received, 1);
        self.resume_seq = Some(change.remote_seq.clone());

        let token = self.sequences.track(change.remote_seq.clone());
        if change.revs.is_empty() {
            if self.sequences.complete(token) {
                self.checkpoint_advanced().await;
            }
            return Ok(());
        }

        let (kind, count) = self.queues.enqueue(&change, token, self.bulk_get);
        self.remaining.insert(token, count);
        metrics::record_change_received(kind.as_str());
        trace!(
            doc_id = %change.doc_id,
            remote_seq = %change.remote_seq,
            queue = %kind,
            revs = count,
            "Change queued"
        );

        if self.shared.state() == PullerState::Running && self.queues.should_flush(kind) {
            self.flush_queue(kind).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queues → fetches
    // ─────────────────────────────────────────────────────────────────────────

    async fn flush_queue(&mut self, kind: QueueKind) -> Result<()> {
        let revs = self.queues.take(kind);
        if revs.is_empty() {
            return Ok(());
        }
        let Some(missing) = self.filter_missing(kind, revs).await? else {
            return Ok(());
        };

        match kind {
            QueueKind::Deleted => {
                for mut rev in missing {
                    rev.make_deletion_stub();
                    self.inserter.add(rev);
                }
                if self.inserter.should_flush() {
                    self.flush_inserts().await?;
                }
            }
            QueueKind::BulkDiff if self.bulk_get => {
                let mut missing = missing.into_iter().peekable();
                while missing.peek().is_some() {
                    let revs: Vec<PulledRevision> =
                        missing.by_ref().take(self.config.fetch.bulk_get_batch_size).collect();
                    self.scheduler.submit(FetchJob::Bulk { revs });
                }
            }
            QueueKind::BulkDiff | QueueKind::Plain => {
                for rev in missing {
                    let known_ancestors = self.known_ancestors(&rev).await;
                    self.scheduler.submit(FetchJob::Single { rev, known_ancestors });
                }
            }
        }
        metrics::set_queue_depth(kind.as_str(), self.queues.len(kind));
        Ok(())
    }

    /// Drop revisions the store already holds, completing their share of the
    /// sequence. `None` means the lookup failed and the batch went back into
    /// its queue.
    async fn filter_missing(
        &mut self,
        kind: QueueKind,
        revs: Vec<PulledRevision>,
    ) -> Result<Option<Vec<PulledRevision>>> {
        let pairs: Vec<(String, String)> = revs
            .iter()
            .map(|r| (r.doc_id.clone(), r.rev_id.clone()))
            .collect();
        let store = &self.store;
        let lookup = self.circuit.reads.call(|| store.find_missing(pairs)).await;
        let missing = match lookup {
            Ok(missing) => missing,
            Err(e) => {
                let error = match e {
                    CircuitError::Rejected => PullError::Store("store read circuit open".into()),
                    CircuitError::Inner(e) => e,
                };
                if error.is_fatal() {
                    return Err(error);
                }
                warn!(queue = %kind, count = revs.len(), error = %error, "Revision lookup failed, requeueing");
                for rev in revs {
                    self.queues.push(kind, rev);
                }
                return Ok(None);
            }
        };

        let missing: HashSet<(String, String)> = missing.into_iter().collect();
        let (missing, local): (Vec<PulledRevision>, Vec<PulledRevision>) = revs
            .into_iter()
            .partition(|r| missing.contains(&(r.doc_id.clone(), r.rev_id.clone())));

        if !local.is_empty() {
            trace!(queue = %kind, count = local.len(), "Revisions already held locally");
            metrics::record_revisions_already_local(local.len());
            for rev in local {
                self.complete_revision(rev.seq_token).await;
            }
        }
        Ok(Some(missing))
    }

    /// Local revisions the remote can use to trim the response. Best effort.
    async fn known_ancestors(&self, rev: &PulledRevision) -> Vec<String> {
        if rev.generation() <= 1 {
            return Vec::new();
        }
        let store = &self.store;
        let (doc_id, rev_id) = (rev.doc_id.clone(), rev.rev_id.clone());
        let lookup = self.circuit.reads.call(|| store.possible_ancestors(doc_id, rev_id)).await;
        match lookup {
            Ok(ancestors) => ancestors,
            Err(e) => {
                debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, error = %e, "No ancestor hint");
                Vec::new()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fetch completions → inserts
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_completion(&mut self, completion: FetchCompletion) -> Result<()> {
        self.scheduler.release();
        trace!(
            kind = completion.kind,
            elapsed_ms = completion.elapsed.as_millis() as u64,
            outcomes = completion.outcomes.len(),
            "Fetch completed"
        );

        let mut fatal = None;
        for outcome in completion.outcomes {
            match outcome {
                FetchOutcome::Fetched(rev) => {
                    StatsCounters::add(&self.shared.stats.revisions_fetched, 1);
                    metrics::record_revisions_fetched(1);
                    self.inserter.add(rev);
                }
                FetchOutcome::Dropped { rev, error } => self.drop_revision(rev, error).await,
                FetchOutcome::Requeue(rev) => self.queues.push(QueueKind::Plain, rev),
                FetchOutcome::BulkUnsupported(revs) => {
                    if self.bulk_get {
                        self.bulk_get = false;
                        metrics::record_bulk_get_disabled();
                        info!("Remote has no bulk GET endpoint, falling back to single fetches");
                    }
                    for rev in revs {
                        self.queues.push(QueueKind::Plain, rev);
                    }
                }
                FetchOutcome::Cancelled(rev) => {
                    debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "Fetch abandoned");
                }
                FetchOutcome::Fatal(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        if self.inserter.should_flush() {
            self.flush_inserts().await?;
        }
        Ok(())
    }

    async fn drop_revision(&mut self, rev: PulledRevision, error: PullError) {
        warn!(
            doc_id = %rev.doc_id,
            rev_id = %rev.rev_id,
            remote_seq = %rev.remote_seq,
            kind = error.kind(),
            error = %error,
            "Dropping revision"
        );
        metrics::record_revision_dropped(error.kind());
        StatsCounters::add(&self.shared.stats.revisions_dropped, 1);
        self.shared.emit(PullEvent::RevisionDropped {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.clone(),
            remote_seq: rev.remote_seq.clone(),
            kind: error.kind(),
            reason: error.to_string(),
        });
        self.complete_revision(rev.seq_token).await;
    }

    async fn flush_inserts(&mut self) -> Result<()> {
        let report = match self.inserter.flush().await {
            Ok(report) => report,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!(pending = self.inserter.len(), error = %e, "Insert batch kept pending");
                return Ok(());
            }
        };

        let stats = Arc::clone(&self.shared.stats);
        let (mut conflicts, mut rejected) = (0, 0);
        for (rev, outcome) in report.outcomes {
            match outcome {
                InsertOutcome::Inserted => StatsCounters::add(&stats.revisions_inserted, 1),
                InsertOutcome::Conflicted => {
                    StatsCounters::add(&stats.revisions_inserted, 1);
                    StatsCounters::add(&stats.conflicts, 1);
                    conflicts += 1;
                    debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "Stored as conflict");
                    self.shared.emit(PullEvent::Conflict {
                        doc_id: rev.doc_id.clone(),
                        rev_id: rev.rev_id.clone(),
                    });
                }
                InsertOutcome::Rejected(reason) => {
                    warn!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, reason = %reason, "Store rejected revision");
                    StatsCounters::add(&stats.revisions_rejected, 1);
                    rejected += 1;
                    self.shared.emit(PullEvent::RevisionRejected {
                        doc_id: rev.doc_id.clone(),
                        rev_id: rev.rev_id.clone(),
                        reason,
                    });
                }
            }
            self.complete_revision(rev.seq_token).await;
        }
        metrics::record_conflicts(conflicts);
        metrics::record_revisions_rejected(rejected);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checkpoint
    // ─────────────────────────────────────────────────────────────────────────

    async fn complete_revision(&mut self, token: SeqToken) {
        let Some(remaining) = self.remaining.get_mut(&token) else {
            warn!(token = token.index(), "Completion for a sequence with no revisions in flight");
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return;
        }
        self.remaining.remove(&token);
        if self.sequences.complete(token) {
            self.checkpoint_advanced().await;
        }
    }

    async fn checkpoint_advanced(&mut self) {
        let Some(seq) = self.sequences.current_safe_checkpoint().map(str::to_string) else {
            return;
        };
        self.checkpoints.set(&self.config.replication_id, &seq).await;
        self.shared.checkpoint.send_replace(Some(seq.clone()));
        metrics::record_checkpoint_advanced();
        trace!(remote_seq = %seq, "Checkpoint advanced");
        self.shared.emit(PullEvent::CheckpointAdvanced { remote_seq: seq });
    }

    async fn persist_checkpoint(&mut self, force: bool) -> Result<()> {
        if !force && self.last_persist.elapsed() < self.persist_interval {
            return Ok(());
        }
        self.last_persist = Instant::now();
        if self.checkpoints.has_dirty().await {
            self.checkpoints.flush_dirty().await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick, commands, lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    async fn on_tick(&mut self) -> Result<()> {
        if self.shared.state() == PullerState::Running {
            self.reconnect_if_due().await?;
            for kind in self.queues.ready() {
                self.flush_queue(kind).await?;
            }
        }
        if self.inserter.should_flush() {
            self.flush_inserts().await?;
        }
        self.persist_checkpoint(false).await?;
        metrics::set_pending_sequences(self.sequences.pending_count());
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let state = self.shared.state();
        if state != PullerState::Running {
            return Err(PullError::InvalidState {
                expected: "Running".into(),
                actual: state.to_string(),
            });
        }

        self.stop_feed().await;
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        let requeued = self.scheduler.waiting();
        for job in self.scheduler.drain_waiting() {
            match job {
                FetchJob::Single { rev, .. } => self.queues.push(QueueKind::Plain, rev),
                FetchJob::Bulk { revs } => {
                    for rev in revs {
                        self.queues.push(QueueKind::BulkDiff, rev);
                    }
                }
            }
        }

        self.shared.publish_state(PullerState::Suspended);
        info!(
            in_flight = self.scheduler.outstanding(),
            requeued,
            queued = self.queues.total_len(),
            "Pull replication paused"
        );
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        let state = self.shared.state();
        if state != PullerState::Suspended {
            return Err(PullError::InvalidState {
                expected: "Suspended".into(),
                actual: state.to_string(),
            });
        }

        self.shared.publish_state(PullerState::Running);
        if !self.feed_ended {
            if let Err(e) = self.start_feed().await {
                warn!(error = %e, "Change feed did not restart");
                self.schedule_reconnect(e.to_string())?;
            }
        }
        info!(since = ?self.resume_seq, "Pull replication resumed");
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.queues.is_empty()
            && self.scheduler.is_idle()
            && self.inserter.is_empty()
            && self.sequences.is_empty()
    }

    /// Stop the feed, cancel retries, wait out in-flight fetches, write the
    /// last batch and persist the checkpoint.
    async fn shutdown(&mut self) -> Result<()> {
        self.shared.publish_state(PullerState::Stopping);
        info!(
            in_flight = self.scheduler.outstanding(),
            max_connections = self.scheduler.max_connections(),
            waiting = self.scheduler.waiting(),
            queued = self.queues.total_len(),
            "Stopping pull replication"
        );
        self.stop_feed().await;
        self.cancel.send_replace(true);

        let mut abandoned: usize = self
            .scheduler
            .drain_waiting()
            .into_iter()
            .map(|job| job.into_revisions().len())
            .sum();

        // Deletion stubs need no network, so they still make it in.
        let deleted = self.queues.take(QueueKind::Deleted);
        if !deleted.is_empty() {
            if let Some(missing) = self.filter_missing(QueueKind::Deleted, deleted).await? {
                for mut rev in missing {
                    rev.make_deletion_stub();
                    self.inserter.add(rev);
                }
            }
        }

        while self.scheduler.outstanding() > 0 {
            let Some(completion) = self.completions.recv().await else {
                break;
            };
            self.handle_completion(completion).await?;
        }
        abandoned += self.queues.total_len();

        if !self.inserter.is_empty() {
            self.flush_inserts().await?;
            if !self.inserter.is_empty() {
                warn!(count = self.inserter.len(), "Final insert batch not written, checkpoint stays behind it");
            }
        }
        if abandoned > 0 {
            info!(abandoned, "Unfetched revisions left for the next run");
        }

        self.persist_checkpoint(true).await?;
        self.checkpoints.close().await;
        Ok(())
    }

    async fn fail(&mut self, error: PullError) {
        error!(kind = error.kind(), error = %error, "Pull replication failed");
        self.cancel.send_replace(true);
        self.stop_feed().await;

        if !matches!(
            error,
            PullError::CheckpointCorruption { .. } | PullError::CheckpointStore(_)
        ) {
            if let Err(e) = self.persist_checkpoint(true).await {
                warn!(error = %e, "Could not persist checkpoint after failure");
            }
        }
        self.checkpoints.close().await;
        self.shared.report_failure(&error);
    }
}
