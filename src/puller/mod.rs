// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull engine: the handle a job controller drives.
//!
//! [`PullEngine`] owns the configuration and the three collaborators (change
//! tracker, remote peer, local store). `start()` loads the checkpoint,
//! starts the change feed and spawns the control loop; everything after
//! that is observed through the state watch, the event broadcast and the
//! progress counters.
//!
//! # Example
//!
//! ```rust,no_run
//! # use pull_replicator::{PullEngine, PullerConfig, HttpRemotePeer, MemoryChangeTracker, MemoryRevisionStore};
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # async fn example() -> pull_replicator::Result<()> {
//! let config = PullerConfig::for_testing("db<-peer");
//! let remote = HttpRemotePeer::new("http://peer:5984/db", Duration::from_secs(30))?;
//! let engine = PullEngine::new(
//!     config,
//!     Arc::new(MemoryChangeTracker::one_shot(vec![])),
//!     Arc::new(remote),
//!     Arc::new(MemoryRevisionStore::new()),
//! )?;
//!
//! engine.start().await?;
//! let final_state = engine.wait().await;
//! println!("finished {} at {:?}", final_state, engine.current_checkpoint());
//! # Ok(())
//! # }
//! ```

mod control;
pub mod types;

pub use types::{PullEvent, PullStats, PullerState};

use crate::circuit_breaker::StoreCircuit;
use crate::config::PullerConfig;
use crate::error::{PullError, Result};
use crate::remote::RemotePeer;
use crate::store::RevisionStore;
use crate::tracker::ChangeTracker;
use control::{Command, Puller, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, Instrument};
use types::StatsCounters;

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 16;

/// A single pull replication job.
pub struct PullEngine<T: ChangeTracker, R: RemotePeer, S: RevisionStore> {
    config: PullerConfig,
    tracker: Arc<T>,
    remote: Arc<R>,
    store: Arc<S>,
    circuit: Arc<StoreCircuit>,

    shared: Shared,
    state_rx: watch::Receiver<PullerState>,
    checkpoint_rx: watch::Receiver<Option<String>>,

    commands: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    outstanding: OnceLock<Arc<AtomicUsize>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ChangeTracker, R: RemotePeer, S: RevisionStore> PullEngine<T, R, S> {
    /// Create an idle engine. Fails only on invalid configuration.
    pub fn new(config: PullerConfig, tracker: Arc<T>, remote: Arc<R>, store: Arc<S>) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(PullerState::Idle);
        let (checkpoint_tx, checkpoint_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        Ok(Self {
            config,
            tracker,
            remote,
            store,
            circuit: Arc::new(StoreCircuit::new()),
            shared: Shared {
                state: Arc::new(state_tx),
                checkpoint: Arc::new(checkpoint_tx),
                events,
                stats: Arc::new(StatsCounters::default()),
            },
            state_rx,
            checkpoint_rx,
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            outstanding: OnceLock::new(),
            task: Mutex::new(None),
        })
    }

    /// Replace the store circuit breakers (tests use fast-recovering ones).
    #[must_use]
    pub fn with_circuit(mut self, circuit: StoreCircuit) -> Self {
        self.circuit = Arc::new(circuit);
        self
    }

    pub fn replication_id(&self) -> &str {
        &self.config.replication_id
    }

    /// Load the checkpoint, start the change feed and spawn the control loop.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the engine is `Idle`. Checkpoint, tracker and
    /// configuration failures leave the engine in `Error` (with one `Failed`
    /// event) and are returned as well.
    pub async fn start(&self) -> Result<()> {
        let state = self.state();
        if state != PullerState::Idle {
            return Err(PullError::InvalidState {
                expected: "Idle".into(),
                actual: state.to_string(),
            });
        }
        let Some(command_rx) = self.command_rx.lock().await.take() else {
            return Err(PullError::InvalidState {
                expected: "Idle".into(),
                actual: "Starting".into(),
            });
        };

        let span = tracing::info_span!("puller", replication_id = %self.config.replication_id);
        info!(
            parent: &span,
            continuous = self.config.continuous,
            max_connections = self.config.fetch.max_connections,
            bulk_get = self.config.fetch.bulk_get,
            "Starting pull replication"
        );
        self.shared.publish_state(PullerState::Starting);

        let opened = Puller::open(
            self.config.clone(),
            self.shared.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&self.remote),
            Arc::clone(&self.store),
            Arc::clone(&self.circuit),
            command_rx,
        )
        .instrument(span.clone())
        .await;

        let (puller, outstanding) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(parent: &span, error = %e, "Pull replication failed to start");
                self.shared.report_failure(&e);
                return Err(e);
            }
        };

        let _ = self.outstanding.set(outstanding);
        self.shared.publish_state(PullerState::Running);
        let handle = tokio::spawn(puller.run().instrument(span));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop taking changes. In-flight fetches finish; nothing new is fetched.
    pub async fn pause(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Pause(reply)).await?;
        response.await.map_err(|_| PullError::Shutdown)?
    }

    /// Restart the change feed from the last change received.
    pub async fn resume(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Resume(reply)).await?;
        response.await.map_err(|_| PullError::Shutdown)?
    }

    /// Stop the job and wait for it to wind down. Returns the final state.
    ///
    /// Retries are cancelled and queued revisions that were never fetched are
    /// left for the next run; the checkpoint never covers them.
    pub async fn stop(&self) -> PullerState {
        let state = self.state();
        if state.is_terminal() {
            return state;
        }
        if state == PullerState::Idle && self.command_rx.lock().await.take().is_some() {
            self.shared.publish_state(PullerState::Stopped);
            return PullerState::Stopped;
        }

        let _ = self.commands.send(Command::Stop).await;
        self.wait().await
    }

    /// Wait until the job reaches `Stopped` or `Error`.
    pub async fn wait(&self) -> PullerState {
        let mut state_rx = self.state_rx.clone();
        // Copy out before the `Ref` guard is dropped; it borrows `state_rx`.
        let waited = state_rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        let state = match waited {
            Ok(state) => state,
            Err(_) => *state_rx.borrow(),
        };
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        state
    }

    #[must_use]
    pub fn state(&self) -> PullerState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<PullerState> {
        self.state_rx.clone()
    }

    /// Highest remote sequence below which everything is durably stored.
    pub fn current_checkpoint(&self) -> Option<String> {
        self.checkpoint_rx.borrow().clone()
    }

    /// Subscribe to incident and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<PullEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> PullStats {
        self.shared.stats.snapshot()
    }

    /// Fetches currently holding a connection.
    pub fn outstanding_connections(&self) -> usize {
        self.outstanding
            .get()
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn send(&self, command: Command) -> Result<()> {
        let state = self.state();
        if matches!(state, PullerState::Idle) || state.is_terminal() {
            return Err(PullError::InvalidState {
                expected: "Running or Suspended".into(),
                actual: state.to_string(),
            });
        }
        self.commands.send(command).await.map_err(|_| PullError::Shutdown)
    }
}
