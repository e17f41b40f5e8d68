// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed source.
//!
//! A [`ChangeTracker`] delivers [`TrackerEvent`]s in arrival order into a
//! channel owned by the pull engine. Parsing the remote's `_changes` wire
//! format lives behind this trait; the engine only cares about ordering and
//! the start/stop control surface.
//!
//! [`MemoryChangeTracker`] replays a scripted feed and can inject
//! disconnects, which is what the engine's own tests run against.

use crate::revision::Change;
use crate::store::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Something the change feed reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// A document changed on the remote.
    Change(Change),
    /// Every change up to the remote's current head has been delivered.
    CaughtUp,
    /// The feed connection dropped. The tracker is stopped.
    Disconnected(String),
    /// A one-shot feed has delivered everything. The tracker is stopped.
    Ended,
}

/// Control surface of a change feed.
pub trait ChangeTracker: Send + Sync + 'static {
    /// Start delivering changes after `since` (from the beginning if `None`).
    ///
    /// Returns once the feed is running. Any previous session is stopped.
    fn start(&self, since: Option<String>, sink: mpsc::Sender<TrackerEvent>) -> BoxFuture<'_, ()>;

    /// Stop delivering changes. Idempotent.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

struct Script {
    feed: Vec<Change>,
    /// Feed positions at which a disconnect fires (once each).
    disconnects: HashSet<usize>,
    starts: Vec<Option<String>>,
}

/// Scripted in-memory change feed.
///
/// Continuous trackers send `CaughtUp` when they reach the end of the feed
/// and then wait for [`push`](Self::push). One-shot trackers send `CaughtUp`
/// followed by `Ended`.
pub struct MemoryChangeTracker {
    script: Arc<Mutex<Script>>,
    appended: Arc<Notify>,
    continuous: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryChangeTracker {
    pub fn new(feed: Vec<Change>, continuous: bool) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                feed,
                disconnects: HashSet::new(),
                starts: Vec::new(),
            })),
            appended: Arc::new(Notify::new()),
            continuous,
            task: Mutex::new(None),
        }
    }

    /// A feed that ends after the scripted changes.
    pub fn one_shot(feed: Vec<Change>) -> Self {
        Self::new(feed, false)
    }

    /// A feed that stays open for more changes.
    pub fn continuous(feed: Vec<Change>) -> Self {
        Self::new(feed, true)
    }

    /// Append a change to the feed.
    pub async fn push(&self, change: Change) {
        self.script.lock().await.feed.push(change);
        self.appended.notify_one();
    }

    /// Drop the connection once, just before delivering feed entry `position`.
    pub async fn disconnect_before(&self, position: usize) {
        self.script.lock().await.disconnects.insert(position);
    }

    /// `since` values passed to every `start` call so far.
    pub async fn start_history(&self) -> Vec<Option<String>> {
        self.script.lock().await.starts.clone()
    }

    async fn abort_session(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_feed(
    script: Arc<Mutex<Script>>,
    appended: Arc<Notify>,
    continuous: bool,
    mut position: usize,
    sink: mpsc::Sender<TrackerEvent>,
) {
    let mut caught_up = false;
    loop {
        let next = {
            let mut script = script.lock().await;
            if script.disconnects.remove(&position) {
                Err(())
            } else {
                Ok(script.feed.get(position).cloned())
            }
        };

        match next {
            Err(()) => {
                debug!(position, "Change feed disconnected");
                let _ = sink
                    .send(TrackerEvent::Disconnected(format!("connection lost at entry {}", position)))
                    .await;
                return;
            }
            Ok(Some(change)) => {
                trace!(doc_id = %change.doc_id, remote_seq = %change.remote_seq, "Delivering change");
                if sink.send(TrackerEvent::Change(change)).await.is_err() {
                    return;
                }
                position += 1;
                caught_up = false;
            }
            Ok(None) => {
                if !caught_up {
                    if sink.send(TrackerEvent::CaughtUp).await.is_err() {
                        return;
                    }
                    caught_up = true;
                }
                if !continuous {
                    let _ = sink.send(TrackerEvent::Ended).await;
                    return;
                }
                appended.notified().await;
            }
        }
    }
}

impl ChangeTracker for MemoryChangeTracker {
    fn start(&self, since: Option<String>, sink: mpsc::Sender<TrackerEvent>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.abort_session().await;

            let position = {
                let mut script = self.script.lock().await;
                script.starts.push(since.clone());
                match &since {
                    None => 0,
                    Some(seq) => script
                        .feed
                        .iter()
                        .position(|c| &c.remote_seq == seq)
                        .map(|i| i + 1)
                        .unwrap_or(0),
                }
            };
            debug!(?since, position, continuous = self.continuous, "Starting change feed");

            let handle = tokio::spawn(run_feed(
                Arc::clone(&self.script),
                Arc::clone(&self.appended),
                self.continuous,
                position,
                sink,
            ));
            *self.task.lock().await = Some(handle);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.abort_session().await;
            Ok(())
        })
    }
}
