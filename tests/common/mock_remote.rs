// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock RemotePeer for testing.
//!
//! Serves revisions from an in-memory table and records every request.
//! Failures can be injected per revision (permanent status or N transient
//! failures), the bulk endpoint can be switched off, and a per-call delay
//! makes connection concurrency observable.

use pull_replicator::remote::classify_bulk_status;
use pull_replicator::{BoxFuture, BulkGetResult, PullError, RemotePeer, RemoteRevision, RevisionRequest};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Key = (String, String);

#[derive(Debug, Clone, Copy)]
enum Failure {
    /// Every request answers with this status.
    Always(u16),
    /// The next `remaining` requests answer with `status`.
    Times { status: u16, remaining: usize },
}

/// Mock implementation of RemotePeer that records all calls.
///
/// # Example
/// ```rust,ignore
/// let remote = MockRemote::new();
/// remote.add_linear("a", "2-x");           // history ["2-x", "1-x"]
/// remote.fail_times("a", "2-x", 503, 2);   // two 503s, then success
/// ```
#[derive(Default)]
pub struct MockRemote {
    revisions: Mutex<HashMap<Key, RemoteRevision>>,
    failures: Mutex<HashMap<Key, Failure>>,
    bulk_status: Mutex<Option<u16>>,
    known_ancestors: Mutex<HashMap<Key, Vec<String>>>,
    delay: Duration,
    get_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[allow(dead_code)] // Not every test binary uses every helper
impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each call holds its "connection" for `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Serve `rev_id` of `doc_id` with the given ancestry (newest first).
    pub fn add_revision(&self, doc_id: &str, rev_id: &str, history: &[&str], deleted: bool) {
        let revision = RemoteRevision {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted,
            history: history.iter().map(|s| s.to_string()).collect(),
            body: json!({ "_id": doc_id, "_rev": rev_id, "value": format!("{}@{}", doc_id, rev_id) }),
        };
        self.lock_revisions()
            .insert((doc_id.to_string(), rev_id.to_string()), revision);
    }

    /// Serve a revision whose ancestors share its suffix: `3-x` has
    /// history `["3-x", "2-x", "1-x"]`.
    pub fn add_linear(&self, doc_id: &str, rev_id: &str) {
        let (generation, suffix) = rev_id.split_once('-').unwrap_or(("1", rev_id));
        let generation: u64 = generation.parse().unwrap_or(1);
        let history: Vec<String> = (1..=generation)
            .rev()
            .map(|g| format!("{}-{}", g, suffix))
            .collect();
        let history: Vec<&str> = history.iter().map(String::as_str).collect();
        self.add_revision(doc_id, rev_id, &history, false);
    }

    /// Every request for this revision answers with `status`.
    pub fn fail_always(&self, doc_id: &str, rev_id: &str, status: u16) {
        self.lock_failures()
            .insert((doc_id.to_string(), rev_id.to_string()), Failure::Always(status));
    }

    /// The next `times` requests for this revision answer with `status`.
    pub fn fail_times(&self, doc_id: &str, rev_id: &str, status: u16, times: usize) {
        self.lock_failures().insert(
            (doc_id.to_string(), rev_id.to_string()),
            Failure::Times {
                status,
                remaining: times,
            },
        );
    }

    /// Make the bulk endpoint answer every call with `status`.
    pub fn set_bulk_status(&self, status: Option<u16>) {
        *self.bulk_status.lock().unwrap() = status;
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// `atts_since` sent with the last single GET of this revision.
    pub fn known_ancestors_sent(&self, doc_id: &str, rev_id: &str) -> Option<Vec<String>> {
        self.known_ancestors
            .lock()
            .unwrap()
            .get(&(doc_id.to_string(), rev_id.to_string()))
            .cloned()
    }

    fn lock_revisions(&self) -> std::sync::MutexGuard<'_, HashMap<Key, RemoteRevision>> {
        self.revisions.lock().unwrap()
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<Key, Failure>> {
        self.failures.lock().unwrap()
    }

    fn answer(&self, doc_id: &str, rev_id: &str) -> Result<RemoteRevision, PullError> {
        let key = (doc_id.to_string(), rev_id.to_string());
        {
            let mut failures = self.lock_failures();
            match failures.get_mut(&key) {
                Some(Failure::Always(status)) => {
                    return Err(PullError::from_status(*status, doc_id, rev_id));
                }
                Some(Failure::Times { status, remaining }) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(PullError::from_status(*status, doc_id, rev_id));
                }
                _ => {}
            }
        }
        self.lock_revisions()
            .get(&key)
            .cloned()
            .ok_or_else(|| PullError::from_status(404, doc_id, rev_id))
    }

    async fn hold_connection(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemotePeer for MockRemote {
    fn get_revision(&self, request: RevisionRequest) -> BoxFuture<'_, RemoteRevision> {
        Box::pin(async move {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.known_ancestors.lock().unwrap().insert(
                (request.doc_id.clone(), request.rev_id.clone()),
                request.known_ancestors.clone(),
            );
            self.hold_connection().await;
            self.answer(&request.doc_id, &request.rev_id)
        })
    }

    fn bulk_get(&self, requests: Vec<RevisionRequest>) -> BoxFuture<'_, Vec<BulkGetResult>> {
        Box::pin(async move {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            self.hold_connection().await;
            let status = *self.bulk_status.lock().unwrap();
            if let Some(status) = status {
                return Err(classify_bulk_status(status));
            }
            Ok(requests
                .into_iter()
                .map(|r| BulkGetResult {
                    result: self.answer(&r.doc_id, &r.rev_id),
                    doc_id: r.doc_id,
                    rev_id: r.rev_id,
                })
                .collect())
        })
    }
}
