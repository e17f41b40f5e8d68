// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed entries and revisions in flight.
//!
//! A [`Change`] is what the change tracker reports: one document, the remote
//! sequence it was seen at, and the leaf revisions the remote holds for it.
//! Each candidate revision that turns out to be missing locally becomes a
//! [`PulledRevision`], which the pipeline owns until it is inserted or dropped.
//!
//! # Revision IDs
//!
//! Revision IDs have the form `"<generation>-<suffix>"`, e.g. `"3-a1b2c3"`.
//! The generation is the depth of the revision in its document's tree, so a
//! parent always has a strictly smaller generation than its child.

use crate::error::{PullError, Result};
use crate::remote::RemoteRevision;
use crate::sequence_map::SeqToken;
use serde::{Deserialize, Serialize};

/// Parse the generation prefix of a revision ID.
///
/// Returns `None` for IDs that are not `"<u64>-<non-empty suffix>"`.
pub fn parse_generation(rev_id: &str) -> Option<u64> {
    let (generation, suffix) = rev_id.split_once('-')?;
    if suffix.is_empty() {
        return None;
    }
    generation.parse::<u64>().ok().filter(|g| *g > 0)
}

/// One entry of the remote change feed.
///
/// Immutable once emitted; routed into exactly one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Document ID.
    pub doc_id: String,
    /// Opaque remote sequence. Only its arrival order is meaningful.
    pub remote_seq: String,
    /// Leaf revisions reported by the remote for this document.
    pub revs: Vec<String>,
    /// Whether the winning revision is a deletion.
    #[serde(default)]
    pub deleted: bool,
}

impl Change {
    /// Build a change entry.
    pub fn new(
        doc_id: impl Into<String>,
        remote_seq: impl Into<String>,
        revs: Vec<String>,
        deleted: bool,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            remote_seq: remote_seq.into(),
            revs,
            deleted,
        }
    }
}

/// A revision discovered on the remote and owned by the pull pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledRevision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Remote sequence the revision was discovered at.
    pub remote_seq: String,
    /// Handle of the sequence entry this revision completes.
    pub seq_token: SeqToken,
    /// Ancestry, newest first. Starts with `rev_id` once fetched.
    pub history: Vec<String>,
    /// Document body; `None` until fetched (or stubbed).
    pub body: Option<serde_json::Value>,
    conflicted: Option<bool>,
}

impl PulledRevision {
    /// Create a revision that has not been fetched yet.
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        deleted: bool,
        remote_seq: impl Into<String>,
        seq_token: SeqToken,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted,
            remote_seq: remote_seq.into(),
            seq_token,
            history: Vec::new(),
            body: None,
            conflicted: None,
        }
    }

    /// Generation of this revision (0 if the ID is malformed).
    pub fn generation(&self) -> u64 {
        parse_generation(&self.rev_id).unwrap_or(0)
    }

    /// Parent revision ID, if the ancestry is known.
    pub fn parent(&self) -> Option<&str> {
        self.history.get(1).map(String::as_str)
    }

    /// Whether a body (or deletion stub) is attached.
    pub fn is_loaded(&self) -> bool {
        self.body.is_some()
    }

    /// Whether the revision will be recorded as a competing branch.
    pub fn conflicted(&self) -> bool {
        self.conflicted.unwrap_or(false)
    }

    /// Whether [`set_conflicted`](Self::set_conflicted) has been called.
    pub fn conflict_decided(&self) -> bool {
        self.conflicted.is_some()
    }

    /// Record the conflict status. Set-once: a second call is a contract
    /// violation (asserts in debug builds, ignored in release).
    pub fn set_conflicted(&mut self, conflicted: bool) {
        debug_assert!(
            self.conflicted.is_none(),
            "conflict status of {} {} set twice",
            self.doc_id,
            self.rev_id
        );
        if self.conflicted.is_none() {
            self.conflicted = Some(conflicted);
        }
    }

    /// Turn this revision into a deletion stub (no network fetch needed).
    pub fn make_deletion_stub(&mut self) {
        self.deleted = true;
        if self.history.is_empty() {
            self.history.push(self.rev_id.clone());
        }
        self.body = Some(serde_json::json!({ "_deleted": true }));
    }

    /// Attach a fetched body after checking it is the revision we asked for.
    pub fn apply_fetched(&mut self, fetched: RemoteRevision) -> Result<()> {
        let invalid = |reason: String| PullError::InvalidRevision {
            doc_id: self.doc_id.clone(),
            rev_id: self.rev_id.clone(),
            reason,
        };

        if fetched.doc_id != self.doc_id {
            return Err(invalid(format!("body names document {}", fetched.doc_id)));
        }
        if fetched.rev_id != self.rev_id {
            return Err(invalid(format!("body names revision {}", fetched.rev_id)));
        }
        let history = if fetched.history.is_empty() {
            vec![self.rev_id.clone()]
        } else {
            fetched.history
        };
        if history[0] != self.rev_id {
            return Err(invalid(format!("history starts at {}", history[0])));
        }
        let mut last = parse_generation(&history[0]).ok_or_else(|| invalid("malformed revision ID".into()))?;
        for ancestor in &history[1..] {
            let generation = parse_generation(ancestor)
                .ok_or_else(|| invalid(format!("malformed ancestor {}", ancestor)))?;
            if generation + 1 != last {
                return Err(invalid(format!("ancestor {} breaks generation chain", ancestor)));
            }
            last = generation;
        }

        self.deleted = fetched.deleted;
        self.history = history;
        self.body = Some(fetched.body);
        Ok(())
    }
}
