// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registration-ordered tracking of in-flight remote sequences.
//!
//! Remote sequence IDs are opaque: the only thing we know about them is the
//! order in which the change feed delivered them. So the map is an ordered
//! record of pending tokens, never a structure sorted by token value.
//!
//! ```text
//! track(a) track(b) track(c)      complete(c)     complete(a)     complete(b)
//! [a· b· c·]                      [a· b· c✓]      [b· c✓]         []
//! checkpoint: None                None            a               c
//! ```
//!
//! The safe checkpoint is the last sequence of the longest fully completed
//! prefix. Completed entries at the head are dropped as soon as they are
//! covered, so memory is bounded by the in-flight window.

use std::collections::VecDeque;
use tracing::warn;

/// Handle returned by [`SequenceMap::track`], one per registered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqToken(u64);

impl SeqToken {
    /// Wrap a raw registration index.
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Registration index (0 for the first tracked sequence).
    pub fn index(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Entry {
    remote_seq: String,
    completed: bool,
}

/// Tracks which registered sequences have completed.
#[derive(Debug, Default)]
pub struct SequenceMap {
    /// Registration index of `entries[0]`.
    head: u64,
    entries: VecDeque<Entry>,
    checkpoint: Option<String>,
}

impl SequenceMap {
    /// Create an empty map with no checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map that resumes from a previously persisted checkpoint.
    pub fn resuming_from(checkpoint: Option<String>) -> Self {
        Self {
            checkpoint,
            ..Self::default()
        }
    }

    /// Register a newly observed sequence as pending.
    pub fn track(&mut self, remote_seq: impl Into<String>) -> SeqToken {
        let token = SeqToken(self.head + self.entries.len() as u64);
        self.entries.push_back(Entry {
            remote_seq: remote_seq.into(),
            completed: false,
        });
        token
    }

    /// Mark a sequence as done.
    ///
    /// Returns `true` if the safe checkpoint advanced. Completing an unknown
    /// or already-completed token is a contract violation: it asserts in
    /// debug builds and is ignored in release.
    pub fn complete(&mut self, token: SeqToken) -> bool {
        let Some(offset) = token.0.checked_sub(self.head) else {
            debug_assert!(false, "sequence {:?} completed twice", token);
            warn!(token = token.0, "Ignoring completion of already covered sequence");
            return false;
        };
        let Some(entry) = self.entries.get_mut(offset as usize) else {
            debug_assert!(false, "sequence {:?} was never tracked", token);
            warn!(token = token.0, "Ignoring completion of untracked sequence");
            return false;
        };
        if entry.completed {
            debug_assert!(false, "sequence {:?} completed twice", token);
            warn!(token = token.0, "Ignoring duplicate completion");
            return false;
        }
        entry.completed = true;

        let mut advanced = false;
        while self.entries.front().is_some_and(|e| e.completed) {
            if let Some(done) = self.entries.pop_front() {
                self.checkpoint = Some(done.remote_seq);
                self.head += 1;
                advanced = true;
            }
        }
        advanced
    }

    /// Highest sequence such that it and everything registered before it
    /// have completed. Falls back to the resume checkpoint.
    pub fn current_safe_checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    /// Whether the given token has completed (covered or explicitly marked).
    pub fn is_completed(&self, token: SeqToken) -> bool {
        match token.0.checked_sub(self.head) {
            None => true,
            Some(offset) => self
                .entries
                .get(offset as usize)
                .map(|e| e.completed)
                .unwrap_or(false),
        }
    }

    /// Number of sequences not yet covered by the checkpoint.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of sequences still waiting for completion.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.completed).count()
    }

    /// True when every tracked sequence is covered by the checkpoint.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
