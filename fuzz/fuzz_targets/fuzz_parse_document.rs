// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for remote document parsing.
//!
//! Arbitrary JSON from a peer must be rejected, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pull_replicator::remote::parse_document;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice(data) else {
        return;
    };
    if let Ok(rev) = parse_document(body) {
        // History is never empty and never runs below generation 1.
        assert!(!rev.history.is_empty());
    }
});
