// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for revision ID parsing.
//!
//! `parse_generation` must never panic, and anything it accepts must
//! round-trip through its own "N-suffix" form.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pull_replicator::revision::parse_generation;

fuzz_target!(|rev_id: &str| {
    if let Some(generation) = parse_generation(rev_id) {
        assert!(generation > 0);
        let (_, suffix) = rev_id.split_once('-').expect("accepted IDs contain a dash");
        assert!(!suffix.is_empty());
        assert_eq!(parse_generation(&format!("{}-{}", generation, suffix)), Some(generation));
    }
});
