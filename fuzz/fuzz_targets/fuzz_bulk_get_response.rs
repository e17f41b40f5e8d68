// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for bulk GET response matching.
//!
//! Every returned result must correspond to a request, with none repeated.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pull_replicator::RevisionRequest;
use pull_replicator::remote::parse_bulk_get_response;

fuzz_target!(|data: &[u8]| {
    let Ok(response) = serde_json::from_slice(data) else {
        return;
    };
    let requests = vec![
        RevisionRequest::new("a", "1-a"),
        RevisionRequest::new("b", "2-b"),
        RevisionRequest::new("a", "2-a"),
    ];
    if let Ok(results) = parse_bulk_get_response(&requests, response) {
        assert!(results.len() <= requests.len());
        for result in &results {
            assert!(requests
                .iter()
                .any(|r| r.doc_id == result.doc_id && r.rev_id == result.rev_id));
        }
    }
});
