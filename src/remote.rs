// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote peer access: individual and bulk revision fetches.
//!
//! The pull pipeline treats every remote call as an opaque network operation
//! that either yields revisions or fails with a classified [`PullError`]. The
//! [`RemotePeer`] trait is the seam; [`HttpRemotePeer`] speaks the CouchDB
//! document API over `reqwest`.
//!
//! # Requests
//!
//! ```text
//! GET  {db}/{doc_id}?rev=R&revs=true&attachments=true&atts_since=[...]
//! POST {db}/_bulk_get?revs=true&attachments=true
//!      {"docs":[{"id":..,"rev":..,"atts_since":[..]}]}
//! ```
//!
//! # Status Classification
//!
//! | Status | Single GET | Bulk GET |
//! |--------|-----------|----------|
//! | 401/403 | `Auth` (fatal) | `Auth` (fatal) |
//! | 404/410 | `NotFound` (drop) | `Unsupported` (fall back to GETs) |
//! | 405/501 | `PermanentFetch` | `Unsupported` |
//! | 408/429/5xx | `Transient` (retry) | `Transient` (retry) |

use crate::error::{PullError, Result};
use crate::store::BoxFuture;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

/// A revision body as returned by the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRevision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Ancestry, newest first.
    pub history: Vec<String>,
    pub body: Value,
}

/// What to fetch, plus the ancestors we already hold for the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionRequest {
    #[serde(rename = "id")]
    pub doc_id: String,
    #[serde(rename = "rev")]
    pub rev_id: String,
    #[serde(rename = "atts_since", skip_serializing_if = "Vec::is_empty")]
    pub known_ancestors: Vec<String>,
}

impl RevisionRequest {
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            known_ancestors: Vec::new(),
        }
    }
}

/// Per-revision outcome of a bulk GET.
#[derive(Debug)]
pub struct BulkGetResult {
    pub doc_id: String,
    pub rev_id: String,
    pub result: Result<RemoteRevision>,
}

/// What the pull pipeline needs from the remote peer.
pub trait RemotePeer: Send + Sync + 'static {
    /// Fetch one revision with its ancestry.
    fn get_revision(&self, request: RevisionRequest) -> BoxFuture<'_, RemoteRevision>;

    /// Fetch many revisions in one request.
    ///
    /// The outer error covers the request as a whole; per-revision failures
    /// are reported inside the returned vector.
    fn bulk_get(&self, requests: Vec<RevisionRequest>) -> BoxFuture<'_, Vec<BulkGetResult>>;
}

/// Parse a CouchDB document (with `_revisions`) into a [`RemoteRevision`].
pub fn parse_document(body: Value) -> std::result::Result<RemoteRevision, String> {
    let doc_id = body
        .get("_id")
        .and_then(Value::as_str)
        .ok_or("document has no _id")?
        .to_string();
    let rev_id = body
        .get("_rev")
        .and_then(Value::as_str)
        .ok_or("document has no _rev")?
        .to_string();
    let deleted = body.get("_deleted").and_then(Value::as_bool).unwrap_or(false);

    let history = match body.get("_revisions") {
        Some(revisions) => {
            let start = revisions
                .get("start")
                .and_then(Value::as_u64)
                .ok_or("_revisions has no start")?;
            let ids = revisions
                .get("ids")
                .and_then(Value::as_array)
                .ok_or("_revisions has no ids")?;
            let mut history = Vec::with_capacity(ids.len());
            for (i, id) in ids.iter().enumerate() {
                let suffix = id.as_str().ok_or("_revisions id is not a string")?;
                let generation = start
                    .checked_sub(i as u64)
                    .filter(|g| *g > 0)
                    .ok_or("_revisions runs past generation 1")?;
                history.push(format!("{}-{}", generation, suffix));
            }
            history
        }
        None => vec![rev_id.clone()],
    };

    Ok(RemoteRevision {
        doc_id,
        rev_id,
        deleted,
        history,
        body,
    })
}

#[derive(Debug, Deserialize)]
struct BulkGetResponse {
    results: Vec<BulkGetEntry>,
}

#[derive(Debug, Deserialize)]
struct BulkGetEntry {
    id: String,
    docs: Vec<BulkGetDoc>,
}

#[derive(Debug, Deserialize)]
struct BulkGetDoc {
    ok: Option<Value>,
    error: Option<BulkGetError>,
}

#[derive(Debug, Deserialize)]
struct BulkGetError {
    #[serde(default)]
    rev: Option<String>,
    error: String,
    #[serde(default)]
    reason: String,
}

/// Match a bulk GET response back to the requests that produced it.
///
/// Requests the remote did not answer are omitted from the result.
pub fn parse_bulk_get_response(
    requests: &[RevisionRequest],
    response: Value,
) -> Result<Vec<BulkGetResult>> {
    let parsed: BulkGetResponse = serde_json::from_value(response)
        .map_err(|e| PullError::transient("POST _bulk_get", format!("malformed response: {}", e)))?;

    let mut answered: Vec<BulkGetResult> = Vec::with_capacity(requests.len());
    for entry in parsed.results {
        for doc in entry.docs {
            if let Some(body) = doc.ok {
                match parse_document(body) {
                    Ok(rev) => answered.push(BulkGetResult {
                        doc_id: rev.doc_id.clone(),
                        rev_id: rev.rev_id.clone(),
                        result: Ok(rev),
                    }),
                    Err(reason) => trace!(doc_id = %entry.id, %reason, "Unparseable bulk GET document"),
                }
            } else if let Some(err) = doc.error {
                let Some(rev_id) = err.rev else { continue };
                let result = if err.error == "not_found" {
                    Err(PullError::NotFound {
                        doc_id: entry.id.clone(),
                        rev_id: rev_id.clone(),
                    })
                } else {
                    Err(PullError::PermanentFetch {
                        doc_id: entry.id.clone(),
                        rev_id: rev_id.clone(),
                        message: format!("{}: {}", err.error, err.reason),
                    })
                };
                answered.push(BulkGetResult {
                    doc_id: entry.id.clone(),
                    rev_id,
                    result,
                });
            }
        }
    }

    // Keep request order; anything the remote skipped is left out so the
    // scheduler retries it with an individual GET.
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        if let Some(i) = answered
            .iter()
            .position(|a| a.doc_id == request.doc_id && a.rev_id == request.rev_id)
        {
            results.push(answered.swap_remove(i));
        }
    }
    Ok(results)
}

/// Classify the status of a failed bulk GET request.
pub fn classify_bulk_status(status: u16) -> PullError {
    match status {
        401 | 403 => PullError::Auth { status },
        404 | 405 | 410 | 501 => PullError::Unsupported {
            operation: "_bulk_get".to_string(),
        },
        _ => PullError::transient("POST _bulk_get", format!("HTTP {}", status)),
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> PullError {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else if e.is_decode() {
        "decode"
    } else {
        "request"
    };
    PullError::transient(operation, format!("{} error: {}", kind, e))
}

/// CouchDB-compatible remote reached over HTTP(S).
pub struct HttpRemotePeer {
    client: Client,
    db_url: Url,
}

impl HttpRemotePeer {
    /// Create a peer for the database at `db_url`.
    pub fn new(db_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PullError::Config(format!("HTTP client: {}", e)))?;
        Self::with_client(client, db_url)
    }

    /// Use an existing client (shared connection pool, custom TLS, auth headers).
    pub fn with_client(client: Client, db_url: &str) -> Result<Self> {
        let mut db_url = Url::parse(db_url)
            .map_err(|e| PullError::Config(format!("invalid database URL {}: {}", db_url, e)))?;
        if db_url.cannot_be_a_base() {
            return Err(PullError::Config(format!("database URL {} cannot be a base", db_url)));
        }
        if !db_url.path().ends_with('/') {
            let path = format!("{}/", db_url.path());
            db_url.set_path(&path);
        }
        Ok(Self { client, db_url })
    }

    /// Database URL (always ends with `/`).
    pub fn db_url(&self) -> &Url {
        &self.db_url
    }

    /// URL for fetching one revision.
    pub fn document_url(&self, request: &RevisionRequest) -> Result<Url> {
        let mut url = self.db_url.clone();
        url.path_segments_mut()
            .map_err(|_| PullError::Internal("database URL cannot be a base".into()))?
            .pop_if_empty()
            .push(&request.doc_id);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("rev", &request.rev_id)
                .append_pair("revs", "true")
                .append_pair("attachments", "true");
            if !request.known_ancestors.is_empty() {
                let since = serde_json::to_string(&request.known_ancestors)
                    .map_err(|e| PullError::Internal(e.to_string()))?;
                query.append_pair("atts_since", &since);
            }
        }
        Ok(url)
    }

    /// URL for bulk fetches.
    pub fn bulk_get_url(&self) -> Result<Url> {
        let mut url = self
            .db_url
            .join("_bulk_get")
            .map_err(|e| PullError::Internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("revs", "true")
            .append_pair("attachments", "true");
        Ok(url)
    }

    async fn fetch_one(&self, request: RevisionRequest) -> Result<RemoteRevision> {
        let url = self.document_url(&request)?;
        let operation = format!("GET {}", request.doc_id);
        trace!(doc_id = %request.doc_id, rev_id = %request.rev_id, "Fetching revision");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PullError::from_status(status.as_u16(), &request.doc_id, &request.rev_id));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error(&operation, e))?;
        parse_document(body).map_err(|reason| PullError::InvalidRevision {
            doc_id: request.doc_id.clone(),
            rev_id: request.rev_id.clone(),
            reason,
        })
    }

    async fn fetch_bulk(&self, requests: Vec<RevisionRequest>) -> Result<Vec<BulkGetResult>> {
        let url = self.bulk_get_url()?;
        debug!(count = requests.len(), "Bulk fetching revisions");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({ "docs": requests }))
            .send()
            .await
            .map_err(|e| transport_error("POST _bulk_get", e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(classify_bulk_status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error("POST _bulk_get", e))?;
        parse_bulk_get_response(&requests, body)
    }
}

impl RemotePeer for HttpRemotePeer {
    fn get_revision(&self, request: RevisionRequest) -> BoxFuture<'_, RemoteRevision> {
        Box::pin(self.fetch_one(request))
    }

    fn bulk_get(&self, requests: Vec<RevisionRequest>) -> BoxFuture<'_, Vec<BulkGetResult>> {
        Box::pin(self.fetch_bulk(requests))
    }
}
