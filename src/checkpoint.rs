// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for pull replications.
//!
//! Stores the last safe remote sequence for each replication in SQLite, so a
//! restarted job resumes the change feed where the previous run left off.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the entry dirty
//! - `flush_dirty()` persists all dirty entries in one pass
//! - The pull engine calls `flush_dirty()` on its persist interval and on stop
//!
//! A crash between `set()` and `flush_dirty()` loses at most one interval of
//! progress. The resumed job re-reads those changes; revisions that already
//! made it into the store are filtered out by `find_missing`.
//!
//! # Integrity
//!
//! Each row carries a CRC32 of `replication_id` and `remote_seq`. A row that
//! fails the check on load is reported as `CheckpointCorruption`; resuming
//! from a garbled sequence could skip changes silently, so the job refuses
//! to start instead.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (capped);
//! other errors propagate immediately.

use crate::config::CheckpointConfig;
use crate::error::{PullError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Checksum stored alongside each checkpoint row.
pub fn checkpoint_checksum(replication_id: &str, remote_seq: &str) -> i64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(replication_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(remote_seq.as_bytes());
    i64::from(hasher.finalize())
}

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(operation, attempts, delay_ms, "SQLite busy, retrying");
                crate::metrics::record_checkpoint_retry(operation);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, String>>,
    dirty: RwLock<HashSet<String>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint database described by `config`.
    pub async fn open(config: &CheckpointConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let in_memory = path == ":memory:";
        info!(path = %path, "Opening checkpoint store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| PullError::Config(format!("Invalid SQLite path {}: {}", path, e)))?
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);
        if config.wal_mode && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is its own database, so keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                replication_id TEXT PRIMARY KEY,
                remote_seq TEXT NOT NULL,
                checksum INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashSet::new()),
            path,
        })
    }

    /// Read the persisted checkpoint for a replication, verifying its checksum.
    ///
    /// Returns `None` for a replication that has never checkpointed.
    pub async fn load(&self, replication_id: &str) -> Result<Option<String>> {
        let pool = &self.pool;
        let row: Option<(String, i64)> = execute_with_retry("checkpoint_load", || async {
            sqlx::query_as("SELECT remote_seq, checksum FROM checkpoints WHERE replication_id = ?")
                .bind(replication_id)
                .fetch_optional(pool)
                .await
        })
        .await?;

        let Some((remote_seq, checksum)) = row else {
            debug!(replication_id, "No persisted checkpoint");
            return Ok(None);
        };

        let expected = checkpoint_checksum(replication_id, &remote_seq);
        if checksum != expected {
            return Err(PullError::CheckpointCorruption {
                replication_id: replication_id.to_string(),
                message: format!("checksum {} does not match {}", checksum, expected),
            });
        }

        info!(replication_id, remote_seq = %remote_seq, "Loaded checkpoint");
        self.cache
            .write()
            .await
            .insert(replication_id.to_string(), remote_seq.clone());
        Ok(Some(remote_seq))
    }

    /// Last checkpoint set or loaded in this process.
    pub async fn get(&self, replication_id: &str) -> Option<String> {
        self.cache.read().await.get(replication_id).cloned()
    }

    /// Record a new checkpoint (debounced; call `flush_dirty()` to persist).
    pub async fn set(&self, replication_id: &str, remote_seq: &str) {
        self.cache
            .write()
            .await
            .insert(replication_id.to_string(), remote_seq.to_string());
        self.dirty.write().await.insert(replication_id.to_string());
        debug!(replication_id, remote_seq, "Checkpoint updated (pending flush)");
    }

    /// Persist every dirty checkpoint. Returns how many were written.
    ///
    /// Entries that fail to write stay dirty for the next flush.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pending: Vec<(String, String)> = {
            let cache = self.cache.read().await;
            dirty
                .into_iter()
                .filter_map(|id| cache.get(&id).map(|seq| (id, seq.clone())))
                .collect()
        };

        let pool = &self.pool;
        let mut flushed = 0;
        let mut last_error = None;

        for (replication_id, remote_seq) in pending {
            let checksum = checkpoint_checksum(&replication_id, &remote_seq);
            let result = execute_with_retry("checkpoint_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (replication_id, remote_seq, checksum, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(replication_id) DO UPDATE SET
                        remote_seq = excluded.remote_seq,
                        checksum = excluded.checksum,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&replication_id)
                .bind(&remote_seq)
                .bind(checksum)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => {
                    flushed += 1;
                    crate::metrics::record_checkpoint_persist(true);
                }
                Err(e) => {
                    warn!(replication_id = %replication_id, error = %e, "Failed to persist checkpoint");
                    crate::metrics::record_checkpoint_persist(false);
                    self.dirty.write().await.insert(replication_id);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(PullError::CheckpointStore(e));
        }
        debug!(flushed, "Persisted checkpoints");
        Ok(flushed)
    }

    /// Whether any checkpoint is waiting to be persisted.
    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    /// Forget a replication's checkpoint (next run starts from scratch).
    pub async fn reset(&self, replication_id: &str) -> Result<()> {
        self.cache.write().await.remove(replication_id);
        self.dirty.write().await.remove(replication_id);

        let pool = &self.pool;
        execute_with_retry("checkpoint_reset", || async {
            sqlx::query("DELETE FROM checkpoints WHERE replication_id = ?")
                .bind(replication_id)
                .execute(pool)
                .await
        })
        .await?;

        info!(replication_id, "Checkpoint reset");
        Ok(())
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush pending checkpoints and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            if let Err(e) = self.flush_dirty().await {
                warn!(error = %e, "Failed to persist checkpoints on close");
            }
        }
        self.pool.close().await;
        debug!(path = %self.path, "Checkpoint store closed");
    }
}
