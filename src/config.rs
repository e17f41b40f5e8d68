// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the pull replicator.
//!
//! Configuration is passed to [`PullEngine::new()`](crate::PullEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Durations are human-readable strings (`"500ms"`, `"30s"`, `"5m"`) parsed
//! with `humantime`; an unparseable value falls back to the default.
//!
//! # Quick Start
//!
//! ```rust
//! use pull_replicator::config::PullerConfig;
//!
//! let config = PullerConfig {
//!     replication_id: "db1<-https://peer.example.com/db1".into(),
//!     continuous: true,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! PullerConfig
//! ├── replication_id: String     # Checkpoint key for this job
//! ├── continuous: bool           # Keep following the feed after catching up
//! ├── fetch: FetchConfig         # Connection budget, timeouts, retries
//! ├── queues: QueueConfig        # Revision queue flush thresholds
//! ├── insert: InsertConfig       # Insert batch thresholds
//! ├── checkpoint: CheckpointConfig # SQLite checkpoint persistence
//! └── tracker: TrackerConfig     # Change feed reconnect + intake rate limit
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! replication_id: "contacts<-https://couch.example.com/contacts"
//! continuous: true
//! fetch:
//!   max_connections: 12
//!   request_timeout: "30s"
//!   bulk_get: true
//! insert:
//!   batch_size: 200
//!   batch_delay: "1s"
//! checkpoint:
//!   sqlite_path: "/var/lib/app/checkpoints.db"
//! ```

use crate::error::{PullError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `PullEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullerConfig {
    /// Identity of this replication job. Keys the persisted checkpoint.
    pub replication_id: String,

    /// Keep following the change feed after catching up.
    /// A one-shot job stops by itself once the feed ends and all work drains.
    #[serde(default = "default_false")]
    pub continuous: bool,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub insert: InsertConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            replication_id: "local.dev.pull.default".to_string(),
            continuous: false,
            fetch: FetchConfig::default(),
            queues: QueueConfig::default(),
            insert: InsertConfig::default(),
            checkpoint: CheckpointConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl PullerConfig {
    /// Create a config with fast timers and an in-memory checkpoint store.
    pub fn for_testing(replication_id: &str) -> Self {
        Self {
            replication_id: replication_id.to_string(),
            continuous: false,
            fetch: FetchConfig {
                max_connections: 4,
                request_timeout: "1s".to_string(),
                bulk_get: true,
                bulk_get_batch_size: 10,
                retry_max_attempts: 3,
                retry_initial_delay: "5ms".to_string(),
                retry_max_delay: "20ms".to_string(),
            },
            queues: QueueConfig {
                flush_threshold: 10,
                flush_delay: "10ms".to_string(),
            },
            insert: InsertConfig {
                batch_size: 10,
                batch_delay: "10ms".to_string(),
            },
            checkpoint: CheckpointConfig {
                persist_interval: "20ms".to_string(),
                ..CheckpointConfig::in_memory()
            },
            tracker: TrackerConfig {
                reconnect_initial_delay: "5ms".to_string(),
                reconnect_max_delay: "50ms".to_string(),
                max_reconnect_attempts: 5,
                ..TrackerConfig::default()
            },
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.replication_id.is_empty() {
            return Err(PullError::Config("replication_id must not be empty".into()));
        }
        if self.fetch.max_connections == 0 {
            return Err(PullError::Config("fetch.max_connections must be > 0".into()));
        }
        if self.fetch.retry_max_attempts == 0 {
            return Err(PullError::Config("fetch.retry_max_attempts must be > 0".into()));
        }
        if self.fetch.bulk_get_batch_size == 0 {
            return Err(PullError::Config("fetch.bulk_get_batch_size must be > 0".into()));
        }
        if self.queues.flush_threshold == 0 {
            return Err(PullError::Config("queues.flush_threshold must be > 0".into()));
        }
        if self.insert.batch_size == 0 {
            return Err(PullError::Config("insert.batch_size must be > 0".into()));
        }
        if self.tracker.channel_capacity == 0 {
            return Err(PullError::Config("tracker.channel_capacity must be > 0".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FetchConfig: connection budget and retry policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Network fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum fetches in flight at once (the connection budget).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Timeout for a single fetch attempt (not the whole retry loop).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Whether the remote is assumed to support bulk GET.
    /// Switched off at runtime if the endpoint turns out to be missing.
    #[serde(default = "default_true")]
    pub bulk_get: bool,

    /// Maximum revisions per bulk GET request.
    #[serde(default = "default_bulk_get_batch_size")]
    pub bulk_get_batch_size: usize,

    /// Attempts per fetch before a transient failure becomes permanent.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    /// First retry delay.
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Ceiling for the exponential backoff.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,
}

fn default_max_connections() -> usize {
    12
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_bulk_get_batch_size() -> usize {
    50
}

fn default_retry_max_attempts() -> usize {
    5
}

fn default_retry_initial_delay() -> String {
    "500ms".to_string()
}

fn default_retry_max_delay() -> String {
    "30s".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_connections: 12,
            request_timeout: "30s".to_string(),
            bulk_get: true,
            bulk_get_batch_size: 50,
            retry_max_attempts: 5,
            retry_initial_delay: "500ms".to_string(),
            retry_max_delay: "30s".to_string(),
        }
    }
}

impl FetchConfig {
    /// Parse the per-attempt timeout.
    pub fn request_timeout_duration(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(30))
    }

    /// Build the retry policy for fetches.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_delay: parse_or(&self.retry_initial_delay, Duration::from_millis(500)),
            max_delay: parse_or(&self.retry_max_delay, Duration::from_secs(30)),
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig / InsertConfig: flush thresholds
// ═══════════════════════════════════════════════════════════════════════════════

/// Revision queue flush settings (applies to each of the three queues).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Flush a queue once it holds this many revisions.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Flush a non-empty queue once its oldest entry is this old.
    #[serde(default = "default_flush_delay")]
    pub flush_delay: String,
}

fn default_flush_threshold() -> usize {
    100
}

fn default_flush_delay() -> String {
    "500ms".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 100,
            flush_delay: "500ms".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn flush_delay_duration(&self) -> Duration {
        parse_or(&self.flush_delay, Duration::from_millis(500))
    }
}

/// Insert batch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertConfig {
    /// Flush once this many validated revisions are waiting.
    #[serde(default = "default_insert_batch_size")]
    pub batch_size: usize,

    /// Flush once the oldest waiting revision is this old.
    #[serde(default = "default_insert_batch_delay")]
    pub batch_delay: String,
}

fn default_insert_batch_size() -> usize {
    200
}

fn default_insert_batch_delay() -> String {
    "1s".to_string()
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            batch_delay: "1s".to_string(),
        }
    }
}

impl InsertConfig {
    pub fn batch_delay_duration(&self) -> Duration {
        parse_or(&self.batch_delay, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database file (`":memory:"` for tests).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Use WAL journal mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Minimum time between checkpoint writes while running.
    #[serde(default = "default_persist_interval")]
    pub persist_interval: String,
}

fn default_sqlite_path() -> String {
    "pull_checkpoints.db".to_string()
}

fn default_persist_interval() -> String {
    "5s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "pull_checkpoints.db".to_string(),
            wal_mode: true,
            persist_interval: "5s".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// In-memory database, nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            persist_interval: "5s".to_string(),
        }
    }

    pub fn persist_interval_duration(&self) -> Duration {
        parse_or(&self.persist_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TrackerConfig: change feed reconnect and intake limits
// ═══════════════════════════════════════════════════════════════════════════════

/// Change tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// First reconnect delay after the feed drops.
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay: String,

    /// Ceiling for reconnect backoff.
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: String,

    /// Consecutive failed reconnects before the job fails.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: usize,

    /// Buffered changes between the tracker and the control loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Change intake throttling
    // ─────────────────────────────────────────────────────────────────────────

    /// Limit the rate at which changes are taken from the feed.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained changes per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_reconnect_initial_delay() -> String {
    "1s".to_string()
}

fn default_reconnect_max_delay() -> String {
    "5m".to_string()
}

fn default_max_reconnect_attempts() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_delay: "1s".to_string(),
            reconnect_max_delay: "5m".to_string(),
            max_reconnect_attempts: 100,
            channel_capacity: 1000,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl TrackerConfig {
    /// Backoff policy for reconnecting the change feed.
    pub fn reconnect_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_reconnect_attempts,
            initial_delay: parse_or(&self.reconnect_initial_delay, Duration::from_secs(1)),
            max_delay: parse_or(&self.reconnect_max_delay, Duration::from_secs(300)),
            multiplier: 2.0,
        }
    }

    /// Rate limit for change intake, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                per_second: self.rate_limit_per_sec,
                burst: self.rate_limit_burst,
            })
        } else {
            None
        }
    }
}
