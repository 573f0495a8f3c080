//! Runtime configuration for sync sessions and logging.
//!
//! # Responsibility
//! - Hold protocol tunables (page sizes, batch sizes, conflict detection).
//! - Hold logging bootstrap settings consumed by [`crate::logging`].
//!
//! # Invariants
//! - Limits are normalized, never rejected: `0` or missing means default,
//!   values above the maximum are clamped.
//! - Loading configuration from files or environment is the embedder's job.

use std::path::PathBuf;

const PULL_DEFAULT_LIMIT: u32 = 100;
const PULL_MAX_LIMIT: u32 = 1_000;
const CYCLE_BATCH_SIZE: u32 = 100;

const LOG_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_MAX_FILES: usize = 5;

/// Tunables for one replica's sync sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Page size used when a pull does not specify a limit.
    pub pull_default_limit: u32,
    /// Upper bound for any pull or outbound page.
    pub pull_max_limit: u32,
    /// Page size used by [`crate::sync::client::SyncClient`] for both
    /// directions of a cycle.
    pub cycle_batch_size: u32,
    /// When disabled, concurrent edits merge without being recorded as
    /// conflicts.
    pub detect_conflicts: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_default_limit: PULL_DEFAULT_LIMIT,
            pull_max_limit: PULL_MAX_LIMIT,
            cycle_batch_size: CYCLE_BATCH_SIZE,
            detect_conflicts: true,
        }
    }
}

impl SyncConfig {
    /// Normalizes a requested page size according to this config.
    pub fn normalize_limit(&self, limit: Option<u32>) -> u32 {
        let max = self.pull_max_limit.max(1);
        let default = self.pull_default_limit.clamp(1, max);
        match limit {
            Some(0) | None => default,
            Some(value) if value > max => max,
            Some(value) => value,
        }
    }

    /// Batch size used by sync cycles, normalized like a pull limit.
    pub fn cycle_batch(&self) -> u32 {
        self.normalize_limit(Some(self.cycle_batch_size))
    }
}

/// Settings for the rolling file logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// One of `trace|debug|info|warn|error` (case-insensitive).
    pub level: String,
    /// Absolute directory for rolling log files.
    pub log_dir: PathBuf,
    pub max_file_size_bytes: u64,
    pub max_files: usize,
}

impl LoggingConfig {
    /// Creates a config with default rotation settings.
    pub fn new(level: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            level: level.into(),
            log_dir: log_dir.into(),
            max_file_size_bytes: LOG_MAX_FILE_SIZE_BYTES,
            max_files: LOG_MAX_FILES,
        }
    }
}
