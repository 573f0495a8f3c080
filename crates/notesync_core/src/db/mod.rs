//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure the durable SQLite tier of one replica.
//! - Apply schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Sync code must not read/write replica data before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Suffix of the message raised by the change-log triggers.
const APPEND_ONLY_SUFFIX: &str = " is append-only";

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The replica was written by a newer binary; it is left untouched.
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// A migration step failed and its transaction was rolled back.
    Migration {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },
    /// A statement tried to rewrite or remove a change record.
    AppendOnlyViolation { table: String },
}

impl DbError {
    /// Stable machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite_error",
            Self::UnsupportedSchemaVersion { .. } => "replica_schema_too_new",
            Self::Migration { .. } => "migration_failed",
            Self::AppendOnlyViolation { .. } => "change_log_append_only",
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "replica schema version {db_version} is newer than supported {latest_supported}; refusing to open"
            ),
            Self::Migration {
                version,
                name,
                source,
            } => write!(f, "replica migration {version:04}_{name} failed: {source}"),
            Self::AppendOnlyViolation { table } => {
                write!(f, "change records in `{table}` cannot be rewritten or removed")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::UnsupportedSchemaVersion { .. } | Self::AppendOnlyViolation { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &value {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                if let Some(table) = message.strip_suffix(APPEND_ONLY_SUFFIX) {
                    return Self::AppendOnlyViolation {
                        table: table.to_string(),
                    };
                }
            }
        }
        Self::Sqlite(value)
    }
}
