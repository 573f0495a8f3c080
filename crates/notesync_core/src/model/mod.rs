//! Replicated domain model.
//!
//! # Responsibility
//! - Define the entities every peer holds a copy of (notes, categories).
//! - Define the immutable change record exchanged between peers.
//! - Define boundary-validated identities (peer, user).
//!
//! # Invariants
//! - Every entity is identified by a stable `EntityId` shared by all peers.
//! - Deletion is represented by tombstone timestamps, not hard delete.
//! - Change records are never mutated after they are written.

pub mod change;
pub mod entity;
pub mod fragment;
pub mod identity;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix epoch milliseconds.
///
/// Peers do not share a clock; values are only compared against other values
/// produced on the same peer, except for `authored_at` heuristics.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
