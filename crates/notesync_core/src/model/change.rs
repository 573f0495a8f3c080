//! Immutable change records.
//!
//! # Responsibility
//! - Describe one mutation event as recorded in a peer's change log.
//!
//! # Invariants
//! - Exactly one record per local mutation event.
//! - A change applied from a remote peer is recorded as `ReceivedViaSync`
//!   under the *same* change id, with the effective operation kept in
//!   `relayed_operation`. The change id doubles as the idempotency key on
//!   every peer.
//! - `fragment` is `None` only for deletes.

use crate::model::entity::{EntityId, EntityKind};
use crate::model::fragment::{full_mask, Fragment};
use crate::model::identity::{PeerId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique change identifier.
pub type ChangeId = Uuid;

/// Mutation kind recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
    /// Terminal operation for changes that arrived from another peer.
    ReceivedViaSync,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ReceivedViaSync => "received_via_sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "received_via_sync" => Some(Self::ReceivedViaSync),
            _ => None,
        }
    }
}

/// One immutable change-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub operation: ChangeOperation,
    /// Effective operation of a `ReceivedViaSync` record.
    pub relayed_operation: Option<ChangeOperation>,
    pub fragment: Option<Fragment>,
    pub owner_id: Option<UserId>,
    /// Peer the change was received from, for `ReceivedViaSync` records.
    pub source_peer: Option<PeerId>,
    /// When the mutation was conceived, possibly on another peer's clock.
    pub authored_at: i64,
    /// When this peer appended the record, local clock.
    pub appended_at: i64,
    /// Local append order shared by both change logs.
    pub local_seq: i64,
}

impl ChangeRecord {
    /// Operation a receiving peer must perform for this record.
    pub fn effective_operation(&self) -> ChangeOperation {
        match self.operation {
            ChangeOperation::ReceivedViaSync => self
                .relayed_operation
                .unwrap_or(ChangeOperation::ReceivedViaSync),
            other => other,
        }
    }

    /// Whether this record was produced by a mutation on this peer.
    pub fn is_local_origin(&self) -> bool {
        self.operation != ChangeOperation::ReceivedViaSync
    }

    /// Field set touched by this record. Deletes touch every field.
    pub fn touched_mask(&self) -> u32 {
        match self.effective_operation() {
            ChangeOperation::Delete => full_mask(self.entity_kind),
            _ => self.fragment.as_ref().map_or(0, |fragment| fragment.mask),
        }
    }
}
