//! Transport-facing shapes of the sync protocol.
//!
//! # Responsibility
//! - Define the JSON shapes exchanged by pull/push/snapshot/status.
//! - Validate an untrusted [`SyncChange`] into a typed [`IncomingChange`],
//!   or a per-item [`RejectReason`]. The claimed owner is left to the
//!   apply step, which knows the authenticated caller.
//!
//! # Invariants
//! - Forwarded `ReceivedViaSync` records travel with their effective
//!   operation and original change id.
//! - Validation never fails a batch; each item is judged on its own.

use crate::model::change::{ChangeId, ChangeOperation, ChangeRecord};
use crate::model::entity::{EntityId, EntityKind};
use crate::model::fragment::Fragment;
use crate::sync::codec::{decode, EntityPatch};
use crate::sync::conflict::ConflictReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Wire form of one change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    #[serde(default)]
    pub change_id: Option<String>,
    #[serde(default)]
    pub entity_kind: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub fragment: Option<Value>,
    /// Claimed owner. Authenticated receivers ignore it.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub authored_at: i64,
}

impl From<&ChangeRecord> for SyncChange {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            change_id: Some(record.change_id.to_string()),
            entity_kind: record.entity_kind.as_str().to_string(),
            entity_id: Some(record.entity_id.to_string()),
            operation: record.effective_operation().as_str().to_string(),
            fragment: record.fragment.as_ref().and_then(|fragment| {
                // Fragment is plain data; serialization cannot fail.
                serde_json::to_value(fragment).ok()
            }),
            owner_id: record.owner_id.as_ref().map(|owner| owner.as_str().to_string()),
            authored_at: record.authored_at,
        }
    }
}

/// Machine-readable reason for a per-item push rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingChangeId,
    InvalidChangeId,
    InvalidEntityKind,
    MissingEntityId,
    InvalidEntityId,
    InvalidOperation,
    MalformedFragment,
    InvalidOwner,
    TargetMissing,
    OwnershipViolation,
    StorageFailure,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingChangeId => "missing_change_id",
            Self::InvalidChangeId => "invalid_change_id",
            Self::InvalidEntityKind => "invalid_entity_kind",
            Self::MissingEntityId => "missing_entity_id",
            Self::InvalidEntityId => "invalid_entity_id",
            Self::InvalidOperation => "invalid_operation",
            Self::MalformedFragment => "malformed_fragment",
            Self::InvalidOwner => "invalid_owner",
            Self::TargetMissing => "target_missing",
            Self::OwnershipViolation => "ownership_violation",
            Self::StorageFailure => "storage_failure",
        }
    }

    /// Whether resending the same change later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TargetMissing | Self::StorageFailure)
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One rejected item of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    /// Change id as sent, `None` when the item had none.
    pub id: Option<String>,
    pub reason: RejectReason,
    pub message: String,
}

impl RejectedChange {
    pub fn new(id: Option<String>, reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            id,
            reason,
            message: message.into(),
        }
    }
}

/// Validated incoming change.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingChange {
    pub change_id: ChangeId,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    /// Always `Create`, `Update` or `Delete`.
    pub operation: ChangeOperation,
    /// Raw fragment, kept for the change log and forwarding.
    pub fragment: Option<Fragment>,
    /// Decoded fragment; `None` exactly for deletes.
    pub patch: Option<EntityPatch>,
    /// Owner as claimed by the sender, unvalidated. Resolved against the
    /// authenticated caller when applied.
    pub claimed_owner: Option<String>,
    pub authored_at: i64,
}

impl SyncChange {
    /// Validates shape and content. Ownership is checked later, against
    /// the stored entity.
    pub fn validate(&self) -> Result<IncomingChange, RejectedChange> {
        let id = self.change_id.clone();
        let reject = |reason: RejectReason, message: String| {
            RejectedChange::new(id.clone(), reason, message)
        };

        let change_id = match self.change_id.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(reject(
                    RejectReason::MissingChangeId,
                    "change id is required".to_string(),
                ))
            }
            Some(raw) => Uuid::parse_str(raw).map_err(|_| {
                reject(
                    RejectReason::InvalidChangeId,
                    "change id must be a uuid".to_string(),
                )
            })?,
        };

        let entity_kind = EntityKind::parse(self.entity_kind.trim()).ok_or_else(|| {
            reject(
                RejectReason::InvalidEntityKind,
                "entity kind must be note or category".to_string(),
            )
        })?;

        let entity_id = match self.entity_id.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(reject(
                    RejectReason::MissingEntityId,
                    "entity id is required".to_string(),
                ))
            }
            Some(raw) => Uuid::parse_str(raw).map_err(|_| {
                reject(
                    RejectReason::InvalidEntityId,
                    "entity id must be a uuid".to_string(),
                )
            })?,
        };

        let operation = match ChangeOperation::parse(self.operation.trim()) {
            Some(
                operation @ (ChangeOperation::Create
                | ChangeOperation::Update
                | ChangeOperation::Delete),
            ) => operation,
            _ => {
                return Err(reject(
                    RejectReason::InvalidOperation,
                    "operation must be create, update or delete".to_string(),
                ))
            }
        };

        let fragment = match (&self.fragment, operation) {
            (None | Some(Value::Null), ChangeOperation::Delete) => None,
            (Some(_), ChangeOperation::Delete) => {
                return Err(reject(
                    RejectReason::MalformedFragment,
                    "delete must not carry a fragment".to_string(),
                ))
            }
            (None | Some(Value::Null), _) => {
                return Err(reject(
                    RejectReason::MalformedFragment,
                    format!("{} requires a fragment", operation.as_str()),
                ))
            }
            (Some(raw), _) => Some(
                serde_json::from_value::<Fragment>(raw.clone()).map_err(|err| {
                    reject(RejectReason::MalformedFragment, err.to_string())
                })?,
            ),
        };
        let patch = fragment
            .as_ref()
            .map(|fragment| decode(entity_kind, fragment))
            .transpose()
            .map_err(|err| reject(RejectReason::MalformedFragment, err.to_string()))?;

        Ok(IncomingChange {
            change_id,
            entity_kind,
            entity_id,
            operation,
            fragment,
            patch,
            claimed_owner: self.owner_id.clone(),
            authored_at: self.authored_at,
        })
    }
}

/// Response of `pull`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<SyncChange>,
    pub has_more: bool,
}

/// Response of `push`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Change ids applied or recognized as already applied.
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedChange>,
    /// Conflicts detected while applying; accepted items all the same.
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
    /// Durable writes succeeded but the read cache could not be refreshed.
    #[serde(default)]
    pub cache_degraded: bool,
}

/// Response of `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub note_count: u64,
    pub category_count: u64,
    /// Order-independent hex digest over active entity content.
    pub checksum: String,
}
