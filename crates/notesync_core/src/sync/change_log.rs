//! Append-only change logs.
//!
//! # Responsibility
//! - Append one immutable record per mutation, inside the caller's
//!   transaction.
//! - Answer per-entity history and change-id lookups.
//!
//! # Invariants
//! - `local_seq` is allocated from both logs at once, so it is a single
//!   total order of appends on this peer.
//! - A change id exists at most once across both logs.
//! - Records are never updated or deleted (enforced by triggers).

use crate::model::change::{ChangeId, ChangeOperation, ChangeRecord};
use crate::model::entity::{EntityId, EntityKind};
use crate::model::fragment::Fragment;
use crate::model::identity::{PeerId, UserId};
use crate::model::now_epoch_ms;
use crate::repo::entity_repo::{parse_owner, parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) const CHANGE_COLUMNS: &str = "change_id,
    entity_uuid,
    operation,
    relayed_operation,
    fragment_mask,
    fragment_json,
    owner_id,
    source_peer,
    authored_at,
    appended_at,
    local_seq";

/// Input for [`append`]. Everything except the local bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub change_id: ChangeId,
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub operation: ChangeOperation,
    pub relayed_operation: Option<ChangeOperation>,
    pub fragment: Option<Fragment>,
    pub owner_id: Option<UserId>,
    pub source_peer: Option<PeerId>,
    pub authored_at: i64,
}

impl NewChange {
    /// Record of a mutation made on this peer, under a fresh change id.
    pub fn local(
        entity_kind: EntityKind,
        entity_id: EntityId,
        operation: ChangeOperation,
        fragment: Option<Fragment>,
        owner_id: Option<UserId>,
        authored_at: i64,
    ) -> Self {
        Self {
            change_id: uuid::Uuid::new_v4(),
            entity_id,
            entity_kind,
            operation,
            relayed_operation: None,
            fragment,
            owner_id,
            source_peer: None,
            authored_at,
        }
    }

    fn validate(&self) -> RepoResult<()> {
        let effective = match (self.operation, self.relayed_operation) {
            (ChangeOperation::ReceivedViaSync, Some(ChangeOperation::ReceivedViaSync))
            | (ChangeOperation::ReceivedViaSync, None) => {
                return Err(RepoError::InvalidData(
                    "received change requires a create/update/delete relayed operation"
                        .to_string(),
                ));
            }
            (ChangeOperation::ReceivedViaSync, Some(relayed)) => relayed,
            (_, Some(_)) => {
                return Err(RepoError::InvalidData(
                    "only received changes carry a relayed operation".to_string(),
                ));
            }
            (operation, None) => operation,
        };

        match (effective, self.fragment.as_ref()) {
            (ChangeOperation::Delete, Some(_)) => Err(RepoError::InvalidData(
                "delete changes carry no fragment".to_string(),
            )),
            (ChangeOperation::Delete, None) => Ok(()),
            (_, None) => Err(RepoError::InvalidData(format!(
                "{} change requires a fragment",
                effective.as_str()
            ))),
            (_, Some(fragment)) if fragment.is_empty() => Err(RepoError::InvalidData(
                "fragment mask cannot be zero".to_string(),
            )),
            (_, Some(_)) => Ok(()),
        }
    }
}

/// Appends one record. Call inside the transaction that mutates the entity.
pub fn append(conn: &Connection, change: NewChange) -> RepoResult<ChangeRecord> {
    change.validate()?;

    let local_seq = next_local_seq(conn)?;
    let appended_at = now_epoch_ms();
    let fragment_json = change
        .fragment
        .as_ref()
        .map(|fragment| serde_json::to_string(&fragment.fields))
        .transpose()?;

    conn.execute(
        &format!(
            "INSERT INTO {} ({CHANGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            table_name(change.entity_kind)
        ),
        params![
            change.change_id.to_string(),
            change.entity_id.to_string(),
            change.operation.as_str(),
            change.relayed_operation.map(ChangeOperation::as_str),
            change.fragment.as_ref().map(|fragment| i64::from(fragment.mask)),
            fragment_json,
            change.owner_id.as_ref().map(UserId::as_str),
            change.source_peer.as_ref().map(PeerId::as_str),
            change.authored_at,
            appended_at,
            local_seq,
        ],
    )?;

    Ok(ChangeRecord {
        change_id: change.change_id,
        entity_id: change.entity_id,
        entity_kind: change.entity_kind,
        operation: change.operation,
        relayed_operation: change.relayed_operation,
        fragment: change.fragment,
        owner_id: change.owner_id,
        source_peer: change.source_peer,
        authored_at: change.authored_at,
        appended_at,
        local_seq,
    })
}

/// Whether `change_id` is already recorded in either log.
pub fn change_exists(conn: &Connection, change_id: ChangeId) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM note_changes WHERE change_id = ?1)
             OR EXISTS(SELECT 1 FROM category_changes WHERE change_id = ?1);",
        [change_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Loads one record from either log.
pub fn get_change(conn: &Connection, change_id: ChangeId) -> RepoResult<Option<ChangeRecord>> {
    for kind in EntityKind::ALL {
        let record = conn
            .query_row(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM {} WHERE change_id = ?1;",
                    table_name(kind)
                ),
                [change_id.to_string()],
                |row| Ok(parse_change_row(kind, row)),
            )
            .optional()?
            .transpose()?;
        if record.is_some() {
            return Ok(record);
        }
    }
    Ok(None)
}

/// Every record for one entity, in append order.
pub fn list_for_entity(
    conn: &Connection,
    kind: EntityKind,
    entity_id: EntityId,
) -> RepoResult<Vec<ChangeRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM {} WHERE entity_uuid = ?1 ORDER BY local_seq ASC;",
        table_name(kind)
    ))?;
    let mut rows = stmt.query([entity_id.to_string()])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(parse_change_row(kind, row)?);
    }
    Ok(records)
}

pub(crate) fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note => "note_changes",
        EntityKind::Category => "category_changes",
    }
}

fn next_local_seq(conn: &Connection) -> RepoResult<i64> {
    let next = conn.query_row(
        "SELECT COALESCE(MAX(local_seq), 0) + 1 FROM (
            SELECT local_seq FROM note_changes
            UNION ALL
            SELECT local_seq FROM category_changes
         );",
        [],
        |row| row.get(0),
    )?;
    Ok(next)
}

pub(crate) fn parse_change_row(kind: EntityKind, row: &Row<'_>) -> RepoResult<ChangeRecord> {
    let change_text: String = row.get("change_id")?;
    let entity_text: String = row.get("entity_uuid")?;
    let operation = parse_operation(&row.get::<_, String>("operation")?)?;
    let relayed_operation = row
        .get::<_, Option<String>>("relayed_operation")?
        .map(|value| parse_operation(&value))
        .transpose()?;

    let mask: Option<i64> = row.get("fragment_mask")?;
    let json: Option<String> = row.get("fragment_json")?;
    let fragment = match (mask, json) {
        (Some(mask), Some(json)) => Some(Fragment {
            mask: u32::try_from(mask).map_err(|_| {
                RepoError::InvalidData(format!("invalid fragment_mask `{mask}`"))
            })?,
            fields: serde_json::from_str(&json)?,
        }),
        (None, None) => None,
        _ => {
            return Err(RepoError::InvalidData(
                "fragment_mask and fragment_json must be set together".to_string(),
            ))
        }
    };

    let source_peer = row
        .get::<_, Option<String>>("source_peer")?
        .map(|value| {
            PeerId::parse(&value)
                .map_err(|err| RepoError::InvalidData(format!("invalid source_peer: {err}")))
        })
        .transpose()?;

    Ok(ChangeRecord {
        change_id: parse_uuid(&change_text, "change_id")?,
        entity_id: parse_uuid(&entity_text, "entity_uuid")?,
        entity_kind: kind,
        operation,
        relayed_operation,
        fragment,
        owner_id: parse_owner(row.get("owner_id")?)?,
        source_peer,
        authored_at: row.get("authored_at")?,
        appended_at: row.get("appended_at")?,
        local_seq: row.get("local_seq")?,
    })
}

fn parse_operation(value: &str) -> RepoResult<ChangeOperation> {
    ChangeOperation::parse(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid change operation `{value}`")))
}
