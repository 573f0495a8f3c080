//! Conflict detection and the conflict ledger.
//!
//! # Responsibility
//! - Decide whether an incoming update/delete races an edit this peer
//!   already holds for the same entity.
//! - Persist detected conflicts with both competing snapshots.
//!
//! # Invariants
//! - A held edit `L` happened before an incoming change `R` from peer `X`
//!   when `X` sent `L` here (as its origin or relaying it), or when this peer
//!   delivered `L` to `X` no later than `R` was authored. Anything else is
//!   concurrent.
//! - Only concurrent edits with overlapping field sets conflict. A delete
//!   overlaps every field; two deletes never conflict.
//! - Detection only. Resolution is a new local mutation made by the caller.

use crate::model::change::{ChangeId, ChangeOperation, ChangeRecord};
use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::model::fragment::full_mask;
use crate::model::identity::{PeerId, UserId};
use crate::repo::entity_repo::{parse_owner, parse_uuid, RepoError, RepoResult};
use crate::sync::change_log::list_for_entity;
use crate::sync::delivery::{find_marker, DeliveryDirection};
use crate::sync::scope::OwnerScope;
use crate::sync::wire::IncomingChange;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Concurrent edits found for one incoming change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentEdits {
    /// Latest held edit that overlaps the incoming change.
    pub local_change_id: ChangeId,
    /// Union of overlapping fields across every concurrent edit.
    pub overlap_mask: u32,
}

/// One detected conflict as stored and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub conflict_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub owner_id: Option<UserId>,
    pub local_change_id: ChangeId,
    pub remote_change_id: ChangeId,
    pub remote_peer: PeerId,
    pub overlap_mask: u32,
    /// State of the entity on this peer before the incoming change.
    pub local_snapshot: Entity,
    /// State the incoming change proposed, had it been applied in full.
    pub remote_snapshot: Entity,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

/// Finds held edits concurrent with `incoming` that touch the same fields.
pub fn find_concurrent(
    conn: &Connection,
    remote_peer: &PeerId,
    incoming: &IncomingChange,
) -> RepoResult<Option<ConcurrentEdits>> {
    let incoming_mask = match incoming.operation {
        ChangeOperation::Delete => full_mask(incoming.entity_kind),
        _ => incoming.patch.as_ref().map_or(0, |patch| patch.mask()),
    };

    let mut found: Option<ConcurrentEdits> = None;
    for held in list_for_entity(conn, incoming.entity_kind, incoming.entity_id)? {
        if !is_competing_edit(&held, incoming) {
            continue;
        }
        if happened_before(conn, &held, remote_peer, incoming.authored_at)? {
            continue;
        }

        let overlap = held.touched_mask() & incoming_mask;
        if overlap == 0 {
            continue;
        }
        found = Some(ConcurrentEdits {
            local_change_id: held.change_id,
            overlap_mask: found.map_or(0, |edits| edits.overlap_mask) | overlap,
        });
    }
    Ok(found)
}

fn is_competing_edit(held: &ChangeRecord, incoming: &IncomingChange) -> bool {
    match (held.effective_operation(), incoming.operation) {
        (ChangeOperation::Delete, ChangeOperation::Delete) => false,
        (ChangeOperation::Update | ChangeOperation::Delete, _) => true,
        _ => false,
    }
}

fn happened_before(
    conn: &Connection,
    held: &ChangeRecord,
    remote_peer: &PeerId,
    remote_authored_at: i64,
) -> RepoResult<bool> {
    if held.source_peer.as_ref() == Some(remote_peer) {
        return Ok(true);
    }
    Ok(match find_marker(conn, held.change_id, remote_peer)? {
        // The peer streams in append order, so it held `held` before `R`.
        Some(marker) if marker.direction == DeliveryDirection::Received => true,
        Some(marker) => marker.delivered_at <= remote_authored_at,
        None => false,
    })
}

/// Persists one conflict.
pub fn record_conflict(conn: &Connection, report: &ConflictReport) -> RepoResult<()> {
    conn.execute(
        "INSERT INTO sync_conflicts (
            conflict_id,
            entity_kind,
            entity_uuid,
            owner_id,
            local_change_id,
            remote_change_id,
            remote_peer,
            overlap_mask,
            local_snapshot_json,
            remote_snapshot_json,
            detected_at,
            resolved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
        params![
            report.conflict_id.to_string(),
            report.entity_kind.as_str(),
            report.entity_id.to_string(),
            report.owner_id.as_ref().map(UserId::as_str),
            report.local_change_id.to_string(),
            report.remote_change_id.to_string(),
            report.remote_peer.as_str(),
            i64::from(report.overlap_mask),
            serde_json::to_string(&report.local_snapshot)?,
            serde_json::to_string(&report.remote_snapshot)?,
            report.detected_at,
            report.resolved_at,
        ],
    )?;
    Ok(())
}

/// Lists conflicts visible in `scope`, oldest first.
pub fn list_conflicts(
    conn: &Connection,
    scope: &OwnerScope,
    include_resolved: bool,
) -> RepoResult<Vec<ConflictReport>> {
    let mut sql = "SELECT
        conflict_id,
        entity_kind,
        entity_uuid,
        owner_id,
        local_change_id,
        remote_change_id,
        remote_peer,
        overlap_mask,
        local_snapshot_json,
        remote_snapshot_json,
        detected_at,
        resolved_at
    FROM sync_conflicts
    WHERE 1 = 1"
        .to_string();
    let mut bind_values: Vec<Value> = Vec::new();
    if !include_resolved {
        sql.push_str(" AND resolved_at IS NULL");
    }
    scope.push_sql_filter("owner_id", &mut sql, &mut bind_values);
    sql.push_str(" ORDER BY detected_at ASC, conflict_id ASC;");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut conflicts = Vec::new();
    while let Some(row) = rows.next()? {
        conflicts.push(parse_conflict_row(row)?);
    }
    Ok(conflicts)
}

/// Marks a conflict resolved. Returns `false` when it is unknown, out of
/// scope, or already resolved.
pub fn resolve_conflict(
    conn: &Connection,
    scope: &OwnerScope,
    conflict_id: Uuid,
    resolved_at: i64,
) -> RepoResult<bool> {
    let mut sql =
        "UPDATE sync_conflicts SET resolved_at = ? WHERE conflict_id = ? AND resolved_at IS NULL"
            .to_string();
    let mut bind_values = vec![
        Value::Integer(resolved_at),
        Value::Text(conflict_id.to_string()),
    ];
    scope.push_sql_filter("owner_id", &mut sql, &mut bind_values);

    let changed = conn.execute(&sql, params_from_iter(bind_values))?;
    Ok(changed > 0)
}

fn parse_conflict_row(row: &Row<'_>) -> RepoResult<ConflictReport> {
    let kind_text: String = row.get("entity_kind")?;
    let entity_kind = EntityKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid entity_kind `{kind_text}` in sync_conflicts"))
    })?;
    let remote_peer_text: String = row.get("remote_peer")?;
    let overlap_mask: i64 = row.get("overlap_mask")?;
    let local_snapshot: String = row.get("local_snapshot_json")?;
    let remote_snapshot: String = row.get("remote_snapshot_json")?;

    Ok(ConflictReport {
        conflict_id: parse_uuid(&row.get::<_, String>("conflict_id")?, "conflict_id")?,
        entity_kind,
        entity_id: parse_uuid(&row.get::<_, String>("entity_uuid")?, "entity_uuid")?,
        owner_id: parse_owner(row.get("owner_id")?)?,
        local_change_id: parse_uuid(&row.get::<_, String>("local_change_id")?, "local_change_id")?,
        remote_change_id: parse_uuid(
            &row.get::<_, String>("remote_change_id")?,
            "remote_change_id",
        )?,
        remote_peer: PeerId::parse(&remote_peer_text)
            .map_err(|err| RepoError::InvalidData(format!("invalid remote_peer: {err}")))?,
        overlap_mask: u32::try_from(overlap_mask)
            .map_err(|_| RepoError::InvalidData(format!("invalid overlap_mask `{overlap_mask}`")))?,
        local_snapshot: serde_json::from_str(&local_snapshot)?,
        remote_snapshot: serde_json::from_str(&remote_snapshot)?,
        detected_at: row.get("detected_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}
