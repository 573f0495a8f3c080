//! Peer delivery ledger and implicit peer registry.
//!
//! # Responsibility
//! - Record that a peer holds a change (`delivery_markers`), either because
//!   this peer sent it or because the peer sent it here.
//! - Track peers by first appearance (`sync_peers`).
//! - Hold this replica's own peer id (`sync_meta`).
//!
//! # Invariants
//! - Markers are insert-only; marking twice keeps the first timestamp.
//! - Peers need no registration step.

use crate::model::change::ChangeId;
use crate::model::identity::PeerId;
use crate::model::now_epoch_ms;
use crate::repo::entity_repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const LOCAL_PEER_KEY: &str = "local_peer_id";

/// How a delivery marker came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDirection {
    /// This peer delivered the change to the other peer.
    Sent,
    /// The other peer delivered the change here, so it held it already.
    Received,
}

impl DeliveryDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "received" => Some(Self::Received),
            _ => None,
        }
    }
}

/// Existing marker for one (change, peer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMarker {
    pub delivered_at: i64,
    pub direction: DeliveryDirection,
}

/// One row of the implicit peer registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

/// Records that `peer` now holds `change_ids` because this peer sent them.
/// Returns how many markers were new.
pub fn mark_delivered(
    conn: &Connection,
    peer: &PeerId,
    change_ids: &[ChangeId],
    delivered_at: i64,
) -> RepoResult<usize> {
    insert_markers(conn, peer, change_ids, delivered_at, DeliveryDirection::Sent)
}

/// Records that `peer` sent `change_id` here.
pub fn mark_received(
    conn: &Connection,
    peer: &PeerId,
    change_id: ChangeId,
    received_at: i64,
) -> RepoResult<usize> {
    insert_markers(
        conn,
        peer,
        &[change_id],
        received_at,
        DeliveryDirection::Received,
    )
}

fn insert_markers(
    conn: &Connection,
    peer: &PeerId,
    change_ids: &[ChangeId],
    at: i64,
    direction: DeliveryDirection,
) -> RepoResult<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO delivery_markers (change_id, peer_id, delivered_at, direction)
         VALUES (?1, ?2, ?3, ?4);",
    )?;
    let mut inserted = 0;
    for change_id in change_ids {
        inserted += stmt.execute(params![
            change_id.to_string(),
            peer.as_str(),
            at,
            direction.as_str()
        ])?;
    }
    Ok(inserted)
}

/// Marker for (`change_id`, `peer`), if any.
pub fn find_marker(
    conn: &Connection,
    change_id: ChangeId,
    peer: &PeerId,
) -> RepoResult<Option<DeliveryMarker>> {
    let row = conn
        .query_row(
            "SELECT delivered_at, direction FROM delivery_markers
             WHERE change_id = ?1 AND peer_id = ?2;",
            params![change_id.to_string(), peer.as_str()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    row.map(|(delivered_at, direction)| {
        let direction = DeliveryDirection::parse(&direction).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid marker direction `{direction}`"))
        })?;
        Ok(DeliveryMarker {
            delivered_at,
            direction,
        })
    })
    .transpose()
}

/// Upserts `peer` into the registry on every appearance.
pub fn register_peer(conn: &Connection, peer: &PeerId, seen_at: i64) -> RepoResult<()> {
    conn.execute(
        "INSERT INTO sync_peers (peer_id, first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?2)
         ON CONFLICT(peer_id) DO UPDATE SET
            last_seen_at = MAX(last_seen_at, excluded.last_seen_at);",
        params![peer.as_str(), seen_at],
    )?;
    Ok(())
}

pub fn list_peers(conn: &Connection) -> RepoResult<Vec<PeerRecord>> {
    let mut stmt = conn.prepare(
        "SELECT peer_id, first_seen_at, last_seen_at FROM sync_peers ORDER BY peer_id ASC;",
    )?;
    let mut rows = stmt.query([])?;
    let mut peers = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        peers.push(PeerRecord {
            peer_id: PeerId::parse(&raw)
                .map_err(|err| RepoError::InvalidData(format!("invalid peer_id: {err}")))?,
            first_seen_at: row.get(1)?,
            last_seen_at: row.get(2)?,
        });
    }
    Ok(peers)
}

/// Returns this replica's peer id, generating and persisting one on first use.
pub fn local_peer_id(conn: &Connection) -> RepoResult<PeerId> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_meta WHERE key = ?1;",
            [LOCAL_PEER_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let raw = match stored {
        Some(raw) => raw,
        None => {
            let generated = format!("peer-{}", Uuid::new_v4().simple());
            conn.execute(
                "INSERT OR IGNORE INTO sync_meta (key, value) VALUES (?1, ?2);",
                params![LOCAL_PEER_KEY, generated],
            )?;
            conn.query_row(
                "SELECT value FROM sync_meta WHERE key = ?1;",
                [LOCAL_PEER_KEY],
                |row| row.get(0),
            )?
        }
    };

    PeerId::parse(&raw)
        .map_err(|err| RepoError::InvalidData(format!("invalid local peer id: {err}")))
}

/// Touches the registry for `peer` at the current time.
pub(crate) fn touch_peer(conn: &Connection, peer: &PeerId) -> RepoResult<()> {
    register_peer(conn, peer, now_epoch_ms())
}
