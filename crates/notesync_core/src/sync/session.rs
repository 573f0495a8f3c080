//! Sync session protocol.
//!
//! # Responsibility
//! - Serve pull/push/snapshot/status/changes-since for one replica on behalf
//!   of one authenticated caller (or none in single-owner mode).
//! - Keep every read inside the caller's ownership scope.
//!
//! # Invariants
//! - A pull writes delivery markers for exactly the records it returns, in
//!   the same transaction that selected them.
//! - Push items are independent: malformed, foreign or failing items are
//!   rejected one by one and never abort the batch.
//! - Peer ids need no registration; every pull/push upserts the registry.

use crate::config::SyncConfig;
use crate::model::change::{ChangeId, ChangeOperation, ChangeRecord};
use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::model::identity::{IdentityError, PeerId, UserId};
use crate::model::now_epoch_ms;
use crate::repo::entity_repo::{
    EntityListQuery, EntityRepository, RepoError, SqliteEntityRepository,
};
use crate::repo::store::EntityStore;
use crate::sync::apply::{ApplyEngine, ApplyOutcome};
use crate::sync::codec::encode_full;
use crate::sync::conflict::{self, ConflictReport};
use crate::sync::delivery::{self, PeerRecord};
use crate::sync::scope::OwnerScope;
use crate::sync::stream::{self, StreamCursor, StreamPage};
use crate::sync::transport::TransportError;
use crate::sync::wire::{PullResponse, PushResponse, SyncChange, SyncStatus};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type SyncResult<T> = Result<T, SyncError>;

/// Session-level failure. Per-item push problems are rejections, not errors.
#[derive(Debug)]
pub enum SyncError {
    Repo(RepoError),
    Identity(IdentityError),
    EntityNotFound { kind: EntityKind, id: EntityId },
    CycleInProgress(PeerId),
    Transport(TransportError),
}

impl SyncError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &str {
        match self {
            Self::Repo(_) => "storage_failure",
            Self::Identity(_) => "invalid_identity",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::CycleInProgress(_) => "cycle_in_progress",
            Self::Transport(err) => err.code.as_str(),
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Identity(err) => write!(f, "{err}"),
            Self::EntityNotFound { kind, id } => write!(f, "{} not found: {id}", kind.as_str()),
            Self::CycleInProgress(peer) => {
                write!(f, "a sync cycle with peer `{peer}` is already running")
            }
            Self::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Identity(err) => Some(err),
            Self::Transport(err) => Some(err),
            Self::EntityNotFound { .. } | Self::CycleInProgress(_) => None,
        }
    }
}

impl From<RepoError> for SyncError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<IdentityError> for SyncError {
    fn from(value: IdentityError) -> Self {
        Self::Identity(value)
    }
}

impl From<TransportError> for SyncError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// One replica's protocol endpoint for one caller.
pub struct SyncSession<'conn> {
    store: EntityStore<'conn>,
    caller: Option<UserId>,
    config: SyncConfig,
}

impl<'conn> SyncSession<'conn> {
    pub fn new(store: EntityStore<'conn>, caller: Option<UserId>, config: SyncConfig) -> Self {
        Self {
            store,
            caller,
            config,
        }
    }

    pub fn store(&self) -> &EntityStore<'conn> {
        &self.store
    }

    pub fn caller(&self) -> Option<&UserId> {
        self.caller.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Scope of every read made by this session.
    pub fn scope(&self) -> OwnerScope {
        OwnerScope::for_caller(self.caller.as_ref())
    }

    pub fn engine(&self) -> ApplyEngine<'_, 'conn> {
        ApplyEngine::new(&self.store, self.config.detect_conflicts)
    }

    /// This replica's own peer id.
    pub fn local_peer_id(&self) -> SyncResult<PeerId> {
        Ok(delivery::local_peer_id(self.store.connection())?)
    }

    /// Returns up to `limit` records `peer` has not seen and marks them
    /// delivered to it.
    pub fn pull(&self, peer: &PeerId, limit: Option<u32>) -> SyncResult<PullResponse> {
        let limit = self.config.normalize_limit(limit);
        let scope = self.scope();
        let page = self
            .store
            .write(|tx| {
                delivery::touch_peer(tx, peer)?;
                let page = stream::unseen_by_peer(tx, peer, &scope, limit)?;
                let ids = page
                    .records
                    .iter()
                    .map(|record| record.change_id)
                    .collect::<Vec<_>>();
                delivery::mark_delivered(tx, peer, &ids, now_epoch_ms())?;
                Ok((page, Vec::new()))
            })?
            .value;

        info!(
            "event=sync_pull module=sync status=ok peer={} count={} has_more={}",
            peer,
            page.records.len(),
            page.has_more
        );
        Ok(PullResponse {
            changes: page.records.iter().map(SyncChange::from).collect(),
            has_more: page.has_more,
        })
    }

    /// Applies `changes` sent by `peer`, each independently.
    pub fn push(&self, peer: &PeerId, changes: &[SyncChange]) -> SyncResult<PushResponse> {
        self.store
            .write(|tx| Ok((delivery::touch_peer(tx, peer)?, Vec::new())))?;

        let engine = self.engine();
        let mut response = PushResponse::default();
        for change in changes {
            let incoming = match change.validate() {
                Ok(incoming) => incoming,
                Err(rejected) => {
                    info!(
                        "event=sync_apply module=sync status=rejected reason={} peer={}",
                        rejected.reason.code(),
                        peer
                    );
                    response.rejected.push(rejected);
                    continue;
                }
            };

            match engine.apply_remote(peer, self.caller.as_ref(), &incoming) {
                ApplyOutcome::Applied {
                    conflict,
                    cache_degraded,
                    ..
                } => {
                    response.accepted.push(incoming.change_id.to_string());
                    response.conflicts.extend(conflict);
                    response.cache_degraded |= cache_degraded;
                }
                ApplyOutcome::Duplicate | ApplyOutcome::AlreadyPresent => {
                    response.accepted.push(incoming.change_id.to_string());
                }
                ApplyOutcome::Rejected(rejected) => response.rejected.push(rejected),
            }
        }

        info!(
            "event=sync_push module=sync status=ok peer={} received={} accepted={} rejected={} conflicts={} cache_degraded={}",
            peer,
            changes.len(),
            response.accepted.len(),
            response.rejected.len(),
            response.conflicts.len(),
            response.cache_degraded
        );
        Ok(response)
    }

    /// Full current state of one active entity as a `Create` record.
    ///
    /// The record is synthesized, not appended: it carries a fresh change id
    /// and `local_seq == 0`.
    pub fn snapshot(&self, kind: EntityKind, id: EntityId) -> SyncResult<ChangeRecord> {
        let entity = self
            .store
            .get(kind, id)?
            .filter(|entity| entity.is_active() && self.scope().permits(entity.owner_id()))
            .ok_or(SyncError::EntityNotFound { kind, id })?;

        Ok(ChangeRecord {
            change_id: Uuid::new_v4(),
            entity_id: id,
            entity_kind: kind,
            operation: ChangeOperation::Create,
            relayed_operation: None,
            fragment: Some(encode_full(&entity)),
            owner_id: entity.owner_id().cloned(),
            source_peer: None,
            authored_at: updated_at(&entity),
            appended_at: now_epoch_ms(),
            local_seq: 0,
        })
    }

    /// Active entity counts and content checksum.
    ///
    /// `owner` narrows the view in single-owner mode; an authenticated caller
    /// always sees only its own entities.
    pub fn status(&self, owner: Option<&UserId>) -> SyncResult<SyncStatus> {
        let scope = OwnerScope::resolve(self.caller.as_ref(), owner);
        let repo = SqliteEntityRepository::new(self.store.connection());

        let mut active = Vec::new();
        for kind in EntityKind::ALL {
            active.extend(repo.list_entities(&EntityListQuery::active(kind, scope.clone()))?);
        }

        Ok(SyncStatus {
            note_count: repo.count_active(EntityKind::Note, &scope)?,
            category_count: repo.count_active(EntityKind::Category, &scope)?,
            checksum: content_checksum(&active)?,
        })
    }

    /// Records appended strictly after `since_ms` (this peer's clock),
    /// oldest first. Continue with [`Self::changes_after`] and
    /// [`StreamPage::next_cursor`] while `has_more` is set.
    pub fn changes_since(
        &self,
        owner: Option<&UserId>,
        since_ms: i64,
        limit: Option<u32>,
    ) -> SyncResult<StreamPage> {
        self.changes_after(owner, StreamCursor::since(since_ms), limit)
    }

    /// Records appended after `cursor`, in `(appended_at, local_seq)` order.
    pub fn changes_after(
        &self,
        owner: Option<&UserId>,
        cursor: StreamCursor,
        limit: Option<u32>,
    ) -> SyncResult<StreamPage> {
        let scope = OwnerScope::resolve(self.caller.as_ref(), owner);
        let limit = self.config.normalize_limit(limit);
        Ok(stream::appended_since(
            self.store.connection(),
            &scope,
            cursor,
            limit,
        )?)
    }

    /// Local records `peer` has not seen, without marking them. Used by the
    /// pushing side, which marks only what the peer accepted.
    pub fn outbound(&self, peer: &PeerId, limit: Option<u32>) -> SyncResult<StreamPage> {
        let limit = self.config.normalize_limit(limit);
        Ok(stream::unseen_by_peer(
            self.store.connection(),
            peer,
            &self.scope(),
            limit,
        )?)
    }

    /// Marks `change_ids` as delivered to `peer`.
    pub fn mark_delivered(&self, peer: &PeerId, change_ids: &[ChangeId]) -> SyncResult<usize> {
        if change_ids.is_empty() {
            return Ok(0);
        }
        let inserted = self
            .store
            .write(|tx| {
                let inserted = delivery::mark_delivered(tx, peer, change_ids, now_epoch_ms())?;
                Ok((inserted, Vec::new()))
            })?
            .value;
        Ok(inserted)
    }

    pub fn list_peers(&self) -> SyncResult<Vec<PeerRecord>> {
        Ok(delivery::list_peers(self.store.connection())?)
    }

    pub fn list_conflicts(&self, include_resolved: bool) -> SyncResult<Vec<ConflictReport>> {
        Ok(conflict::list_conflicts(
            self.store.connection(),
            &self.scope(),
            include_resolved,
        )?)
    }

    /// Marks a conflict resolved. Returns `false` when it is unknown to this
    /// caller or already resolved.
    pub fn resolve_conflict(&self, conflict_id: Uuid) -> SyncResult<bool> {
        Ok(conflict::resolve_conflict(
            self.store.connection(),
            &self.scope(),
            conflict_id,
            now_epoch_ms(),
        )?)
    }
}

fn updated_at(entity: &Entity) -> i64 {
    match entity {
        Entity::Note(note) => note.updated_at,
        Entity::Category(category) => category.updated_at,
    }
}

/// Order-independent digest over replicated content.
///
/// One canonical JSON line per entity (kind, id, content fields), sorted,
/// then hashed. Owner and local timestamps are excluded because they differ
/// legitimately between peers.
pub(crate) fn content_checksum(entities: &[Entity]) -> Result<String, RepoError> {
    let mut lines = entities
        .iter()
        .map(|entity| {
            let line = match entity {
                Entity::Note(note) => serde_json::json!([
                    "note",
                    note.id.to_string(),
                    note.title,
                    note.body,
                    note.category_id.map(|id| id.to_string()),
                    note.is_pinned,
                ]),
                Entity::Category(category) => serde_json::json!([
                    "category",
                    category.id.to_string(),
                    category.name,
                    category.color,
                ]),
            };
            serde_json::to_string(&line)
        })
        .collect::<Result<Vec<_>, _>>()?;
    lines.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}
