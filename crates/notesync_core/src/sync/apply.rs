//! Apply engine.
//!
//! # Responsibility
//! - Local path: mutate an entity and append its change record atomically.
//! - Remote path: apply an incoming change idempotently, record it as
//!   `ReceivedViaSync` and mark it delivered by its source peer.
//!
//! # Invariants
//! - A change id is applied at most once per peer. Replays are no-op
//!   successes.
//! - Every remote change runs in its own transaction; one failure never
//!   affects another item.
//! - Ownership of stored entities is never rewritten by remote changes.
//! - Updates and deletes for an entity this peer does not hold are rejected
//!   with `target_missing` and not recorded, so they can be retried. Another
//!   tenant's entity counts as not held.

use crate::logging::{sanitize_message, MAX_LOGGED_DETAIL_CHARS};
use crate::model::change::{ChangeOperation, ChangeRecord};
use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::model::identity::{PeerId, UserId};
use crate::model::now_epoch_ms;
use crate::repo::entity_repo::{EntityRepository, RepoError, RepoResult, SqliteEntityRepository};
use crate::repo::store::{EntityStore, Persisted};
use crate::sync::change_log::{append, change_exists, NewChange};
use crate::sync::codec::{decode, encode, encode_full};
use crate::sync::conflict::{find_concurrent, record_conflict, ConflictReport};
use crate::sync::delivery::mark_received;
use crate::sync::scope::{rewrite_owner, OwnerScope};
use crate::sync::wire::{IncomingChange, RejectReason, RejectedChange};
use log::{debug, error, warn};
use rusqlite::Connection;
use uuid::Uuid;

/// Result of one local mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMutation {
    pub entity: Entity,
    /// `None` when the mutation changed nothing and no record was written.
    pub record: Option<ChangeRecord>,
}

/// Result of applying one remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        record: ChangeRecord,
        conflict: Option<ConflictReport>,
        cache_degraded: bool,
    },
    /// The change id was applied before.
    Duplicate,
    /// Create for an entity this peer already holds.
    AlreadyPresent,
    Rejected(RejectedChange),
}

impl ApplyOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Applies local and remote mutations against one replica's store.
pub struct ApplyEngine<'s, 'conn> {
    store: &'s EntityStore<'conn>,
    detect_conflicts: bool,
}

impl<'s, 'conn> ApplyEngine<'s, 'conn> {
    pub fn new(store: &'s EntityStore<'conn>, detect_conflicts: bool) -> Self {
        Self {
            store,
            detect_conflicts,
        }
    }

    /// Inserts `entity` and appends a full-state `Create` record.
    pub fn record_local_create(&self, entity: Entity) -> RepoResult<Persisted<LocalMutation>> {
        self.store.write(|tx| {
            let now = now_epoch_ms();
            let mut entity = entity;
            entity.touch(now);
            SqliteEntityRepository::new(tx).insert_entity(&entity)?;

            let record = append(
                tx,
                NewChange::local(
                    entity.kind(),
                    entity.id(),
                    ChangeOperation::Create,
                    Some(encode_full(&entity)),
                    entity.owner_id().cloned(),
                    now,
                ),
            )?;
            let mutation = LocalMutation {
                entity: entity.clone(),
                record: Some(record),
            };
            Ok((mutation, vec![entity]))
        })
    }

    /// Replaces the mutable fields of an active entity with those of `next`
    /// and appends an `Update` carrying only the changed fields.
    ///
    /// Entities outside `scope` are reported as not found.
    pub fn record_local_update(
        &self,
        scope: &OwnerScope,
        next: Entity,
    ) -> RepoResult<Persisted<LocalMutation>> {
        self.store.write(|tx| {
            let prior = load_active(tx, scope, next.kind(), next.id())?;
            let Some(fragment) = encode(Some(&prior), &next)? else {
                return Ok((
                    LocalMutation {
                        entity: prior,
                        record: None,
                    },
                    Vec::new(),
                ));
            };

            let now = now_epoch_ms();
            let mut updated = prior.clone();
            decode(updated.kind(), &fragment)?.apply_to(&mut updated)?;
            updated.touch(now);
            SqliteEntityRepository::new(tx).update_entity(&updated)?;

            let record = append(
                tx,
                NewChange::local(
                    updated.kind(),
                    updated.id(),
                    ChangeOperation::Update,
                    Some(fragment),
                    prior.owner_id().cloned(),
                    now,
                ),
            )?;
            Ok((
                LocalMutation {
                    entity: updated.clone(),
                    record: Some(record),
                },
                vec![updated],
            ))
        })
    }

    /// Tombstones an entity. Deleting an already tombstoned entity is a
    /// no-op without a record.
    pub fn record_local_delete(
        &self,
        scope: &OwnerScope,
        kind: EntityKind,
        id: EntityId,
    ) -> RepoResult<Persisted<LocalMutation>> {
        self.store.write(|tx| {
            let repo = SqliteEntityRepository::new(tx);
            let prior = match repo.get_entity(kind, id)? {
                Some(entity) if scope.permits(entity.owner_id()) => entity,
                _ => return Err(RepoError::NotFound { kind, id }),
            };
            if !prior.is_active() {
                return Ok((
                    LocalMutation {
                        entity: prior,
                        record: None,
                    },
                    Vec::new(),
                ));
            }

            let now = now_epoch_ms();
            let mut deleted = prior.clone();
            deleted.tombstone(now);
            deleted.touch(now);
            repo.update_entity(&deleted)?;

            let record = append(
                tx,
                NewChange::local(
                    kind,
                    id,
                    ChangeOperation::Delete,
                    None,
                    prior.owner_id().cloned(),
                    now,
                ),
            )?;
            Ok((
                LocalMutation {
                    entity: deleted.clone(),
                    record: Some(record),
                },
                vec![deleted],
            ))
        })
    }

    /// Applies one validated remote change received from `source_peer`.
    ///
    /// `caller` is the authenticated user of the request, `None` in
    /// single-owner mode. Storage failures are reported as a rejection.
    pub fn apply_remote(
        &self,
        source_peer: &PeerId,
        caller: Option<&UserId>,
        incoming: &IncomingChange,
    ) -> ApplyOutcome {
        let result = self
            .store
            .write(|tx| self.apply_in_tx(tx, source_peer, caller, incoming));

        match result {
            Ok(Persisted {
                value: RemoteStep::Applied { record, conflict },
                cache_degraded,
            }) => {
                if let Some(conflict) = conflict.as_ref() {
                    warn!(
                        "event=sync_conflict module=sync status=detected change_id={} entity_id={} kind={} local_change_id={} overlap_mask={} peer={}",
                        incoming.change_id,
                        incoming.entity_id,
                        incoming.entity_kind.as_str(),
                        conflict.local_change_id,
                        conflict.overlap_mask,
                        source_peer
                    );
                }
                debug!(
                    "event=sync_apply module=sync status=applied change_id={} entity_id={} op={} peer={}",
                    incoming.change_id,
                    incoming.entity_id,
                    incoming.operation.as_str(),
                    source_peer
                );
                ApplyOutcome::Applied {
                    record,
                    conflict,
                    cache_degraded,
                }
            }
            Ok(Persisted {
                value: RemoteStep::Duplicate,
                ..
            }) => ApplyOutcome::Duplicate,
            Ok(Persisted {
                value: RemoteStep::AlreadyPresent,
                ..
            }) => ApplyOutcome::AlreadyPresent,
            Ok(Persisted {
                value: RemoteStep::Rejected(reason, message),
                ..
            }) => {
                warn!(
                    "event=sync_apply module=sync status=rejected reason={} change_id={} entity_id={} peer={}",
                    reason.code(),
                    incoming.change_id,
                    incoming.entity_id,
                    source_peer
                );
                ApplyOutcome::Rejected(RejectedChange::new(
                    Some(incoming.change_id.to_string()),
                    reason,
                    message,
                ))
            }
            Err(err) => {
                error!(
                    "event=sync_apply module=sync status=error reason=storage_failure change_id={} entity_id={} error={}",
                    incoming.change_id,
                    incoming.entity_id,
                    sanitize_message(&err.to_string(), MAX_LOGGED_DETAIL_CHARS)
                );
                ApplyOutcome::Rejected(RejectedChange::new(
                    Some(incoming.change_id.to_string()),
                    RejectReason::StorageFailure,
                    "change could not be stored",
                ))
            }
        }
    }

    fn apply_in_tx(
        &self,
        conn: &Connection,
        source_peer: &PeerId,
        caller: Option<&UserId>,
        incoming: &IncomingChange,
    ) -> RepoResult<(RemoteStep, Vec<Entity>)> {
        if change_exists(conn, incoming.change_id)? {
            // The sender evidently holds it; never offer it back.
            mark_received(conn, source_peer, incoming.change_id, now_epoch_ms())?;
            return Ok((RemoteStep::Duplicate, Vec::new()));
        }

        let claimed_owner = match rewrite_owner(incoming.claimed_owner.as_deref(), caller) {
            Ok(owner) => owner,
            Err(err) => {
                return Ok((
                    RemoteStep::Rejected(RejectReason::InvalidOwner, err.to_string()),
                    Vec::new(),
                ));
            }
        };

        let repo = SqliteEntityRepository::new(conn);
        let mut prior = repo.get_entity(incoming.entity_kind, incoming.entity_id)?;
        let foreign = match (caller, prior.as_ref()) {
            (Some(caller), Some(held)) => held.owner_id() != Some(caller),
            _ => false,
        };
        if foreign {
            if incoming.operation == ChangeOperation::Create {
                return Ok((
                    RemoteStep::Rejected(
                        RejectReason::OwnershipViolation,
                        "entity id is already taken".to_string(),
                    ),
                    Vec::new(),
                ));
            }
            // Reported as absent; only the log keeps the real reason.
            warn!(
                "event=sync_apply module=sync status=rejected reason=ownership_violation reported=target_missing change_id={} entity_id={}",
                incoming.change_id,
                incoming.entity_id
            );
            prior = None;
        }

        let now = now_epoch_ms();
        let (next, owner, conflict) = match (incoming.operation, prior) {
            (ChangeOperation::Create, Some(_)) => {
                return Ok((RemoteStep::AlreadyPresent, Vec::new()));
            }
            (ChangeOperation::Update | ChangeOperation::Delete, None) => {
                return Ok((
                    RemoteStep::Rejected(
                        RejectReason::TargetMissing,
                        format!(
                            "{} {} is not present on this peer",
                            incoming.entity_kind.as_str(),
                            incoming.entity_id
                        ),
                    ),
                    Vec::new(),
                ));
            }
            (ChangeOperation::Create, None) => {
                let owner = claimed_owner;
                let mut created = Entity::blank(
                    incoming.entity_kind,
                    incoming.entity_id,
                    owner.clone(),
                    now,
                );
                if let Some(patch) = incoming.patch.as_ref() {
                    patch.apply_to(&mut created)?;
                }
                repo.insert_entity(&created)?;
                (created, owner, None)
            }
            (ChangeOperation::Update, Some(prior)) => {
                let Some(patch) = incoming.patch.as_ref() else {
                    return Err(RepoError::InvalidData("update without fragment".to_string()));
                };
                let mut proposed = prior.clone();
                patch.apply_to(&mut proposed)?;
                let conflict =
                    self.detect_conflict(conn, source_peer, incoming, &prior, proposed, now)?;
                let withheld = conflict.as_ref().map_or(0, |report| report.overlap_mask);

                let mut updated = prior.clone();
                patch.retain(!withheld).apply_to(&mut updated)?;
                updated.touch(now);
                repo.update_entity(&updated)?;
                let owner = prior.owner_id().cloned();
                (updated, owner, conflict)
            }
            (ChangeOperation::Delete, Some(prior)) => {
                let mut deleted = prior.clone();
                deleted.tombstone(incoming.authored_at);
                let conflict =
                    self.detect_conflict(conn, source_peer, incoming, &prior, deleted.clone(), now)?;

                // Deletes win over concurrent edits so every peer settles on
                // the tombstone; the conflict keeps the lost state.
                deleted.touch(now);
                repo.update_entity(&deleted)?;
                let owner = prior.owner_id().cloned();
                (deleted, owner, conflict)
            }
            (ChangeOperation::ReceivedViaSync, _) => {
                return Err(RepoError::InvalidData(
                    "received_via_sync is not an applicable operation".to_string(),
                ));
            }
        };

        if let Some(report) = conflict.as_ref() {
            record_conflict(conn, report)?;
        }

        let record = append(
            conn,
            NewChange {
                change_id: incoming.change_id,
                entity_id: incoming.entity_id,
                entity_kind: incoming.entity_kind,
                operation: ChangeOperation::ReceivedViaSync,
                relayed_operation: Some(incoming.operation),
                fragment: incoming.fragment.clone(),
                owner_id: owner,
                source_peer: Some(source_peer.clone()),
                authored_at: incoming.authored_at,
            },
        )?;
        mark_received(conn, source_peer, incoming.change_id, now)?;

        Ok((RemoteStep::Applied { record, conflict }, vec![next]))
    }

    fn detect_conflict(
        &self,
        conn: &Connection,
        source_peer: &PeerId,
        incoming: &IncomingChange,
        local: &Entity,
        proposed: Entity,
        now: i64,
    ) -> RepoResult<Option<ConflictReport>> {
        if !self.detect_conflicts {
            return Ok(None);
        }
        let Some(edits) = find_concurrent(conn, source_peer, incoming)? else {
            return Ok(None);
        };

        Ok(Some(ConflictReport {
            conflict_id: Uuid::new_v4(),
            entity_kind: incoming.entity_kind,
            entity_id: incoming.entity_id,
            owner_id: local.owner_id().cloned(),
            local_change_id: edits.local_change_id,
            remote_change_id: incoming.change_id,
            remote_peer: source_peer.clone(),
            overlap_mask: edits.overlap_mask,
            local_snapshot: local.clone(),
            remote_snapshot: proposed,
            detected_at: now,
            resolved_at: None,
        }))
    }
}

/// Transaction-internal outcome, before cache state is known.
enum RemoteStep {
    Applied {
        record: ChangeRecord,
        conflict: Option<ConflictReport>,
    },
    Duplicate,
    AlreadyPresent,
    Rejected(RejectReason, String),
}

fn load_active(
    conn: &Connection,
    scope: &OwnerScope,
    kind: EntityKind,
    id: EntityId,
) -> RepoResult<Entity> {
    match SqliteEntityRepository::new(conn).get_entity(kind, id)? {
        Some(entity) if entity.is_active() && scope.permits(entity.owner_id()) => Ok(entity),
        _ => Err(RepoError::NotFound { kind, id }),
    }
}
