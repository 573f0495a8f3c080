//! Note use-case service.
//!
//! # Responsibility
//! - Provide note create/update/delete/get/list for the session's owner.
//!
//! # Invariants
//! - `update_note` uses full replacement semantics; only fields that differ
//!   end up in the change record.
//! - Notes are created under the session caller (none in single-owner mode).

use crate::model::entity::{Entity, EntityId, EntityKind, Note};
use crate::model::now_epoch_ms;
use crate::repo::entity_repo::EntityListQuery;
use crate::repo::store::Persisted;
use crate::service::{normalize_list_limit, ListResult, Mutation, ServiceError};
use crate::sync::apply::LocalMutation;
use crate::sync::session::SyncSession;
use uuid::Uuid;

/// Mutable note content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoteDraft {
    pub title: String,
    pub body: String,
    pub category_id: Option<EntityId>,
    pub is_pinned: bool,
}

impl NoteDraft {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Self::default()
        }
    }
}

/// Note service facade over one sync session.
pub struct NoteService<'s, 'conn> {
    session: &'s SyncSession<'conn>,
}

impl<'s, 'conn> NoteService<'s, 'conn> {
    pub fn new(session: &'s SyncSession<'conn>) -> Self {
        Self { session }
    }

    /// Creates one note with a fresh stable id.
    pub fn create_note(&self, draft: NoteDraft) -> Result<Mutation<Note>, ServiceError> {
        let mut note = Note::blank(
            Uuid::new_v4(),
            self.session.caller().cloned(),
            now_epoch_ms(),
        );
        apply_draft(&mut note, draft);
        let persisted = self
            .session
            .engine()
            .record_local_create(Entity::Note(note))?;
        into_note_mutation(persisted)
    }

    /// Replaces the note's content with `draft`.
    pub fn update_note(
        &self,
        id: EntityId,
        draft: NoteDraft,
    ) -> Result<Mutation<Note>, ServiceError> {
        let mut note = self.get_note(id)?.ok_or(ServiceError::NotFound {
            kind: EntityKind::Note,
            id,
        })?;
        apply_draft(&mut note, draft);
        let persisted = self
            .session
            .engine()
            .record_local_update(&self.session.scope(), Entity::Note(note))?;
        into_note_mutation(persisted)
    }

    /// Tombstones one note. Deleting twice is a no-op.
    pub fn delete_note(&self, id: EntityId) -> Result<Mutation<Note>, ServiceError> {
        let persisted = self.session.engine().record_local_delete(
            &self.session.scope(),
            EntityKind::Note,
            id,
        )?;
        into_note_mutation(persisted)
    }

    /// Gets one active note by stable id.
    pub fn get_note(&self, id: EntityId) -> Result<Option<Note>, ServiceError> {
        let scope = self.session.scope();
        match self.session.store().get(EntityKind::Note, id)? {
            Some(Entity::Note(note))
                if note.deleted_at.is_none() && scope.permits(note.owner_id.as_ref()) =>
            {
                Ok(Some(note))
            }
            Some(Entity::Note(_)) | None => Ok(None),
            Some(Entity::Category(_)) => Err(ServiceError::InconsistentState(
                "note lookup returned a category",
            )),
        }
    }

    /// Lists active notes ordered by id.
    pub fn list_notes(
        &self,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<ListResult<Note>, ServiceError> {
        let applied_limit = normalize_list_limit(limit);
        let query = EntityListQuery {
            limit: Some(applied_limit),
            offset,
            ..EntityListQuery::active(EntityKind::Note, self.session.scope())
        };
        let items = self
            .session
            .store()
            .list(&query)?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Note(note) => Some(note),
                Entity::Category(_) => None,
            })
            .collect();
        Ok(ListResult {
            items,
            applied_limit,
        })
    }
}

fn apply_draft(note: &mut Note, draft: NoteDraft) {
    note.title = draft.title;
    note.body = draft.body;
    note.category_id = draft.category_id;
    note.is_pinned = draft.is_pinned;
}

fn into_note_mutation(
    persisted: Persisted<LocalMutation>,
) -> Result<Mutation<Note>, ServiceError> {
    let Persisted {
        value: LocalMutation { entity, record },
        cache_degraded,
    } = persisted;
    match entity {
        Entity::Note(note) => Ok(Mutation {
            value: note,
            record,
            cache_degraded,
        }),
        Entity::Category(_) => Err(ServiceError::InconsistentState(
            "note mutation returned a category",
        )),
    }
}
