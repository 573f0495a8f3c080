//! Note and category entities.
//!
//! # Responsibility
//! - Define the mutable, user-owned records replicated between peers.
//! - Provide tombstone helpers for soft-delete semantics.
//!
//! # Invariants
//! - `id` is stable and never reused for another entity.
//! - `deleted_at` is the source of truth for tombstone state.
//! - `owner_id` is bound at creation time and never rewritten by updates.

use crate::model::identity::UserId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier shared by every replica of one entity.
pub type EntityId = Uuid;

/// Replicated entity kind. Each kind has its own change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Note,
    Category,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Note, EntityKind::Category];

    /// Stable wire/storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Category => "category",
        }
    }

    /// Parses the wire/storage name. Unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "note" => Some(Self::Note),
            "category" => Some(Self::Category),
            _ => None,
        }
    }
}

/// Free-form note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: EntityId,
    /// `None` in single-owner mode.
    pub owner_id: Option<UserId>,
    pub title: String,
    pub body: String,
    /// Category reference by stable id. Not enforced as a foreign key because
    /// the referenced category may reach this peer in a later batch.
    pub category_id: Option<EntityId>,
    pub is_pinned: bool,
    /// Local epoch ms. Differs per peer and is excluded from content checks.
    pub created_at: i64,
    /// Local epoch ms. Differs per peer and is excluded from content checks.
    pub updated_at: i64,
    /// Tombstone timestamp, taken from the authoring time of the delete.
    pub deleted_at: Option<i64>,
}

/// Grouping label for notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: EntityId,
    pub owner_id: Option<UserId>,
    pub name: String,
    pub color: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Note {
    /// Creates a blank note with the given stable id.
    pub fn blank(id: EntityId, owner_id: Option<UserId>, now_ms: i64) -> Self {
        Self {
            id,
            owner_id,
            title: String::new(),
            body: String::new(),
            category_id: None,
            is_pinned: false,
            created_at: now_ms,
            updated_at: now_ms,
            deleted_at: None,
        }
    }
}

impl Category {
    /// Creates a blank category with the given stable id.
    pub fn blank(id: EntityId, owner_id: Option<UserId>, now_ms: i64) -> Self {
        Self {
            id,
            owner_id,
            name: String::new(),
            color: None,
            created_at: now_ms,
            updated_at: now_ms,
            deleted_at: None,
        }
    }
}

/// Either replicated entity, used where code is kind-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Note(Note),
    Category(Category),
}

impl Entity {
    /// Creates a blank entity of `kind`, used as the base for a Create patch.
    pub fn blank(kind: EntityKind, id: EntityId, owner_id: Option<UserId>, now_ms: i64) -> Self {
        match kind {
            EntityKind::Note => Self::Note(Note::blank(id, owner_id, now_ms)),
            EntityKind::Category => Self::Category(Category::blank(id, owner_id, now_ms)),
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Note(note) => note.id,
            Self::Category(category) => category.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Note(_) => EntityKind::Note,
            Self::Category(_) => EntityKind::Category,
        }
    }

    pub fn owner_id(&self) -> Option<&UserId> {
        match self {
            Self::Note(note) => note.owner_id.as_ref(),
            Self::Category(category) => category.owner_id.as_ref(),
        }
    }

    pub fn deleted_at(&self) -> Option<i64> {
        match self {
            Self::Note(note) => note.deleted_at,
            Self::Category(category) => category.deleted_at,
        }
    }

    /// Returns whether this entity is visible (not tombstoned).
    pub fn is_active(&self) -> bool {
        self.deleted_at().is_none()
    }

    /// Sets the tombstone. Keeps the earliest tombstone when already deleted,
    /// so concurrent deletes settle on the same value on every peer.
    pub fn tombstone(&mut self, deleted_at: i64) {
        let slot = match self {
            Self::Note(note) => &mut note.deleted_at,
            Self::Category(category) => &mut category.deleted_at,
        };
        *slot = Some(slot.map_or(deleted_at, |existing| existing.min(deleted_at)));
    }

    pub fn touch(&mut self, now_ms: i64) {
        match self {
            Self::Note(note) => note.updated_at = now_ms,
            Self::Category(category) => category.updated_at = now_ms,
        }
    }
}

impl From<Note> for Entity {
    fn from(value: Note) -> Self {
        Self::Note(value)
    }
}

impl From<Category> for Entity {
    fn from(value: Category) -> Self {
        Self::Category(value)
    }
}
