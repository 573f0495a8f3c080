//! Fragment payload and stable field-bit assignments.
//!
//! # Invariants
//! - Every bit below is a permanent assignment. A retired field keeps its bit
//!   reserved forever; reusing it would corrupt replay of historical records.
//! - A fragment with `mask == 0` is invalid.
//! - `fields` holds exactly one key per flagged bit.

use crate::model::entity::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Note field bits (schema version 1).
pub mod note_fields {
    pub const TITLE: u32 = 1 << 0;
    pub const BODY: u32 = 1 << 1;
    pub const CATEGORY: u32 = 1 << 2;
    pub const PINNED: u32 = 1 << 3;

    pub const ALL: u32 = TITLE | BODY | CATEGORY | PINNED;
}

/// Category field bits (schema version 1).
pub mod category_fields {
    pub const NAME: u32 = 1 << 0;
    pub const COLOR: u32 = 1 << 1;

    pub const ALL: u32 = NAME | COLOR;
}

/// Sparse delta: bitmask of present fields plus their JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub mask: u32,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn has(&self, bit: u32) -> bool {
        self.mask & bit != 0
    }
}

/// Every bit currently assigned for `kind`.
pub fn full_mask(kind: EntityKind) -> u32 {
    match kind {
        EntityKind::Note => note_fields::ALL,
        EntityKind::Category => category_fields::ALL,
    }
}

/// Payload key for one assigned bit, `None` for unassigned bits.
pub fn field_key(kind: EntityKind, bit: u32) -> Option<&'static str> {
    match (kind, bit) {
        (EntityKind::Note, note_fields::TITLE) => Some("title"),
        (EntityKind::Note, note_fields::BODY) => Some("body"),
        (EntityKind::Note, note_fields::CATEGORY) => Some("category_id"),
        (EntityKind::Note, note_fields::PINNED) => Some("is_pinned"),
        (EntityKind::Category, category_fields::NAME) => Some("name"),
        (EntityKind::Category, category_fields::COLOR) => Some("color"),
        _ => None,
    }
}

/// Payload keys for every bit set in `mask`, in bit order.
pub fn field_names(kind: EntityKind, mask: u32) -> Vec<&'static str> {
    (0..u32::BITS)
        .map(|shift| 1u32 << shift)
        .filter(|bit| mask & bit != 0)
        .filter_map(|bit| field_key(kind, bit))
        .collect()
}
