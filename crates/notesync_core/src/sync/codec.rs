//! Fragment codec.
//!
//! # Responsibility
//! - Encode the minimal changed-field set between two entity states.
//! - Decode a fragment into a typed patch that exposes only flagged fields.
//!
//! # Invariants
//! - Unflagged fields decode as *absent* (`None`), never as zero values.
//!   Nullable fields use `Option<Option<_>>` so "set to null" stays distinct
//!   from "untouched".
//! - Decoding is strict: zero masks, unassigned bits, missing flagged keys,
//!   unflagged extra keys and mistyped values are all rejected.
//! - `encode` never produces an empty fragment; no change yields `None`.

use crate::model::entity::{Category, Entity, EntityId, EntityKind, Note};
use crate::model::fragment::{category_fields, field_key, full_mask, note_fields, Fragment};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Codec failure. Surfaces as `malformed_fragment` at the protocol level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    EmptyMask,
    UnknownBits { kind: EntityKind, bits: u32 },
    MissingField(&'static str),
    UnexpectedField(String),
    InvalidField { field: &'static str, message: String },
    KindMismatch { expected: EntityKind, actual: EntityKind },
}

impl Display for FragmentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMask => write!(f, "fragment has no field flags set"),
            Self::UnknownBits { kind, bits } => write!(
                f,
                "fragment flags {bits:#x} are not assigned for {}",
                kind.as_str()
            ),
            Self::MissingField(field) => write!(f, "flagged field `{field}` is missing"),
            Self::UnexpectedField(field) => write!(f, "unflagged field `{field}` is present"),
            Self::InvalidField { field, message } => {
                write!(f, "field `{field}` is invalid: {message}")
            }
            Self::KindMismatch { expected, actual } => write!(
                f,
                "fragment for {} cannot apply to {}",
                actual.as_str(),
                expected.as_str()
            ),
        }
    }
}

impl Error for FragmentError {}

/// Partial note: `None` means the field is untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub category_id: Option<Option<EntityId>>,
    pub is_pinned: Option<bool>,
}

/// Partial category: `None` means the field is untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub color: Option<Option<String>>,
}

/// Decoded fragment for either entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPatch {
    Note(NotePatch),
    Category(CategoryPatch),
}

impl NotePatch {
    pub fn mask(&self) -> u32 {
        let mut mask = 0;
        if self.title.is_some() {
            mask |= note_fields::TITLE;
        }
        if self.body.is_some() {
            mask |= note_fields::BODY;
        }
        if self.category_id.is_some() {
            mask |= note_fields::CATEGORY;
        }
        if self.is_pinned.is_some() {
            mask |= note_fields::PINNED;
        }
        mask
    }

    fn diff(prior: Option<&Note>, next: &Note) -> Self {
        Self {
            title: changed(prior.map(|note| &note.title), &next.title),
            body: changed(prior.map(|note| &note.body), &next.body),
            category_id: changed(prior.map(|note| &note.category_id), &next.category_id),
            is_pinned: changed(prior.map(|note| &note.is_pinned), &next.is_pinned),
        }
    }

    fn retain(&self, mask: u32) -> Self {
        Self {
            title: keep(&self.title, mask, note_fields::TITLE),
            body: keep(&self.body, mask, note_fields::BODY),
            category_id: keep(&self.category_id, mask, note_fields::CATEGORY),
            is_pinned: keep(&self.is_pinned, mask, note_fields::PINNED),
        }
    }

    fn apply_to(&self, note: &mut Note) {
        if let Some(title) = &self.title {
            note.title.clone_from(title);
        }
        if let Some(body) = &self.body {
            note.body.clone_from(body);
        }
        if let Some(category_id) = self.category_id {
            note.category_id = category_id;
        }
        if let Some(is_pinned) = self.is_pinned {
            note.is_pinned = is_pinned;
        }
    }

    fn write_fields(&self, fields: &mut Map<String, Value>) {
        if let Some(title) = &self.title {
            fields.insert("title".to_string(), Value::String(title.clone()));
        }
        if let Some(body) = &self.body {
            fields.insert("body".to_string(), Value::String(body.clone()));
        }
        if let Some(category_id) = self.category_id {
            fields.insert(
                "category_id".to_string(),
                category_id.map_or(Value::Null, |id| Value::String(id.to_string())),
            );
        }
        if let Some(is_pinned) = self.is_pinned {
            fields.insert("is_pinned".to_string(), Value::Bool(is_pinned));
        }
    }

    fn read_fields(fragment: &Fragment) -> Result<Self, FragmentError> {
        let fields = &fragment.fields;
        let mut patch = Self::default();
        if fragment.has(note_fields::TITLE) {
            patch.title = Some(read_string(fields, "title")?);
        }
        if fragment.has(note_fields::BODY) {
            patch.body = Some(read_string(fields, "body")?);
        }
        if fragment.has(note_fields::CATEGORY) {
            patch.category_id = Some(read_nullable_uuid(fields, "category_id")?);
        }
        if fragment.has(note_fields::PINNED) {
            patch.is_pinned = Some(read_bool(fields, "is_pinned")?);
        }
        Ok(patch)
    }
}

impl CategoryPatch {
    pub fn mask(&self) -> u32 {
        let mut mask = 0;
        if self.name.is_some() {
            mask |= category_fields::NAME;
        }
        if self.color.is_some() {
            mask |= category_fields::COLOR;
        }
        mask
    }

    fn diff(prior: Option<&Category>, next: &Category) -> Self {
        Self {
            name: changed(prior.map(|category| &category.name), &next.name),
            color: changed(prior.map(|category| &category.color), &next.color),
        }
    }

    fn retain(&self, mask: u32) -> Self {
        Self {
            name: keep(&self.name, mask, category_fields::NAME),
            color: keep(&self.color, mask, category_fields::COLOR),
        }
    }

    fn apply_to(&self, category: &mut Category) {
        if let Some(name) = &self.name {
            category.name.clone_from(name);
        }
        if let Some(color) = &self.color {
            category.color.clone_from(color);
        }
    }

    fn write_fields(&self, fields: &mut Map<String, Value>) {
        if let Some(name) = &self.name {
            fields.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(color) = &self.color {
            fields.insert(
                "color".to_string(),
                color.clone().map_or(Value::Null, Value::String),
            );
        }
    }

    fn read_fields(fragment: &Fragment) -> Result<Self, FragmentError> {
        let fields = &fragment.fields;
        let mut patch = Self::default();
        if fragment.has(category_fields::NAME) {
            patch.name = Some(read_string(fields, "name")?);
        }
        if fragment.has(category_fields::COLOR) {
            patch.color = Some(read_nullable_string(fields, "color")?);
        }
        Ok(patch)
    }
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Note(_) => EntityKind::Note,
            Self::Category(_) => EntityKind::Category,
        }
    }

    /// Bits of the fields present in this patch.
    pub fn mask(&self) -> u32 {
        match self {
            Self::Note(patch) => patch.mask(),
            Self::Category(patch) => patch.mask(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mask() == 0
    }

    /// Copy of this patch keeping only the fields flagged in `mask`.
    pub fn retain(&self, mask: u32) -> Self {
        match self {
            Self::Note(patch) => Self::Note(patch.retain(mask)),
            Self::Category(patch) => Self::Category(patch.retain(mask)),
        }
    }

    /// Merges the present fields into `entity`. Absent fields stay untouched.
    pub fn apply_to(&self, entity: &mut Entity) -> Result<(), FragmentError> {
        match (self, entity) {
            (Self::Note(patch), Entity::Note(note)) => {
                patch.apply_to(note);
                Ok(())
            }
            (Self::Category(patch), Entity::Category(category)) => {
                patch.apply_to(category);
                Ok(())
            }
            (patch, entity) => Err(FragmentError::KindMismatch {
                expected: entity.kind(),
                actual: patch.kind(),
            }),
        }
    }

    /// Encodes this patch, `None` when no field is present.
    pub fn to_fragment(&self) -> Option<Fragment> {
        let mask = self.mask();
        if mask == 0 {
            return None;
        }

        let mut fields = Map::new();
        match self {
            Self::Note(patch) => patch.write_fields(&mut fields),
            Self::Category(patch) => patch.write_fields(&mut fields),
        }
        Some(Fragment { mask, fields })
    }
}

/// Encodes the fields of `next` that differ from `prior`.
///
/// With no prior state every field is emitted, which is the full-state form
/// used by creates and snapshots.
pub fn encode(prior: Option<&Entity>, next: &Entity) -> Result<Option<Fragment>, FragmentError> {
    let patch = match (prior, next) {
        (None, Entity::Note(next)) => EntityPatch::Note(NotePatch::diff(None, next)),
        (None, Entity::Category(next)) => EntityPatch::Category(CategoryPatch::diff(None, next)),
        (Some(Entity::Note(prior)), Entity::Note(next)) => {
            EntityPatch::Note(NotePatch::diff(Some(prior), next))
        }
        (Some(Entity::Category(prior)), Entity::Category(next)) => {
            EntityPatch::Category(CategoryPatch::diff(Some(prior), next))
        }
        (Some(prior), next) => {
            return Err(FragmentError::KindMismatch {
                expected: prior.kind(),
                actual: next.kind(),
            })
        }
    };
    Ok(patch.to_fragment())
}

/// Full-state fragment with every assigned bit set.
pub fn encode_full(entity: &Entity) -> Fragment {
    let patch = match entity {
        Entity::Note(note) => EntityPatch::Note(NotePatch::diff(None, note)),
        Entity::Category(category) => EntityPatch::Category(CategoryPatch::diff(None, category)),
    };
    let mut fields = Map::new();
    match &patch {
        EntityPatch::Note(patch) => patch.write_fields(&mut fields),
        EntityPatch::Category(patch) => patch.write_fields(&mut fields),
    }
    Fragment {
        mask: full_mask(entity.kind()),
        fields,
    }
}

/// Decodes and validates a fragment for `kind`.
pub fn decode(kind: EntityKind, fragment: &Fragment) -> Result<EntityPatch, FragmentError> {
    if fragment.is_empty() {
        return Err(FragmentError::EmptyMask);
    }
    let unknown = fragment.mask & !full_mask(kind);
    if unknown != 0 {
        return Err(FragmentError::UnknownBits {
            kind,
            bits: unknown,
        });
    }

    let flagged_keys = (0..u32::BITS)
        .map(|shift| 1u32 << shift)
        .filter(|bit| fragment.has(*bit))
        .filter_map(|bit| field_key(kind, bit))
        .collect::<Vec<_>>();
    if let Some(extra) = fragment
        .fields
        .keys()
        .find(|key| !flagged_keys.contains(&key.as_str()))
    {
        return Err(FragmentError::UnexpectedField(extra.clone()));
    }

    match kind {
        EntityKind::Note => NotePatch::read_fields(fragment).map(EntityPatch::Note),
        EntityKind::Category => CategoryPatch::read_fields(fragment).map(EntityPatch::Category),
    }
}

fn changed<T: Clone + PartialEq>(prior: Option<&T>, next: &T) -> Option<T> {
    match prior {
        Some(prior) if prior == next => None,
        _ => Some(next.clone()),
    }
}

fn keep<T: Clone>(value: &Option<T>, mask: u32, bit: u32) -> Option<T> {
    if mask & bit != 0 {
        value.clone()
    } else {
        None
    }
}

fn field<'a>(fields: &'a Map<String, Value>, key: &'static str) -> Result<&'a Value, FragmentError> {
    fields.get(key).ok_or(FragmentError::MissingField(key))
}

fn read_string(fields: &Map<String, Value>, key: &'static str) -> Result<String, FragmentError> {
    match field(fields, key)? {
        Value::String(value) => Ok(value.clone()),
        other => Err(invalid(key, "string", other)),
    }
}

fn read_nullable_string(
    fields: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, FragmentError> {
    match field(fields, key)? {
        Value::Null => Ok(None),
        Value::String(value) => Ok(Some(value.clone())),
        other => Err(invalid(key, "string or null", other)),
    }
}

fn read_nullable_uuid(
    fields: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<Uuid>, FragmentError> {
    match field(fields, key)? {
        Value::Null => Ok(None),
        Value::String(value) => {
            Uuid::parse_str(value)
                .map(Some)
                .map_err(|_| FragmentError::InvalidField {
                    field: key,
                    message: "expected uuid".to_string(),
                })
        }
        other => Err(invalid(key, "uuid string or null", other)),
    }
}

fn read_bool(fields: &Map<String, Value>, key: &'static str) -> Result<bool, FragmentError> {
    match field(fields, key)? {
        Value::Bool(value) => Ok(*value),
        other => Err(invalid(key, "bool", other)),
    }
}

fn invalid(key: &'static str, expected: &str, actual: &Value) -> FragmentError {
    let actual = match actual {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    FragmentError::InvalidField {
        field: key,
        message: format!("expected {expected}, got {actual}"),
    }
}
