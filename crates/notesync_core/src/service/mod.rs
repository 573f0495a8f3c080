//! Local use-case services.
//!
//! # Responsibility
//! - Expose note and category CRUD for the session's owner.
//! - Route every mutation through the apply engine so it is logged for sync.
//!
//! # Invariants
//! - Services never see entities outside the session's ownership scope.
//! - An update that changes nothing writes no change record.

use crate::model::change::ChangeRecord;
use crate::model::entity::{EntityId, EntityKind};
use crate::repo::entity_repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod category_service;
pub mod note_service;

const LIST_LIMIT_DEFAULT: u32 = 50;
const LIST_LIMIT_MAX: u32 = 100;

/// Service error for local CRUD use-cases.
#[derive(Debug)]
pub enum ServiceError {
    /// Input rejected before touching storage.
    InvalidInput(String),
    /// Target does not exist, is tombstoned, or belongs to another owner.
    NotFound { kind: EntityKind, id: EntityId },
    Repo(RepoError),
    /// Stored entity kind differs from the one requested.
    InconsistentState(&'static str),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::NotFound { kind, id } => write!(f, "{} not found: {id}", kind.as_str()),
            Self::Repo(err) => write!(f, "{err}"),
            Self::InconsistentState(details) => write!(f, "inconsistent state: {details}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::Repo(other),
        }
    }
}

/// One local mutation as seen by service callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation<T> {
    pub value: T,
    /// Change record written for the mutation, `None` for no-op updates.
    pub record: Option<ChangeRecord>,
    /// Durable write succeeded but the read cache was not refreshed.
    pub cache_degraded: bool,
}

/// List result envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResult<T> {
    /// Items ordered by id.
    pub items: Vec<T>,
    /// Effective normalized limit used by the query.
    pub applied_limit: u32,
}

/// Normalizes list limits: `0`/missing uses the default, large values clamp.
pub fn normalize_list_limit(limit: Option<u32>) -> u32 {
    match limit {
        Some(0) | None => LIST_LIMIT_DEFAULT,
        Some(value) if value > LIST_LIMIT_MAX => LIST_LIMIT_MAX,
        Some(value) => value,
    }
}
