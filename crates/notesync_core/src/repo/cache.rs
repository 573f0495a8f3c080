//! Read-optimized cache tier.
//!
//! # Responsibility
//! - Define the port for the rebuildable read cache that sits in front of
//!   the durable SQLite tier.
//! - Provide an in-process implementation and a pass-through one.
//!
//! # Invariants
//! - The cache is never authoritative. Anything it holds can be rebuilt from
//!   the durable tier, so a failed cache write never fails the operation that
//!   caused it.

use crate::model::entity::{Entity, EntityId, EntityKind};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

/// Cache-tier failure. Reported as a degraded flag, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheError {
    pub message: String,
}

impl CacheError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache error: {}", self.message)
    }
}

impl Error for CacheError {}

/// Port for the read cache tier.
pub trait ReadCache: Send + Sync {
    fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity>;
    fn put(&self, entity: &Entity) -> Result<(), CacheError>;
    fn invalidate(&self, kind: EntityKind, id: EntityId);
    fn clear(&self);
}

/// Single-tier deployments: every read goes to the durable store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ReadCache for NoCache {
    fn get(&self, _kind: EntityKind, _id: EntityId) -> Option<Entity> {
        None
    }

    fn put(&self, _entity: &Entity) -> Result<(), CacheError> {
        Ok(())
    }

    fn invalidate(&self, _kind: EntityKind, _id: EntityId) {}

    fn clear(&self) {}
}

/// In-process map cache keyed by `(kind, id)`.
#[derive(Debug, Default)]
pub struct MemoryReadCache {
    entries: Mutex<HashMap<(EntityKind, EntityId), Entity>>,
}

impl MemoryReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadCache for MemoryReadCache {
    fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&(kind, id)).cloned())
    }

    fn put(&self, entity: &Entity) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::new("memory cache lock poisoned"))?;
        entries.insert((entity.kind(), entity.id()), entity.clone());
        Ok(())
    }

    fn invalidate(&self, kind: EntityKind, id: EntityId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&(kind, id));
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
