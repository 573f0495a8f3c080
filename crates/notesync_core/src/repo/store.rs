//! Write-through entity store over the durable and cache tiers.
//!
//! # Responsibility
//! - Run every durable write in one immediate transaction, so the entity
//!   mutation and its change record commit or roll back together.
//! - Refresh the read cache after commit and report cache failures as a
//!   degraded flag.
//!
//! # Invariants
//! - The durable tier is authoritative; `Persisted::cache_degraded == true`
//!   still means the write succeeded.
//! - The cache is only touched after a successful commit.

use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::repo::cache::{NoCache, ReadCache};
use crate::repo::entity_repo::{
    EntityListQuery, EntityRepository, RepoResult, SqliteEntityRepository,
};
use crate::sync::scope::OwnerScope;
use log::{debug, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::Arc;

/// Result of a durable write plus the state of the cache tier afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Persisted<T> {
    pub value: T,
    /// `true` when the durable write succeeded but the cache refresh failed.
    pub cache_degraded: bool,
}

impl<T> Persisted<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Persisted<U> {
        Persisted {
            value: f(self.value),
            cache_degraded: self.cache_degraded,
        }
    }
}

/// One replica's entity storage port.
pub struct EntityStore<'conn> {
    conn: &'conn Connection,
    cache: Arc<dyn ReadCache>,
}

impl<'conn> EntityStore<'conn> {
    pub fn new(conn: &'conn Connection, cache: Arc<dyn ReadCache>) -> Self {
        Self { conn, cache }
    }

    /// Store without a cache tier.
    pub fn durable_only(conn: &'conn Connection) -> Self {
        Self::new(conn, Arc::new(NoCache))
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    /// Runs `op` in an immediate transaction and refreshes the cache with the
    /// entities it reports as touched.
    pub fn write<T, F>(&self, op: F) -> RepoResult<Persisted<T>>
    where
        F: FnOnce(&Transaction<'_>) -> RepoResult<(T, Vec<Entity>)>,
    {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let (value, touched) = op(&tx)?;
        tx.commit()?;

        let cache_degraded = self.refresh_cache(&touched);
        Ok(Persisted {
            value,
            cache_degraded,
        })
    }

    /// Loads one entity, cache first, durable tier as fallback.
    pub fn get(&self, kind: EntityKind, id: EntityId) -> RepoResult<Option<Entity>> {
        if let Some(entity) = self.cache.get(kind, id) {
            return Ok(Some(entity));
        }

        let loaded = SqliteEntityRepository::new(self.conn).get_entity(kind, id)?;
        if let Some(entity) = loaded.as_ref() {
            if let Err(err) = self.cache.put(entity) {
                debug!(
                    "event=cache_backfill module=repo status=skipped kind={} entity_id={} error={}",
                    kind.as_str(),
                    id,
                    err
                );
            }
        }
        Ok(loaded)
    }

    /// Lists entities from the durable tier.
    pub fn list(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>> {
        SqliteEntityRepository::new(self.conn).list_entities(query)
    }

    /// Drops the cache and reloads it from the durable tier.
    ///
    /// Returns the number of entities written back and whether any cache
    /// write failed.
    pub fn rebuild_cache(&self) -> RepoResult<Persisted<usize>> {
        self.cache.clear();
        let repo = SqliteEntityRepository::new(self.conn);
        let mut loaded = Vec::new();
        for kind in EntityKind::ALL {
            let query = EntityListQuery {
                include_deleted: true,
                ..EntityListQuery::active(kind, OwnerScope::All)
            };
            loaded.extend(repo.list_entities(&query)?);
        }

        let cache_degraded = self.refresh_cache(&loaded);
        Ok(Persisted {
            value: loaded.len(),
            cache_degraded,
        })
    }

    fn refresh_cache(&self, touched: &[Entity]) -> bool {
        let mut degraded = false;
        for entity in touched {
            if let Err(err) = self.cache.put(entity) {
                // A stale entry is worse than a miss.
                self.cache.invalidate(entity.kind(), entity.id());
                warn!(
                    "event=cache_write module=repo status=degraded kind={} entity_id={} error={}",
                    entity.kind().as_str(),
                    entity.id(),
                    err
                );
                degraded = true;
            }
        }
        degraded
    }
}
