//! Core of the notesync replica.
//!
//! Every replica holds notes and categories, records each mutation in an
//! append-only change log and exchanges unseen records with other peers
//! until all of them converge.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod sync;

pub use config::{LoggingConfig, SyncConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::change::{ChangeId, ChangeOperation, ChangeRecord};
pub use model::entity::{Category, Entity, EntityId, EntityKind, Note};
pub use model::fragment::{category_fields, note_fields, Fragment};
pub use model::identity::{IdentityError, PeerId, UserId};
pub use repo::cache::{CacheError, MemoryReadCache, NoCache, ReadCache};
pub use repo::entity_repo::{
    EntityListQuery, EntityRepository, RepoError, RepoResult, SqliteEntityRepository,
};
pub use repo::store::{EntityStore, Persisted};
pub use service::category_service::CategoryService;
pub use service::note_service::{NoteDraft, NoteService};
pub use service::{ListResult, Mutation, ServiceError};
pub use sync::apply::{ApplyEngine, ApplyOutcome, LocalMutation};
pub use sync::client::{CycleReport, SyncClient};
pub use sync::conflict::ConflictReport;
pub use sync::scope::OwnerScope;
pub use sync::session::{SyncError, SyncResult, SyncSession};
pub use sync::stream::{StreamCursor, StreamPage};
pub use sync::transport::{SyncStage, SyncTransport, TransportError};
pub use sync::wire::{
    PullResponse, PushResponse, RejectReason, RejectedChange, SyncChange, SyncStatus,
};

/// Minimal health-check API for embedders.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
