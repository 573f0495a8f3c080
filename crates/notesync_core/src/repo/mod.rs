//! Repository layer: durable entity tier, read cache tier, and the
//! write-through store that joins them.
//!
//! # Invariants
//! - Durable writes that must stay coupled with the change log run inside
//!   [`store::EntityStore::write`].
//! - Repository APIs return semantic errors (`NotFound`, `AlreadyExists`) in
//!   addition to DB transport errors.

pub mod cache;
pub mod entity_repo;
pub mod store;
