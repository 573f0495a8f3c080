//! Transport seam for the sync protocol.
//!
//! # Responsibility
//! - Define the four protocol operations a remote peer is reached through.
//! - Provide the in-process adapter over [`SyncSession`].
//!
//! # Invariants
//! - Transport failures use one envelope (`stage`, `code`, `retryable`) so a
//!   cycle driver can decide what to do without knowing the transport.
//! - Framing, routing and encryption live outside this crate.

use crate::model::entity::{EntityId, EntityKind};
use crate::model::identity::{PeerId, UserId};
use crate::sync::session::{SyncError, SyncSession};
use crate::sync::wire::{PullResponse, PushResponse, SyncChange, SyncStatus};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Protocol step a transport error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Pull,
    Push,
    Snapshot,
    Status,
}

impl SyncStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Snapshot => "snapshot",
            Self::Status => "status",
        }
    }
}

/// Normalized transport failure envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub stage: SyncStage,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn new(
        stage: SyncStage,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            stage,
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    fn from_sync(stage: SyncStage, err: SyncError) -> Self {
        let retryable = matches!(err, SyncError::Repo(_))
            || matches!(&err, SyncError::Transport(inner) if inner.retryable);
        Self::new(stage, err.code().to_string(), err.to_string(), retryable)
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}:{}] {}",
            self.stage.as_str(),
            self.code,
            self.message
        )
    }
}

impl Error for TransportError {}

/// A remote peer as seen by the cycle driver.
pub trait SyncTransport {
    fn pull(&self, peer: &PeerId, limit: u32) -> Result<PullResponse, TransportError>;
    fn push(&self, peer: &PeerId, changes: &[SyncChange]) -> Result<PushResponse, TransportError>;
    fn snapshot(&self, kind: EntityKind, id: EntityId) -> Result<SyncChange, TransportError>;
    fn status(&self, owner: Option<&UserId>) -> Result<SyncStatus, TransportError>;
}

impl SyncTransport for SyncSession<'_> {
    fn pull(&self, peer: &PeerId, limit: u32) -> Result<PullResponse, TransportError> {
        SyncSession::pull(self, peer, Some(limit))
            .map_err(|err| TransportError::from_sync(SyncStage::Pull, err))
    }

    fn push(&self, peer: &PeerId, changes: &[SyncChange]) -> Result<PushResponse, TransportError> {
        SyncSession::push(self, peer, changes)
            .map_err(|err| TransportError::from_sync(SyncStage::Push, err))
    }

    fn snapshot(&self, kind: EntityKind, id: EntityId) -> Result<SyncChange, TransportError> {
        SyncSession::snapshot(self, kind, id)
            .map(|record| SyncChange::from(&record))
            .map_err(|err| TransportError::from_sync(SyncStage::Snapshot, err))
    }

    fn status(&self, owner: Option<&UserId>) -> Result<SyncStatus, TransportError> {
        SyncSession::status(self, owner)
            .map_err(|err| TransportError::from_sync(SyncStage::Status, err))
    }
}
