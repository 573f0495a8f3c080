//! Caller-driven sync cycle against one remote peer.
//!
//! # Responsibility
//! - Drain the remote's unseen records into the local replica, then offer
//!   local unseen records to the remote, in batches.
//! - Recover `target_missing` rejections once per change with a snapshot of
//!   the entity.
//!
//! # Invariants
//! - At most one cycle per remote peer runs at a time on one client.
//! - Cancellation is honored between batches; committed batches stay.
//! - Local records are marked delivered only after the remote answered for
//!   them.

use crate::model::change::{ChangeId, ChangeRecord};
use crate::model::identity::PeerId;
use crate::sync::conflict::ConflictReport;
use crate::sync::session::{SyncError, SyncResult, SyncSession};
use crate::sync::transport::SyncTransport;
use crate::sync::wire::{RejectReason, RejectedChange, SyncChange};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CycleReport {
    pub pulled: usize,
    /// Pulled records applied locally or recognized as already applied.
    pub applied: usize,
    pub pull_rejected: Vec<RejectedChange>,
    pub pushed: usize,
    pub push_accepted: usize,
    pub push_rejected: Vec<RejectedChange>,
    /// Conflicts detected on this replica while applying pulled records.
    pub local_conflicts: Vec<ConflictReport>,
    /// Conflicts the remote reported while applying pushed records.
    pub remote_conflicts: Vec<ConflictReport>,
    /// `target_missing` rejections repaired with a snapshot.
    pub recovered: usize,
    pub cancelled: bool,
    pub cache_degraded: bool,
    /// Whether both status checksums matched after the cycle. `None` when
    /// the cycle stopped early.
    pub converged: Option<bool>,
}

/// Drives sync cycles for one local replica.
pub struct SyncClient<'conn> {
    session: SyncSession<'conn>,
    local_peer: PeerId,
    running: Mutex<HashSet<PeerId>>,
}

impl<'conn> SyncClient<'conn> {
    pub fn new(session: SyncSession<'conn>) -> SyncResult<Self> {
        let local_peer = session.local_peer_id()?;
        Ok(Self::with_peer_id(session, local_peer))
    }

    /// Client that presents itself to remotes as `local_peer`.
    pub fn with_peer_id(session: SyncSession<'conn>, local_peer: PeerId) -> Self {
        Self {
            session,
            local_peer,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn session(&self) -> &SyncSession<'conn> {
        &self.session
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Runs one pull-then-push cycle against `remote_peer`.
    ///
    /// # Errors
    /// - [`SyncError::CycleInProgress`] when a cycle with this remote is
    ///   already running.
    /// - Transport and storage failures abort the cycle; batches committed
    ///   before the failure are kept.
    pub fn run_cycle(
        &self,
        remote_peer: &PeerId,
        transport: &dyn SyncTransport,
        cancel: Option<&AtomicBool>,
    ) -> SyncResult<CycleReport> {
        let _guard = CycleGuard::acquire(&self.running, remote_peer)?;
        info!(
            "event=sync_cycle module=sync status=start local_peer={} peer={}",
            self.local_peer, remote_peer
        );

        let mut report = CycleReport::default();
        let result = self
            .pull_phase(remote_peer, transport, cancel, &mut report)
            .and_then(|()| self.push_phase(remote_peer, transport, cancel, &mut report));
        if let Err(err) = result {
            warn!(
                "event=sync_cycle module=sync status=error peer={} code={} pulled={} pushed={}",
                remote_peer,
                err.code(),
                report.pulled,
                report.pushed
            );
            return Err(err);
        }

        if report.cancelled {
            info!(
                "event=sync_cycle module=sync status=cancelled peer={} pulled={} pushed={}",
                remote_peer, report.pulled, report.pushed
            );
            return Ok(report);
        }

        let local = self.session.status(None)?;
        let remote = transport.status(None)?;
        report.converged = Some(local.checksum == remote.checksum);
        info!(
            "event=sync_cycle module=sync status=ok peer={} pulled={} applied={} pushed={} accepted={} rejected={} conflicts={} recovered={} converged={}",
            remote_peer,
            report.pulled,
            report.applied,
            report.pushed,
            report.push_accepted,
            report.pull_rejected.len() + report.push_rejected.len(),
            report.local_conflicts.len() + report.remote_conflicts.len(),
            report.recovered,
            local.checksum == remote.checksum
        );
        Ok(report)
    }

    fn pull_phase(
        &self,
        remote_peer: &PeerId,
        transport: &dyn SyncTransport,
        cancel: Option<&AtomicBool>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let batch = self.session.config().cycle_batch();
        loop {
            if is_cancelled(cancel) {
                report.cancelled = true;
                return Ok(());
            }

            let page = transport.pull(&self.local_peer, batch)?;
            report.pulled += page.changes.len();

            let applied = self.session.push(remote_peer, &page.changes)?;
            report.applied += applied.accepted.len();
            report.local_conflicts.extend(applied.conflicts);
            report.cache_degraded |= applied.cache_degraded;

            for rejected in applied.rejected {
                let original = find_change(&page.changes, rejected.id.as_deref());
                match (rejected.reason, original) {
                    (RejectReason::TargetMissing, Some(original)) => {
                        if self.recover_pulled(remote_peer, transport, original, report)? {
                            report.recovered += 1;
                            report.applied += 1;
                        } else {
                            report.pull_rejected.push(rejected);
                        }
                    }
                    _ => report.pull_rejected.push(rejected),
                }
            }

            if !page.has_more {
                return Ok(());
            }
        }
    }

    /// Fetches the remote's snapshot of the missing entity, applies it, then
    /// reapplies `original`.
    fn recover_pulled(
        &self,
        remote_peer: &PeerId,
        transport: &dyn SyncTransport,
        original: &SyncChange,
        report: &mut CycleReport,
    ) -> SyncResult<bool> {
        let Ok(incoming) = original.validate() else {
            return Ok(false);
        };
        let snapshot = match transport.snapshot(incoming.entity_kind, incoming.entity_id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    "event=sync_recover module=sync status=skipped direction=pull peer={} change_id={} entity_id={} code={}",
                    remote_peer, incoming.change_id, incoming.entity_id, err.code
                );
                return Ok(false);
            }
        };

        let created = self.session.push(remote_peer, std::slice::from_ref(&snapshot))?;
        report.cache_degraded |= created.cache_degraded;
        if !created.rejected.is_empty() {
            return Ok(false);
        }
        let retried = self.session.push(remote_peer, std::slice::from_ref(original))?;
        report.local_conflicts.extend(retried.conflicts);
        report.cache_degraded |= retried.cache_degraded;
        Ok(retried.rejected.is_empty())
    }

    fn push_phase(
        &self,
        remote_peer: &PeerId,
        transport: &dyn SyncTransport,
        cancel: Option<&AtomicBool>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let batch = self.session.config().cycle_batch();
        let mut recovery_attempted: HashSet<ChangeId> = HashSet::new();
        loop {
            if is_cancelled(cancel) {
                report.cancelled = true;
                return Ok(());
            }

            let page = self.session.outbound(remote_peer, Some(batch))?;
            if page.records.is_empty() {
                return Ok(());
            }
            let changes = page
                .records
                .iter()
                .map(SyncChange::from)
                .collect::<Vec<_>>();
            let response = transport.push(&self.local_peer, &changes)?;
            report.pushed += changes.len();
            report.push_accepted += response.accepted.len();
            report.remote_conflicts.extend(response.conflicts);

            let mut settled = parse_ids(&response.accepted);
            let mut retry_later = false;
            let mut stalled = false;
            for rejected in response.rejected {
                let record = rejected
                    .id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .and_then(|id| page.records.iter().find(|record| record.change_id == id));
                let Some(record) = record else {
                    report.push_rejected.push(rejected);
                    continue;
                };

                match rejected.reason {
                    RejectReason::TargetMissing
                        if recovery_attempted.insert(record.change_id) =>
                    {
                        if self.recover_pushed(remote_peer, transport, record)? {
                            report.recovered += 1;
                            retry_later = true;
                        } else {
                            settled.push(record.change_id);
                            report.push_rejected.push(rejected);
                        }
                    }
                    RejectReason::StorageFailure => {
                        stalled = true;
                        report.push_rejected.push(rejected);
                    }
                    _ => {
                        // Permanent for this remote; stop offering it.
                        settled.push(record.change_id);
                        report.push_rejected.push(rejected);
                    }
                }
            }

            let marked = self.session.mark_delivered(remote_peer, &settled)?;
            if stalled || (marked == 0 && !retry_later) {
                return Ok(());
            }
        }
    }

    /// Pushes a snapshot of the entity `record` targets, so the remote can
    /// accept `record` on the next batch.
    fn recover_pushed(
        &self,
        remote_peer: &PeerId,
        transport: &dyn SyncTransport,
        record: &ChangeRecord,
    ) -> SyncResult<bool> {
        let snapshot = match self.session.snapshot(record.entity_kind, record.entity_id) {
            Ok(snapshot) => snapshot,
            Err(SyncError::EntityNotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        let response = transport.push(&self.local_peer, &[SyncChange::from(&snapshot)])?;
        let recovered = response.rejected.is_empty();
        if !recovered {
            warn!(
                "event=sync_recover module=sync status=failed direction=push peer={} change_id={} entity_id={}",
                remote_peer, record.change_id, record.entity_id
            );
        }
        Ok(recovered)
    }
}

struct CycleGuard<'a> {
    running: &'a Mutex<HashSet<PeerId>>,
    peer: PeerId,
}

impl<'a> CycleGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<PeerId>>, peer: &PeerId) -> SyncResult<Self> {
        let mut set = running.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(peer.clone()) {
            warn!(
                "event=sync_cycle module=sync status=rejected reason=cycle_in_progress peer={}",
                peer
            );
            return Err(SyncError::CycleInProgress(peer.clone()));
        }
        Ok(Self {
            running,
            peer: peer.clone(),
        })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::SeqCst))
}

fn find_change<'a>(changes: &'a [SyncChange], id: Option<&str>) -> Option<&'a SyncChange> {
    let id = id?;
    changes
        .iter()
        .find(|change| change.change_id.as_deref() == Some(id))
}

fn parse_ids(ids: &[String]) -> Vec<ChangeId> {
    ids.iter()
        .filter_map(|id| Uuid::parse_str(id).ok())
        .collect()
}
