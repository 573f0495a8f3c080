use notesync_core::db::open_db_in_memory;
use notesync_core::{
    CategoryService, EntityId, EntityKind, EntityStore, NoteDraft, NoteService, PeerId,
    PullResponse, PushResponse, RejectReason, SyncChange, SyncClient, SyncConfig, SyncError,
    SyncSession, SyncStage, SyncStatus, SyncTransport, TransportError, UserId,
};
use rusqlite::Connection;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};

fn peer(id: &str) -> PeerId {
    PeerId::parse(id).unwrap()
}

fn session(conn: &Connection) -> SyncSession<'_> {
    SyncSession::new(EntityStore::durable_only(conn), None, SyncConfig::default())
}

fn client<'conn>(conn: &'conn Connection, id: &str) -> SyncClient<'conn> {
    SyncClient::with_peer_id(session(conn), peer(id))
}

fn create_notes(session: &SyncSession<'_>, titles: &[&str]) -> Vec<EntityId> {
    let notes = NoteService::new(session);
    titles
        .iter()
        .map(|title| notes.create_note(NoteDraft::new(*title, "")).unwrap().value.id)
        .collect()
}

#[test]
fn one_cycle_converges_two_peers() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = session(&conn_b);

    create_notes(a.session(), &["a1", "a2"]);
    CategoryService::new(a.session())
        .create_category("inbox", Some("#00ff00"))
        .unwrap();
    create_notes(&b, &["b1"]);

    let report = a.run_cycle(&peer("peer-b"), &b, None).unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.pushed, 3);
    assert_eq!(report.push_accepted, 3);
    assert!(report.pull_rejected.is_empty());
    assert!(report.push_rejected.is_empty());
    assert!(!report.cancelled);
    assert_eq!(report.converged, Some(true));

    let status = b.status(None).unwrap();
    assert_eq!(status.note_count, 3);
    assert_eq!(status.category_count, 1);

    let again = a.run_cycle(&peer("peer-b"), &b, None).unwrap();
    assert_eq!(again.pulled, 0);
    assert_eq!(again.pushed, 0);
    assert_eq!(again.converged, Some(true));
}

#[test]
fn cycles_page_through_large_backlogs() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = SyncClient::with_peer_id(
        SyncSession::new(
            EntityStore::durable_only(&conn_a),
            None,
            SyncConfig {
                cycle_batch_size: 2,
                ..SyncConfig::default()
            },
        ),
        peer("peer-a"),
    );
    let b = session(&conn_b);
    create_notes(a.session(), &["1", "2", "3", "4", "5"]);
    create_notes(&b, &["6", "7", "8"]);

    let report = a.run_cycle(&peer("peer-b"), &b, None).unwrap();
    assert_eq!(report.pulled, 3);
    assert_eq!(report.pushed, 5);
    assert_eq!(report.converged, Some(true));
    assert_eq!(b.status(None).unwrap().note_count, 8);
}

#[test]
fn three_peers_converge_through_relays() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let conn_c = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = client(&conn_b, "peer-b");
    let c = client(&conn_c, "peer-c");
    let remote_a = session(&conn_a);
    let remote_b = session(&conn_b);
    let remote_c = session(&conn_c);

    let a_notes = create_notes(a.session(), &["from a"]);
    create_notes(b.session(), &["from b"]);
    let c_notes = create_notes(c.session(), &["from c", "also c"]);

    a.run_cycle(&peer("peer-b"), &remote_b, None).unwrap();
    b.run_cycle(&peer("peer-c"), &remote_c, None).unwrap();

    // Each peer only edits what it created, so nothing races.
    NoteService::new(a.session())
        .update_note(a_notes[0], NoteDraft::new("from a, edited", "more"))
        .unwrap();
    NoteService::new(c.session()).delete_note(c_notes[1]).unwrap();

    c.run_cycle(&peer("peer-a"), &remote_a, None).unwrap();
    a.run_cycle(&peer("peer-b"), &remote_b, None).unwrap();
    let last = b.run_cycle(&peer("peer-c"), &remote_c, None).unwrap();
    assert_eq!(last.converged, Some(true));

    let checksums = [&remote_a, &remote_b, &remote_c]
        .iter()
        .map(|replica| replica.status(None).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(checksums[0], checksums[1]);
    assert_eq!(checksums[1], checksums[2]);
    assert_eq!(checksums[0].note_count, 3);

    for replica in [&remote_a, &remote_b, &remote_c] {
        assert!(replica.list_conflicts(true).unwrap().is_empty());
        let edited = NoteService::new(replica)
            .get_note(a_notes[0])
            .unwrap()
            .unwrap();
        assert_eq!(edited.body, "more");
    }
}

#[test]
fn cancelled_cycle_stops_before_the_next_batch() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = session(&conn_b);
    create_notes(&b, &["waiting"]);

    let cancel = AtomicBool::new(true);
    let report = a.run_cycle(&peer("peer-b"), &b, Some(&cancel)).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.pulled, 0);
    assert_eq!(report.converged, None);
    assert_eq!(a.session().status(None).unwrap().note_count, 0);
}

/// Raises the cancel flag while serving the first pull.
struct CancelDuringPull<'a> {
    inner: &'a SyncSession<'a>,
    cancel: &'a AtomicBool,
}

impl SyncTransport for CancelDuringPull<'_> {
    fn pull(&self, peer: &PeerId, limit: u32) -> Result<PullResponse, TransportError> {
        self.cancel.store(true, Ordering::SeqCst);
        SyncTransport::pull(self.inner, peer, limit)
    }

    fn push(&self, peer: &PeerId, changes: &[SyncChange]) -> Result<PushResponse, TransportError> {
        SyncTransport::push(self.inner, peer, changes)
    }

    fn snapshot(&self, kind: EntityKind, id: EntityId) -> Result<SyncChange, TransportError> {
        SyncTransport::snapshot(self.inner, kind, id)
    }

    fn status(&self, owner: Option<&UserId>) -> Result<SyncStatus, TransportError> {
        SyncTransport::status(self.inner, owner)
    }
}

#[test]
fn cancellation_keeps_committed_batches() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = SyncClient::with_peer_id(
        SyncSession::new(
            EntityStore::durable_only(&conn_a),
            None,
            SyncConfig {
                cycle_batch_size: 1,
                ..SyncConfig::default()
            },
        ),
        peer("peer-a"),
    );
    let b = session(&conn_b);
    create_notes(&b, &["first", "second"]);

    let cancel = AtomicBool::new(false);
    let transport = CancelDuringPull {
        inner: &b,
        cancel: &cancel,
    };
    let report = a
        .run_cycle(&peer("peer-b"), &transport, Some(&cancel))
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.pulled, 1);
    assert_eq!(report.pushed, 0);
    assert_eq!(a.session().status(None).unwrap().note_count, 1);

    cancel.store(false, Ordering::SeqCst);
    let resumed = a.run_cycle(&peer("peer-b"), &b, Some(&cancel)).unwrap();
    assert_eq!(resumed.pulled, 1);
    assert_eq!(resumed.converged, Some(true));
}

/// Tries to start a second cycle with the same remote from inside the first.
struct Reentrant<'a> {
    inner: &'a SyncSession<'a>,
    client: &'a SyncClient<'a>,
    remote_peer: PeerId,
    nested_error: RefCell<Option<String>>,
}

impl SyncTransport for Reentrant<'_> {
    fn pull(&self, peer: &PeerId, limit: u32) -> Result<PullResponse, TransportError> {
        if self.nested_error.borrow().is_none() {
            let nested = self.client.run_cycle(&self.remote_peer, self, None);
            let code = match nested {
                Err(err) => err.code().to_string(),
                Ok(_) => "started".to_string(),
            };
            *self.nested_error.borrow_mut() = Some(code);
        }
        SyncTransport::pull(self.inner, peer, limit)
    }

    fn push(&self, peer: &PeerId, changes: &[SyncChange]) -> Result<PushResponse, TransportError> {
        SyncTransport::push(self.inner, peer, changes)
    }

    fn snapshot(&self, kind: EntityKind, id: EntityId) -> Result<SyncChange, TransportError> {
        SyncTransport::snapshot(self.inner, kind, id)
    }

    fn status(&self, owner: Option<&UserId>) -> Result<SyncStatus, TransportError> {
        SyncTransport::status(self.inner, owner)
    }
}

#[test]
fn second_cycle_with_the_same_peer_is_refused() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = session(&conn_b);
    create_notes(&b, &["one"]);

    let transport = Reentrant {
        inner: &b,
        client: &a,
        remote_peer: peer("peer-b"),
        nested_error: RefCell::new(None),
    };
    let report = a.run_cycle(&peer("peer-b"), &transport, None).unwrap();
    assert_eq!(report.converged, Some(true));
    assert_eq!(
        transport.nested_error.borrow().as_deref(),
        Some("cycle_in_progress")
    );

    // The guard is released once the first cycle returns.
    assert!(a.run_cycle(&peer("peer-b"), &b, None).is_ok());
}

struct Unreachable;

impl SyncTransport for Unreachable {
    fn pull(&self, _peer: &PeerId, _limit: u32) -> Result<PullResponse, TransportError> {
        Err(TransportError::new(
            SyncStage::Pull,
            "unreachable",
            "peer did not answer",
            true,
        ))
    }

    fn push(&self, _peer: &PeerId, _changes: &[SyncChange]) -> Result<PushResponse, TransportError> {
        Err(TransportError::new(SyncStage::Push, "unreachable", "", true))
    }

    fn snapshot(&self, _kind: EntityKind, _id: EntityId) -> Result<SyncChange, TransportError> {
        Err(TransportError::new(SyncStage::Snapshot, "unreachable", "", true))
    }

    fn status(&self, _owner: Option<&UserId>) -> Result<SyncStatus, TransportError> {
        Err(TransportError::new(SyncStage::Status, "unreachable", "", true))
    }
}

#[test]
fn transport_failure_aborts_the_cycle() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");

    let err = a
        .run_cycle(&peer("peer-b"), &Unreachable, None)
        .unwrap_err();
    match err {
        SyncError::Transport(inner) => {
            assert_eq!(inner.stage, SyncStage::Pull);
            assert_eq!(inner.code, "unreachable");
            assert!(inner.retryable);
        }
        other => panic!("unexpected error: {other}"),
    }

    let b = session(&conn_b);
    assert!(a.run_cycle(&peer("peer-b"), &b, None).is_ok());
}

#[test]
fn push_side_target_missing_is_repaired_with_a_snapshot() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = session(&conn_b);

    let notes = NoteService::new(a.session());
    let created = notes.create_note(NoteDraft::new("lost", "")).unwrap();
    let id = created.value.id;
    notes.update_note(id, NoteDraft::new("found", "")).unwrap();
    // Pretend the create reached peer-b and was lost there.
    a.session()
        .mark_delivered(&peer("peer-b"), &[created.record.unwrap().change_id])
        .unwrap();

    let report = a.run_cycle(&peer("peer-b"), &b, None).unwrap();
    assert_eq!(report.recovered, 1);
    assert!(report.push_rejected.is_empty());
    assert_eq!(report.push_accepted, 1);
    assert_eq!(report.converged, Some(true));
    assert_eq!(
        NoteService::new(&b).get_note(id).unwrap().unwrap().title,
        "found"
    );
}

#[test]
fn pull_side_target_missing_is_repaired_with_a_snapshot() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = session(&conn_b);

    let notes = NoteService::new(&b);
    let created = notes.create_note(NoteDraft::new("lost", "")).unwrap();
    let id = created.value.id;
    notes.update_note(id, NoteDraft::new("found", "")).unwrap();
    b.mark_delivered(&peer("peer-a"), &[created.record.unwrap().change_id])
        .unwrap();

    let report = a.run_cycle(&peer("peer-b"), &b, None).unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.applied, 1);
    assert!(report.pull_rejected.is_empty());
    assert_eq!(report.pushed, 0);
    assert_eq!(report.converged, Some(true));
    assert_eq!(
        NoteService::new(a.session())
            .get_note(id)
            .unwrap()
            .unwrap()
            .title,
        "found"
    );
}

#[test]
fn unrecoverable_target_missing_is_reported() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = client(&conn_a, "peer-a");
    let b = session(&conn_b);

    let notes = NoteService::new(&b);
    let created = notes.create_note(NoteDraft::new("short lived", "")).unwrap();
    let id = created.value.id;
    notes.update_note(id, NoteDraft::new("edited", "")).unwrap();
    notes.delete_note(id).unwrap();
    b.mark_delivered(&peer("peer-a"), &[created.record.unwrap().change_id])
        .unwrap();

    let report = a.run_cycle(&peer("peer-b"), &b, None).unwrap();
    assert_eq!(report.pulled, 2);
    assert_eq!(report.recovered, 0);
    let reasons = report
        .pull_rejected
        .iter()
        .map(|rejected| rejected.reason)
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![RejectReason::TargetMissing, RejectReason::TargetMissing]
    );
    // Neither side shows the entity, so the visible state still agrees.
    assert_eq!(report.converged, Some(true));
}

#[test]
fn client_without_explicit_id_uses_the_stored_peer_id() {
    let conn = open_db_in_memory().unwrap();
    let stored = session(&conn).local_peer_id().unwrap();
    let client = SyncClient::new(session(&conn)).unwrap();
    assert_eq!(client.local_peer(), &stored);
}
