use notesync_core::db::open_db_in_memory;
use notesync_core::{
    note_fields, ChangeOperation, Entity, EntityKind, EntityStore, NoteDraft, NoteService,
    PeerId, RejectReason, StreamCursor, SyncChange, SyncConfig, SyncError, SyncSession, UserId,
};
use rusqlite::Connection;
use serde_json::json;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

fn peer(id: &str) -> PeerId {
    PeerId::parse(id).unwrap()
}

fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

fn session(conn: &Connection) -> SyncSession<'_> {
    SyncSession::new(EntityStore::durable_only(conn), None, SyncConfig::default())
}

fn session_as<'conn>(conn: &'conn Connection, caller: &str) -> SyncSession<'conn> {
    SyncSession::new(
        EntityStore::durable_only(conn),
        Some(user(caller)),
        SyncConfig::default(),
    )
}

fn note_create(entity_id: Uuid, title: &str, owner: Option<&str>) -> SyncChange {
    SyncChange {
        change_id: Some(Uuid::new_v4().to_string()),
        entity_kind: "note".to_string(),
        entity_id: Some(entity_id.to_string()),
        operation: "create".to_string(),
        fragment: Some(json!({ "mask": note_fields::TITLE, "fields": { "title": title } })),
        owner_id: owner.map(str::to_string),
        authored_at: 1,
    }
}

fn title_update(entity_id: Uuid, title: &str) -> SyncChange {
    SyncChange {
        operation: "update".to_string(),
        ..note_create(entity_id, title, None)
    }
}

/// Delivery times are compared with authoring times in milliseconds; keep
/// concurrent edits strictly older than the exchange that follows them.
fn settle_clock() {
    thread::sleep(Duration::from_millis(5));
}

/// Pulls everything `to` has not seen from `from` and applies it on `to`.
fn exchange(from: &SyncSession<'_>, from_peer: &str, to: &SyncSession<'_>, to_peer: &str) {
    loop {
        let page = from.pull(&peer(to_peer), Some(50)).unwrap();
        let applied = to.push(&peer(from_peer), &page.changes).unwrap();
        assert!(applied.rejected.is_empty(), "{:?}", applied.rejected);
        if !page.has_more {
            break;
        }
    }
}

#[test]
fn create_then_update_reaches_the_other_peer() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let notes_a = NoteService::new(&a);

    let created = notes_a
        .create_note(NoteDraft::new("groceries", "milk"))
        .unwrap();
    let id = created.value.id;
    notes_a
        .update_note(id, NoteDraft::new("groceries", "milk, eggs"))
        .unwrap();

    let pulled = a.pull(&peer("peer-b"), None).unwrap();
    assert!(!pulled.has_more);
    let operations = pulled
        .changes
        .iter()
        .map(|change| change.operation.as_str())
        .collect::<Vec<_>>();
    assert_eq!(operations, vec!["create", "update"]);
    assert_eq!(pulled.changes[1].fragment.as_ref().unwrap()["mask"], json!(note_fields::BODY));

    let applied = b.push(&peer("peer-a"), &pulled.changes).unwrap();
    assert_eq!(applied.accepted.len(), 2);
    assert!(applied.rejected.is_empty());
    assert!(applied.conflicts.is_empty());

    let replica = NoteService::new(&b).get_note(id).unwrap().unwrap();
    assert_eq!(replica.title, "groceries");
    assert_eq!(replica.body, "milk, eggs");
    assert_eq!(
        a.status(None).unwrap().checksum,
        b.status(None).unwrap().checksum
    );

    let second = a.pull(&peer("peer-b"), None).unwrap();
    assert!(second.changes.is_empty());
}

#[test]
fn received_changes_keep_their_id_and_are_not_echoed_back() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let created = NoteService::new(&a)
        .create_note(NoteDraft::new("hello", ""))
        .unwrap();
    let original = created.record.unwrap();

    exchange(&a, "peer-a", &b, "peer-b");

    let held = b.changes_since(None, 0, None).unwrap().records;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].change_id, original.change_id);
    assert_eq!(held[0].operation, ChangeOperation::ReceivedViaSync);
    assert_eq!(held[0].relayed_operation, Some(ChangeOperation::Create));
    assert_eq!(held[0].source_peer, Some(peer("peer-a")));
    assert_eq!(held[0].authored_at, original.authored_at);

    assert!(b.pull(&peer("peer-a"), None).unwrap().changes.is_empty());
    // Relayed onwards with the effective operation.
    let relayed = b.pull(&peer("peer-c"), None).unwrap();
    assert_eq!(relayed.changes.len(), 1);
    assert_eq!(relayed.changes[0].operation, "create");
    assert_eq!(
        relayed.changes[0].change_id.as_deref(),
        Some(original.change_id.to_string().as_str())
    );
}

#[test]
fn duplicate_push_is_accepted_without_reapplying() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    NoteService::new(&a)
        .create_note(NoteDraft::new("once", ""))
        .unwrap();
    let pulled = a.pull(&peer("peer-b"), None).unwrap();

    let first = b.push(&peer("peer-a"), &pulled.changes).unwrap();
    let second = b.push(&peer("peer-a"), &pulled.changes).unwrap();
    assert_eq!(first.accepted, second.accepted);
    assert!(second.rejected.is_empty());
    assert_eq!(b.changes_since(None, 0, None).unwrap().records.len(), 1);
    assert_eq!(b.status(None).unwrap().note_count, 1);
}

#[test]
fn pull_pages_in_append_order() {
    let conn = open_db_in_memory().unwrap();
    let a = session(&conn);
    let notes = NoteService::new(&a);
    for index in 0..5 {
        notes
            .create_note(NoteDraft::new(format!("note {index}"), ""))
            .unwrap();
    }
    let expected = a
        .changes_since(None, 0, None)
        .unwrap()
        .records
        .iter()
        .map(|record| record.change_id.to_string())
        .collect::<Vec<_>>();

    let mut seen = Vec::new();
    let mut pages = Vec::new();
    loop {
        let page = a.pull(&peer("peer-b"), Some(2)).unwrap();
        pages.push((page.changes.len(), page.has_more));
        seen.extend(page.changes.into_iter().filter_map(|change| change.change_id));
        if !page.has_more {
            break;
        }
    }
    assert_eq!(pages, vec![(2, true), (2, true), (1, false)]);
    assert_eq!(seen, expected);
}

#[test]
fn push_rejects_items_one_by_one() {
    let conn = open_db_in_memory().unwrap();
    let b = session(&conn);
    let valid = note_create(Uuid::new_v4(), "fine", None);
    let missing_id = SyncChange {
        change_id: None,
        ..note_create(Uuid::new_v4(), "no id", None)
    };
    let bad_kind = SyncChange {
        entity_kind: "task".to_string(),
        ..note_create(Uuid::new_v4(), "bad kind", None)
    };
    let bad_fragment = SyncChange {
        fragment: Some(json!({ "mask": note_fields::TITLE, "fields": { "title": 42 } })),
        ..note_create(Uuid::new_v4(), "typed", None)
    };

    let response = b
        .push(
            &peer("peer-a"),
            &[missing_id, bad_kind, valid.clone(), bad_fragment],
        )
        .unwrap();
    assert_eq!(response.accepted, vec![valid.change_id.unwrap()]);
    let reasons = response
        .rejected
        .iter()
        .map(|rejected| rejected.reason)
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![
            RejectReason::MissingChangeId,
            RejectReason::InvalidEntityKind,
            RejectReason::MalformedFragment,
        ]
    );
    assert_eq!(response.rejected[0].id, None);
    assert_eq!(b.status(None).unwrap().note_count, 1);
}

#[test]
fn update_for_unknown_entity_is_rejected_and_not_recorded() {
    let conn = open_db_in_memory().unwrap();
    let b = session(&conn);
    let id = Uuid::new_v4();
    let update = title_update(id, "early");

    let response = b.push(&peer("peer-a"), &[update.clone()]).unwrap();
    assert_eq!(response.rejected.len(), 1);
    assert_eq!(response.rejected[0].reason, RejectReason::TargetMissing);
    assert!(response.rejected[0].reason.is_retryable());
    assert!(b.changes_since(None, 0, None).unwrap().records.is_empty());

    // Once the create arrives, the same update is accepted.
    let response = b
        .push(&peer("peer-a"), &[note_create(id, "first", None), update])
        .unwrap();
    assert_eq!(response.accepted.len(), 2);
    assert_eq!(
        NoteService::new(&b).get_note(id).unwrap().unwrap().title,
        "early"
    );
}

#[test]
fn create_for_present_entity_is_a_no_op() {
    let conn = open_db_in_memory().unwrap();
    let b = session(&conn);
    let id = Uuid::new_v4();
    b.push(&peer("peer-a"), &[note_create(id, "first", None)])
        .unwrap();

    let response = b
        .push(&peer("peer-c"), &[note_create(id, "second", None)])
        .unwrap();
    assert_eq!(response.accepted.len(), 1);
    assert_eq!(b.changes_since(None, 0, None).unwrap().records.len(), 1);
    assert_eq!(
        NoteService::new(&b).get_note(id).unwrap().unwrap().title,
        "first"
    );
}

#[test]
fn concurrent_updates_to_the_same_field_are_reported() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("draft", "body"))
        .unwrap()
        .value
        .id;
    exchange(&a, "peer-a", &b, "peer-b");

    NoteService::new(&a)
        .update_note(id, NoteDraft::new("from a", "body"))
        .unwrap();
    NoteService::new(&b)
        .update_note(id, NoteDraft::new("from b", "body"))
        .unwrap();
    settle_clock();

    let pulled = a.pull(&peer("peer-b"), None).unwrap();
    let response = b.push(&peer("peer-a"), &pulled.changes).unwrap();
    assert_eq!(response.accepted.len(), 1);
    assert_eq!(response.conflicts.len(), 1);

    let conflict = &response.conflicts[0];
    assert_eq!(conflict.entity_id, id);
    assert_eq!(conflict.overlap_mask, note_fields::TITLE);
    assert_eq!(conflict.remote_peer, peer("peer-a"));
    match (&conflict.local_snapshot, &conflict.remote_snapshot) {
        (Entity::Note(local), Entity::Note(remote)) => {
            assert_eq!(local.title, "from b");
            assert_eq!(remote.title, "from a");
        }
        other => panic!("unexpected snapshots: {other:?}"),
    }

    // The conflicting field is withheld; the local value stays.
    assert_eq!(
        NoteService::new(&b).get_note(id).unwrap().unwrap().title,
        "from b"
    );
    assert_eq!(b.list_conflicts(false).unwrap(), response.conflicts);

    // The other side sees the race too.
    let pulled = b.pull(&peer("peer-a"), None).unwrap();
    let response = a.push(&peer("peer-b"), &pulled.changes).unwrap();
    assert_eq!(response.conflicts.len(), 1);
    assert_eq!(
        NoteService::new(&a).get_note(id).unwrap().unwrap().title,
        "from a"
    );
}

#[test]
fn concurrent_updates_to_different_fields_merge() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("draft", "body"))
        .unwrap()
        .value
        .id;
    exchange(&a, "peer-a", &b, "peer-b");

    NoteService::new(&a)
        .update_note(id, NoteDraft::new("retitled", "body"))
        .unwrap();
    NoteService::new(&b)
        .update_note(id, NoteDraft::new("draft", "rewritten"))
        .unwrap();

    exchange(&a, "peer-a", &b, "peer-b");
    exchange(&b, "peer-b", &a, "peer-a");

    for replica in [&a, &b] {
        let note = NoteService::new(replica).get_note(id).unwrap().unwrap();
        assert_eq!(note.title, "retitled");
        assert_eq!(note.body, "rewritten");
        assert!(replica.list_conflicts(true).unwrap().is_empty());
    }
    assert_eq!(
        a.status(None).unwrap().checksum,
        b.status(None).unwrap().checksum
    );
}

#[test]
fn sequential_edits_across_peers_do_not_conflict() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("v1", ""))
        .unwrap()
        .value
        .id;
    NoteService::new(&a)
        .update_note(id, NoteDraft::new("v2", ""))
        .unwrap();
    exchange(&a, "peer-a", &b, "peer-b");

    NoteService::new(&b)
        .update_note(id, NoteDraft::new("v3", ""))
        .unwrap();
    exchange(&b, "peer-b", &a, "peer-a");

    assert!(a.list_conflicts(true).unwrap().is_empty());
    assert_eq!(
        NoteService::new(&a).get_note(id).unwrap().unwrap().title,
        "v3"
    );
}

#[test]
fn delete_wins_over_a_concurrent_update() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("shared", ""))
        .unwrap()
        .value
        .id;
    exchange(&a, "peer-a", &b, "peer-b");

    NoteService::new(&a).delete_note(id).unwrap();
    NoteService::new(&b)
        .update_note(id, NoteDraft::new("edited", ""))
        .unwrap();
    settle_clock();

    exchange(&a, "peer-a", &b, "peer-b");
    exchange(&b, "peer-b", &a, "peer-a");

    for replica in [&a, &b] {
        assert!(NoteService::new(replica).get_note(id).unwrap().is_none());
        assert_eq!(replica.list_conflicts(false).unwrap().len(), 1);
    }
    assert_eq!(
        a.status(None).unwrap().checksum,
        b.status(None).unwrap().checksum
    );
}

#[test]
fn concurrent_deletes_do_not_conflict() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("gone", ""))
        .unwrap()
        .value
        .id;
    exchange(&a, "peer-a", &b, "peer-b");

    NoteService::new(&a).delete_note(id).unwrap();
    NoteService::new(&b).delete_note(id).unwrap();
    exchange(&a, "peer-a", &b, "peer-b");
    exchange(&b, "peer-b", &a, "peer-a");

    assert!(a.list_conflicts(true).unwrap().is_empty());
    assert!(b.list_conflicts(true).unwrap().is_empty());
    assert_eq!(a.status(None).unwrap().note_count, 0);
}

#[test]
fn conflicts_can_be_resolved_once() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("draft", ""))
        .unwrap()
        .value
        .id;
    exchange(&a, "peer-a", &b, "peer-b");
    NoteService::new(&a)
        .update_note(id, NoteDraft::new("a", ""))
        .unwrap();
    NoteService::new(&b)
        .update_note(id, NoteDraft::new("b", ""))
        .unwrap();
    exchange(&a, "peer-a", &b, "peer-b");

    let open = b.list_conflicts(false).unwrap();
    assert_eq!(open.len(), 1);
    let conflict_id = open[0].conflict_id;

    assert!(b.resolve_conflict(conflict_id).unwrap());
    assert!(!b.resolve_conflict(conflict_id).unwrap());
    assert!(!b.resolve_conflict(Uuid::new_v4()).unwrap());
    assert!(b.list_conflicts(false).unwrap().is_empty());

    let all = b.list_conflicts(true).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].resolved_at.is_some());
}

#[test]
fn disabled_detection_merges_without_reporting() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = SyncSession::new(
        EntityStore::durable_only(&conn_b),
        None,
        SyncConfig {
            detect_conflicts: false,
            ..SyncConfig::default()
        },
    );
    let id = NoteService::new(&a)
        .create_note(NoteDraft::new("draft", ""))
        .unwrap()
        .value
        .id;
    exchange(&a, "peer-a", &b, "peer-b");
    NoteService::new(&a)
        .update_note(id, NoteDraft::new("a", ""))
        .unwrap();
    NoteService::new(&b)
        .update_note(id, NoteDraft::new("b", ""))
        .unwrap();

    let pulled = a.pull(&peer("peer-b"), None).unwrap();
    let response = b.push(&peer("peer-a"), &pulled.changes).unwrap();
    assert!(response.conflicts.is_empty());
    assert_eq!(
        NoteService::new(&b).get_note(id).unwrap().unwrap().title,
        "a"
    );
}

#[test]
fn authenticated_push_stores_under_the_caller() {
    let conn = open_db_in_memory().unwrap();
    let alice = session_as(&conn, "alice");
    let id = Uuid::new_v4();

    let response = alice
        .push(&peer("peer-a"), &[note_create(id, "mine", Some("mallory"))])
        .unwrap();
    assert_eq!(response.accepted.len(), 1);

    let note = NoteService::new(&alice).get_note(id).unwrap().unwrap();
    assert_eq!(note.owner_id, Some(user("alice")));
    let held = alice.changes_since(None, 0, None).unwrap().records;
    assert_eq!(held[0].owner_id, Some(user("alice")));
}

#[test]
fn unparseable_claimed_owner_is_rewritten_for_an_authenticated_caller() {
    let conn = open_db_in_memory().unwrap();
    let alice = session_as(&conn, "alice");
    let long_id = Uuid::new_v4();
    let blank_id = Uuid::new_v4();
    let too_long = "x".repeat(300);

    let response = alice
        .push(
            &peer("peer-a"),
            &[
                note_create(long_id, "long", Some(too_long.as_str())),
                note_create(blank_id, "blank", Some("")),
            ],
        )
        .unwrap();
    assert!(response.rejected.is_empty(), "{:?}", response.rejected);
    assert_eq!(response.accepted.len(), 2);

    let notes = NoteService::new(&alice);
    for id in [long_id, blank_id] {
        let note = notes.get_note(id).unwrap().unwrap();
        assert_eq!(note.owner_id, Some(user("alice")));
    }
}

#[test]
fn unparseable_claimed_owner_is_rejected_without_a_caller() {
    let conn = open_db_in_memory().unwrap();
    let single = session(&conn);

    let response = single
        .push(&peer("peer-a"), &[note_create(Uuid::new_v4(), "x", Some(""))])
        .unwrap();
    assert!(response.accepted.is_empty());
    assert_eq!(response.rejected[0].reason, RejectReason::InvalidOwner);
    assert_eq!(single.status(None).unwrap().note_count, 0);
}

#[test]
fn push_cannot_touch_another_owners_entity() {
    let conn = open_db_in_memory().unwrap();
    let alice = session_as(&conn, "alice");
    let bob = session_as(&conn, "bob");
    let id = NoteService::new(&bob)
        .create_note(NoteDraft::new("bob's", ""))
        .unwrap()
        .value
        .id;

    let response = alice
        .push(
            &peer("peer-a"),
            &[title_update(id, "hijacked"), title_update(Uuid::new_v4(), "nobody")],
        )
        .unwrap();
    assert_eq!(response.rejected.len(), 2);
    // Another owner's note is indistinguishable from one that does not exist.
    assert_eq!(response.rejected[0].reason, RejectReason::TargetMissing);
    assert_eq!(response.rejected[1].reason, RejectReason::TargetMissing);

    let taken = alice
        .push(&peer("peer-a"), &[note_create(id, "squat", None)])
        .unwrap();
    assert_eq!(taken.rejected[0].reason, RejectReason::OwnershipViolation);
    assert!(!taken.rejected[0].reason.is_retryable());
    assert_eq!(
        NoteService::new(&bob).get_note(id).unwrap().unwrap().title,
        "bob's"
    );
}

#[test]
fn reads_are_scoped_to_the_caller() {
    let conn = open_db_in_memory().unwrap();
    let alice = session_as(&conn, "alice");
    let bob = session_as(&conn, "bob");
    NoteService::new(&alice)
        .create_note(NoteDraft::new("alice 1", ""))
        .unwrap();
    NoteService::new(&bob)
        .create_note(NoteDraft::new("bob 1", ""))
        .unwrap();
    NoteService::new(&bob)
        .create_note(NoteDraft::new("bob 2", ""))
        .unwrap();

    let pulled = alice.pull(&peer("peer-x"), None).unwrap();
    assert_eq!(pulled.changes.len(), 1);
    assert_eq!(pulled.changes[0].owner_id.as_deref(), Some("alice"));

    // Asking for bob's data narrows to the caller instead.
    let status = alice.status(Some(&user("bob"))).unwrap();
    assert_eq!(status.note_count, 1);
    assert_eq!(status, alice.status(None).unwrap());
    assert_eq!(
        alice
            .changes_since(Some(&user("bob")), 0, None)
            .unwrap()
            .records
            .len(),
        1
    );

    // Bob's records were never shown to peer-x, so bob can still serve them.
    assert_eq!(bob.pull(&peer("peer-x"), None).unwrap().changes.len(), 2);

    let unscoped = session(&conn);
    assert_eq!(unscoped.status(None).unwrap().note_count, 3);
    assert_eq!(unscoped.status(Some(&user("bob"))).unwrap().note_count, 2);
}

#[test]
fn snapshot_carries_full_state_without_logging() {
    let conn_a = open_db_in_memory().unwrap();
    let conn_b = open_db_in_memory().unwrap();
    let a = session(&conn_a);
    let b = session(&conn_b);
    let notes = NoteService::new(&a);
    let id = notes
        .create_note(NoteDraft::new("snap", "shot"))
        .unwrap()
        .value
        .id;
    notes
        .update_note(
            id,
            NoteDraft {
                is_pinned: true,
                ..NoteDraft::new("snap", "shot")
            },
        )
        .unwrap();

    let snapshot = a.snapshot(EntityKind::Note, id).unwrap();
    assert_eq!(snapshot.operation, ChangeOperation::Create);
    assert_eq!(snapshot.local_seq, 0);
    assert_eq!(snapshot.fragment.as_ref().unwrap().mask, note_fields::ALL);
    assert_eq!(a.changes_since(None, 0, None).unwrap().records.len(), 2);

    let response = b
        .push(&peer("peer-a"), &[SyncChange::from(&snapshot)])
        .unwrap();
    assert_eq!(response.accepted.len(), 1);
    assert_eq!(
        a.status(None).unwrap().checksum,
        b.status(None).unwrap().checksum
    );

    notes.delete_note(id).unwrap();
    assert!(matches!(
        a.snapshot(EntityKind::Note, id).unwrap_err(),
        SyncError::EntityNotFound { .. }
    ));
    assert!(matches!(
        a.snapshot(EntityKind::Category, Uuid::new_v4()).unwrap_err(),
        SyncError::EntityNotFound { .. }
    ));
}

#[test]
fn snapshot_respects_ownership() {
    let conn = open_db_in_memory().unwrap();
    let bob = session_as(&conn, "bob");
    let id = NoteService::new(&bob)
        .create_note(NoteDraft::new("private", ""))
        .unwrap()
        .value
        .id;

    let alice = session_as(&conn, "alice");
    assert!(matches!(
        alice.snapshot(EntityKind::Note, id).unwrap_err(),
        SyncError::EntityNotFound { .. }
    ));
    assert!(bob.snapshot(EntityKind::Note, id).is_ok());
}

#[test]
fn status_checksum_ignores_tombstones_and_tracks_content() {
    let conn = open_db_in_memory().unwrap();
    let a = session(&conn);
    let empty = a.status(None).unwrap();
    assert_eq!(empty.note_count, 0);
    assert_eq!(empty.category_count, 0);

    let notes = NoteService::new(&a);
    let id = notes.create_note(NoteDraft::new("temp", "")).unwrap().value.id;
    let with_note = a.status(None).unwrap();
    assert_eq!(with_note.note_count, 1);
    assert_ne!(with_note.checksum, empty.checksum);

    notes.delete_note(id).unwrap();
    assert_eq!(a.status(None).unwrap(), empty);
}

#[test]
fn changes_since_uses_append_time() {
    let conn = open_db_in_memory().unwrap();
    let a = session(&conn);
    let notes = NoteService::new(&a);
    notes.create_note(NoteDraft::new("one", "")).unwrap();
    let last = notes
        .create_note(NoteDraft::new("two", ""))
        .unwrap()
        .record
        .unwrap();

    let all = a.changes_since(None, 0, None).unwrap().records;
    assert_eq!(all.len(), 2);
    assert!(all[0].local_seq < all[1].local_seq);
    assert!(a
        .changes_since(None, last.appended_at, None)
        .unwrap()
        .records
        .is_empty());
    assert_eq!(a.changes_since(None, 0, Some(1)).unwrap().records.len(), 1);
}

#[test]
fn changes_since_pages_through_every_record() {
    let conn = open_db_in_memory().unwrap();
    let a = session(&conn);
    let notes = NoteService::new(&a);
    let created = (0..20)
        .map(|i| {
            notes
                .create_note(NoteDraft::new(format!("note {i}"), ""))
                .unwrap()
                .record
                .unwrap()
                .change_id
        })
        .collect::<Vec<_>>();

    let mut page = a.changes_since(None, 0, Some(1)).unwrap();
    let mut seen = Vec::new();
    loop {
        seen.extend(page.records.iter().map(|record| record.change_id));
        if !page.has_more {
            break;
        }
        let cursor: StreamCursor = page.next_cursor().unwrap();
        page = a.changes_after(None, cursor, Some(1)).unwrap();
    }
    assert_eq!(seen, created);
}

#[test]
fn peers_register_on_first_contact() {
    let conn = open_db_in_memory().unwrap();
    let a = session(&conn);
    assert!(a.list_peers().unwrap().is_empty());

    a.pull(&peer("phone"), None).unwrap();
    a.push(&peer("laptop"), &[]).unwrap();
    a.pull(&peer("phone"), None).unwrap();

    let peers = a
        .list_peers()
        .unwrap()
        .into_iter()
        .map(|record| record.peer_id)
        .collect::<Vec<_>>();
    assert_eq!(peers, vec![peer("laptop"), peer("phone")]);

    let local = a.local_peer_id().unwrap();
    assert_eq!(a.local_peer_id().unwrap(), local);
}

#[test]
fn wire_shapes_use_camel_case() {
    let conn = open_db_in_memory().unwrap();
    let a = session(&conn);
    NoteService::new(&a)
        .create_note(NoteDraft::new("wire", ""))
        .unwrap();

    let pulled = a.pull(&peer("peer-b"), None).unwrap();
    let encoded = serde_json::to_value(&pulled).unwrap();
    assert_eq!(encoded["hasMore"], json!(false));
    let change = &encoded["changes"][0];
    assert_eq!(change["entityKind"], json!("note"));
    assert!(change["changeId"].is_string());
    assert!(change["authoredAt"].is_i64());

    let status = serde_json::to_value(a.status(None).unwrap()).unwrap();
    assert_eq!(status["noteCount"], json!(1));
    assert_eq!(status["categoryCount"], json!(0));
}
