//! Unified change stream over both change logs.
//!
//! # Responsibility
//! - Merge note and category records into one feed ordered by `local_seq`.
//! - Page the feed with a look-ahead row so callers learn `has_more`
//!   without a second query.
//!
//! # Invariants
//! - Ordering is the local append order, so an entity's create always
//!   precedes its later updates.
//! - Every read applies the caller's `OwnerScope`.

use crate::model::change::ChangeRecord;
use crate::model::entity::EntityKind;
use crate::model::identity::PeerId;
use crate::repo::entity_repo::{RepoError, RepoResult};
use crate::sync::change_log::{parse_change_row, table_name};
use crate::sync::scope::OwnerScope;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

/// One page of the unified stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamPage {
    pub records: Vec<ChangeRecord>,
    pub has_more: bool,
}

/// Position in the append-time feed: strictly after `appended_at`, or at
/// `appended_at` with a larger `local_seq`.
///
/// Appends within one millisecond share `appended_at`; `local_seq` breaks
/// the tie so no record is skipped across a page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    pub appended_at: i64,
    pub local_seq: i64,
}

impl StreamCursor {
    /// Everything appended strictly after `since_ms`.
    pub fn since(since_ms: i64) -> Self {
        Self {
            appended_at: since_ms,
            local_seq: i64::MAX,
        }
    }

    /// Everything after `record` in append-time order.
    pub fn after(record: &ChangeRecord) -> Self {
        Self {
            appended_at: record.appended_at,
            local_seq: record.local_seq,
        }
    }
}

impl StreamPage {
    /// Cursor continuing an append-time read after this page.
    pub fn next_cursor(&self) -> Option<StreamCursor> {
        self.records.last().map(StreamCursor::after)
    }
}

/// Which records a stream read selects.
enum StreamFilter<'a> {
    UnseenBy(&'a PeerId),
    AppendedAfter(StreamCursor),
}

impl StreamFilter<'_> {
    fn order_by(&self) -> &'static str {
        match self {
            Self::UnseenBy(_) => "local_seq ASC",
            Self::AppendedAfter(_) => "appended_at ASC, local_seq ASC",
        }
    }
}

/// Records `peer` has no delivery marker for, oldest first.
pub fn unseen_by_peer(
    conn: &Connection,
    peer: &PeerId,
    scope: &OwnerScope,
    limit: u32,
) -> RepoResult<StreamPage> {
    read_page(conn, StreamFilter::UnseenBy(peer), scope, limit)
}

/// Records appended after `cursor` (local clock), ordered by
/// `(appended_at, local_seq)`.
pub fn appended_since(
    conn: &Connection,
    scope: &OwnerScope,
    cursor: StreamCursor,
    limit: u32,
) -> RepoResult<StreamPage> {
    read_page(conn, StreamFilter::AppendedAfter(cursor), scope, limit)
}

fn read_page(
    conn: &Connection,
    filter: StreamFilter<'_>,
    scope: &OwnerScope,
    limit: u32,
) -> RepoResult<StreamPage> {
    let mut bind_values: Vec<Value> = Vec::new();
    let branches = EntityKind::ALL
        .iter()
        .map(|kind| branch_sql(*kind, &filter, scope, &mut bind_values))
        .collect::<Vec<_>>();

    let sql = format!(
        "SELECT * FROM ({}) ORDER BY {} LIMIT ?;",
        branches.join(" UNION ALL "),
        filter.order_by()
    );
    // One extra row tells whether another page exists.
    bind_values.push(Value::Integer(i64::from(limit) + 1));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let kind_text: String = row.get("entity_kind")?;
        let kind = EntityKind::parse(&kind_text).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid entity_kind `{kind_text}` in stream"))
        })?;
        records.push(parse_change_row(kind, row)?);
    }

    let has_more = records.len() > limit as usize;
    records.truncate(limit as usize);
    Ok(StreamPage { records, has_more })
}

fn branch_sql(
    kind: EntityKind,
    filter: &StreamFilter<'_>,
    scope: &OwnerScope,
    bind_values: &mut Vec<Value>,
) -> String {
    let mut sql = match filter {
        StreamFilter::UnseenBy(peer) => {
            bind_values.push(Value::Text(peer.as_str().to_string()));
            format!(
                "SELECT '{}' AS entity_kind, c.* FROM {} c
                 LEFT JOIN delivery_markers m
                    ON m.change_id = c.change_id AND m.peer_id = ?
                 WHERE m.change_id IS NULL",
                kind.as_str(),
                table_name(kind)
            )
        }
        StreamFilter::AppendedAfter(cursor) => {
            bind_values.push(Value::Integer(cursor.appended_at));
            bind_values.push(Value::Integer(cursor.appended_at));
            bind_values.push(Value::Integer(cursor.local_seq));
            format!(
                "SELECT '{}' AS entity_kind, c.* FROM {} c
                 WHERE (c.appended_at > ? OR (c.appended_at = ? AND c.local_seq > ?))",
                kind.as_str(),
                table_name(kind)
            )
        }
    };
    scope.push_sql_filter("c.owner_id", &mut sql, bind_values);
    sql
}

#[cfg(test)]
mod tests {
    use super::{appended_since, unseen_by_peer, StreamCursor};
    use crate::db::open_db_in_memory;
    use crate::model::change::ChangeOperation;
    use crate::model::entity::EntityKind;
    use crate::model::identity::{PeerId, UserId};
    use crate::sync::change_log::{append, NewChange};
    use crate::sync::delivery::mark_delivered;
    use crate::sync::scope::OwnerScope;
    use uuid::Uuid;

    fn delete(kind: EntityKind, owner: Option<&str>) -> NewChange {
        NewChange::local(
            kind,
            Uuid::new_v4(),
            ChangeOperation::Delete,
            None,
            owner.map(|value| UserId::parse(value).unwrap()),
            1,
        )
    }

    #[test]
    fn interleaves_kinds_in_append_order_and_pages() {
        let conn = open_db_in_memory().unwrap();
        let peer = PeerId::parse("phone").unwrap();
        let kinds = [
            EntityKind::Note,
            EntityKind::Category,
            EntityKind::Note,
            EntityKind::Category,
        ];
        let appended = kinds
            .iter()
            .map(|kind| append(&conn, delete(*kind, None)).unwrap())
            .collect::<Vec<_>>();

        let first = unseen_by_peer(&conn, &peer, &OwnerScope::All, 3).unwrap();
        assert!(first.has_more);
        assert_eq!(
            first.records.iter().map(|r| r.change_id).collect::<Vec<_>>(),
            appended[..3].iter().map(|r| r.change_id).collect::<Vec<_>>()
        );
        assert_eq!(first.records[1].entity_kind, EntityKind::Category);

        let ids = first.records.iter().map(|r| r.change_id).collect::<Vec<_>>();
        mark_delivered(&conn, &peer, &ids, 2).unwrap();

        let second = unseen_by_peer(&conn, &peer, &OwnerScope::All, 3).unwrap();
        assert!(!second.has_more);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].change_id, appended[3].change_id);
    }

    #[test]
    fn owner_scope_filters_both_kinds() {
        let conn = open_db_in_memory().unwrap();
        append(&conn, delete(EntityKind::Note, Some("alice"))).unwrap();
        append(&conn, delete(EntityKind::Category, Some("bob"))).unwrap();
        append(&conn, delete(EntityKind::Category, Some("alice"))).unwrap();

        let alice = OwnerScope::Owner(UserId::parse("alice").unwrap());
        let page = appended_since(&conn, &alice, StreamCursor::since(0), 10).unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page
            .records
            .iter()
            .all(|r| r.owner_id.as_ref().map(UserId::as_str) == Some("alice")));

        let all = appended_since(&conn, &OwnerScope::All, StreamCursor::since(0), 10).unwrap();
        assert_eq!(all.records.len(), 3);
    }

    #[test]
    fn append_time_cursor_does_not_skip_records_sharing_a_millisecond() {
        let conn = open_db_in_memory().unwrap();
        let appended = (0..6)
            .map(|i| {
                let kind = if i % 2 == 0 {
                    EntityKind::Note
                } else {
                    EntityKind::Category
                };
                append(&conn, delete(kind, None)).unwrap()
            })
            .collect::<Vec<_>>();

        let mut cursor = StreamCursor::since(0);
        let mut seen = Vec::new();
        loop {
            let page = appended_since(&conn, &OwnerScope::All, cursor, 1).unwrap();
            seen.extend(page.records.iter().map(|r| r.change_id));
            match page.next_cursor() {
                Some(next) if page.has_more => cursor = next,
                _ => break,
            }
        }
        assert_eq!(
            seen,
            appended.iter().map(|r| r.change_id).collect::<Vec<_>>()
        );
    }
}
