//! Entity repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide CRUD-with-soft-delete over `notes` and `categories` keyed by
//!   stable id.
//! - Keep SQL details inside the durable persistence boundary.
//!
//! # Invariants
//! - Repositories borrow a `Connection`; callers that need atomicity with the
//!   change log pass a `Transaction` (it derefs to `Connection`).
//! - Reads return tombstoned rows only when asked to.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::DbError;
use crate::model::entity::{Category, Entity, EntityId, EntityKind, Note};
use crate::model::identity::UserId;
use crate::sync::codec::FragmentError;
use crate::sync::scope::OwnerScope;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const NOTE_SELECT_SQL: &str = "SELECT
    uuid,
    owner_id,
    title,
    body,
    category_uuid,
    is_pinned,
    created_at,
    updated_at,
    deleted_at
FROM notes";

const CATEGORY_SELECT_SQL: &str = "SELECT
    uuid,
    owner_id,
    name,
    color,
    created_at,
    updated_at,
    deleted_at
FROM categories";

pub type RepoResult<T> = Result<T, RepoError>;

/// Persistence error for entity, change-log and ledger operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    NotFound { kind: EntityKind, id: EntityId },
    AlreadyExists { kind: EntityKind, id: EntityId },
    InvalidData(String),
    Fragment(FragmentError),
    Serialization(serde_json::Error),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { kind, id } => write!(f, "{} not found: {id}", kind.as_str()),
            Self::AlreadyExists { kind, id } => {
                write!(f, "{} already exists: {id}", kind.as_str())
            }
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Fragment(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "serialization failed: {err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Fragment(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::NotFound { .. } | Self::AlreadyExists { .. } | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::from(value))
    }
}

impl From<FragmentError> for RepoError {
    fn from(value: FragmentError) -> Self {
        Self::Fragment(value)
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Query options for listing entities of one kind.
#[derive(Debug, Clone)]
pub struct EntityListQuery {
    pub kind: EntityKind,
    pub scope: OwnerScope,
    pub include_deleted: bool,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl EntityListQuery {
    pub fn active(kind: EntityKind, scope: OwnerScope) -> Self {
        Self {
            kind,
            scope,
            include_deleted: false,
            limit: None,
            offset: 0,
        }
    }
}

/// Repository interface for the durable entity tier.
pub trait EntityRepository {
    fn insert_entity(&self, entity: &Entity) -> RepoResult<()>;
    fn update_entity(&self, entity: &Entity) -> RepoResult<()>;
    /// Loads one entity regardless of owner, tombstoned rows included.
    fn get_entity(&self, kind: EntityKind, id: EntityId) -> RepoResult<Option<Entity>>;
    fn list_entities(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>>;
    fn count_active(&self, kind: EntityKind, scope: &OwnerScope) -> RepoResult<u64>;
}

/// SQLite-backed entity repository.
pub struct SqliteEntityRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEntityRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn insert_entity(&self, entity: &Entity) -> RepoResult<()> {
        if self.get_entity(entity.kind(), entity.id())?.is_some() {
            return Err(RepoError::AlreadyExists {
                kind: entity.kind(),
                id: entity.id(),
            });
        }

        match entity {
            Entity::Note(note) => {
                self.conn.execute(
                    "INSERT INTO notes (
                        uuid,
                        owner_id,
                        title,
                        body,
                        category_uuid,
                        is_pinned,
                        created_at,
                        updated_at,
                        deleted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
                    params![
                        note.id.to_string(),
                        note.owner_id.as_ref().map(UserId::as_str),
                        note.title.as_str(),
                        note.body.as_str(),
                        note.category_id.map(|value| value.to_string()),
                        bool_to_int(note.is_pinned),
                        note.created_at,
                        note.updated_at,
                        note.deleted_at,
                    ],
                )?;
            }
            Entity::Category(category) => {
                self.conn.execute(
                    "INSERT INTO categories (
                        uuid,
                        owner_id,
                        name,
                        color,
                        created_at,
                        updated_at,
                        deleted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
                    params![
                        category.id.to_string(),
                        category.owner_id.as_ref().map(UserId::as_str),
                        category.name.as_str(),
                        category.color.as_deref(),
                        category.created_at,
                        category.updated_at,
                        category.deleted_at,
                    ],
                )?;
            }
        }

        Ok(())
    }

    fn update_entity(&self, entity: &Entity) -> RepoResult<()> {
        // Owner and created_at are bound at creation and never rewritten.
        let changed = match entity {
            Entity::Note(note) => self.conn.execute(
                "UPDATE notes
                 SET
                    title = ?2,
                    body = ?3,
                    category_uuid = ?4,
                    is_pinned = ?5,
                    updated_at = ?6,
                    deleted_at = ?7
                 WHERE uuid = ?1;",
                params![
                    note.id.to_string(),
                    note.title.as_str(),
                    note.body.as_str(),
                    note.category_id.map(|value| value.to_string()),
                    bool_to_int(note.is_pinned),
                    note.updated_at,
                    note.deleted_at,
                ],
            )?,
            Entity::Category(category) => self.conn.execute(
                "UPDATE categories
                 SET
                    name = ?2,
                    color = ?3,
                    updated_at = ?4,
                    deleted_at = ?5
                 WHERE uuid = ?1;",
                params![
                    category.id.to_string(),
                    category.name.as_str(),
                    category.color.as_deref(),
                    category.updated_at,
                    category.deleted_at,
                ],
            )?,
        };

        if changed == 0 {
            return Err(RepoError::NotFound {
                kind: entity.kind(),
                id: entity.id(),
            });
        }

        Ok(())
    }

    fn get_entity(&self, kind: EntityKind, id: EntityId) -> RepoResult<Option<Entity>> {
        let select = select_sql(kind);
        let mut stmt = self.conn.prepare(&format!("{select} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(kind, row)?));
        }

        Ok(None)
    }

    fn list_entities(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>> {
        let mut sql = format!("{} WHERE 1 = 1", select_sql(query.kind));
        let mut bind_values: Vec<Value> = Vec::new();

        if !query.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        query.scope.push_sql_filter("owner_id", &mut sql, &mut bind_values);

        sql.push_str(" ORDER BY uuid ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_entity_row(query.kind, row)?);
        }

        Ok(entities)
    }

    fn count_active(&self, kind: EntityKind, scope: &OwnerScope) -> RepoResult<u64> {
        let table = table_name(kind);
        let mut sql = format!("SELECT COUNT(*) FROM {table} WHERE deleted_at IS NULL");
        let mut bind_values: Vec<Value> = Vec::new();
        scope.push_sql_filter("owner_id", &mut sql, &mut bind_values);

        let count: i64 =
            self.conn
                .query_row(&sql, params_from_iter(bind_values), |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative row count `{count}`")))
    }
}

fn select_sql(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note => NOTE_SELECT_SQL,
        EntityKind::Category => CATEGORY_SELECT_SQL,
    }
}

fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note => "notes",
        EntityKind::Category => "categories",
    }
}

fn parse_entity_row(kind: EntityKind, row: &Row<'_>) -> RepoResult<Entity> {
    let uuid_text: String = row.get("uuid")?;
    let id = parse_uuid(&uuid_text, "uuid")?;
    let owner_id = parse_owner(row.get("owner_id")?)?;

    let entity = match kind {
        EntityKind::Note => {
            let category_id = row
                .get::<_, Option<String>>("category_uuid")?
                .map(|value| parse_uuid(&value, "notes.category_uuid"))
                .transpose()?;
            let is_pinned = match row.get::<_, i64>("is_pinned")? {
                0 => false,
                1 => true,
                other => {
                    return Err(RepoError::InvalidData(format!(
                        "invalid is_pinned value `{other}` in notes.is_pinned"
                    )));
                }
            };
            Entity::Note(Note {
                id,
                owner_id,
                title: row.get("title")?,
                body: row.get("body")?,
                category_id,
                is_pinned,
                created_at: row.get("created_at")?,
                updated_at: row.get("updated_at")?,
                deleted_at: row.get("deleted_at")?,
            })
        }
        EntityKind::Category => Entity::Category(Category {
            id,
            owner_id,
            name: row.get("name")?,
            color: row.get("color")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            deleted_at: row.get("deleted_at")?,
        }),
    };

    Ok(entity)
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn parse_owner(value: Option<String>) -> RepoResult<Option<UserId>> {
    value
        .map(|text| {
            UserId::parse(&text)
                .map_err(|err| RepoError::InvalidData(format!("invalid owner_id: {err}")))
        })
        .transpose()
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
