//! SQLite `LocalStore`.
//!
//! The connection is protected by a `parking_lot::ReentrantMutex<RefCell<Connection>>`
//! so that `transaction()` can hold the lock while the closure re-acquires it
//! for its own SQL.

use std::cell::{Cell, RefCell};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::ReentrantMutex;
use rusqlite::{params, OptionalExtension};

use crate::error::{FieldSyncError, Result, StorageError};
use crate::mutation::{FieldUpdate, Mutation, MutationKind, SyncStatus};
use crate::types::{AuditInfo, Entity, FieldMap};

use super::traits::{check_enqueue, check_entity, LocalStore};

// ============================================================================
// Row helpers
// ============================================================================

fn storage_err(e: rusqlite::Error) -> FieldSyncError {
    FieldSyncError::Storage(StorageError::Sqlite(e))
}

fn corruption(
    table: &str,
    id: &str,
    column: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> FieldSyncError {
    StorageError::Corruption {
        table: table.to_string(),
        id: id.to_string(),
        column: column.to_string(),
        source: Box::new(source),
    }
    .into()
}

fn format_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &str, id: &str, column: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| corruption(table, id, column, e))
}

/// Column values of one `entities` row, before decoding.
struct EntityRow {
    id: String,
    parent_id: String,
    fields: String,
    created_by: String,
    created_at: String,
    modified_by: String,
    modified_at: String,
}

const ENTITY_COLUMNS: &str =
    "id, parent_id, fields, created_by, created_at, modified_by, modified_at";

impl EntityRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            fields: row.get(2)?,
            created_by: row.get(3)?,
            created_at: row.get(4)?,
            modified_by: row.get(5)?,
            modified_at: row.get(6)?,
        })
    }

    fn into_entity(self) -> Result<Entity> {
        let fields: FieldMap = serde_json::from_str(&self.fields)
            .map_err(|e| corruption("entities", &self.id, "fields", e))?;
        let created_at = parse_ts("entities", &self.id, "created_at", &self.created_at)?;
        let modified_at = parse_ts("entities", &self.id, "modified_at", &self.modified_at)?;
        Ok(Entity {
            id: self.id,
            parent_id: self.parent_id,
            fields,
            created: AuditInfo::new(self.created_by, created_at),
            last_modified: AuditInfo::new(self.modified_by, modified_at),
        })
    }
}

/// Column values of one `mutations` row, before decoding.
struct MutationRow {
    id: i64,
    entity_id: String,
    parent_id: String,
    kind: String,
    field_updates: String,
    author: String,
    created_at: String,
    retry_count: u32,
    status: String,
    last_error: Option<String>,
}

const MUTATION_COLUMNS: &str = "id, entity_id, parent_id, kind, field_updates, author, \
     created_at, retry_count, status, last_error";

impl MutationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            parent_id: row.get(2)?,
            kind: row.get(3)?,
            field_updates: row.get(4)?,
            author: row.get(5)?,
            created_at: row.get(6)?,
            retry_count: row.get(7)?,
            status: row.get(8)?,
            last_error: row.get(9)?,
        })
    }

    fn into_mutation(self) -> Result<Mutation> {
        let key = self.id.to_string();
        let bad_enum = |column: &str, value: &str| {
            corruption(
                "mutations",
                &key,
                column,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown value {value:?}"),
                ),
            )
        };
        let kind = MutationKind::parse(&self.kind).ok_or_else(|| bad_enum("kind", &self.kind))?;
        let status =
            SyncStatus::parse(&self.status).ok_or_else(|| bad_enum("status", &self.status))?;
        let field_updates: Vec<FieldUpdate> = serde_json::from_str(&self.field_updates)
            .map_err(|e| corruption("mutations", &key, "field_updates", e))?;
        let created_at = parse_ts("mutations", &key, "created_at", &self.created_at)?;

        Ok(Mutation {
            id: self.id,
            entity_id: self.entity_id,
            parent_id: self.parent_id,
            kind,
            field_updates,
            author: self.author,
            created_at,
            retry_count: self.retry_count,
            status,
            last_error: self.last_error,
        })
    }
}

// ============================================================================
// SqliteStore
// ============================================================================

pub struct SqliteStore {
    conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
}

impl SqliteStore {
    /// Open (and initialize) a file-backed database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(storage_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                id          TEXT PRIMARY KEY,
                parent_id   TEXT NOT NULL,
                fields      TEXT NOT NULL DEFAULT '{}',
                created_by  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                modified_by TEXT NOT NULL,
                modified_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entities_parent
                ON entities(parent_id);
            CREATE TABLE IF NOT EXISTS mutations (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id     TEXT NOT NULL CHECK (entity_id <> ''),
                parent_id     TEXT NOT NULL,
                kind          TEXT NOT NULL,
                field_updates TEXT NOT NULL DEFAULT '[]',
                author        TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                retry_count   INTEGER NOT NULL DEFAULT 0,
                status        TEXT NOT NULL,
                last_error    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_mutations_entity
                ON mutations(entity_id, id);
            CREATE INDEX IF NOT EXISTS idx_mutations_parent
                ON mutations(parent_id, id);",
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        f(&*conn).map_err(storage_err)
    }

    /// Run `f` inside a SAVEPOINT; roll back if it returns `Err`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        // Unique names keep nested savepoints apart.
        thread_local! {
            static SP_COUNTER: Cell<u64> = const { Cell::new(0) };
        }
        let sp_name = SP_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            format!("sp_{n}")
        });

        // Held for the whole transaction; the closure re-enters it.
        let guard = self.conn.lock();
        guard
            .borrow()
            .execute(&format!("SAVEPOINT {sp_name}"), [])
            .map_err(storage_err)?;

        match f(self) {
            Ok(v) => {
                let released = guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                match released {
                    Ok(_) => Ok(v),
                    Err(e) => {
                        let _ = guard
                            .borrow()
                            .execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                        Err(StorageError::Transaction {
                            message: "RELEASE SAVEPOINT failed".to_string(),
                            source: Some(Box::new(e)),
                        }
                        .into())
                    }
                }
            }
            Err(e) => {
                let conn = guard.borrow();
                let _ = conn.execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                let _ = conn.execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                Err(e)
            }
        }
    }
}

impl LocalStore for SqliteStore {
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
                params![id],
                EntityRow::read,
            )
            .optional()
        })?;
        row.map(EntityRow::into_entity).transpose()
    }

    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE parent_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![parent_id], EntityRow::read)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        check_entity(entity)?;
        let fields = serde_json::to_string(&entity.fields)
            .map_err(|e| FieldSyncError::Internal(format!("encode fields: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO entities
                    (id, parent_id, fields, created_by, created_at, modified_by, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    fields = excluded.fields,
                    created_by = excluded.created_by,
                    created_at = excluded.created_at,
                    modified_by = excluded.modified_by,
                    modified_at = excluded.modified_at",
                params![
                    entity.id,
                    entity.parent_id,
                    fields,
                    entity.created.user_id,
                    format_ts(&entity.created.timestamp),
                    entity.last_modified.user_id,
                    format_ts(&entity.last_modified.timestamp),
                ],
            )
        })?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM entities WHERE id = ?1", params![id])
        })?;
        Ok(n > 0)
    }

    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64> {
        check_enqueue(mutation)?;
        let field_updates = serde_json::to_string(&mutation.field_updates)
            .map_err(|e| FieldSyncError::Internal(format!("encode field updates: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mutations
                    (entity_id, parent_id, kind, field_updates, author, created_at,
                     retry_count, status, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    mutation.entity_id,
                    mutation.parent_id,
                    mutation.kind.as_str(),
                    field_updates,
                    mutation.author,
                    format_ts(&mutation.created_at),
                    mutation.retry_count,
                    mutation.status.as_str(),
                    mutation.last_error,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM mutations WHERE id = ?1", params![mutation.id])
        })?;
        if n == 0 {
            return Err(StorageError::MutationNotFound { id: mutation.id }.into());
        }
        Ok(())
    }

    fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        let n = self.with_conn(|conn| {
            conn.execute(
                "UPDATE mutations SET status = ?1, retry_count = ?2, last_error = ?3
                 WHERE id = ?4",
                params![
                    mutation.status.as_str(),
                    mutation.retry_count,
                    mutation.last_error,
                    mutation.id,
                ],
            )
        })?;
        if n == 0 {
            return Err(StorageError::MutationNotFound { id: mutation.id }.into());
        }
        Ok(())
    }

    fn list_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MUTATION_COLUMNS} FROM mutations WHERE entity_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![entity_id], MutationRow::read)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().map(MutationRow::into_mutation).collect()
    }

    fn list_queued_entities(&self, parent_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_id FROM mutations WHERE parent_id = ?1
                 GROUP BY entity_id ORDER BY MIN(id)",
            )?;
            let rows = stmt.query_map(params![parent_id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    fn write_entity_and_enqueue(
        &self,
        entity: Option<&Entity>,
        mutation: &Mutation,
    ) -> Result<i64> {
        self.transaction(|store| {
            if let Some(entity) = entity {
                store.upsert(entity)?;
            }
            store.enqueue_mutation(mutation)
        })
    }
}
