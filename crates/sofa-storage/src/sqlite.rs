//! SQLite storage backend

use crate::{Backend, Direction, KeyRange, KeyValue, StorageError, StorageStats, Transaction};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// SQLite storage backend
///
/// Embedded persistence for single-node setups. Every collection is a
/// `WITHOUT ROWID` table keyed by a BLOB, so range scans follow bytewise
/// key order. A single connection is shared; a read-write transaction holds
/// it from `BEGIN IMMEDIATE` until commit or abort.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sofa_collections (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn table_name(collection: &str) -> String {
    format!("\"coll:{}\"", collection.replace('"', "\"\""))
}

fn collection_exists(conn: &Connection, name: &str) -> Result<bool, StorageError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sofa_collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(found.is_some())
}

fn require_collection(conn: &Connection, name: &str) -> Result<(), StorageError> {
    if collection_exists(conn, name)? {
        Ok(())
    } else {
        Err(StorageError::NotFound(name.to_string()))
    }
}

fn create_collection(conn: &Connection, name: &str) -> Result<(), StorageError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (key BLOB PRIMARY KEY NOT NULL, value BLOB NOT NULL) WITHOUT ROWID;",
        table_name(name)
    ))
    .map_err(db_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO sofa_collections (name) VALUES (?1)",
        params![name],
    )
    .map_err(db_err)?;
    Ok(())
}

fn drop_collection(conn: &Connection, name: &str) -> Result<bool, StorageError> {
    if !collection_exists(conn, name)? {
        return Ok(false);
    }
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table_name(name)))
        .map_err(db_err)?;
    conn.execute("DELETE FROM sofa_collections WHERE name = ?1", params![name])
        .map_err(db_err)?;
    Ok(true)
}

fn get_value(conn: &Connection, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
    require_collection(conn, collection)?;
    conn.query_row(
        &format!("SELECT value FROM {} WHERE key = ?1", table_name(collection)),
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

fn put_value(conn: &Connection, collection: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
    require_collection(conn, collection)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            table_name(collection)
        ),
        params![key, value],
    )
    .map_err(db_err)?;
    Ok(())
}

fn delete_value(conn: &Connection, collection: &str, key: &[u8]) -> Result<bool, StorageError> {
    require_collection(conn, collection)?;
    let affected = conn
        .execute(
            &format!("DELETE FROM {} WHERE key = ?1", table_name(collection)),
            params![key],
        )
        .map_err(db_err)?;
    Ok(affected > 0)
}

fn scan_values(
    conn: &Connection,
    collection: &str,
    range: &KeyRange,
    direction: Direction,
    limit: usize,
) -> Result<Vec<KeyValue>, StorageError> {
    require_collection(conn, collection)?;
    if range.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let mut clauses = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    match &range.lower {
        Bound::Included(k) => {
            clauses.push("key >= ?");
            args.push(SqlValue::Blob(k.clone()));
        }
        Bound::Excluded(k) => {
            clauses.push("key > ?");
            args.push(SqlValue::Blob(k.clone()));
        }
        Bound::Unbounded => {}
    }
    match &range.upper {
        Bound::Included(k) => {
            clauses.push("key <= ?");
            args.push(SqlValue::Blob(k.clone()));
        }
        Bound::Excluded(k) => {
            clauses.push("key < ?");
            args.push(SqlValue::Blob(k.clone()));
        }
        Bound::Unbounded => {}
    }

    let mut sql = format!("SELECT key, value FROM {}", table_name(collection));
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(match direction {
        Direction::Forward => " ORDER BY key ASC",
        Direction::Reverse => " ORDER BY key DESC",
    });
    sql.push_str(" LIMIT ?");
    args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(db_err)?;
    let items: Result<Vec<KeyValue>, rusqlite::Error> = rows.collect();
    items.map_err(db_err)
}

fn collect_stats(conn: &Connection) -> Result<StorageStats, StorageError> {
    let names: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT name FROM sofa_collections")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let names: Result<Vec<String>, rusqlite::Error> = rows.collect();
        names.map_err(db_err)?
    };

    let mut stats = StorageStats {
        collection_count: names.len(),
        ..Default::default()
    };
    for name in &names {
        let (count, size): (i64, i64) = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM {}",
                    table_name(name)
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        stats.entry_count += count as usize;
        stats.total_size_bytes += size as usize;
    }
    Ok(stats)
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn create_collection(&self, name: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        create_collection(&conn, name)
    }

    async fn drop_collection(&self, name: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        drop_collection(&conn, name)
    }

    async fn has_collection(&self, name: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        collection_exists(&conn, name)
    }

    async fn get(&self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock().await;
        get_value(&conn, collection, key)
    }

    async fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError> {
        let conn = self.conn.lock().await;
        scan_values(&conn, collection, range, direction, limit)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_err)?;
        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock().await;
        collect_stats(&conn)
    }
}

/// Read-write transaction holding the shared connection
pub struct SqliteTransaction {
    conn: Option<OwnedMutexGuard<Connection>>,
}

impl SqliteTransaction {
    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn.as_deref().ok_or(StorageError::TransactionClosed)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn get(&mut self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        get_value(self.conn()?, collection, key)
    }

    async fn put(&mut self, collection: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        put_value(self.conn()?, collection, key, value)
    }

    async fn delete(&mut self, collection: &str, key: &[u8]) -> Result<bool, StorageError> {
        delete_value(self.conn()?, collection, key)
    }

    async fn scan(
        &mut self,
        collection: &str,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError> {
        scan_values(self.conn()?, collection, range, direction, limit)
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let conn = self.conn.take().ok_or(StorageError::TransactionClosed)?;
        if let Err(e) = conn.execute_batch("COMMIT") {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(db_err(e));
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StorageError> {
        let conn = self.conn.take().ok_or(StorageError::TransactionClosed)?;
        conn.execute_batch("ROLLBACK").map_err(db_err)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}
