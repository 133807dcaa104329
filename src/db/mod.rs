//! Database module for Fieldsync
//!
//! Provides the durable key-value storage the offline queue is built on.
//! Every record lives under its own key; writes are single-key and atomic,
//! there are no cross-key transactions.

mod memory;

pub use memory::MemoryStore;

use rusqlite::params;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Namespace for typed settings stored alongside queue entries
pub const SETTINGS_PREFIX: &str = "settings/";

/// Escape LIKE wildcards so a key prefix is matched literally
fn escape_like_pattern(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Durable local key-value store
///
/// Implementations must make each `set`/`remove` atomic for its key and
/// crash-consistent. `list_prefix` returns entries ordered by key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> DbResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> DbResult<()>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, key: &str) -> DbResult<bool>;

    fn list_prefix(&self, prefix: &str) -> DbResult<Vec<(String, String)>>;
}

impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    fn get(&self, key: &str) -> DbResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> DbResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> DbResult<bool> {
        (**self).remove(key)
    }

    fn list_prefix(&self, prefix: &str) -> DbResult<Vec<(String, String)>> {
        (**self).list_prefix(prefix)
    }
}

/// Get a typed setting value (JSON encoded)
pub fn get_setting<T: DeserializeOwned>(store: &dyn KvStore, name: &str) -> DbResult<Option<T>> {
    match store.get(&format!("{}{}", SETTINGS_PREFIX, name))? {
        Some(json) => {
            let value: T = serde_json::from_str(&json)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Set a typed setting value (JSON encoded)
pub fn set_setting<T: Serialize>(store: &dyn KvStore, name: &str, value: &T) -> DbResult<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    store.set(&format!("{}{}", SETTINGS_PREFIX, name), &json)
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    );
"#;

/// SQLite-backed store with pooled connections
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        // FULL sync: an acknowledged enqueue must survive power loss
        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
        "#)?;
        conn.execute_batch(SCHEMA)?;

        log::info!("Database opened at {:?}", db_path);

        Ok(Self { pool: Arc::new(pool) })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        // Each in-memory connection is its own database, so keep exactly one
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { pool: Arc::new(pool) })
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl KvStore for Database {
    fn get(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    fn list_prefix(&self, prefix: &str) -> DbResult<Vec<(String, String)>> {
        let conn = self.get_conn()?;
        let pattern = format!("{}%", escape_like_pattern(prefix));

        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv_store WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map(params![pattern], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;

        Ok(rows)
    }
}
