//! Generic keyed storage consumed by the task store.
//!
//! Two engines: [`MemoryKv`] for tests and throwaway runs, and [`SqliteKv`]
//! for durable state shared across restarts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors from a key-value engine.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Owned cursor over `(key, value)` pairs in key order.
#[derive(Debug, Default)]
pub struct KeyCursor {
    entries: std::vec::IntoIter<(String, String)>,
}

impl KeyCursor {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for KeyCursor {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

/// Namespaced string storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Every entry whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<KeyCursor, KvError>;

    async fn count_prefix(&self, prefix: &str) -> Result<usize, KvError>;
}

/// In-process engine backed by a sorted map.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<KeyCursor, KvError> {
        let entries = self.entries.read().await;
        let matched = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(KeyCursor::new(matched))
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }
}

/// SQLite engine. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        debug!("Key-value schema initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KvError::Unavailable("connection lock poisoned".to_string()))?;
            op(&guard).map_err(KvError::from)
        })
        .await
        .map_err(|e| KvError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO kv (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<KeyCursor, KvError> {
        let prefix = prefix.to_string();
        let entries = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<Vec<(String, String)>, _>>()
            })
            .await?;
        Ok(KeyCursor::new(entries))
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        let prefix = prefix.to_string();
        let count: i64 = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                    params![prefix],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
