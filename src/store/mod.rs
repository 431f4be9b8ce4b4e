pub mod chunks;
pub mod embeddings;
pub mod links;
pub mod lock;
pub mod memories;
pub mod repos;
pub mod schema;
pub mod search;
pub mod state;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::ids::parse_timestamp;

/// The embedded database wrapper. Owns the single connection for its path;
/// every statement is serialized through it.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path`, applying pragmas before any
    /// other statement and running the bootstrap under an advisory lock.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;

        let lock_path = path.with_extension("bootstrap.lock");
        let _lock = lock::acquire_blocking(&lock_path)?;
        schema::bootstrap(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory database for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        schema::bootstrap(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expose the raw connection (for tests and the health probes).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get(0))?;
        match rows.next() {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            [key, value],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self.conn.query_row("PRAGMA user_version", [], |r| r.get(0))?)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=3000;
         PRAGMA cache_size=-20000;
         PRAGMA temp_store=MEMORY;
         PRAGMA mmap_size=268435456;",
    )?;
    Ok(())
}

/// Parse an RFC 3339 timestamp column, tolerating legacy precision.
pub(crate) fn parse_dt(s: &str) -> DateTime<Utc> {
    parse_timestamp(s)
}

pub(crate) fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_dt(&v))
}

/// Serialize a tag/entity list to its JSON column form.
pub(crate) fn values_to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a JSON list column, tolerating legacy garbage.
pub(crate) fn values_from_json(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_dirs_and_db() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("repos").join("r_1").join("memory.db");
        let store = Store::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(store.path(), db_path);
    }

    #[test]
    fn pragmas_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("memory.db")).unwrap();
        let journal: String = store
            .conn()
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
        let busy: i64 = store
            .conn()
            .query_row("PRAGMA busy_timeout", [], |r| r.get(0))
            .unwrap();
        assert_eq!(busy, 3000);
    }

    #[test]
    fn meta_round_trips() {
        let store = Store::open_memory().unwrap();
        assert_eq!(store.meta_get("missing").unwrap(), None);
        store.meta_set("k", "v1").unwrap();
        store.meta_set("k", "v2").unwrap();
        assert_eq!(store.meta_get("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn schema_version_reports_current() {
        let store = Store::open_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn values_json_round_trip() {
        let values = vec!["a".to_string(), "b".to_string()];
        assert_eq!(values_from_json(&values_to_json(&values)), values);
        assert!(values_from_json("not json").is_empty());
    }
}
