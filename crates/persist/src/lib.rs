//! kform persistence: SQLite store for the flat state record of each
//! managed resource, keyed by kind and identity.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use kform_core::{Attributes, StateRecord};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

/// A persisted record with its last write time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: StateRecord,
    pub updated_at: DateTime<Utc>,
}

pub trait StateStore {
    fn get(&self, kind: &str, id: &str) -> Result<Option<StoredRecord>>;
    fn put(&self, kind: &str, record: &StateRecord) -> Result<()>;
    /// Returns whether a record was removed.
    fn delete(&self, kind: &str, id: &str) -> Result<bool>;
    fn list(&self, kind: &str) -> Result<Vec<String>>;
}

/// SQLite-backed store. Synchronous; one connection behind a mutex.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KFORM_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS state (
                kind           TEXT NOT NULL,
                id             TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                attributes     TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            )",
            [],
        )
        .context("creating state table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "state db open");
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("state db lock poisoned"))
    }
}

impl StateStore for SqliteStore {
    fn get(&self, kind: &str, id: &str) -> Result<Option<StoredRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT schema_version, attributes, updated_at FROM state WHERE kind = ?1 AND id = ?2",
                (kind, id),
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()
            .with_context(|| format!("reading {} {}", kind, id))?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        let Some((schema_version, attributes, updated_at)) = row else { return Ok(None) };
        let attributes: Attributes =
            serde_json::from_str(&attributes).with_context(|| format!("decoding attributes of {} {}", kind, id))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .with_context(|| format!("parsing updated_at of {} {}", kind, id))?
            .with_timezone(&Utc);
        Ok(Some(StoredRecord { record: StateRecord { id: id.to_string(), schema_version, attributes }, updated_at }))
    }

    fn put(&self, kind: &str, record: &StateRecord) -> Result<()> {
        if record.id.is_empty() {
            return Err(anyhow!("refusing to store a {} record without identity", kind));
        }
        let started = std::time::Instant::now();
        let attributes = serde_json::to_string(&record.attributes)?;
        let db = self.conn()?;
        db.execute(
            "INSERT INTO state(kind, id, schema_version, attributes, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, id) DO UPDATE SET
                schema_version = excluded.schema_version,
                attributes = excluded.attributes,
                updated_at = excluded.updated_at",
            (kind, &record.id, record.schema_version, &attributes, Utc::now().to_rfc3339()),
        )
        .with_context(|| format!("writing {} {}", kind, record.id))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db
            .execute("DELETE FROM state WHERE kind = ?1 AND id = ?2", (kind, id))
            .with_context(|| format!("deleting {} {}", kind, id))?;
        Ok(n > 0)
    }

    fn list(&self, kind: &str) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT id FROM state WHERE kind = ?1 ORDER BY id")?;
        let ids = stmt.query_map([kind], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kform");
        let _ = std::fs::create_dir_all(&p);
        p.push("state.db");
        return p.to_string_lossy().to_string();
    }
    "kform-state.db".to_string()
}
