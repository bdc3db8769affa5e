//! Snapshot storage trait and SQLite implementation.
//!
//! Snapshots let a fresh process show the last known data for a key while the
//! first real fetch is still running, and keep serving it when offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::key::QueryKey;

/// Last successful data persisted for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub data: Value,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get the snapshot for a key, if any.
  fn load(&self, key: &QueryKey) -> Result<Option<Snapshot>>;

  /// Store (or replace) the snapshot for a key.
  fn store(&self, key: &QueryKey, data: &Value) -> Result<()>;

  /// Delete the snapshot for a key.
  fn remove(&self, key: &QueryKey) -> Result<()>;

  /// Delete every snapshot.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load(&self, _key: &QueryKey) -> Result<Option<Snapshot>> {
    Ok(None) // Always miss
  }

  fn store(&self, _key: &QueryKey, _data: &Value) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &QueryKey) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the snapshot database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the snapshot database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory database, gone when dropped.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("leadsync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for snapshot tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_snapshots (
    query_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn load(&self, key: &QueryKey) -> Result<Option<Snapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM query_snapshots WHERE query_hash = ?",
        params![key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read snapshot for {}: {}", key, e))?;

    match row {
      Some((data, cached_at_str)) => {
        let data: Value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize snapshot for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(Snapshot { data, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn store(&self, key: &QueryKey, data: &Value) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let bytes =
      serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_snapshots (query_hash, query_key, data, cached_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![key.digest(), key.serialized(), bytes],
      )
      .map_err(|e| eyre!("Failed to store snapshot for {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &QueryKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM query_snapshots WHERE query_hash = ?",
        params![key.digest()],
      )
      .map_err(|e| eyre!("Failed to delete snapshot for {}: {}", key, e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM query_snapshots", [])
      .map_err(|e| eyre!("Failed to clear snapshots: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
