//! Cache backend trait plus the in-memory and sqlite implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// A single cached value with its expiration metadata.
///
/// The payload is kept as serialized JSON so backends can store arbitrary
/// caller types without knowing them.
#[derive(Debug, Clone)]
pub struct StoredEntry {
  pub value: serde_json::Value,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl StoredEntry {
  /// Whether this entry is past its expiration at the given instant.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// Trait for cache storage backends.
pub trait CacheBackend: Send + Sync {
  /// Load an entry by key, expired or not.
  fn load(&self, key: &str) -> Result<Option<StoredEntry>>;

  /// Store an entry, overwriting any prior entry under the same key.
  fn store(&self, key: &str, entry: &StoredEntry) -> Result<()>;

  /// Remove an entry entirely.
  fn remove(&self, key: &str) -> Result<()>;
}

/// Session-scoped in-memory store. This is the default namespace for
/// short-lived query results.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheBackend for MemoryStore {
  fn load(&self, key: &str) -> Result<Option<StoredEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), entry.clone());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}

/// Sqlite-backed store for the persistent namespace (reference data like
/// country and category lists that should survive a restart).
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the persistent cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ttl_cache (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ttl_cache_expires ON ttl_cache(expires_at);
"#;

impl SqliteStore {
  /// Open (or create) the store at the default location under the
  /// platform data directory.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("chatsync").join("cache.db"))
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

impl CacheBackend for SqliteStore {
  fn load(&self, key: &str) -> Result<Option<StoredEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT data, stored_at, expires_at FROM ttl_cache WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((data, stored_at, expires_at)) => {
        let value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry: {}", e))?;
        Ok(Some(StoredEntry {
          value,
          stored_at: parse_datetime(&stored_at)?,
          expires_at: parse_datetime(&expires_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data =
      serde_json::to_vec(&entry.value).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO ttl_cache (key, data, stored_at, expires_at)
         VALUES (?, ?, ?, ?)",
        params![
          key,
          data,
          entry.stored_at.to_rfc3339(),
          entry.expires_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM ttl_cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;

    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
