//! The caller-facing cache handle: TTL reads, writes, invalidation, and a
//! cache-first read-through with stale fallback.

use chrono::{Duration, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::store::{CacheBackend, MemoryStore, SqliteStore, StoredEntry};

/// TTL cache over a pluggable backend.
///
/// The cache is advisory: it is never the source of truth, so backend
/// failures degrade to a miss (reads) or a no-op (writes) with a debug log
/// instead of propagating. Callers always have a fallback fetch path.
#[derive(Clone)]
pub struct TtlCache {
  backend: Arc<dyn CacheBackend>,
}

impl TtlCache {
  /// Create a cache over an explicit backend. Tests use this to get an
  /// isolated instance per case instead of shared global state.
  pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
    Self { backend }
  }

  /// Session-scoped in-memory cache.
  pub fn in_memory() -> Self {
    Self::new(Arc::new(MemoryStore::new()))
  }

  /// Persistent cache backed by sqlite at the default location.
  pub fn persistent() -> Result<Self> {
    Ok(Self::new(Arc::new(SqliteStore::open()?)))
  }

  /// Get the value under `key` if present and not expired.
  ///
  /// Expired entries are left in place so `get_stale` can still serve them
  /// when a refetch fails.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.load_logged(key)?;
    if entry.is_expired(Utc::now()) {
      return None;
    }
    self.decode(key, entry)
  }

  /// Get the value under `key` regardless of expiration.
  pub fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.load_logged(key)?;
    self.decode(key, entry)
  }

  /// Store a value with `expires_at = now + ttl`, overwriting any prior
  /// entry under the same key.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
    let value = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        debug!(key, error = %e, "cache set skipped: serialization failed");
        return;
      }
    };

    let now = Utc::now();
    let entry = StoredEntry {
      value,
      stored_at: now,
      expires_at: now + ttl,
    };

    if let Err(e) = self.backend.store(key, &entry) {
      debug!(key, error = %e, "cache set failed");
    }
  }

  /// Explicit invalidation: a subsequent `get` is a miss even if the TTL
  /// has not elapsed. Used whenever a mutation makes a cached read stale.
  pub fn clear(&self, key: &str) {
    if let Err(e) = self.backend.remove(key) {
      debug!(key, error = %e, "cache clear failed");
    }
  }

  /// Cache-first read-through.
  ///
  /// 1. Fresh hit: return immediately without calling the fetcher.
  /// 2. Miss or expired: run the fetcher and store its result.
  /// 3. Fetcher failed but a stale entry exists: return the stale value
  ///    (stale-but-available beats a blank state).
  pub async fn fetch_with<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(fresh) = self.get::<T>(key) {
      return Ok(fresh);
    }

    match fetcher().await {
      Ok(value) => {
        self.set(key, &value, ttl);
        Ok(value)
      }
      Err(e) => match self.get_stale::<T>(key) {
        Some(stale) => {
          debug!(key, error = %e, "fetch failed, serving stale cache entry");
          Ok(stale)
        }
        None => Err(e),
      },
    }
  }

  fn load_logged(&self, key: &str) -> Option<StoredEntry> {
    match self.backend.load(key) {
      Ok(entry) => entry,
      Err(e) => {
        debug!(key, error = %e, "cache load failed");
        None
      }
    }
  }

  fn decode<T: DeserializeOwned>(&self, key: &str, entry: StoredEntry) -> Option<T> {
    match serde_json::from_value(entry.value) {
      Ok(value) => Some(value),
      Err(e) => {
        // Shape drift between writes; drop the entry rather than keep
        // serving undecodable bytes.
        debug!(key, error = %e, "cache entry undecodable, clearing");
        self.clear(key);
        None
      }
    }
  }
}

/// Digest an arbitrary-length key description into a stable hex string.
///
/// Query keys embed user ids and filter parameters; hashing keeps the
/// stored key fixed-length and free of separator ambiguity.
pub fn digest_key(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
