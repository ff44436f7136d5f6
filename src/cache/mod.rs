//! TTL-based memoization layer for remote reads.
//!
//! Two namespaces share one contract: a session-scoped in-memory store for
//! short-lived query results, and a sqlite-backed store for reference data
//! that should survive a restart. Entries carry an absolute expiration
//! timestamp; reads past it are misses, but the stale value is retained so
//! a failed refetch can still fall back to it.

mod layer;
mod store;

pub use layer::{digest_key, TtlCache};
pub use store::{CacheBackend, MemoryStore, SqliteStore, StoredEntry};
