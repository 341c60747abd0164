//! The byte-oriented cache store contract and an in-memory implementation.
//!
//! Persistence engines (key-value, document, relational) live outside this
//! crate and are consumed only through the narrow [`CacheStore`] contract:
//! get/put/delete over raw bytes with an optional TTL. [`MemoryStore`] is
//! the bundled in-process implementation, used by the demo and tests and
//! serviceable as a default.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced by a cache store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Convenience constructor.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Byte-oriented storage with TTL.
///
/// Implementations may drop entries at any time (TTL expiry, backend
/// eviction); callers must treat every `get` miss as authoritative.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetches the bytes stored under `key`, or `None`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Stores `value` under `key`. A `ttl` of `None` means no store-level
    /// expiry.
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Removes the entry under `key`. Returns `true` if one existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// An in-memory [`CacheStore`] guarded by a single mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

#[derive(Debug)]
struct StoredEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries. Test and inspection helper.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("memory store mutex poisoned")
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    /// `true` if the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::backend("memory store mutex poisoned"))?;

        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    entries.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(entry.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::backend("memory store mutex poisoned"))?;
        entries.insert(
            key.to_owned(),
            StoredEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::backend("memory store mutex poisoned"))?;
        Ok(entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        store
            .put("k", Bytes::from_static(b"v"), None)
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().as_ref(), b"v");
        assert!(store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store
            .put("k", Bytes::from_static(b"v"), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let store = MemoryStore::new();
        store
            .put("k", Bytes::from_static(b"old"), None)
            .await
            .unwrap();
        store
            .put("k", Bytes::from_static(b"new"), None)
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().as_ref(), b"new");
        assert_eq!(store.len(), 1);
    }
}
