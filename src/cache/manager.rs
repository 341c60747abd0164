//! Policy-driven cache orchestration over a byte-oriented store.
//!
//! The manager owns every cache safety rule so callers cannot get them
//! wrong: auth-scoped responses are not cached without an explicit opt-in, a
//! fixed set of sensitive URL patterns is never cached, `Cache-Control:
//! no-store` is honored, and `Vary: *` responses are never stored. It also
//! resolves TTLs, runs byte-ceiling eviction on every write, and serves
//! stale reads through a separate path for revalidation and error fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::policy::CacheConfig;
use crate::cache::record::WireCacheRecord;
use crate::cache::store::CacheStore;
use crate::http::{FetchRequest, RawResponse};
use crate::key::RequestKey;

/// Eviction accounting for one cached record.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    size: u64,
    cached_at_ms: u64,
    expires_at_ms: Option<u64>,
}

/// Read/write/eviction orchestration over a [`CacheStore`].
///
/// Store failures are absorbed here: a failed read is a miss, a failed
/// write is logged and skipped. The cache never fails a request.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    /// Size/age bookkeeping for eviction; the store remains authoritative
    /// for the bytes themselves.
    index: Mutex<HashMap<String, IndexEntry>>,
}

impl CacheManager {
    /// Creates a manager over the given store.
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches a *fresh* record for `key`. Expired records are treated as
    /// misses and deleted.
    pub async fn get(&self, key: &RequestKey) -> Option<WireCacheRecord> {
        let record = self.load(key).await?;
        if record.is_expired() {
            debug!(key = %key, "cache record expired");
            self.delete(key).await;
            return None;
        }
        Some(record)
    }

    /// Fetches a record for `key` ignoring expiry.
    ///
    /// Serves stale-while-revalidate hits and stale-on-error fallbacks.
    pub async fn get_stale(&self, key: &RequestKey) -> Option<WireCacheRecord> {
        self.load(key).await
    }

    /// Writes a response through, subject to the safety rules.
    ///
    /// Returns `true` if the response was stored.
    pub async fn put(&self, key: &RequestKey, request: &FetchRequest, response: &RawResponse) -> bool {
        if !self.is_cacheable(key, request, response) {
            return false;
        }

        let ttl = self.resolve_ttl(request, response);
        let record = WireCacheRecord::from_response(response, ttl);
        let encoded = record.encode();
        let size = encoded.len() as u64;

        // No store-level TTL: record metadata governs freshness, and an
        // expired record must stay readable through `get_stale`.
        if let Err(e) = self.store.put(key.as_str(), encoded, None).await {
            warn!(key = %key, error = %e, "cache write failed");
            return false;
        }

        {
            let mut index = self.lock_index();
            index.insert(
                key.as_str().to_owned(),
                IndexEntry {
                    size,
                    cached_at_ms: record.cached_at_ms(),
                    expires_at_ms: record.expires_at_ms(),
                },
            );
        }

        debug!(key = %key, bytes = size, ttl = ?ttl, "cache write");
        self.evict_to_ceiling().await;
        true
    }

    /// Removes the record for `key`. Returns `true` if one existed.
    pub async fn delete(&self, key: &RequestKey) -> bool {
        self.delete_raw(key.as_str()).await
    }

    /// Removes every record whose canonical key contains `pattern`.
    ///
    /// Returns the number of records removed. Useful for namespace-style
    /// invalidation (e.g. every key under `/items`).
    pub async fn delete_by_pattern(&self, pattern: &str) -> usize {
        let victims: Vec<String> = {
            let index = self.lock_index();
            index
                .keys()
                .filter(|k| k.contains(pattern))
                .cloned()
                .collect()
        };

        let mut removed = 0;
        for key in victims {
            if self.delete_raw(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Deletes every record whose TTL has elapsed. Returns the number removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now_ms = {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        };

        let victims: Vec<String> = {
            let index = self.lock_index();
            index
                .iter()
                .filter(|(_, e)| e.expires_at_ms.is_some_and(|at| at <= now_ms))
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut removed = 0;
        for key in victims {
            if self.delete_raw(&key).await {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expired cache records cleaned up");
        }
        removed
    }

    /// Total framed bytes currently accounted for.
    pub fn total_bytes(&self) -> u64 {
        self.lock_index().values().map(|e| e.size).sum()
    }

    /// Number of records currently accounted for.
    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    /// `true` if no records are accounted for.
    pub fn is_empty(&self) -> bool {
        self.lock_index().is_empty()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn load(&self, key: &RequestKey) -> Option<WireCacheRecord> {
        let bytes = match self.store.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                // The store may drop entries on its own (backend eviction);
                // keep the accounting in step with it.
                self.lock_index().remove(key.as_str());
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed — treating as miss");
                return None;
            }
        };

        match WireCacheRecord::decode(bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %key, error = %e, "cache record corrupt — evicting");
                self.delete_raw(key.as_str()).await;
                None
            }
        }
    }

    async fn delete_raw(&self, key: &str) -> bool {
        self.lock_index().remove(key);
        match self.store.delete(key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key = %key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Cache safety rules. Enforced here, never by callers.
    fn is_cacheable(&self, key: &RequestKey, request: &FetchRequest, response: &RawResponse) -> bool {
        if !response.is_success() {
            return false;
        }
        if request.auth_scope_value().is_some() && !request.is_cache_authorized() {
            debug!(key = %key, "auth-scoped response not cached without opt-in");
            return false;
        }
        if self
            .config
            .sensitive_patterns
            .iter()
            .any(|p| key.canonical_url().contains(p.as_str()))
        {
            debug!(key = %key, "sensitive URL never cached");
            return false;
        }
        if response.is_no_store() {
            debug!(key = %key, "Cache-Control: no-store honored");
            return false;
        }
        if response.varies_on_everything() {
            debug!(key = %key, "Vary: * response not cacheable");
            return false;
        }
        true
    }

    /// TTL resolution order: request override, server max-age, configured
    /// default, unbounded.
    fn resolve_ttl(&self, request: &FetchRequest, response: &RawResponse) -> Option<Duration> {
        request
            .ttl_override()
            .or_else(|| response.max_age())
            .or(self.config.default_ttl)
    }

    /// Evicts least-recently-cached records until total bytes sit at or
    /// below 90% of the ceiling. Runs after every write.
    async fn evict_to_ceiling(&self) {
        let victims: Vec<String> = {
            let index = self.lock_index();
            let mut total: u64 = index.values().map(|e| e.size).sum();
            if total <= self.config.max_bytes {
                return;
            }

            let target = self.config.eviction_target();
            let mut by_age: Vec<(&String, &IndexEntry)> = index.iter().collect();
            by_age.sort_by_key(|(_, e)| e.cached_at_ms);

            let mut victims = Vec::new();
            for (key, entry) in by_age {
                if total <= target {
                    break;
                }
                total = total.saturating_sub(entry.size);
                victims.push(key.clone());
            }
            victims
        };

        if victims.is_empty() {
            return;
        }
        debug!(evicted = victims.len(), "cache over byte ceiling — evicting oldest");
        for key in victims {
            self.delete_raw(&key).await;
        }
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, IndexEntry>> {
        // Index mutations never panic while holding the lock.
        self.index.lock().expect("cache index mutex poisoned")
    }
}
