//! Cache policies governing when the cache is consulted and written.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a request interacts with the cache.
///
/// The policy decides three things: whether the cache is consulted before
/// the network, whether the network is attempted at all, and whether a hit
/// additionally triggers a silent background refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Always go to the network; never read or write the cache.
    NetworkOnly,
    /// Only read the cache; a miss is a failure, the network is never used.
    CacheOnly,
    /// Serve a fresh cache hit, otherwise fall through to the network.
    #[default]
    CacheFirst,
    /// Try the network first; on failure fall back to the cache.
    NetworkFirst,
    /// Serve a cache hit immediately and refresh it in the background.
    StaleWhileRevalidate,
}

impl CachePolicy {
    /// Returns `true` if the cache is consulted before any network attempt.
    pub fn reads_cache_first(self) -> bool {
        matches!(
            self,
            Self::CacheOnly | Self::CacheFirst | Self::StaleWhileRevalidate
        )
    }

    /// Returns `true` if the network may be attempted under this policy.
    pub fn allows_network(self) -> bool {
        !matches!(self, Self::CacheOnly)
    }

    /// Returns `true` if a successful network response is written back.
    pub fn writes_cache(self) -> bool {
        matches!(
            self,
            Self::CacheFirst | Self::NetworkFirst | Self::StaleWhileRevalidate
        )
    }

    /// Returns `true` if a hit should also launch a silent background refresh.
    pub fn refreshes_in_background(self) -> bool {
        matches!(self, Self::StaleWhileRevalidate)
    }

    /// Returns `true` if a network failure may be substituted with a cached
    /// value under this policy.
    pub fn falls_back_to_cache(self) -> bool {
        matches!(
            self,
            Self::CacheFirst | Self::NetworkFirst | Self::StaleWhileRevalidate
        )
    }
}

/// Cache-wide configuration applied by the manager.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fallback TTL when neither the request nor the server supplies one.
    /// `None` means entries without a TTL never expire.
    pub default_ttl: Option<Duration>,
    /// Total byte ceiling across all cached records. Writes that push the
    /// total above the ceiling trigger eviction down to 90% of it.
    pub max_bytes: u64,
    /// URL substrings that must never be cached regardless of headers.
    pub sensitive_patterns: Vec<String>,
}

impl CacheConfig {
    /// Eviction target as a fraction of [`max_bytes`](Self::max_bytes).
    pub(crate) const EVICTION_HEADROOM: f64 = 0.9;

    /// Byte total eviction drains down to.
    pub(crate) fn eviction_target(&self) -> u64 {
        (self.max_bytes as f64 * Self::EVICTION_HEADROOM) as u64
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(300)),
            max_bytes: 64 * 1024 * 1024,
            sensitive_patterns: vec![
                "/auth".to_owned(),
                "/login".to_owned(),
                "/logout".to_owned(),
                "/token".to_owned(),
                "/password".to_owned(),
                "/oauth".to_owned(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_predicates() {
        assert!(CachePolicy::CacheFirst.reads_cache_first());
        assert!(CachePolicy::StaleWhileRevalidate.reads_cache_first());
        assert!(!CachePolicy::NetworkOnly.reads_cache_first());
        assert!(!CachePolicy::NetworkFirst.reads_cache_first());

        assert!(!CachePolicy::CacheOnly.allows_network());
        assert!(CachePolicy::NetworkFirst.allows_network());

        assert!(!CachePolicy::NetworkOnly.writes_cache());
        assert!(!CachePolicy::CacheOnly.writes_cache());
        assert!(CachePolicy::NetworkFirst.writes_cache());

        assert!(CachePolicy::StaleWhileRevalidate.refreshes_in_background());
        assert!(!CachePolicy::CacheFirst.refreshes_in_background());
    }

    #[test]
    fn eviction_target_is_ninety_percent() {
        let config = CacheConfig {
            max_bytes: 1000,
            ..CacheConfig::default()
        };
        assert_eq!(config.eviction_target(), 900);
    }
}
