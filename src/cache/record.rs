//! Cached wire responses and their byte framing.
//!
//! The cache stores *raw* responses — status, a restricted header subset,
//! and undecoded body bytes — never a decoded type. Records are framed for
//! the byte-oriented store as a u32 length-prefixed JSON metadata block
//! followed by the body verbatim.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{Headers, RawResponse};

/// Response headers worth keeping alongside the cached bytes.
const KEPT_HEADERS: [&str; 4] = ["content-type", "etag", "last-modified", "cache-control"];

/// Errors decoding a framed record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record too short: {len} bytes")]
    Truncated { len: usize },

    #[error("record metadata is invalid: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    status: u16,
    headers: Vec<(String, String)>,
    cached_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

/// A cached raw response.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use reqkit::cache::WireCacheRecord;
/// use reqkit::http::RawResponse;
///
/// let response = RawResponse::new(200)
///     .header("Content-Type", "application/json")
///     .body(r#"{"ok":true}"#);
/// let record = WireCacheRecord::from_response(&response, Some(Duration::from_secs(60)));
///
/// assert!(!record.is_expired());
/// let decoded = WireCacheRecord::decode(record.encode()).unwrap();
/// assert_eq!(decoded.status(), 200);
/// ```
#[derive(Debug, Clone)]
pub struct WireCacheRecord {
    status: u16,
    headers: Headers,
    body: Bytes,
    cached_at_ms: u64,
    expires_at_ms: Option<u64>,
}

impl WireCacheRecord {
    /// Captures a response into a record, keeping only the restricted header
    /// subset. `ttl = None` means the record never expires.
    pub fn from_response(response: &RawResponse, ttl: Option<Duration>) -> Self {
        let mut headers = Headers::new();
        for name in KEPT_HEADERS {
            for value in response.headers().get_all(name) {
                headers.insert(name, value);
            }
        }

        let cached_at_ms = now_ms();
        let expires_at_ms = ttl.map(|ttl| cached_at_ms.saturating_add(ttl.as_millis() as u64));

        Self {
            status: response.status(),
            headers,
            body: response.bytes().clone(),
            cached_at_ms,
            expires_at_ms,
        }
    }

    /// The cached status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The retained header subset.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The cached `ETag`, if the response carried one.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    /// The cached `Last-Modified`, if the response carried one.
    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified")
    }

    /// Unix milliseconds at which the record was created.
    pub fn cached_at_ms(&self) -> u64 {
        self.cached_at_ms
    }

    /// Unix milliseconds at which the record expires, if bounded.
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.expires_at_ms
    }

    /// `true` once the record's TTL has elapsed. Unbounded records never expire.
    pub fn is_expired(&self) -> bool {
        match self.expires_at_ms {
            Some(expires) => now_ms() >= expires,
            None => false,
        }
    }

    /// Time since the record was cached.
    pub fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.cached_at_ms))
    }

    /// Framed size in bytes, the unit of eviction accounting.
    pub fn size(&self) -> u64 {
        self.encode().len() as u64
    }

    /// Rebuilds a servable response from the record.
    pub fn to_response(&self) -> RawResponse {
        let mut response = RawResponse::new(self.status).body_bytes(self.body.clone());
        for (name, value) in self.headers.iter() {
            response = response.header(name, value);
        }
        response
    }

    /// Frames the record: u32 big-endian metadata length, JSON metadata, body.
    pub fn encode(&self) -> Bytes {
        let meta = RecordMeta {
            status: self.status,
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            cached_at_ms: self.cached_at_ms,
            expires_at_ms: self.expires_at_ms,
        };
        // RecordMeta serialization cannot fail: it is a plain data struct.
        let meta_bytes = serde_json::to_vec(&meta).unwrap_or_default();

        let mut buf = BytesMut::with_capacity(4 + meta_bytes.len() + self.body.len());
        buf.put_u32(meta_bytes.len() as u32);
        buf.put_slice(&meta_bytes);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parses a framed record.
    ///
    /// # Errors
    ///
    /// - [`RecordError::Truncated`] — the buffer is shorter than its framing claims.
    /// - [`RecordError::Metadata`] — the metadata block is not valid JSON.
    pub fn decode(bytes: Bytes) -> Result<Self, RecordError> {
        if bytes.len() < 4 {
            return Err(RecordError::Truncated { len: bytes.len() });
        }
        let meta_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + meta_len {
            return Err(RecordError::Truncated { len: bytes.len() });
        }

        let meta: RecordMeta = serde_json::from_slice(&bytes[4..4 + meta_len])?;
        let body = bytes.slice(4 + meta_len..);

        Ok(Self {
            status: meta.status,
            headers: meta.headers.into_iter().collect(),
            body,
            cached_at_ms: meta.cached_at_ms,
            expires_at_ms: meta.expires_at_ms,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
