//! Raw transport response.
//!
//! A [`RawResponse`] is exactly what came off the wire: a status code,
//! headers, and undecoded body bytes. Decoding happens per-caller via
//! [`RawResponse::json`] so a decode bug can never poison a shared cache
//! entry or a coalesced sibling.

use std::time::Duration;

use bytes::Bytes;

use super::Headers;

/// An undecoded HTTP response.
///
/// # Examples
///
/// ```
/// use reqkit::http::RawResponse;
///
/// let res = RawResponse::new(200)
///     .header("Content-Type", "application/json")
///     .body(r#"{"ok":true}"#);
///
/// assert!(res.is_success());
/// assert_eq!(res.bytes().as_ref(), br#"{"ok":true}"#);
/// ```
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl RawResponse {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw body bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// The body's actual byte length (not a character count).
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `true` for 4xx statuses.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// `true` for 5xx statuses.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// Decodes the body as JSON into `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Parses a `Retry-After` header given in whole seconds, if present.
    ///
    /// HTTP-date forms of `Retry-After` are not parsed; the backoff schedule
    /// applies instead.
    pub fn retry_after(&self) -> Option<Duration> {
        let value = self.headers.get("retry-after")?;
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    /// Parses `Cache-Control: max-age=N` from the response, if present.
    pub fn max_age(&self) -> Option<Duration> {
        let value = self.headers.get("cache-control")?;
        for directive in value.split(',') {
            let directive = directive.trim();
            if let Some(seconds) = directive.strip_prefix("max-age=") {
                return seconds.parse::<u64>().ok().map(Duration::from_secs);
            }
        }
        None
    }

    /// `true` if the response forbids storage via `Cache-Control: no-store`.
    pub fn is_no_store(&self) -> bool {
        self.headers
            .get("cache-control")
            .map(|v| {
                v.split(',')
                    .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
            })
            .unwrap_or(false)
    }

    /// `true` if the response declares `Vary: *`, which makes it uncacheable.
    pub fn varies_on_everything(&self) -> bool {
        self.headers
            .get_all("vary")
            .any(|v| v.split(',').any(|field| field.trim() == "*"))
    }
}
