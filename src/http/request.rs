//! Outgoing request description and builder.

use std::time::Duration;

use bytes::Bytes;

use super::{Headers, Method};
use crate::cache::CachePolicy;
use crate::transport::CancelHandle;

/// A fully described outgoing request.
///
/// Built with the fluent methods below and submitted to
/// [`FetchEngine`](crate::engine::FetchEngine). Everything that affects the
/// request's identity (method, URL, query, body, identity headers, auth
/// scope, variant) feeds the canonicalizer; the remaining fields steer
/// caching, retries, and cancellation.
///
/// # Examples
///
/// ```
/// use reqkit::http::{FetchRequest, Method};
/// use reqkit::cache::CachePolicy;
///
/// let req = FetchRequest::new(Method::Get, "https://api.example.com/items")
///     .query("page", "2")
///     .header("Accept", "application/json")
///     .cache_policy(CachePolicy::CacheFirst)
///     .scope("items-screen");
///
/// assert_eq!(req.method(), &Method::Get);
/// assert_eq!(req.url(), "https://api.example.com/items");
/// ```
#[derive(Debug, Clone)]
pub struct FetchRequest {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Headers,
    body: Option<Bytes>,
    cache_policy: CachePolicy,
    ttl: Option<Duration>,
    retryable: Option<bool>,
    max_attempts: Option<u32>,
    idempotency_key: Option<String>,
    auth_scope: Option<String>,
    variant: Option<String>,
    scope: Option<String>,
    cache_authorized: bool,
    cancel: Option<CancelHandle>,
}

impl FetchRequest {
    /// Creates a request with engine defaults for everything but method and URL.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Headers::new(),
            body: None,
            cache_policy: CachePolicy::default(),
            ttl: None,
            retryable: None,
            max_attempts: None,
            idempotency_key: None,
            auth_scope: None,
            variant: None,
            scope: None,
            cache_authorized: false,
            cancel: None,
        }
    }

    /// Appends a query parameter. Repeated keys are preserved.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the raw request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON request body and sets `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if serialization fails.
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        self.body = Some(Bytes::from(bytes));
        self.headers.set("Content-Type", "application/json");
        Ok(self)
    }

    /// Sets the cache interaction policy.
    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets an explicit per-request TTL, taking precedence over server
    /// `Cache-Control: max-age` and the configured default.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Explicitly enables or disables retries for this request.
    ///
    /// Non-idempotent methods (POST, PATCH, custom) additionally require an
    /// [`idempotency_key`](Self::idempotency_key) before retries are allowed.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Overrides the engine's maximum attempt count for this request.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Attaches an idempotency key, sent as the `Idempotency-Key` header and
    /// required to retry non-idempotent methods.
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Tags the request with an auth identity (e.g. a user id).
    ///
    /// The scope participates in the request key so different identities
    /// never share cache entries or coalesced flights. The credential value
    /// itself must never be passed here — rotation would otherwise
    /// invalidate every key.
    #[must_use]
    pub fn auth_scope(mut self, scope: impl Into<String>) -> Self {
        self.auth_scope = Some(scope.into());
        self
    }

    /// Adds an arbitrary variant tag to the request identity.
    #[must_use]
    pub fn variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Tags the request with a lifecycle scope for grouped cancellation.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Opts this request's response into caching despite carrying an auth
    /// scope. Without this, auth-scoped responses are never cached.
    #[must_use]
    pub fn cache_authorized(mut self, authorized: bool) -> Self {
        self.cache_authorized = authorized;
        self
    }

    /// Attaches a caller-owned cancellation handle.
    ///
    /// Firing the handle cancels this caller only; a coalesced flight keeps
    /// running for its remaining callers.
    #[must_use]
    pub fn cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    /// Detaches the caller-owned cancel handle, for background refreshes
    /// that must outlive the caller.
    pub(crate) fn clear_cancel(&mut self) {
        self.cancel = None;
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URL as given (not canonicalized).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query parameters in insertion order.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable request headers, for interceptors.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The raw request body, if any.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The cache interaction policy.
    pub fn policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// The explicit per-request TTL, if any.
    pub fn ttl_override(&self) -> Option<Duration> {
        self.ttl
    }

    /// The explicit retry opt-in/out, if any.
    pub fn retryable_override(&self) -> Option<bool> {
        self.retryable
    }

    /// The per-request attempt ceiling, if any.
    pub fn max_attempts_override(&self) -> Option<u32> {
        self.max_attempts
    }

    /// The idempotency key, if any.
    pub fn idempotency_key_value(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// The auth identity scope, if any.
    pub fn auth_scope_value(&self) -> Option<&str> {
        self.auth_scope.as_deref()
    }

    /// The identity variant tag, if any.
    pub fn variant_value(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// The cancellation scope tag, if any.
    pub fn scope_tag(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Whether an auth-scoped response may be cached.
    pub fn is_cache_authorized(&self) -> bool {
        self.cache_authorized
    }

    /// The caller-owned cancellation handle, if any.
    pub fn caller_cancel(&self) -> Option<&CancelHandle> {
        self.cancel.as_ref()
    }
}
