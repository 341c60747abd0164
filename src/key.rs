//! Request key canonicalization.
//!
//! Every outgoing request is reduced to a deterministic identity string so
//! that caching and coalescing agree on what "the same request" means, no
//! matter how independently the callers built it. Canonicalization is total:
//! malformed inputs degrade to a best-effort normal form, they never fail.
//!
//! The identity covers: method, canonical URL (lowercased scheme/host,
//! default ports stripped, dot segments resolved, fragment dropped, query
//! pairs sorted), a SHA-256 body digest (JSON bodies are re-serialized with
//! sorted keys first), a digest over a fixed allow-list of identity headers,
//! an auth scope string, and an optional variant tag.
//!
//! Credentials never participate: auth identity is the `auth_scope` string
//! (e.g. a user id), so token rotation cannot invalidate keys, and headers
//! outside the allow-list — `Authorization` included — are ignored to bound
//! the key space.

use std::fmt;
use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};

use crate::http::{FetchRequest, Headers, Method};

/// Headers that participate in the identity digest. Everything else,
/// including credentials, is excluded.
const VARY_ALLOW_LIST: [&str; 4] = ["accept", "content-type", "accept-language", "x-api-version"];

/// A stable, immutable request identity.
///
/// Equality and hashing are defined *only* on the derived canonical string;
/// the component fields are retained for inspection and logging.
///
/// # Examples
///
/// ```
/// use reqkit::http::{FetchRequest, Method};
/// use reqkit::key::RequestKey;
///
/// let a = RequestKey::from_request(
///     &FetchRequest::new(Method::Get, "https://example.com/a?z=1&a=2"),
/// );
/// let b = RequestKey::from_request(
///     &FetchRequest::new(Method::Get, "https://EXAMPLE.com:443/a?a=2&z=1"),
/// );
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone)]
pub struct RequestKey {
    method: Method,
    canonical_url: String,
    body_hash: Option<String>,
    vary_hash: Option<String>,
    auth_scope: Option<String>,
    variant: Option<String>,
    canonical: String,
}

impl RequestKey {
    /// Canonicalizes a [`FetchRequest`] into its identity.
    pub fn from_request(request: &FetchRequest) -> Self {
        canonicalize(
            request.method().clone(),
            request.url(),
            request.query_params(),
            request.body_bytes().map(|b| b.as_ref()),
            request.headers(),
            request.auth_scope_value(),
            request.variant_value(),
        )
    }

    /// The canonical identity string.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The canonical URL (scheme/host lowercased, default port stripped,
    /// dot segments resolved, fragment dropped, query sorted).
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// The body digest, if the request had a body.
    pub fn body_hash(&self) -> Option<&str> {
        self.body_hash.as_deref()
    }

    /// The identity-header digest, if any allow-listed header was present.
    pub fn vary_hash(&self) -> Option<&str> {
        self.vary_hash.as_deref()
    }

    /// The auth identity scope, if any.
    pub fn auth_scope(&self) -> Option<&str> {
        self.auth_scope.as_deref()
    }

    /// The variant tag, if any.
    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Builds a [`RequestKey`] from raw request parts.
///
/// Total and side-effect-free: no input combination fails.
pub fn canonicalize(
    method: Method,
    url: &str,
    query_params: &[(String, String)],
    body: Option<&[u8]>,
    headers: &Headers,
    auth_scope: Option<&str>,
    variant: Option<&str>,
) -> RequestKey {
    let canonical_url = canonical_url(url, query_params);
    let body_hash = body.map(body_digest);
    let vary_hash = vary_digest(headers);

    let mut canonical = format!("{} {}", method.as_str(), canonical_url);
    if let Some(hash) = &body_hash {
        canonical.push_str("|body:");
        canonical.push_str(hash);
    }
    if let Some(hash) = &vary_hash {
        canonical.push_str("|vary:");
        canonical.push_str(hash);
    }
    if let Some(scope) = auth_scope {
        canonical.push_str("|auth:");
        canonical.push_str(scope);
    }
    if let Some(tag) = variant {
        canonical.push_str("|variant:");
        canonical.push_str(tag);
    }

    RequestKey {
        method,
        canonical_url,
        body_hash,
        vary_hash,
        auth_scope: auth_scope.map(str::to_owned),
        variant: variant.map(str::to_owned),
        canonical,
    }
}

/// Normalizes a URL and merges in explicit query parameters.
fn canonical_url(url: &str, extra_query: &[(String, String)]) -> String {
    // Fragment never reaches the server; drop it first.
    let url = url.split('#').next().unwrap_or(url);

    let (rest, url_query) = match url.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (url, None),
    };

    let (scheme, after_scheme) = match rest.split_once("://") {
        Some((scheme, after)) => (Some(scheme.to_ascii_lowercase()), after),
        None => (None, rest),
    };

    let (authority, path) = match after_scheme.find('/') {
        Some(idx) => (&after_scheme[..idx], &after_scheme[idx..]),
        None => (after_scheme, ""),
    };

    let authority = canonical_authority(authority, scheme.as_deref());
    let path = canonical_path(path);
    let query = canonical_query(url_query, extra_query);

    let mut out = String::with_capacity(url.len());
    if let Some(scheme) = &scheme {
        out.push_str(scheme);
        out.push_str("://");
    }
    out.push_str(&authority);
    out.push_str(&path);
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// Lowercases the host and strips the scheme's default port.
fn canonical_authority(authority: &str, scheme: Option<&str>) -> String {
    // Userinfo is rare; preserve it verbatim if present.
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((user, host)) => (Some(user), host),
        None => (None, authority),
    };

    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (host, Some(port)),
        _ => (hostport, None),
    };

    let default_port = match scheme {
        Some("http") => Some("80"),
        Some("https") => Some("443"),
        _ => None,
    };

    let mut out = String::new();
    if let Some(user) = userinfo {
        out.push_str(user);
        out.push('@');
    }
    out.push_str(&host.to_ascii_lowercase());
    if let Some(port) = port {
        if default_port != Some(port) {
            out.push(':');
            out.push_str(port);
        }
    }
    out
}

/// Resolves `.` and `..` segments and collapses empty segments.
fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    // A normalized path keeps a trailing slash only for the root.
    out
}

/// Sorts query pairs lexicographically by key then value, repeats preserved.
fn canonical_query(url_query: Option<&str>, extra: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();

    if let Some(raw) = url_query {
        for pair in raw.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k.to_owned(), v.to_owned()),
                None => (pair.to_owned(), String::new()),
            };
            pairs.push((key, value));
        }
    }
    pairs.extend(extra.iter().cloned());

    pairs.sort();

    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// SHA-256 over the body, canonicalizing JSON first.
///
/// A body that parses as JSON is re-serialized with sorted object keys and
/// no whitespace before hashing, so key order never splits identities.
fn body_digest(body: &[u8]) -> String {
    // serde_json's default Map is BTreeMap-backed: re-serialization sorts keys.
    let canonical: Vec<u8> = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec()),
        Err(_) => body.to_vec(),
    };
    hex_sha256(&canonical)
}

/// Digest over the allow-listed identity headers, or `None` if none are set.
fn vary_digest(headers: &Headers) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    for name in VARY_ALLOW_LIST {
        for value in headers.get_all(name) {
            lines.push(format!("{name}:{value}"));
        }
    }
    if lines.is_empty() {
        return None;
    }
    lines.sort();
    Some(hex_sha256(lines.join("\n").as_bytes()))
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
