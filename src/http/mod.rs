//! Client-side HTTP value types.
//!
//! This module provides the core primitives the engine is built from:
//! [`Method`], [`Headers`], [`FetchRequest`], and [`RawResponse`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::FetchRequest;
pub use response::RawResponse;

/// An HTTP request method.
///
/// Standard methods are represented as unit variants for zero-cost comparison.
/// Non-standard methods are captured in the `Custom` variant.
///
/// # Examples
///
/// ```
/// use reqkit::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// assert!(method.is_idempotent());
/// assert!(method.default_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET — retrieve a representation of the target resource.
    Get,
    /// POST — perform resource-specific processing on the request payload.
    Post,
    /// PUT — replace the target resource's current representation.
    Put,
    /// DELETE — remove the association between the target resource and its functionality.
    Delete,
    /// HEAD — identical to GET but without a response body.
    Head,
    /// OPTIONS — describe the communication options for the target resource.
    Options,
    /// PATCH — apply partial modifications to a resource.
    Patch,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Returns `true` if this method is considered "safe" (no side effects per RFC 9110 §9.2.1).
    ///
    /// Safe methods: GET, HEAD, OPTIONS.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }

    /// Returns `true` if this method is idempotent (RFC 9110 §9.2.2).
    ///
    /// Idempotent methods: GET, HEAD, PUT, DELETE, OPTIONS.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Get | Self::Head | Self::Put | Self::Delete | Self::Options
        )
    }

    /// Returns `true` if the retry engine may repeat this method without an
    /// explicit opt-in.
    ///
    /// GET, HEAD, PUT, and DELETE are retryable by default. POST, PATCH, and
    /// custom methods require an explicit opt-in plus an idempotency key.
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Put | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_standard_methods() {
        let m: Method = "DELETE".parse().unwrap();
        assert_eq!(m, Method::Delete);
        let m: Method = "PATCH".parse().unwrap();
        assert_eq!(m, Method::Patch);
    }

    #[test]
    fn parse_custom_method() {
        let m: Method = "PURGE".parse().unwrap();
        assert_eq!(m, Method::Custom("PURGE".to_owned()));
        assert_eq!(m.as_str(), "PURGE");
    }

    #[test]
    fn default_retryable_table() {
        assert!(Method::Get.default_retryable());
        assert!(Method::Head.default_retryable());
        assert!(Method::Put.default_retryable());
        assert!(Method::Delete.default_retryable());
        assert!(!Method::Post.default_retryable());
        assert!(!Method::Patch.default_retryable());
        assert!(!Method::Custom("PURGE".into()).default_retryable());
    }

    #[test]
    fn idempotency_table() {
        assert!(Method::Put.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
    }
}
