//! The closed error taxonomy every caller sees.
//!
//! Callers always receive a [`FetchError`] variant, never a raw transport
//! error. Each variant carries the originating [`RequestKey`] and the time
//! elapsed when the failure surfaced. Variants are cheap to clone so a
//! single failed flight can settle every coalesced caller with the same
//! typed outcome.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::key::RequestKey;
use crate::transport::{TimeoutPhase, TransportError};

/// Whether an HTTP error originated from the client or the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    /// 4xx — the request is at fault; retrying will not help (except 429).
    Client,
    /// 5xx — the server failed; transient failures are retry candidates.
    Server,
}

/// A typed request failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The transport produced no response at all.
    #[error("network error for {key}: {message}")]
    Network {
        key: RequestKey,
        elapsed: Duration,
        message: String,
        #[source]
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// A transport phase exceeded its deadline.
    #[error("{phase} timeout for {key} after {elapsed:?}")]
    Timeout {
        key: RequestKey,
        elapsed: Duration,
        phase: TimeoutPhase,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {key}")]
    Http {
        key: RequestKey,
        elapsed: Duration,
        status: u16,
        kind: HttpErrorKind,
        /// Server-provided retry delay, honored for 429 responses.
        retry_after: Option<Duration>,
    },

    /// The response bytes could not be decoded into the caller's type.
    ///
    /// Scoped to the calling decode attempt: the shared cache entry and
    /// sibling coalesced callers are unaffected.
    #[error("decode error for {key}: {message}")]
    Decode {
        key: RequestKey,
        elapsed: Duration,
        message: String,
    },

    /// The request was cancelled cooperatively.
    #[error("request {key} cancelled after {elapsed:?}")]
    Cancelled { key: RequestKey, elapsed: Duration },

    /// The request configuration was rejected before any network attempt
    /// (e.g. retrying a non-idempotent method without an idempotency key).
    #[error("invalid request configuration for {url}: {message}")]
    Config { url: String, message: String },
}

impl FetchError {
    /// Attaches request identity and timing to a [`TransportError`].
    pub fn from_transport(key: RequestKey, elapsed: Duration, err: TransportError) -> Self {
        match err {
            TransportError::Network { message, cause } => Self::Network {
                key,
                elapsed,
                message,
                cause,
            },
            TransportError::Timeout { phase, .. } => Self::Timeout {
                key,
                elapsed,
                phase,
            },
            TransportError::Cancelled => Self::Cancelled { key, elapsed },
        }
    }

    /// Builds the HTTP error for a non-success status.
    pub fn from_status(
        key: RequestKey,
        elapsed: Duration,
        status: u16,
        retry_after: Option<Duration>,
    ) -> Self {
        let kind = if (500..600).contains(&status) {
            HttpErrorKind::Server
        } else {
            HttpErrorKind::Client
        };
        Self::Http {
            key,
            elapsed,
            status,
            kind,
            retry_after,
        }
    }

    /// The originating request key, when one exists.
    ///
    /// `Config` errors are raised before canonicalization is relevant and
    /// carry the URL instead.
    pub fn key(&self) -> Option<&RequestKey> {
        match self {
            Self::Network { key, .. }
            | Self::Timeout { key, .. }
            | Self::Http { key, .. }
            | Self::Decode { key, .. }
            | Self::Cancelled { key, .. } => Some(key),
            Self::Config { .. } => None,
        }
    }

    /// The HTTP status, for `Http` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `true` for cooperative cancellation outcomes.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
