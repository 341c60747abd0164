//! Transport contract and cooperative cancellation.
//!
//! The engine never speaks TCP or TLS itself; the actual wire call is
//! delegated to a [`Transport`] collaborator. The transport receives the
//! shared operation's [`CancelHandle`] and is expected to abort the call
//! when the handle fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::http::{FetchRequest, RawResponse};

/// The phase of a transport call in which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing the connection.
    Connect,
    /// Writing the request.
    Send,
    /// Waiting for or reading the response.
    Receive,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

/// Errors a [`Transport`] implementation may surface.
///
/// Transport errors carry no request identity; the engine attaches the
/// originating key and elapsed time when converting to
/// [`FetchError`](crate::error::FetchError).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{phase} timeout after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    #[error("transport call cancelled")]
    Cancelled,
}

impl TransportError {
    /// Convenience constructor for a network error without an underlying cause.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            cause: None,
        }
    }
}

/// The wire-level collaborator that actually performs a request.
///
/// Implementations must be cancel-aware: when `cancel` fires mid-call they
/// should abort and return [`TransportError::Cancelled`]. A response with a
/// non-success status is *not* a transport error — return the
/// [`RawResponse`] and let the engine classify it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request and returns the raw response.
    async fn send(
        &self,
        request: &FetchRequest,
        cancel: &CancelHandle,
    ) -> Result<RawResponse, TransportError>;
}

/// A cooperative cancellation flag shared between callers, the inflight
/// table, and the transport.
///
/// Cloning the handle yields another view of the same flag. Cancellation is
/// level-triggered: once fired it stays fired, and [`cancelled`](Self::cancelled)
/// resolves immediately for late subscribers.
///
/// # Examples
///
/// ```
/// use reqkit::transport::CancelHandle;
///
/// let handle = CancelHandle::new();
/// assert!(!handle.is_cancelled());
/// handle.cancel();
/// assert!(handle.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    /// Creates a new, un-fired handle.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Fires the cancellation flag, waking every waiter.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` if the flag has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag fires. Resolves immediately if it already has.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside `self`, so `wait_for` cannot observe a
        // closed channel while this handle is alive.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
