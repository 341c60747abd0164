//! # reqkit
//!
//! A client-side request engine: canonical request identity, response
//! caching, single-flight coalescing, idempotency-gated retries, a
//! priority-ordered interceptor pipeline, FIFO-bounded concurrency, and
//! cooperative cancellation — composed behind one execution path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reqkit::engine::FetchEngine;
//! use reqkit::transport::Transport;
//!
//! async fn run(transport: Arc<dyn Transport>) -> Result<(), reqkit::error::FetchError> {
//!     let engine = FetchEngine::builder(transport).build();
//!     let items: serde_json::Value = engine.get("https://api.example.com/items").await?;
//!     println!("{items}");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod coalesce;
pub mod engine;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod key;
pub mod limit;
pub mod metrics;
pub mod retry;
pub mod scope;
pub mod transport;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CachePolicy, CacheStore, MemoryStore};
pub use engine::{EngineConfig, FetchEngine};
pub use error::FetchError;
pub use http::{FetchRequest, Headers, Method, RawResponse};
pub use key::RequestKey;
pub use transport::{CancelHandle, Transport};
