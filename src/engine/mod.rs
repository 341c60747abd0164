//! The request orchestrator.
//!
//! [`FetchEngine`] is the composition root: it wires the canonicalizer,
//! cache, coalescer, limiter, retry engine, and interceptor pipeline into
//! one execution path. Every verb entry point funnels into the same
//! parameterized [`execute`](FetchEngine::execute); there is no per-verb
//! logic anywhere else.
//!
//! The path for one request:
//!
//! 1. Canonicalize into a [`RequestKey`].
//! 2. Consult the cache per the request's [`CachePolicy`].
//! 3. On a miss, join or start a single-flight operation for the key.
//! 4. The flight acquires a concurrency permit, then runs attempts through
//!    the interceptor pipeline under the retry engine.
//! 5. A success is written through (subject to the cache safety rules) and
//!    fanned out to every coalesced caller; a failure may be substituted
//!    with a stale cache entry.
//! 6. Each caller decodes the shared raw bytes independently.
//!
//! Cancellation is cooperative at every stage, and scope cancellation
//! notifies [`ScopeObserver`]s through a bounded [`CleanupBarrier`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheManager, CacheStore, MemoryStore};
use crate::coalesce::{Coalescer, FlightRole};
use crate::error::FetchError;
use crate::http::{FetchRequest, Method, RawResponse};
use crate::interceptor::{Interceptor, InterceptorPipeline};
use crate::key::RequestKey;
use crate::limit::ConcurrencyLimiter;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::scope::{CleanupBarrier, DEFAULT_CLEANUP_TIMEOUT, ScopeObserver};
use crate::transport::{CancelHandle, Transport};

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum simultaneous network calls.
    pub max_concurrent: usize,
    /// Default retry policy; per-request overrides still apply.
    pub retry: RetryPolicy,
    /// Cache configuration.
    pub cache: CacheConfig,
    /// Bound on how long a scope cancellation waits for observer cleanup.
    pub cleanup_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

/// Where a tracked request currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPhase {
    /// Registered, not yet on the wire.
    Pending,
    /// Holding a permit and running attempts.
    Inflight,
    Completed,
    Failed,
    Cancelled,
}

/// Read-only view of one inflight table entry.
#[derive(Debug, Clone, Serialize)]
pub struct InflightSnapshot {
    pub key: String,
    pub phase: RequestPhase,
    pub scope: Option<String>,
    pub attempts: u32,
    pub callers: usize,
    pub elapsed_ms: u64,
}

/// One entry per [`RequestKey`], owned exclusively by the orchestrator.
struct InflightEntry {
    phase: RequestPhase,
    scope: Option<String>,
    started: Instant,
    attempts: Arc<AtomicU32>,
    /// Key-level cancel: firing it detaches every caller of this key.
    cancel: CancelHandle,
    callers: usize,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    cache: CacheManager,
    coalescer: Coalescer,
    limiter: ConcurrencyLimiter,
    pipeline: InterceptorPipeline,
    retry: RetryEngine,
    metrics: EngineMetrics,
    observers: Vec<Arc<dyn ScopeObserver>>,
    inflight: Mutex<HashMap<RequestKey, InflightEntry>>,
    config: EngineConfig,
}

/// The client-side request engine.
///
/// Cheap to clone; clones share every component.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use reqkit::engine::FetchEngine;
/// use reqkit::transport::Transport;
///
/// # async fn run(transport: Arc<dyn Transport>) -> Result<(), reqkit::error::FetchError> {
/// let engine = FetchEngine::builder(transport).build();
/// let user: serde_json::Value = engine.get("https://api.example.com/me").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

/// Assembles a [`FetchEngine`] from its collaborators.
pub struct FetchEngineBuilder {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn CacheStore>>,
    config: EngineConfig,
    pipeline: InterceptorPipeline,
    observers: Vec<Arc<dyn ScopeObserver>>,
}

impl FetchEngineBuilder {
    /// Replaces the default in-memory cache store.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an interceptor.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.pipeline.add(interceptor);
        self
    }

    /// Subscribes an observer to scope lifecycle events.
    pub fn observer(mut self, observer: Arc<dyn ScopeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> FetchEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        FetchEngine {
            inner: Arc::new(EngineInner {
                transport: self.transport,
                cache: CacheManager::new(store, self.config.cache.clone()),
                coalescer: Coalescer::new(),
                limiter: ConcurrencyLimiter::new(self.config.max_concurrent),
                pipeline: self.pipeline,
                retry: RetryEngine::new(self.config.retry.clone()),
                metrics: EngineMetrics::new(),
                observers: self.observers,
                inflight: Mutex::new(HashMap::new()),
                config: self.config,
            }),
        }
    }
}

impl FetchEngine {
    /// Starts building an engine around the given transport.
    pub fn builder(transport: Arc<dyn Transport>) -> FetchEngineBuilder {
        FetchEngineBuilder {
            transport,
            store: None,
            config: EngineConfig::default(),
            pipeline: InterceptorPipeline::new(),
            observers: Vec::new(),
        }
    }

    // ── Verb entry points ─────────────────────────────────────────────────────
    //
    // Thin wrappers over the one parameterized execution path. Anything
    // beyond method/URL/body goes through `execute` with a built request.

    pub async fn get<T: DeserializeOwned>(&self, url: impl Into<String>) -> Result<T, FetchError> {
        self.execute(FetchRequest::new(Method::Get, url)).await
    }

    pub async fn head(&self, url: impl Into<String>) -> Result<RawResponse, FetchError> {
        self.execute_raw(FetchRequest::new(Method::Head, url)).await
    }

    pub async fn delete(&self, url: impl Into<String>) -> Result<RawResponse, FetchError> {
        self.execute_raw(FetchRequest::new(Method::Delete, url))
            .await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        url: impl Into<String>,
        body: &B,
    ) -> Result<T, FetchError> {
        self.send_json(Method::Post, url.into(), body).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        url: impl Into<String>,
        body: &B,
    ) -> Result<T, FetchError> {
        self.send_json(Method::Put, url.into(), body).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(
        &self,
        url: impl Into<String>,
        body: &B,
    ) -> Result<T, FetchError> {
        self.send_json(Method::Patch, url.into(), body).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: &B,
    ) -> Result<T, FetchError> {
        let request = FetchRequest::new(method, url.clone())
            .json(body)
            .map_err(|e| FetchError::Config {
                url,
                message: format!("body serialization failed: {e}"),
            })?;
        self.execute(request).await
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Executes a request and decodes the response body as JSON.
    ///
    /// Decoding happens per caller on the shared raw bytes: a decode failure
    /// here never poisons the cache entry or any coalesced sibling.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: FetchRequest,
    ) -> Result<T, FetchError> {
        let key = RequestKey::from_request(&request);
        let started = Instant::now();
        let response = self.execute_raw(request).await?;
        response.json().map_err(|e| FetchError::Decode {
            key,
            elapsed: started.elapsed(),
            message: e.to_string(),
        })
    }

    /// Executes a request and returns the raw, undecoded response.
    pub async fn execute_raw(&self, request: FetchRequest) -> Result<RawResponse, FetchError> {
        let key = RequestKey::from_request(&request);
        let started = Instant::now();
        let policy = request.policy();
        self.inner.metrics.record_request();

        if policy.reads_cache_first() {
            // Stale-while-revalidate serves any cached record; the other
            // read-first policies require freshness.
            let cached = if policy.refreshes_in_background() {
                self.inner.cache.get_stale(&key).await
            } else {
                self.inner.cache.get(&key).await
            };
            if let Some(record) = cached {
                self.inner.metrics.record_cache_hit();
                debug!(key = %key, "cache hit");
                if policy.refreshes_in_background() {
                    self.spawn_background_refresh(request.clone(), key.clone());
                }
                return Ok(record.to_response());
            }
            self.inner.metrics.record_cache_miss();
            if !policy.allows_network() {
                self.inner.metrics.record_cancelled();
                return Err(FetchError::Cancelled {
                    key,
                    elapsed: started.elapsed(),
                });
            }
        }

        let outcome = self.fetch_shared(&request, &key).await;

        match outcome {
            // Config and decode failures describe the request itself, not
            // the network; they surface as-is instead of a stale substitute.
            Err(err)
                if policy.falls_back_to_cache()
                    && !err.is_cancelled()
                    && !matches!(err, FetchError::Config { .. } | FetchError::Decode { .. }) =>
            {
                if let Some(record) = self.inner.cache.get_stale(&key).await {
                    warn!(key = %key, error = %err, "network failed — serving stale cache entry");
                    self.inner.metrics.record_stale_served();
                    Ok(record.to_response())
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    /// Joins or starts the single-flight network operation for `key`.
    async fn fetch_shared(
        &self,
        request: &FetchRequest,
        key: &RequestKey,
    ) -> Result<RawResponse, FetchError> {
        let (attempts, entry_cancel) = self.inner.register_caller(request, key);
        let _caller = CallerGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        };
        // `_watch` keeps the merge task alive until this caller settles.
        let (cancel, _watch) = merged_cancel(&entry_cancel, request.caller_cancel());

        let (role, outcome) = {
            let inner = Arc::clone(&self.inner);
            let op_request = request.clone();
            let op_key = key.clone();
            self.inner
                .coalescer
                .coalesce(key.clone(), Some(cancel), move |shared_cancel| async move {
                    inner
                        .run_network_op(op_request, op_key, shared_cancel, attempts)
                        .await
                })
                .await
        };

        if role == FlightRole::Follower {
            self.inner.metrics.record_coalesced();
        }

        match &outcome {
            Ok(_) => self.inner.set_phase(key, RequestPhase::Completed),
            Err(err) if err.is_cancelled() => {
                self.inner.metrics.record_cancelled();
                self.inner.set_phase(key, RequestPhase::Cancelled);
            }
            Err(_) => self.inner.set_phase(key, RequestPhase::Failed),
        }
        outcome
    }

    /// Launches a silent coalesced refresh for a stale-while-revalidate hit.
    fn spawn_background_refresh(&self, mut request: FetchRequest, key: RequestKey) {
        request.clear_cancel();
        let engine = self.clone();
        tokio::spawn(async move {
            debug!(key = %key, "background refresh");
            if let Err(err) = engine.fetch_shared(&request, &key).await {
                debug!(key = %key, error = %err, "background refresh failed");
            }
        });
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Cancels every caller attached to `key`. Returns `true` if the key was
    /// inflight.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let inflight = self.inner.lock_inflight();
        match inflight.get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every request tagged with `scope`, notifies observers, and
    /// waits (bounded) for their cleanup. Returns the number of cancelled
    /// keys.
    ///
    /// The wait never exceeds the configured cleanup timeout, even when an
    /// observer hangs.
    pub async fn cancel_scope(&self, scope: &str) -> usize {
        let keys: Vec<RequestKey> = {
            let inflight = self.inner.lock_inflight();
            inflight
                .iter()
                .filter(|(_, entry)| entry.scope.as_deref() == Some(scope))
                .map(|(key, entry)| {
                    entry.cancel.cancel();
                    key.clone()
                })
                .collect()
        };
        debug!(scope, cancelled = keys.len(), "scope cancelled");

        let deadline = Instant::now() + self.inner.config.cleanup_timeout;
        let barrier = CleanupBarrier::new();
        let notify = async {
            for observer in &self.inner.observers {
                observer.scope_ending(scope, &keys, &barrier).await;
            }
        };
        if tokio::time::timeout(deadline.saturating_duration_since(Instant::now()), notify)
            .await
            .is_err()
        {
            warn!(scope, "scope observer notification timed out — proceeding");
        }
        barrier
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await;

        keys.len()
    }

    /// Cancels every tracked request. Returns the number of cancelled keys.
    pub fn cancel_all(&self) -> usize {
        let inflight = self.inner.lock_inflight();
        for entry in inflight.values() {
            entry.cancel.cancel();
        }
        inflight.len()
    }

    // ── Observability ─────────────────────────────────────────────────────────

    /// A point-in-time copy of the engine counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// A read-only projection of the inflight table.
    pub fn inflight(&self) -> Vec<InflightSnapshot> {
        self.inner
            .lock_inflight()
            .iter()
            .map(|(key, entry)| InflightSnapshot {
                key: key.as_str().to_owned(),
                phase: entry.phase,
                scope: entry.scope.clone(),
                attempts: entry.attempts.load(Ordering::Relaxed),
                callers: entry.callers,
                elapsed_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// The cache manager, for explicit invalidation.
    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }
}

impl EngineInner {
    /// Runs as the single flight for `key` on its own task.
    async fn run_network_op(
        self: Arc<Self>,
        request: FetchRequest,
        key: RequestKey,
        cancel: CancelHandle,
        attempts: Arc<AtomicU32>,
    ) -> Result<RawResponse, FetchError> {
        let started = Instant::now();

        let _permit = tokio::select! {
            permit = self.limiter.acquire() => permit,
            _ = cancel.cancelled() => {
                return Err(FetchError::Cancelled {
                    key,
                    elapsed: started.elapsed(),
                });
            }
        };
        self.set_phase(&key, RequestPhase::Inflight);

        let sent_bytes = request
            .body_bytes()
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        let result = self
            .retry
            .execute(&request, Some(Arc::clone(&attempts)), |_attempt| {
                let inner = Arc::clone(&self);
                let mut attempt_request = request.clone();
                let key = key.clone();
                let cancel = cancel.clone();
                async move {
                    inner.metrics.record_bytes_sent(sent_bytes);
                    let transport = Arc::clone(&inner.transport);
                    inner
                        .pipeline
                        .execute(&mut attempt_request, &key, started, &transport, &cancel)
                        .await
                }
            })
            .await;

        let total_attempts = attempts.load(Ordering::Relaxed) as u64;
        self.metrics.record_retries(total_attempts.saturating_sub(1));

        match &result {
            Ok(response) => {
                // Actual byte length, not a character count.
                self.metrics.record_bytes_received(response.body_len() as u64);
                self.metrics
                    .record_latency(started.elapsed().as_millis() as u64);
                if request.policy().writes_cache() {
                    self.cache.put(&key, &request, response).await;
                }
            }
            Err(err) if err.is_cancelled() => {}
            Err(_) => self.metrics.record_failure(),
        }
        result
    }

    /// Adds a caller to the inflight entry for `key`, creating it if absent.
    fn register_caller(
        &self,
        request: &FetchRequest,
        key: &RequestKey,
    ) -> (Arc<AtomicU32>, CancelHandle) {
        let mut inflight = self.lock_inflight();
        let entry = inflight.entry(key.clone()).or_insert_with(|| InflightEntry {
            phase: RequestPhase::Pending,
            scope: request.scope_tag().map(str::to_owned),
            started: Instant::now(),
            attempts: Arc::new(AtomicU32::new(0)),
            cancel: CancelHandle::new(),
            callers: 0,
        });
        entry.callers += 1;
        (Arc::clone(&entry.attempts), entry.cancel.clone())
    }

    fn set_phase(&self, key: &RequestKey, phase: RequestPhase) {
        if let Some(entry) = self.lock_inflight().get_mut(key) {
            entry.phase = phase;
        }
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestKey, InflightEntry>> {
        self.inflight.lock().expect("inflight table mutex poisoned")
    }
}

/// Removes this caller from the inflight entry, dropping the entry when the
/// last caller leaves.
struct CallerGuard {
    inner: Arc<EngineInner>,
    key: RequestKey,
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.inner.inflight.lock() {
            if let Some(entry) = inflight.get_mut(&self.key) {
                entry.callers = entry.callers.saturating_sub(1);
                if entry.callers == 0 {
                    inflight.remove(&self.key);
                }
            }
        }
    }
}

/// Combines the key-level cancel with an optional caller-owned one.
///
/// Dropping the returned sender ends the forwarding task once the caller
/// settles, so un-fired handles never leak a task.
fn merged_cancel(
    entry: &CancelHandle,
    caller: Option<&CancelHandle>,
) -> (CancelHandle, Option<oneshot::Sender<()>>) {
    let Some(caller) = caller else {
        return (entry.clone(), None);
    };

    let merged = CancelHandle::new();
    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    let entry = entry.clone();
    let caller = caller.clone();
    let out = merged.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = entry.cancelled() => out.cancel(),
            _ = caller.cancelled() => out.cancel(),
            _ = &mut done_rx => {}
        }
    });
    (merged, Some(done_tx))
}
