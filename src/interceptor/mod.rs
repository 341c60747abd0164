//! Priority-ordered interceptor pipeline around the transport call.
//!
//! Interceptors observe and transform traffic without the engine knowing
//! about any concern beyond ordering. Each interceptor declares a priority;
//! the pipeline runs [`Interceptor::on_request`] in ascending priority order
//! on the way in, then folds the outcome back out in *descending* order —
//! [`Interceptor::on_response`] for successes, [`Interceptor::on_error`] for
//! failures. An interceptor may recover from an error by returning a
//! substitute response, in which case interceptors further out see a
//! success.
//!
//! The pipeline also owns status classification: a non-2xx wire response is
//! converted into [`FetchError::Http`] *before* the unwind, so interceptors
//! like the auth refresher observe a typed 401 rather than a raw status
//! code.
//!
//! ## Core types
//!
//! - [`Interceptor`] — the hook trait.
//! - [`InterceptorPipeline`] — ordered stack, executed once per attempt.
//! - [`LoggerInterceptor`] — built-in request/outcome logger.

pub mod auth;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::http::{FetchRequest, RawResponse};
use crate::key::RequestKey;
use crate::transport::{CancelHandle, Transport};

/// A hook into the request/response path.
///
/// All hooks default to pass-through, so implementations override only the
/// phases they care about.
///
/// # Contract
///
/// - Implementations are shared across tasks and must be `Send + Sync`.
/// - `on_request` runs before the wire call and may mutate the outgoing
///   request in place.
/// - `on_response` and `on_error` run after the wire call, outermost-last;
///   returning `Err` from `on_response` demotes the outcome, returning `Ok`
///   from `on_error` recovers it.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Stable name, used in log lines.
    fn name(&self) -> &str;

    /// Ordering rank. Lower runs earlier on the way in and later on the way
    /// out (outermost). Ties run in registration order.
    fn priority(&self) -> i32 {
        0
    }

    /// Inspect or mutate the outgoing request.
    async fn on_request(&self, _request: &mut FetchRequest) -> Result<(), FetchError> {
        Ok(())
    }

    /// Inspect or replace a successful response.
    async fn on_response(
        &self,
        _request: &FetchRequest,
        response: RawResponse,
    ) -> Result<RawResponse, FetchError> {
        Ok(response)
    }

    /// Observe a failure, optionally recovering with a substitute response.
    async fn on_error(
        &self,
        _request: &FetchRequest,
        error: FetchError,
    ) -> Result<RawResponse, FetchError> {
        Err(error)
    }
}

/// An ordered interceptor stack wrapping the transport call.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use reqkit::interceptor::{InterceptorPipeline, LoggerInterceptor};
///
/// let pipeline = InterceptorPipeline::new().with(Arc::new(LoggerInterceptor));
/// assert_eq!(pipeline.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    // Kept sorted ascending by priority; insertion is stable for ties.
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an interceptor, keeping the stack priority-sorted.
    pub fn add(&mut self, interceptor: Arc<dyn Interceptor>) {
        let at = self
            .interceptors
            .partition_point(|existing| existing.priority() <= interceptor.priority());
        self.interceptors.insert(at, interceptor);
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.add(interceptor);
        self
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// `true` when no interceptors are registered.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs one attempt: request hooks in, the wire call, outcome hooks out.
    ///
    /// `started` anchors the elapsed time attached to errors; the retry
    /// engine calls this once per attempt against the same start instant.
    pub async fn execute(
        &self,
        request: &mut FetchRequest,
        key: &RequestKey,
        started: Instant,
        transport: &Arc<dyn Transport>,
        cancel: &CancelHandle,
    ) -> Result<RawResponse, FetchError> {
        let outcome = match self.run_request_hooks(request).await {
            Ok(()) => match transport.send(request, cancel).await {
                Ok(response) => classify(key, started, response),
                Err(err) => Err(FetchError::from_transport(key.clone(), started.elapsed(), err)),
            },
            Err(err) => Err(err),
        };

        // Unwind outermost-last. Recovery flips the remaining hooks from
        // on_error to on_response.
        let mut result = outcome;
        for interceptor in self.interceptors.iter().rev() {
            result = match result {
                Ok(response) => interceptor.on_response(request, response).await,
                Err(error) => interceptor.on_error(request, error).await,
            };
        }
        result
    }

    async fn run_request_hooks(&self, request: &mut FetchRequest) -> Result<(), FetchError> {
        for interceptor in &self.interceptors {
            if let Err(err) = interceptor.on_request(request).await {
                debug!(
                    interceptor = interceptor.name(),
                    error = %err,
                    "request hook failed"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Classifies a wire response: 2xx passes, anything else becomes a typed
/// [`FetchError::Http`] carrying any `Retry-After` delay.
fn classify(
    key: &RequestKey,
    started: Instant,
    response: RawResponse,
) -> Result<RawResponse, FetchError> {
    if response.is_success() {
        Ok(response)
    } else {
        let retry_after = response.retry_after();
        Err(FetchError::from_status(
            key.clone(),
            started.elapsed(),
            response.status(),
            retry_after,
        ))
    }
}

/// Built-in interceptor that logs each request and its outcome.
///
/// Registers at priority `-100` so it sits outermost: it sees the request
/// before any other hook touches it and the final outcome after every
/// recovery has run.
pub struct LoggerInterceptor;

#[async_trait]
impl Interceptor for LoggerInterceptor {
    fn name(&self) -> &str {
        "logger"
    }

    fn priority(&self) -> i32 {
        -100
    }

    async fn on_request(&self, request: &mut FetchRequest) -> Result<(), FetchError> {
        debug!("{} {}", request.method().as_str(), request.url());
        Ok(())
    }

    async fn on_response(
        &self,
        request: &FetchRequest,
        response: RawResponse,
    ) -> Result<RawResponse, FetchError> {
        info!(
            "{} {} - {}",
            request.method().as_str(),
            request.url(),
            response.status()
        );
        Ok(response)
    }

    async fn on_error(
        &self,
        request: &FetchRequest,
        error: FetchError,
    ) -> Result<RawResponse, FetchError> {
        warn!(
            "{} {} - {}",
            request.method().as_str(),
            request.url(),
            error
        );
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::http::Method;
    use crate::transport::TransportError;

    struct StaticTransport {
        outcomes: Mutex<Vec<Result<RawResponse, TransportError>>>,
    }

    impl StaticTransport {
        fn new(outcomes: Vec<Result<RawResponse, TransportError>>) -> Arc<dyn Transport> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn send(
            &self,
            _request: &FetchRequest,
            _cancel: &CancelHandle,
        ) -> Result<RawResponse, TransportError> {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TransportError::network("no outcome queued")))
        }
    }

    struct Recorder {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_request(&self, _request: &mut FetchRequest) -> Result<(), FetchError> {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            Ok(())
        }

        async fn on_response(
            &self,
            _request: &FetchRequest,
            response: RawResponse,
        ) -> Result<RawResponse, FetchError> {
            self.log.lock().unwrap().push(format!("res:{}", self.name));
            Ok(response)
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new(Method::Get, "https://example.com/things")
    }

    fn key(request: &FetchRequest) -> RequestKey {
        RequestKey::from_request(request)
    }

    #[tokio::test]
    async fn hooks_run_ascending_in_and_descending_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = InterceptorPipeline::new()
            .with(Arc::new(Recorder {
                name: "outer",
                priority: 0,
                log: Arc::clone(&log),
            }))
            .with(Arc::new(Recorder {
                name: "inner",
                priority: 10,
                log: Arc::clone(&log),
            }));

        let transport = StaticTransport::new(vec![Ok(RawResponse::new(200))]);
        let mut req = request();
        let k = key(&req);
        pipeline
            .execute(&mut req, &k, Instant::now(), &transport, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:outer", "req:inner", "res:inner", "res:outer"]
        );
    }

    #[tokio::test]
    async fn non_success_status_becomes_typed_error() {
        let pipeline = InterceptorPipeline::new();
        let transport = StaticTransport::new(vec![Ok(RawResponse::new(429)
            .header("Retry-After", "7"))]);

        let mut req = request();
        let k = key(&req);
        let err = pipeline
            .execute(&mut req, &k, Instant::now(), &transport, &CancelHandle::new())
            .await
            .unwrap_err();

        match err {
            FetchError::Http {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn request_hook_can_inject_headers() {
        struct Stamp;

        #[async_trait]
        impl Interceptor for Stamp {
            fn name(&self) -> &str {
                "stamp"
            }

            async fn on_request(&self, request: &mut FetchRequest) -> Result<(), FetchError> {
                request.headers_mut().set("X-Trace", "abc123");
                Ok(())
            }
        }

        struct Echo;

        #[async_trait]
        impl Transport for Echo {
            async fn send(
                &self,
                request: &FetchRequest,
                _cancel: &CancelHandle,
            ) -> Result<RawResponse, TransportError> {
                let trace = request.headers().get("x-trace").unwrap_or_default();
                Ok(RawResponse::new(200).body(trace))
            }
        }

        let pipeline = InterceptorPipeline::new().with(Arc::new(Stamp));
        let transport: Arc<dyn Transport> = Arc::new(Echo);

        let mut req = request();
        let k = key(&req);
        let response = pipeline
            .execute(&mut req, &k, Instant::now(), &transport, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(response.bytes(), &b"abc123"[..]);
    }

    #[tokio::test]
    async fn error_hook_can_recover_with_substitute_response() {
        struct Fallback;

        #[async_trait]
        impl Interceptor for Fallback {
            fn name(&self) -> &str {
                "fallback"
            }

            async fn on_error(
                &self,
                _request: &FetchRequest,
                error: FetchError,
            ) -> Result<RawResponse, FetchError> {
                if error.status() == Some(503) {
                    Ok(RawResponse::new(200).body("recovered"))
                } else {
                    Err(error)
                }
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        // Outermost recorder must observe the recovery as a success.
        let pipeline = InterceptorPipeline::new()
            .with(Arc::new(Recorder {
                name: "observer",
                priority: -10,
                log: Arc::clone(&log),
            }))
            .with(Arc::new(Fallback));

        let transport = StaticTransport::new(vec![Ok(RawResponse::new(503))]);
        let mut req = request();
        let k = key(&req);
        let response = pipeline
            .execute(&mut req, &k, Instant::now(), &transport, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(response.bytes(), &b"recovered"[..]);
        assert!(log.lock().unwrap().contains(&"res:observer".to_owned()));
    }

    #[tokio::test]
    async fn request_hook_failure_skips_transport() {
        struct Reject;

        #[async_trait]
        impl Interceptor for Reject {
            fn name(&self) -> &str {
                "reject"
            }

            async fn on_request(&self, request: &mut FetchRequest) -> Result<(), FetchError> {
                Err(FetchError::Config {
                    url: request.url().to_owned(),
                    message: "blocked before the wire".into(),
                })
            }
        }

        struct CountingTransport {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Transport for CountingTransport {
            async fn send(
                &self,
                _request: &FetchRequest,
                _cancel: &CancelHandle,
            ) -> Result<RawResponse, TransportError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(RawResponse::new(200))
            }
        }

        let transport = Arc::new(CountingTransport {
            calls: AtomicU32::new(0),
        });
        let pipeline = InterceptorPipeline::new().with(Arc::new(Reject));

        let mut req = request();
        let k = key(&req);
        let err = pipeline
            .execute(
                &mut req,
                &k,
                Instant::now(),
                &(Arc::clone(&transport) as Arc<dyn Transport>),
                &CancelHandle::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Config { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_failure_maps_to_network_error() {
        let pipeline = InterceptorPipeline::new();
        let transport =
            StaticTransport::new(vec![Err(TransportError::network("connection refused"))]);

        let mut req = request();
        let k = key(&req);
        let err = pipeline
            .execute(&mut req, &k, Instant::now(), &transport, &CancelHandle::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Network { .. }));
    }
}
