//! Bounded retry with exponential backoff, gated by idempotency rules.
//!
//! Retrying is only safe when repeating the request cannot change the
//! outcome beyond the first application. The gate is validated *before* the
//! first attempt: GET/HEAD/PUT/DELETE are retryable by default, POST/PATCH
//! (and custom methods) require an explicit opt-in plus an idempotency key,
//! otherwise the request fails fast with a configuration error.
//!
//! Only failures that may be transient are retried: no-response errors
//! (network, timeout), 5xx except 501 Not Implemented, and 429 — honoring a
//! server-provided `Retry-After` delay when present. 4xx (except 429) and
//! cancellations are never retried.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{FetchError, HttpErrorKind};
use crate::http::{FetchRequest, RawResponse};

/// Backoff schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff with a floor and ceiling.
    Exponential {
        /// Initial delay (the floor).
        base: Duration,
        /// Maximum delay (the ceiling).
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay before the retry following attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => *d,
            Self::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = 2u64.saturating_pow(exponent);
                let delay =
                    Duration::from_millis((base.as_millis() as u64).saturating_mul(multiplier));
                delay.min(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Retry configuration applied to every request unless overridden.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum total attempts, the first included.
    pub max_attempts: u32,
    /// Backoff schedule.
    pub backoff: BackoffStrategy,
    /// Randomize each delay within ±50% to avoid synchronized retry storms.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            jitter: true,
        }
    }
}

/// Executes operations with idempotency-gated, bounded retries.
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    /// Creates an engine with the given default policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Validates the request's retry configuration before any attempt.
    ///
    /// Returns whether retries are enabled for this request.
    ///
    /// # Errors
    ///
    /// [`FetchError::Config`] if a non-idempotent method opts into retries
    /// without an idempotency key.
    pub fn validate(&self, request: &FetchRequest) -> Result<bool, FetchError> {
        let method = request.method();
        if method.default_retryable() {
            return Ok(request.retryable_override().unwrap_or(true));
        }

        match request.retryable_override() {
            Some(true) => {
                if request.idempotency_key_value().is_none() {
                    return Err(FetchError::Config {
                        url: request.url().to_owned(),
                        message: format!(
                            "retrying {} requires an idempotency key",
                            method.as_str()
                        ),
                    });
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Runs `op` with retries per the request's configuration.
    ///
    /// `op` receives the 1-indexed attempt number. `attempts` (when given)
    /// is incremented once per attempt so the inflight table can expose a
    /// live count. Validation errors surface before `op` ever runs.
    pub async fn execute<F, Fut>(
        &self,
        request: &FetchRequest,
        attempts: Option<Arc<AtomicU32>>,
        mut op: F,
    ) -> Result<RawResponse, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<RawResponse, FetchError>>,
    {
        let retry_enabled = self.validate(request)?;
        let max_attempts = if retry_enabled {
            request
                .max_attempts_override()
                .unwrap_or(self.policy.max_attempts)
                .max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(counter) = &attempts {
                counter.fetch_add(1, Ordering::Relaxed);
            }

            match op(attempt).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if attempt >= max_attempts || !should_retry(&err) {
                        if attempt > 1 {
                            debug!(
                                url = request.url(),
                                attempt,
                                error = %err,
                                "retries exhausted"
                            );
                        }
                        return Err(err);
                    }
                    let delay = self.delay_for(&err, attempt);
                    debug!(
                        url = request.url(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed — backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before the next attempt: a server-provided `Retry-After` wins
    /// for 429s, otherwise the backoff schedule (optionally jittered).
    fn delay_for(&self, err: &FetchError, attempt: u32) -> Duration {
        if let FetchError::Http {
            status: 429,
            retry_after: Some(delay),
            ..
        } = err
        {
            return *delay;
        }

        let delay = self.policy.backoff.delay_for_attempt(attempt);
        if self.policy.jitter && !delay.is_zero() {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}


/// Retry condition table.
///
/// Transient, response-less failures and throttling retry; everything the
/// client plainly got wrong does not.
pub fn should_retry(err: &FetchError) -> bool {
    match err {
        FetchError::Network { .. } | FetchError::Timeout { .. } => true,
        FetchError::Http { status: 429, .. } => true,
        FetchError::Http {
            kind: HttpErrorKind::Server,
            status,
            ..
        } => *status != 501,
        FetchError::Http { .. }
        | FetchError::Decode { .. }
        | FetchError::Cancelled { .. }
        | FetchError::Config { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::http::Method;
    use crate::key::RequestKey;

    fn engine() -> RetryEngine {
        RetryEngine::new(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffStrategy::Fixed(Duration::from_millis(1)),
            jitter: false,
        })
    }

    fn key_for(request: &FetchRequest) -> RequestKey {
        RequestKey::from_request(request)
    }

    fn server_error(request: &FetchRequest, status: u16) -> FetchError {
        FetchError::from_status(key_for(request), Duration::ZERO, status, None)
    }

    #[test]
    fn validation_table() {
        let engine = engine();

        let get = FetchRequest::new(Method::Get, "https://example.com/a");
        assert!(engine.validate(&get).unwrap());

        let get_opt_out = FetchRequest::new(Method::Get, "https://example.com/a").retryable(false);
        assert!(!engine.validate(&get_opt_out).unwrap());

        let post = FetchRequest::new(Method::Post, "https://example.com/a");
        assert!(!engine.validate(&post).unwrap());

        let post_opted = FetchRequest::new(Method::Post, "https://example.com/a")
            .retryable(true)
            .idempotency_key("op-1");
        assert!(engine.validate(&post_opted).unwrap());
    }

    #[tokio::test]
    async fn non_idempotent_opt_in_without_key_fails_before_any_attempt() {
        let engine = engine();
        let request = FetchRequest::new(Method::Post, "https://example.com/items").retryable(true);

        let calls = AtomicU32::new(0);
        let result = engine
            .execute(&request, None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(RawResponse::new(201)) }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Config { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn post_with_key_retries_through_two_failures() {
        let engine = engine();
        let request = FetchRequest::new(Method::Post, "https://example.com/items")
            .retryable(true)
            .idempotency_key("op-1");

        let attempts = Arc::new(AtomicU32::new(0));
        let req = request.clone();
        let result = engine
            .execute(&request, Some(Arc::clone(&attempts)), move |attempt| {
                let req = req.clone();
                async move {
                    if attempt < 3 {
                        Err(server_error(&req, 503))
                    } else {
                        Ok(RawResponse::new(201).body("created"))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap().status(), 201);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let engine = engine();
        let request = FetchRequest::new(Method::Get, "https://example.com/a");

        let calls = Arc::new(AtomicU32::new(0));
        let req = request.clone();
        let counter = Arc::clone(&calls);
        let result = engine
            .execute(&request, None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let req = req.clone();
                async move { Err(server_error(&req, 404)) }
            })
            .await;

        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_implemented_is_not_retried() {
        let engine = engine();
        let request = FetchRequest::new(Method::Get, "https://example.com/a");

        let calls = Arc::new(AtomicU32::new(0));
        let req = request.clone();
        let counter = Arc::clone(&calls);
        let result = engine
            .execute(&request, None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let req = req.clone();
                async move { Err(server_error(&req, 501)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_never_retried() {
        let engine = engine();
        let request = FetchRequest::new(Method::Get, "https://example.com/a");

        let calls = Arc::new(AtomicU32::new(0));
        let req = request.clone();
        let counter = Arc::clone(&calls);
        let result = engine
            .execute(&request, None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let key = key_for(&req);
                async move {
                    Err(FetchError::Cancelled {
                        key,
                        elapsed: Duration::ZERO,
                    })
                }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn throttling_honors_server_delay() {
        let engine = engine();
        let request = FetchRequest::new(Method::Get, "https://example.com/a");

        let req = request.clone();
        let started = std::time::Instant::now();
        let result = engine
            .execute(&request, None, move |attempt| {
                let req = req.clone();
                async move {
                    if attempt == 1 {
                        Err(FetchError::Http {
                            key: key_for(&req),
                            elapsed: Duration::ZERO,
                            status: 429,
                            kind: HttpErrorKind::Client,
                            retry_after: Some(Duration::from_millis(30)),
                        })
                    } else {
                        Ok(RawResponse::new(200))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap().status(), 200);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(4),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(4)); // capped
    }

    #[test]
    fn retry_condition_table() {
        let request = FetchRequest::new(Method::Get, "https://example.com/a");
        assert!(should_retry(&server_error(&request, 500)));
        assert!(should_retry(&server_error(&request, 503)));
        assert!(!should_retry(&server_error(&request, 501)));
        assert!(should_retry(&server_error(&request, 429)));
        assert!(!should_retry(&server_error(&request, 400)));
        assert!(!should_retry(&server_error(&request, 404)));
    }
}
