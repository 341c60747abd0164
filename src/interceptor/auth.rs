//! Bearer-token injection with single-flight refresh on 401.
//!
//! The interceptor stamps `Authorization` on the way in. When the server
//! rejects the credential, exactly one caller performs the refresh while
//! concurrent rejections wait and reuse its result, then the original
//! request is re-sent once with the fresh token. A second rejection
//! surfaces as-is; there is no refresh loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Interceptor;
use crate::error::FetchError;
use crate::http::{FetchRequest, RawResponse};
use crate::transport::Transport;

/// Supplies and renews the credential the interceptor injects.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The current token, if one is held.
    async fn token(&self) -> Option<String>;

    /// Obtains a fresh token after the current one was rejected.
    async fn refresh(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

/// Injects `Authorization` and transparently recovers from credential
/// expiry.
///
/// Holds its own [`Transport`] reference so the recovery re-send bypasses
/// the pipeline: hooks that already ran for the attempt do not run twice.
pub struct AuthInterceptor {
    provider: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    // Serializes refreshes so concurrent rejections share one.
    refresh_lock: Mutex<()>,
}

impl AuthInterceptor {
    pub fn new(provider: Arc<dyn CredentialProvider>, transport: Arc<dyn Transport>) -> Self {
        Self {
            provider,
            transport,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Refreshes the credential unless the token the rejected attempt went
    /// out with has already been replaced.
    ///
    /// The comparison happens under the lock: a 401 that arrives any time
    /// after a completed refresh sees the newer token and skips.
    async fn refresh_once(
        &self,
        rejected: Option<&str>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(rejected) = rejected {
            if self.provider.token().await.as_deref() != Some(rejected) {
                debug!("credential already refreshed since the rejected attempt");
                return Ok(());
            }
        }
        self.provider.refresh().await?;
        Ok(())
    }

    async fn resend(&self, request: &FetchRequest) -> Result<RawResponse, FetchError> {
        let mut retry = request.clone();
        if let Some(token) = self.provider.token().await {
            retry
                .headers_mut()
                .set("Authorization", format!("Bearer {token}"));
        }
        let cancel = request.caller_cancel().cloned().unwrap_or_default();

        let key = crate::key::RequestKey::from_request(&retry);
        match self.transport.send(&retry, &cancel).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(FetchError::from_status(
                key,
                std::time::Duration::ZERO,
                response.status(),
                response.retry_after(),
            )),
            Err(err) => Err(FetchError::from_transport(
                key,
                std::time::Duration::ZERO,
                err,
            )),
        }
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    fn name(&self) -> &str {
        "auth"
    }

    /// Innermost by default, so the token is stamped after every other
    /// request hook has shaped the request.
    fn priority(&self) -> i32 {
        100
    }

    async fn on_request(&self, request: &mut FetchRequest) -> Result<(), FetchError> {
        if request.headers().get("authorization").is_none() {
            if let Some(token) = self.provider.token().await {
                request
                    .headers_mut()
                    .set("Authorization", format!("Bearer {token}"));
            }
        }
        Ok(())
    }

    async fn on_error(
        &self,
        request: &FetchRequest,
        error: FetchError,
    ) -> Result<RawResponse, FetchError> {
        if error.status() != Some(401) {
            return Err(error);
        }

        let rejected = request
            .headers()
            .get("authorization")
            .and_then(|value| value.strip_prefix("Bearer "));
        if let Err(refresh_err) = self.refresh_once(rejected).await {
            warn!(error = %refresh_err, "credential refresh failed");
            return Err(error);
        }

        debug!(url = request.url(), "re-sending with refreshed credential");
        self.resend(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::http::Method;
    use crate::key::RequestKey;
    use crate::transport::{CancelHandle, TransportError};

    struct RotatingProvider {
        tokens: StdMutex<Vec<&'static str>>,
        current: StdMutex<Option<String>>,
        refreshes: AtomicU32,
        fail: bool,
    }

    impl RotatingProvider {
        fn new(initial: &str, next: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                tokens: StdMutex::new(next),
                current: StdMutex::new(Some(initial.to_owned())),
                refreshes: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing(initial: &str) -> Arc<Self> {
            Arc::new(Self {
                tokens: StdMutex::new(Vec::new()),
                current: StdMutex::new(Some(initial.to_owned())),
                refreshes: AtomicU32::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl CredentialProvider for RotatingProvider {
        async fn token(&self) -> Option<String> {
            self.current.lock().unwrap().clone()
        }

        async fn refresh(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("refresh endpoint unavailable".into());
            }
            let fresh = self
                .tokens
                .lock()
                .unwrap()
                .pop()
                .expect("no token left to rotate in")
                .to_owned();
            *self.current.lock().unwrap() = Some(fresh.clone());
            Ok(fresh)
        }
    }

    /// Accepts only the given token; everything else gets a 401.
    struct TokenGate {
        accepts: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for TokenGate {
        async fn send(
            &self,
            request: &FetchRequest,
            _cancel: &CancelHandle,
        ) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let expected = format!("Bearer {}", self.accepts);
            match request.headers().get("authorization") {
                Some(value) if value == expected => Ok(RawResponse::new(200).body("granted")),
                _ => Ok(RawResponse::new(401)),
            }
        }
    }

    fn unauthorized(request: &FetchRequest) -> FetchError {
        FetchError::from_status(
            RequestKey::from_request(request),
            Duration::ZERO,
            401,
            None,
        )
    }

    #[tokio::test]
    async fn injects_bearer_token_on_request() {
        let provider = RotatingProvider::new("tok-1", vec![]);
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "tok-1",
            calls: AtomicU32::new(0),
        });
        let auth = AuthInterceptor::new(provider, transport);

        let mut request = FetchRequest::new(Method::Get, "https://api.example.com/me");
        auth.on_request(&mut request).await.unwrap();

        assert_eq!(
            request.headers().get("authorization"),
            Some("Bearer tok-1")
        );
    }

    #[tokio::test]
    async fn existing_authorization_header_is_left_alone() {
        let provider = RotatingProvider::new("tok-1", vec![]);
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "tok-1",
            calls: AtomicU32::new(0),
        });
        let auth = AuthInterceptor::new(provider, transport);

        let mut request = FetchRequest::new(Method::Get, "https://api.example.com/me")
            .header("Authorization", "Bearer caller-supplied");
        auth.on_request(&mut request).await.unwrap();

        assert_eq!(
            request.headers().get("authorization"),
            Some("Bearer caller-supplied")
        );
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_resent() {
        let provider = RotatingProvider::new("stale", vec!["fresh"]);
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "fresh",
            calls: AtomicU32::new(0),
        });
        let auth = AuthInterceptor::new(Arc::clone(&provider) as _, transport);

        let request = FetchRequest::new(Method::Get, "https://api.example.com/me");
        let response = auth
            .on_error(&request, unauthorized(&request))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_rejections_refresh_once() {
        let provider = RotatingProvider::new("stale", vec!["fresh"]);
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "fresh",
            calls: AtomicU32::new(0),
        });
        let auth = Arc::new(AuthInterceptor::new(Arc::clone(&provider) as _, transport));

        // Every attempt went out carrying the same stale token.
        let mut request = FetchRequest::new(Method::Get, "https://api.example.com/me");
        auth.on_request(&mut request).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let auth = Arc::clone(&auth);
            let request = request.clone();
            let error = unauthorized(&request);
            tasks.push(tokio::spawn(async move {
                auth.on_error(&request, error).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().status(), 200);
        }

        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_rejection_after_a_refresh_does_not_refresh_again() {
        let provider = RotatingProvider::new("stale", vec!["fresh"]);
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "fresh",
            calls: AtomicU32::new(0),
        });
        let auth = AuthInterceptor::new(Arc::clone(&provider) as _, transport);

        let mut first = FetchRequest::new(Method::Get, "https://api.example.com/me");
        auth.on_request(&mut first).await.unwrap();
        auth.on_error(&first, unauthorized(&first)).await.unwrap();

        // A straggler that was sent with the old token and got its 401 back
        // only after the refresh completed.
        let late = FetchRequest::new(Method::Get, "https://api.example.com/me")
            .header("Authorization", "Bearer stale");
        let response = auth.on_error(&late, unauthorized(&late)).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_surfaces_the_original_error() {
        let provider = RotatingProvider::failing("stale");
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "never",
            calls: AtomicU32::new(0),
        });
        let auth = AuthInterceptor::new(provider, transport);

        let request = FetchRequest::new(Method::Get, "https://api.example.com/me");
        let err = auth
            .on_error(&request, unauthorized(&request))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn non_auth_errors_pass_through() {
        let provider = RotatingProvider::new("tok", vec![]);
        let transport: Arc<dyn Transport> = Arc::new(TokenGate {
            accepts: "tok",
            calls: AtomicU32::new(0),
        });
        let auth = AuthInterceptor::new(Arc::clone(&provider) as _, transport);

        let request = FetchRequest::new(Method::Get, "https://api.example.com/me");
        let original = FetchError::from_status(
            RequestKey::from_request(&request),
            Duration::ZERO,
            503,
            None,
        );
        let err = auth.on_error(&request, original).await.unwrap_err();

        assert_eq!(err.status(), Some(503));
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 0);
    }
}
