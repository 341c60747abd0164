//! End-to-end demo over an in-process transport.
//!
//! Wires a [`FetchEngine`] with the logger interceptor and a toy transport
//! that serves canned JSON, then shows caching and coalescing:
//! five concurrent identical requests produce a single "network" call, and
//! a follow-up request is answered from the cache.
//!
//! Run with: `cargo run --example fetch`

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqkit::engine::FetchEngine;
use reqkit::http::{FetchRequest, Method, RawResponse};
use reqkit::interceptor::LoggerInterceptor;
use reqkit::transport::{CancelHandle, Transport, TransportError};

/// Serves a canned catalog after a small artificial delay.
struct DemoTransport {
    calls: AtomicU32,
}

#[async_trait]
impl Transport for DemoTransport {
    async fn send(
        &self,
        request: &FetchRequest,
        _cancel: &CancelHandle,
    ) -> Result<RawResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(RawResponse::new(200)
            .header("Content-Type", "application/json")
            .body(format!(
                r#"{{"url":"{}","network_call":{n}}}"#,
                request.url()
            )))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reqkit=debug".into()),
        )
        .init();

    let transport = Arc::new(DemoTransport {
        calls: AtomicU32::new(0),
    });
    let engine = FetchEngine::builder(Arc::clone(&transport) as Arc<dyn Transport>)
        .interceptor(Arc::new(LoggerInterceptor))
        .build();

    // Five concurrent identical requests coalesce into one network call.
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .get::<serde_json::Value>("https://api.example.com/catalog")
                .await
        }));
    }
    for task in tasks {
        println!("caller got: {}", task.await??);
    }

    // Served from the cache — the transport is not called again.
    let cached: serde_json::Value = engine.get("https://api.example.com/catalog").await?;
    println!("cached:     {cached}");

    println!(
        "network calls: {}",
        transport.calls.load(Ordering::SeqCst)
    );
    println!(
        "metrics:       {}",
        serde_json::to_string_pretty(&engine.metrics())?
    );

    // The full request surface goes through the builder.
    let detailed = engine
        .execute_raw(
            FetchRequest::new(Method::Get, "https://api.example.com/search")
                .query("q", "widgets")
                .query("page", "2")
                .header("Accept", "application/json")
                .scope("demo"),
        )
        .await?;
    println!("detailed:   {}", String::from_utf8_lossy(detailed.bytes()));

    Ok(())
}
