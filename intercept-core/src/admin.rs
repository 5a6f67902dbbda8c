use crate::Result;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Shared interception counters
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub frames: AtomicU64,
    /// Messages a listener decided to drop
    pub dropped: AtomicU64,
    /// Messages passed through untouched because of the mode gate
    pub gated: AtomicU64,
    pub filter_failures: AtomicU64,
    pub breakpoints_hit: AtomicU64,
    pub callbacks_received: AtomicU64,
    pub callbacks_unmatched: AtomicU64,
    pub api_requests: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsResponse {
        MetricsResponse {
            interception: InterceptionMetrics {
                requests: self.requests.load(Ordering::Relaxed),
                responses: self.responses.load(Ordering::Relaxed),
                frames: self.frames.load(Ordering::Relaxed),
                dropped: self.dropped.load(Ordering::Relaxed),
                gated: self.gated.load(Ordering::Relaxed),
                filter_failures: self.filter_failures.load(Ordering::Relaxed),
                breakpoints_hit: self.breakpoints_hit.load(Ordering::Relaxed),
            },
            callbacks: CallbackMetrics {
                received: self.callbacks_received.load(Ordering::Relaxed),
                unmatched: self.callbacks_unmatched.load(Ordering::Relaxed),
            },
            api_requests: self.api_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub interception: InterceptionMetrics,
    pub callbacks: CallbackMetrics,
    pub api_requests: u64,
}

#[derive(Debug, Serialize)]
pub struct InterceptionMetrics {
    pub requests: u64,
    pub responses: u64,
    pub frames: u64,
    pub dropped: u64,
    pub gated: u64,
    pub filter_failures: u64,
    pub breakpoints_hit: u64,
}

#[derive(Debug, Serialize)]
pub struct CallbackMetrics {
    pub received: u64,
    pub unmatched: u64,
}

pub fn admin_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || metrics_handler(metrics)))
}

/// Serve `/health` and `/metrics` until `shutdown` completes.
pub async fn start_admin_server<F>(port: u16, metrics: Arc<Metrics>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::error::InterceptError::Network(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, admin_router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| crate::error::InterceptError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(metrics: Arc<Metrics>) -> Json<MetricsResponse> {
    Json(metrics.snapshot())
}
