//! Out-of-band callback endpoint
//!
//! Components that plant URLs in payloads (to detect blind or delayed
//! triggers) register a path prefix here. Every request hitting the callback
//! listener is routed to the handler with the longest matching prefix.

use crate::admin::Metrics;
use crate::error::InterceptError;
use crate::message::{Headers, HttpMessage, HttpRequest, HttpResponse};
use crate::Result;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Path answered by the router itself, for checking reachability.
pub const SELF_TEST_PATH: &str = "/CallbackTest";
pub const SELF_TEST_RESPONSE: &str = "Callback listener is working";

const FAVICON_PATH: &str = "/favicon.ico";
const RECENT_CALLBACKS: usize = 100;
const MAX_CALLBACK_BODY: usize = 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Callback prefix already registered: {0}")]
    DuplicatePrefix(String),

    #[error("Callback prefix must start with '/': {0:?}")]
    InvalidPrefix(String),
}

pub trait CallbackHandler: Send + Sync {
    /// Receives a private copy of the request; changes stay local.
    fn handle_callback(&self, msg: &mut HttpMessage);
}

/// Result of routing one inbound callback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    SelfTest,
    /// Browser noise that is accepted without dispatch
    Absorbed,
    Dispatched { prefix: String },
    Unmatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceivedCallback {
    pub prefix: Option<String>,
    pub url: String,
    pub method: String,
    pub received_at: DateTime<Utc>,
    pub source: Option<String>,
}

pub struct CallbackRouter {
    handlers: DashMap<String, Arc<dyn CallbackHandler>>,
    recent: Mutex<VecDeque<ReceivedCallback>>,
    base_url: RwLock<Option<String>>,
    metrics: Arc<Metrics>,
}

impl Default for CallbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CALLBACKS)),
            base_url: RwLock::new(None),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registers `handler` under `prefix`. An existing registration is kept.
    pub fn register_prefix(
        &self,
        prefix: &str,
        handler: Arc<dyn CallbackHandler>,
    ) -> std::result::Result<(), CallbackError> {
        if !prefix.starts_with('/') {
            error!(prefix, "Rejected callback prefix without leading '/'");
            return Err(CallbackError::InvalidPrefix(prefix.to_string()));
        }

        match self.handlers.entry(prefix.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                error!(prefix, "Callback prefix already registered");
                Err(CallbackError::DuplicatePrefix(prefix.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                info!(prefix, "Callback prefix registered");
                Ok(())
            }
        }
    }

    pub fn deregister(&self, prefix: &str) -> bool {
        self.handlers.remove(prefix).is_some()
    }

    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        prefixes.sort();
        prefixes
    }

    pub fn set_base_url(&self, url: impl Into<String>) {
        *self.base_url.write() = Some(url.into());
    }

    /// Public URL of the callback listener, once known.
    pub fn callback_url(&self) -> Option<String> {
        self.base_url.read().clone()
    }

    /// Most recent callbacks, oldest first.
    pub fn received(&self) -> Vec<ReceivedCallback> {
        self.recent.lock().iter().cloned().collect()
    }

    fn longest_match(&self, path: &str) -> Option<(String, Arc<dyn CallbackHandler>)> {
        self.handlers
            .iter()
            .filter(|entry| path.starts_with(entry.key().as_str()))
            .max_by_key(|entry| entry.key().len())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn route(&self, msg: &HttpMessage) -> CallbackOutcome {
        self.route_from(msg, None)
    }

    pub fn route_from(&self, msg: &HttpMessage, source: Option<SocketAddr>) -> CallbackOutcome {
        let path = msg.path();
        if path == SELF_TEST_PATH {
            return CallbackOutcome::SelfTest;
        }
        if path == FAVICON_PATH {
            return CallbackOutcome::Absorbed;
        }

        self.metrics.callbacks_received.fetch_add(1, Ordering::Relaxed);
        let matched = self.longest_match(&path);
        self.record(msg, matched.as_ref().map(|(prefix, _)| prefix.clone()), source);

        match matched {
            Some((prefix, handler)) => {
                debug!(%prefix, %path, "Dispatching callback");
                let mut copy = msg.clone();
                handler.handle_callback(&mut copy);
                CallbackOutcome::Dispatched { prefix }
            }
            None => {
                self.metrics.callbacks_unmatched.fetch_add(1, Ordering::Relaxed);
                error!(%path, "No callback handler for request");
                CallbackOutcome::Unmatched
            }
        }
    }

    fn record(&self, msg: &HttpMessage, prefix: Option<String>, source: Option<SocketAddr>) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_CALLBACKS {
            recent.pop_front();
        }
        recent.push_back(ReceivedCallback {
            prefix,
            url: msg.request.url.clone(),
            method: msg.request.method.clone(),
            received_at: Utc::now(),
            source: source.map(|addr| addr.to_string()),
        });
    }

    /// Reply sent back to the caller. Handlers never influence it.
    pub fn response_for(outcome: &CallbackOutcome) -> HttpResponse {
        match outcome {
            CallbackOutcome::SelfTest => {
                HttpResponse::with_body(200, "text/plain; charset=UTF-8", SELF_TEST_RESPONSE)
            }
            _ => HttpResponse::with_body(200, "text/html; charset=UTF-8", Vec::new()),
        }
    }
}

/// A bound callback listener.
pub struct CallbackServer {
    listener: TcpListener,
    router: Arc<CallbackRouter>,
}

impl CallbackServer {
    /// Binds `addr` and, unless one is configured, advertises the bound
    /// address as the callback URL.
    pub async fn bind(router: Arc<CallbackRouter>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            InterceptError::Network(format!("Failed to bind callback listener {}: {}", addr, e))
        })?;
        let local = listener.local_addr()?;
        if router.callback_url().is_none() {
            router.set_base_url(format!("http://{}", local));
        }
        info!("Callback listener on {}", local);
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new()
            .fallback(callback_handler)
            .with_state(self.router);

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| InterceptError::Network(format!("Callback server failed: {}", e)))
    }
}

/// Binds and serves callbacks until `shutdown` completes.
pub async fn serve_callbacks<F>(router: Arc<CallbackRouter>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    CallbackServer::bind(router, addr).await?.run(shutdown).await
}

async fn callback_handler(
    State(router): State<Arc<CallbackRouter>>,
    ConnectInfo(source): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_CALLBACK_BODY).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            debug!("Failed to read callback body: {}", e);
            Vec::new()
        }
    };

    let mut headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.append(name.as_str(), value);
        }
    }
    let mut request = HttpRequest::new(parts.method.as_str(), parts.uri.to_string());
    request.headers = headers;
    request.body = body;

    let outcome = router.route_from(&HttpMessage::new(request), Some(source));
    into_axum_response(CallbackRouter::response_for(&outcome))
}

fn into_axum_response(response: HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in response.headers.iter() {
        builder = builder.header(name, value);
    }
    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build callback response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mutating {
        seen: Mutex<Vec<String>>,
    }

    impl CallbackHandler for Mutating {
        fn handle_callback(&self, msg: &mut HttpMessage) {
            self.seen.lock().push(msg.path());
            msg.request.body = b"tampered".to_vec();
            msg.request.headers.set("X-Injected", "1");
            msg.response = Some(HttpResponse::with_body(200, "text/plain", "smuggled"));
        }
    }

    fn mutating() -> Arc<Mutating> {
        Arc::new(Mutating {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_handler_cannot_touch_original() {
        let router = CallbackRouter::new();
        let handler = mutating();
        router.register_prefix("/scan", handler.clone()).unwrap();

        let mut original = HttpMessage::get("http://cb.test/scan/42");
        original.request.body = b"original".to_vec();
        let before = original.clone();

        let outcome = router.route(&original);
        assert_eq!(
            outcome,
            CallbackOutcome::Dispatched {
                prefix: "/scan".to_string()
            }
        );
        assert_eq!(original, before);
        assert_eq!(*handler.seen.lock(), vec!["/scan/42".to_string()]);

        let reply = CallbackRouter::response_for(&outcome);
        assert!(reply.body.is_empty());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = CallbackRouter::new();
        let short = mutating();
        let long = mutating();
        router.register_prefix("/a", short.clone()).unwrap();
        router.register_prefix("/a/b", long.clone()).unwrap();

        router.route(&HttpMessage::get("/a/b/c"));
        router.route(&HttpMessage::get("/a/x"));
        assert_eq!(*long.seen.lock(), vec!["/a/b/c".to_string()]);
        assert_eq!(*short.seen.lock(), vec!["/a/x".to_string()]);
    }

    #[test]
    fn test_duplicate_and_invalid_prefixes() {
        let router = CallbackRouter::new();
        let first = mutating();
        router.register_prefix("/dup", first.clone()).unwrap();
        assert_eq!(
            router.register_prefix("/dup", mutating()),
            Err(CallbackError::DuplicatePrefix("/dup".to_string()))
        );
        assert_eq!(
            router.register_prefix("dup", mutating()),
            Err(CallbackError::InvalidPrefix("dup".to_string()))
        );

        router.route(&HttpMessage::get("/dup"));
        assert_eq!(first.seen.lock().len(), 1);
        assert_eq!(router.prefixes(), vec!["/dup".to_string()]);

        assert!(router.deregister("/dup"));
        assert_eq!(router.route(&HttpMessage::get("/dup")), CallbackOutcome::Unmatched);
    }

    #[test]
    fn test_reserved_paths() {
        let router = CallbackRouter::new();
        let handler = mutating();
        router.register_prefix("/", handler.clone()).unwrap();

        let outcome = router.route(&HttpMessage::get("/CallbackTest"));
        assert_eq!(outcome, CallbackOutcome::SelfTest);
        assert_eq!(
            CallbackRouter::response_for(&outcome).body,
            SELF_TEST_RESPONSE.as_bytes()
        );
        assert_eq!(
            router.route(&HttpMessage::get("/favicon.ico")),
            CallbackOutcome::Absorbed
        );
        assert!(handler.seen.lock().is_empty());
        assert!(router.received().is_empty());
    }

    #[test]
    fn test_received_log_is_bounded() {
        let router = CallbackRouter::new();
        for i in 0..(RECENT_CALLBACKS + 5) {
            router.route(&HttpMessage::get(format!("/miss/{}", i)));
        }
        let received = router.received();
        assert_eq!(received.len(), RECENT_CALLBACKS);
        assert_eq!(received[0].url, "/miss/5");
        assert!(received.iter().all(|r| r.prefix.is_none()));
    }
}
