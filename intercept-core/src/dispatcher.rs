//! Interception entry point
//!
//! Every outbound request, inbound response and WebSocket frame enters the
//! [`ListenerDispatcher`]. It reads the current [`Mode`] first, then hands the
//! message to each registered listener in ascending `observing_order`.
//! Listeners run inline on the connection's task, so a held breakpoint
//! stalls only that connection.

use crate::admin::Metrics;
use crate::message::{HttpMessage, WebSocketMessage};
use crate::session::{Mode, ModeProvider, ScopeService};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What should happen to a message after a listener saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerVerdict {
    Forward,
    Drop,
}

/// Per-message context handed to listeners.
#[derive(Debug, Clone, Default)]
pub struct InterceptContext {
    /// Cancelled when the client connection goes away
    pub cancel: CancellationToken,
}

impl InterceptContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
pub trait ProxyListener: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first; equal orders run in registration order.
    fn observing_order(&self) -> i32;

    async fn on_request(&self, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict;

    async fn on_response(&self, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict;
}

#[async_trait]
pub trait WebSocketObserver: Send + Sync {
    fn name(&self) -> &str;

    fn observing_order(&self) -> i32;

    async fn on_frame(
        &self,
        channel_id: u64,
        msg: &mut WebSocketMessage,
        ctx: &InterceptContext,
    ) -> ListenerVerdict;
}

type Snapshot<T> = Arc<Vec<Arc<T>>>;

/// Copy-on-write insert keeping `list` ordered by `order`, after equals.
fn insert_ordered<T: ?Sized>(
    slot: &RwLock<Snapshot<T>>,
    item: Arc<T>,
    order: impl Fn(&T) -> i32,
) {
    let mut guard = slot.write();
    let mut next: Vec<Arc<T>> = (**guard).clone();
    let key = order(item.as_ref());
    let pos = next.partition_point(|existing| order(existing.as_ref()) <= key);
    next.insert(pos, item);
    *guard = Arc::new(next);
}

pub struct ListenerDispatcher {
    mode: Arc<dyn ModeProvider>,
    scope: Arc<dyn ScopeService>,
    proxy_listeners: RwLock<Snapshot<dyn ProxyListener>>,
    ws_observers: RwLock<Snapshot<dyn WebSocketObserver>>,
    metrics: Arc<Metrics>,
}

impl ListenerDispatcher {
    pub fn new(mode: Arc<dyn ModeProvider>, scope: Arc<dyn ScopeService>) -> Self {
        Self {
            mode,
            scope,
            proxy_listeners: RwLock::new(Arc::new(Vec::new())),
            ws_observers: RwLock::new(Arc::new(Vec::new())),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn add_proxy_listener(&self, listener: Arc<dyn ProxyListener>) {
        info!(
            listener = listener.name(),
            order = listener.observing_order(),
            "Registered proxy listener"
        );
        insert_ordered(&self.proxy_listeners, listener, |l| l.observing_order());
    }

    pub fn add_websocket_observer(&self, observer: Arc<dyn WebSocketObserver>) {
        info!(
            observer = observer.name(),
            order = observer.observing_order(),
            "Registered WebSocket observer"
        );
        insert_ordered(&self.ws_observers, observer, |o| o.observing_order());
    }

    pub fn remove_proxy_listener(&self, name: &str) {
        let mut guard = self.proxy_listeners.write();
        let next: Vec<_> = guard.iter().filter(|l| l.name() != name).cloned().collect();
        *guard = Arc::new(next);
    }

    pub fn proxy_listener_names(&self) -> Vec<String> {
        self.proxy_listeners
            .read()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// Mode gate, evaluated fresh for every message.
    fn side_effects_allowed(&self, target_url: &str) -> bool {
        match self.mode.mode() {
            Mode::Safe => false,
            Mode::Protect => self.scope.is_in_scope(target_url),
            Mode::Standard => true,
        }
    }

    pub async fn on_request(&self, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        if !self.side_effects_allowed(&msg.request.url) {
            self.metrics.gated.fetch_add(1, Ordering::Relaxed);
            debug!(url = %msg.request.url, "Request passed through by mode gate");
            return ListenerVerdict::Forward;
        }

        let listeners = self.proxy_listeners.read().clone();
        for listener in listeners.iter() {
            if listener.on_request(msg, ctx).await == ListenerVerdict::Drop {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                info!(listener = listener.name(), url = %msg.request.url, "Request dropped");
                return ListenerVerdict::Drop;
            }
        }
        ListenerVerdict::Forward
    }

    pub async fn on_response(&self, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict {
        self.metrics.responses.fetch_add(1, Ordering::Relaxed);
        if !self.side_effects_allowed(&msg.request.url) {
            self.metrics.gated.fetch_add(1, Ordering::Relaxed);
            return ListenerVerdict::Forward;
        }

        let listeners = self.proxy_listeners.read().clone();
        for listener in listeners.iter() {
            if listener.on_response(msg, ctx).await == ListenerVerdict::Drop {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                info!(listener = listener.name(), url = %msg.request.url, "Response dropped");
                return ListenerVerdict::Drop;
            }
        }
        ListenerVerdict::Forward
    }

    pub async fn on_frame(
        &self,
        channel_id: u64,
        msg: &mut WebSocketMessage,
        ctx: &InterceptContext,
    ) -> ListenerVerdict {
        self.metrics.frames.fetch_add(1, Ordering::Relaxed);
        if !self.side_effects_allowed(&msg.handshake_url) {
            self.metrics.gated.fetch_add(1, Ordering::Relaxed);
            return ListenerVerdict::Forward;
        }

        let observers = self.ws_observers.read().clone();
        for observer in observers.iter() {
            if observer.on_frame(channel_id, msg, ctx).await == ListenerVerdict::Drop {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(observer = observer.name(), channel_id, "Frame dropped");
                return ListenerVerdict::Drop;
            }
        }
        ListenerVerdict::Forward
    }
}
