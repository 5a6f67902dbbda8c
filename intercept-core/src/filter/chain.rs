use super::{Filter, FilterError, FilterOutcome, FilterResult};
use crate::admin::Metrics;
use crate::dispatcher::{InterceptContext, ListenerVerdict, ProxyListener, WebSocketObserver};
use crate::message::{HttpMessage, WebSocketMessage};
use crate::session::SessionChangedListener;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Position of the filter chain among proxy listeners.
pub const FILTER_LISTENER_ORDER: i32 = 0;

/// What happened to one message on its way through the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub applied: Vec<u32>,
    pub skipped: Vec<u32>,
    pub failures: Vec<FilterError>,
}

impl ChainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Folds every failure into one [`FilterError::Aggregate`].
    pub fn into_result(self) -> Result<(), FilterError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(FilterError::Aggregate(self.failures))
        }
    }
}

/// Filters ordered by id. Registration swaps in a new snapshot; traffic
/// iterates whatever snapshot was current when the message arrived.
pub struct FilterChain {
    filters: RwLock<Arc<Vec<Arc<dyn Filter>>>>,
    metrics: Arc<Metrics>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(Arc::new(Vec::new())),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Inserts `filter` after every filter with an id less than or equal
    /// to its own.
    pub fn register(&self, filter: Arc<dyn Filter>) {
        let mut guard = self.filters.write();
        let mut next: Vec<Arc<dyn Filter>> = (**guard).clone();
        let id = filter.id();
        let pos = next.partition_point(|existing| existing.id() <= id);
        info!(filter_id = id, name = filter.name(), "Filter registered");
        next.insert(pos, filter);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, id: u32) -> bool {
        let mut guard = self.filters.write();
        let before = guard.len();
        let next: Vec<_> = guard.iter().filter(|f| f.id() != id).cloned().collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn all(&self) -> Vec<Arc<dyn Filter>> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn get(&self, id: u32) -> Option<Arc<dyn Filter>> {
        self.snapshot().iter().find(|f| f.id() == id).cloned()
    }

    pub fn set_enabled(&self, id: u32, enabled: bool) -> bool {
        match self.get(id) {
            Some(filter) => {
                filter.set_enabled(enabled);
                info!(filter_id = id, enabled, "Filter state changed");
                true
            }
            None => false,
        }
    }

    /// Returns every filter to its defaults.
    pub fn reset_all(&self) {
        for filter in self.snapshot().iter() {
            filter.reset();
        }
        debug!("Filters reset");
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn Filter>>> {
        self.filters.read().clone()
    }

    /// Runs `invoke` on every enabled filter. `invoke` returns `None` when
    /// the filter lacks the capability for this message kind.
    fn run<F>(&self, kind: &'static str, mut invoke: F) -> ChainReport
    where
        F: FnMut(&dyn Filter) -> Option<FilterResult>,
    {
        let mut report = ChainReport::default();

        for filter in self.snapshot().iter() {
            if !filter.is_enabled() {
                continue;
            }
            let id = filter.id();
            let result = match catch_unwind(AssertUnwindSafe(|| invoke(filter.as_ref()))) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(_) => Err(FilterError::Panicked { filter_id: id }),
            };

            match result {
                Ok(FilterOutcome::Applied) => report.applied.push(id),
                Ok(FilterOutcome::Skipped) => report.skipped.push(id),
                Err(err) => {
                    match &err {
                        FilterError::ReplacementEscape { .. } => {
                            warn!(filter_id = id, name = filter.name(), kind, error = %err, "Filter replacement rejected")
                        }
                        _ => error!(filter_id = id, name = filter.name(), kind, error = %err, "Filter failed"),
                    }
                    self.metrics.filter_failures.fetch_add(1, Ordering::Relaxed);
                    report.failures.push(err);
                }
            }
        }

        report
    }

    pub fn filter_request(&self, msg: &mut HttpMessage) -> ChainReport {
        self.run("request", |filter| filter.as_http().map(|http| http.on_request(msg)))
    }

    pub fn filter_response(&self, msg: &mut HttpMessage) -> ChainReport {
        self.run("response", |filter| filter.as_http().map(|http| http.on_response(msg)))
    }

    pub fn filter_frame(&self, channel_id: u64, msg: &mut WebSocketMessage) -> ChainReport {
        self.run("frame", |filter| {
            filter.as_websocket().map(|ws| ws.on_frame(channel_id, msg))
        })
    }
}

#[async_trait]
impl ProxyListener for FilterChain {
    fn name(&self) -> &str {
        "filters"
    }

    fn observing_order(&self) -> i32 {
        FILTER_LISTENER_ORDER
    }

    async fn on_request(&self, msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
        self.filter_request(msg);
        ListenerVerdict::Forward
    }

    async fn on_response(&self, msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
        self.filter_response(msg);
        ListenerVerdict::Forward
    }
}

#[async_trait]
impl WebSocketObserver for FilterChain {
    fn name(&self) -> &str {
        "filters"
    }

    fn observing_order(&self) -> i32 {
        FILTER_LISTENER_ORDER
    }

    async fn on_frame(
        &self,
        channel_id: u64,
        msg: &mut WebSocketMessage,
        _ctx: &InterceptContext,
    ) -> ListenerVerdict {
        self.filter_frame(channel_id, msg);
        ListenerVerdict::Forward
    }
}

impl SessionChangedListener for FilterChain {
    fn session_changed(&self) {
        self.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ListenerDispatcher;
    use crate::filter::{HttpFilter, WebSocketFilter};
    use crate::message::Direction;
    use crate::session::{Mode, Session};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Apply,
        Fail,
        Panic,
    }

    struct Recorder {
        id: u32,
        enabled: AtomicBool,
        calls: AtomicUsize,
        behaviour: Behaviour,
    }

    impl Recorder {
        fn new(id: u32, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                id,
                enabled: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                behaviour,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn act(&self, msg: &mut HttpMessage) -> FilterResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Apply => {
                    msg.request.headers.append("X-Filter", self.id.to_string());
                    Ok(FilterOutcome::Applied)
                }
                Behaviour::Fail => Err(FilterError::Failed {
                    filter_id: self.id,
                    reason: "broken".to_string(),
                }),
                Behaviour::Panic => panic!("filter {} exploded", self.id),
            }
        }
    }

    impl Filter for Recorder {
        fn id(&self) -> u32 {
            self.id
        }

        fn name(&self) -> &str {
            "recorder"
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        fn as_http(&self) -> Option<&dyn HttpFilter> {
            Some(self)
        }
    }

    impl HttpFilter for Recorder {
        fn on_request(&self, msg: &mut HttpMessage) -> FilterResult {
            self.act(msg)
        }

        fn on_response(&self, msg: &mut HttpMessage) -> FilterResult {
            self.act(msg)
        }
    }

    struct FrameOnly {
        calls: AtomicUsize,
    }

    impl Filter for FrameOnly {
        fn id(&self) -> u32 {
            1
        }

        fn name(&self) -> &str {
            "frame-only"
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn set_enabled(&self, _enabled: bool) {}

        fn as_websocket(&self) -> Option<&dyn WebSocketFilter> {
            Some(self)
        }
    }

    impl WebSocketFilter for FrameOnly {
        fn on_frame(&self, _channel_id: u64, _msg: &mut WebSocketMessage) -> FilterResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FilterOutcome::Applied)
        }
    }

    #[test]
    fn test_iteration_is_by_id() {
        let chain = FilterChain::new();
        for id in [50, 10, 30] {
            chain.register(Recorder::new(id, Behaviour::Apply));
        }
        let ids: Vec<u32> = chain.all().iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![10, 30, 50]);

        let mut msg = HttpMessage::get("http://a.test/");
        let report = chain.filter_request(&mut msg);
        assert_eq!(report.applied, vec![10, 30, 50]);
        let seen: Vec<&str> = msg.request.headers.iter().map(|(_, v)| v).collect();
        assert_eq!(seen, vec!["10", "30", "50"]);
    }

    #[test]
    fn test_failing_filters_do_not_stop_chain() {
        for behaviour in [Behaviour::Fail, Behaviour::Panic] {
            let chain = FilterChain::new();
            let first = Recorder::new(1, Behaviour::Apply);
            let broken = Recorder::new(2, behaviour);
            let third = Recorder::new(3, Behaviour::Apply);
            chain.register(first.clone());
            chain.register(broken.clone());
            chain.register(third.clone());

            let report = chain.filter_request(&mut HttpMessage::get("http://a.test/"));
            assert_eq!(first.calls(), 1);
            assert_eq!(broken.calls(), 1);
            assert_eq!(third.calls(), 1);
            assert_eq!(report.applied, vec![1, 3]);
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].filter_id(), Some(2));
        }
    }

    #[test]
    fn test_report_aggregates_failures() {
        let chain = FilterChain::new();
        chain.register(Recorder::new(1, Behaviour::Fail));
        chain.register(Recorder::new(2, Behaviour::Panic));
        let report = chain.filter_response(&mut HttpMessage::get("http://a.test/"));
        match report.into_result() {
            Err(FilterError::Aggregate(errors)) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[1], FilterError::Panicked { filter_id: 2 });
            }
            other => panic!("expected aggregate, got {:?}", other),
        }
        assert!(ChainReport::default().into_result().is_ok());
    }

    #[test]
    fn test_disabled_and_capabilities() {
        let chain = FilterChain::new();
        let http = Recorder::new(5, Behaviour::Apply);
        let frames = Arc::new(FrameOnly {
            calls: AtomicUsize::new(0),
        });
        chain.register(http.clone());
        chain.register(frames.clone());

        assert!(chain.set_enabled(5, false));
        assert!(!chain.set_enabled(99, false));
        chain.filter_request(&mut HttpMessage::get("http://a.test/"));
        assert_eq!(http.calls(), 0);
        assert_eq!(frames.calls.load(Ordering::SeqCst), 0);

        let mut frame = WebSocketMessage::text(1, Direction::Outgoing, "hi");
        let report = chain.filter_frame(1, &mut frame);
        assert_eq!(report.applied, vec![1]);
        assert_eq!(http.calls(), 0);
    }

    #[test]
    fn test_reset_and_remove() {
        let chain = FilterChain::new();
        let recorder = Recorder::new(7, Behaviour::Apply);
        chain.register(recorder.clone());
        chain.session_changed();
        assert!(!recorder.is_enabled());
        assert!(chain.get(7).is_some());
        assert!(chain.remove(7));
        assert!(chain.get(7).is_none());
        assert!(!chain.remove(7));
    }

    #[tokio::test]
    async fn test_safe_mode_skips_filters_through_dispatcher() {
        let session = Arc::new(Session::new(Mode::Safe));
        let dispatcher = ListenerDispatcher::new(session.clone(), session.clone());
        let chain = Arc::new(FilterChain::new());
        let recorder = Recorder::new(1, Behaviour::Apply);
        chain.register(recorder.clone());
        dispatcher.add_proxy_listener(chain.clone());

        let ctx = InterceptContext::default();
        let mut msg = HttpMessage::get("http://a.test/");
        dispatcher.on_request(&mut msg, &ctx).await;
        dispatcher.on_response(&mut msg, &ctx).await;
        assert_eq!(recorder.calls(), 0);
        assert!(msg.request.headers.is_empty());

        session.set_mode(Mode::Standard);
        dispatcher.on_request(&mut msg, &ctx).await;
        assert_eq!(recorder.calls(), 1);
    }
}
