//! Message history
//!
//! Completed exchanges are handed to a [`HistoryStore`]; the in-memory
//! store also tracks the hosts, sites and URLs seen, which back the `core`
//! API views and the site report.

use crate::dispatcher::{InterceptContext, ListenerVerdict, ProxyListener};
use crate::message::HttpMessage;
use crate::session::SessionChangedListener;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Runs after filters and breakpoints so it records what was forwarded.
pub const HISTORY_LISTENER_ORDER: i32 = 5000;

/// Opaque reference to a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryRef(pub u64);

pub trait HistoryStore: Send + Sync {
    fn persist(&self, msg: &HttpMessage) -> HistoryRef;

    fn get(&self, reference: HistoryRef) -> Option<HttpMessage>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hosts(&self) -> Vec<String>;

    fn sites(&self) -> Vec<String>;

    fn urls(&self) -> Vec<String>;

    fn clear(&self);
}

#[derive(Default)]
struct Entries {
    messages: VecDeque<HttpMessage>,
    /// Messages dropped from the front; references stay stable across
    /// eviction.
    evicted: u64,
    hosts: BTreeSet<String>,
    sites: BTreeSet<String>,
    urls: BTreeSet<String>,
}

/// In-memory store. Hosts, sites and URLs are kept for the whole session
/// even when messages are evicted.
#[derive(Default)]
pub struct MemoryHistory {
    entries: RwLock<Entries>,
    limit: Option<usize>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `limit` messages, evicting the oldest.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.filter(|limit| *limit > 0);
        self
    }
}

impl HistoryStore for MemoryHistory {
    fn persist(&self, msg: &HttpMessage) -> HistoryRef {
        let mut entries = self.entries.write();
        if let Some(host) = msg.host() {
            entries.hosts.insert(host);
        }
        if let Some(site) = msg.site() {
            entries.sites.insert(site);
        }
        if let Some(url) = msg.url_without_query() {
            entries.urls.insert(url);
        }
        entries.messages.push_back(msg.clone());
        let reference = HistoryRef(entries.evicted + entries.messages.len() as u64);
        if let Some(limit) = self.limit {
            while entries.messages.len() > limit {
                entries.messages.pop_front();
                entries.evicted += 1;
            }
        }
        reference
    }

    fn get(&self, reference: HistoryRef) -> Option<HttpMessage> {
        let entries = self.entries.read();
        let index = reference.0.checked_sub(1)?.checked_sub(entries.evicted)?;
        entries.messages.get(usize::try_from(index).ok()?).cloned()
    }

    fn len(&self) -> usize {
        self.entries.read().messages.len()
    }

    fn hosts(&self) -> Vec<String> {
        self.entries.read().hosts.iter().cloned().collect()
    }

    fn sites(&self) -> Vec<String> {
        self.entries.read().sites.iter().cloned().collect()
    }

    fn urls(&self) -> Vec<String> {
        self.entries.read().urls.iter().cloned().collect()
    }

    fn clear(&self) {
        *self.entries.write() = Entries::default();
    }
}

impl SessionChangedListener for MemoryHistory {
    fn session_changed(&self) {
        self.clear();
    }
}

/// Records every exchange that completes with a response.
pub struct HistoryListener {
    store: Arc<dyn HistoryStore>,
}

impl HistoryListener {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProxyListener for HistoryListener {
    fn name(&self) -> &str {
        "history"
    }

    fn observing_order(&self) -> i32 {
        HISTORY_LISTENER_ORDER
    }

    async fn on_request(&self, _msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
        ListenerVerdict::Forward
    }

    async fn on_response(&self, msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
        let reference = self.store.persist(msg);
        debug!(reference = reference.0, url = %msg.request.url, "Message stored");
        ListenerVerdict::Forward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HttpResponse;

    #[test]
    fn test_persist_tracks_sites() {
        let history = MemoryHistory::new();
        let first = history.persist(&HttpMessage::get("https://A.test/x?q=1"));
        history.persist(&HttpMessage::get("http://b.test:8080/"));
        history.persist(&HttpMessage::get("https://a.test/x?q=2"));

        assert_eq!(first, HistoryRef(1));
        assert_eq!(history.len(), 3);
        assert_eq!(history.hosts(), vec!["a.test", "b.test"]);
        assert_eq!(history.sites(), vec!["http://b.test:8080", "https://a.test:443"]);
        assert_eq!(history.urls(), vec!["http://b.test:8080/", "https://a.test/x"]);
        assert_eq!(
            history.get(first).unwrap().request.url,
            "https://A.test/x?q=1"
        );
        assert!(history.get(HistoryRef(0)).is_none());
        assert!(history.get(HistoryRef(9)).is_none());
    }

    #[test]
    fn test_limit_evicts_oldest() {
        let history = MemoryHistory::new().with_limit(Some(2));
        let refs: Vec<HistoryRef> = ["http://a.test/1", "http://b.test/2", "http://c.test/3"]
            .iter()
            .map(|url| history.persist(&HttpMessage::get(*url)))
            .collect();

        assert_eq!(refs, vec![HistoryRef(1), HistoryRef(2), HistoryRef(3)]);
        assert_eq!(history.len(), 2);
        assert!(history.get(refs[0]).is_none());
        assert_eq!(history.get(refs[1]).unwrap().request.url, "http://b.test/2");
        assert_eq!(history.get(refs[2]).unwrap().request.url, "http://c.test/3");
        assert_eq!(history.hosts(), vec!["a.test", "b.test", "c.test"]);

        history.clear();
        assert_eq!(history.persist(&HttpMessage::get("http://d.test/")), HistoryRef(1));

        let unbounded = MemoryHistory::new().with_limit(Some(0));
        for _ in 0..5 {
            unbounded.persist(&HttpMessage::get("http://a.test/"));
        }
        assert_eq!(unbounded.len(), 5);
    }

    #[tokio::test]
    async fn test_listener_persists_responses() {
        let history = Arc::new(MemoryHistory::new());
        let listener = HistoryListener::new(history.clone());
        let ctx = InterceptContext::default();

        let mut msg = HttpMessage::get("http://a.test/");
        listener.on_request(&mut msg, &ctx).await;
        assert!(history.is_empty());

        msg.response = Some(HttpResponse::new(200));
        listener.on_response(&mut msg, &ctx).await;
        assert_eq!(history.len(), 1);

        history.session_changed();
        assert!(history.is_empty());
        assert!(history.hosts().is_empty());
    }
}
