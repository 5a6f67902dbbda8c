use super::registry::HeldKind;
use crate::admin::Metrics;
use crate::message::HttpMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Operator decision for a held message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakDecision {
    Continue,
    ContinueModified(HttpMessage),
    /// Continue (optionally edited) and break on the very next message
    Step(Option<HttpMessage>),
    Drop,
}

/// A message suspended at a breakpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HeldMessage {
    pub id: Uuid,
    pub kind: HeldKind,
    pub message: HttpMessage,
    pub held_at: DateTime<Utc>,
}

impl HeldMessage {
    pub fn new(kind: HeldKind, message: HttpMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message,
            held_at: Utc::now(),
        }
    }
}

/// The break dialog: given a held message, produce a decision.
#[async_trait]
pub trait BreakHandler: Send + Sync {
    async fn on_break(&self, held: HeldMessage, cancel: &CancellationToken) -> BreakDecision;
}

struct Pending {
    held: HeldMessage,
    edited: bool,
    tx: oneshot::Sender<BreakDecision>,
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<Uuid, Pending>,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Parks held messages until the operator (API or UI) resolves them.
#[derive(Clone, Default)]
pub struct BreakManager {
    /// Maps held message ID -> sender for the decision
    pending: Arc<DashMap<Uuid, Pending>>,
    hold_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl BreakManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release held messages unmodified after `timeout`.
    pub fn with_hold_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hold_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Hold a message and wait for a decision, the connection closing, or
    /// the hold timeout, whichever comes first.
    pub async fn hold(&self, held: HeldMessage, cancel: &CancellationToken) -> BreakDecision {
        let id = held.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                held,
                edited: false,
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        info!(%id, "Message held at breakpoint");

        let limit = self.hold_timeout;
        let expiry = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            decision = rx => decision.unwrap_or(BreakDecision::Continue),
            _ = cancel.cancelled() => {
                info!(%id, "Connection closed while held, abandoning");
                BreakDecision::Drop
            }
            _ = expiry => {
                warn!(%id, "Hold timeout reached, continuing unmodified");
                BreakDecision::Continue
            }
        }
    }

    /// Resolve a held message. Returns false if it is no longer held.
    pub fn resume(&self, id: &Uuid, decision: BreakDecision) -> bool {
        if let Some((_, pending)) = self.pending.remove(id) {
            info!(%id, "Resuming held message");
            let _ = pending.tx.send(decision);
            true
        } else {
            false
        }
    }

    /// Continue with whatever edits were stored via [`Self::update_pending`].
    pub fn continue_pending(&self, id: &Uuid) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => {
                let decision = if pending.edited {
                    BreakDecision::ContinueModified(pending.held.message)
                } else {
                    BreakDecision::Continue
                };
                let _ = pending.tx.send(decision);
                true
            }
            None => false,
        }
    }

    pub fn step(&self, id: &Uuid) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => {
                let edited = pending.edited.then_some(pending.held.message);
                let _ = pending.tx.send(BreakDecision::Step(edited));
                true
            }
            None => false,
        }
    }

    pub fn drop_message(&self, id: &Uuid) -> bool {
        self.resume(id, BreakDecision::Drop)
    }

    /// Releases every held message unmodified.
    pub fn continue_all(&self) -> usize {
        let ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.iter()
            .filter(|id| self.resume(id, BreakDecision::Continue))
            .count()
    }

    /// Replaces the held copy of a message; applied on continue/step.
    pub fn update_pending(&self, id: &Uuid, message: HttpMessage) -> bool {
        match self.pending.get_mut(id) {
            Some(mut pending) => {
                pending.held.message = message;
                pending.edited = true;
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> Vec<HeldMessage> {
        let mut held: Vec<HeldMessage> = self
            .pending
            .iter()
            .map(|entry| entry.value().held.clone())
            .collect();
        held.sort_by_key(|h| h.held_at);
        held
    }

    pub fn pending_message(&self, id: &Uuid) -> Option<HeldMessage> {
        self.pending.get(id).map(|entry| entry.held.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl BreakHandler for BreakManager {
    async fn on_break(&self, held: HeldMessage, cancel: &CancellationToken) -> BreakDecision {
        self.metrics.breakpoints_hit.fetch_add(1, Ordering::Relaxed);
        self.hold(held, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_pending(manager: &BreakManager) -> Uuid {
        loop {
            if let Some(held) = manager.pending().first() {
                return held.id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_hold_and_resume() {
        let manager = BreakManager::new();
        let held = HeldMessage::new(HeldKind::Request, HttpMessage::get("http://a.test/"));
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.hold(held, &CancellationToken::new()).await })
        };

        let id = wait_for_pending(&manager).await;
        assert!(manager.resume(&id, BreakDecision::Drop));
        assert_eq!(task.await.unwrap(), BreakDecision::Drop);
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.resume(&id, BreakDecision::Continue));
    }

    #[tokio::test]
    async fn test_edited_message_is_continued_modified() {
        let manager = BreakManager::new();
        let held = HeldMessage::new(HeldKind::Request, HttpMessage::get("http://a.test/"));
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.hold(held, &CancellationToken::new()).await })
        };

        let id = wait_for_pending(&manager).await;
        let mut edited = manager.pending_message(&id).unwrap().message;
        edited.request.headers.set("X-Edited", "1");
        assert!(manager.update_pending(&id, edited.clone()));
        assert!(manager.continue_pending(&id));
        assert_eq!(task.await.unwrap(), BreakDecision::ContinueModified(edited));
    }

    #[tokio::test]
    async fn test_cancel_abandons_hold() {
        let manager = BreakManager::new();
        let cancel = CancellationToken::new();
        let held = HeldMessage::new(HeldKind::Response, HttpMessage::get("http://a.test/"));
        let task = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.hold(held, &cancel).await })
        };

        wait_for_pending(&manager).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), BreakDecision::Drop);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_future_cleans_up() {
        let manager = BreakManager::new();
        let held = HeldMessage::new(HeldKind::Request, HttpMessage::get("http://a.test/"));
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.hold(held, &CancellationToken::new()).await })
        };

        wait_for_pending(&manager).await;
        task.abort();
        let _ = task.await;
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_timeout_continues() {
        let manager = BreakManager::new().with_hold_timeout(Some(Duration::from_millis(20)));
        let held = HeldMessage::new(HeldKind::Request, HttpMessage::get("http://a.test/"));
        let decision = manager.hold(held, &CancellationToken::new()).await;
        assert_eq!(decision, BreakDecision::Continue);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_continue_all() {
        let manager = BreakManager::new();
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let manager = manager.clone();
            let held = HeldMessage::new(HeldKind::Request, HttpMessage::get("http://a.test/"));
            tasks.push(tokio::spawn(async move {
                manager.hold(held, &CancellationToken::new()).await
            }));
        }
        while manager.pending_count() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.continue_all(), 3);
        for task in tasks {
            assert_eq!(task.await.unwrap(), BreakDecision::Continue);
        }
    }
}
