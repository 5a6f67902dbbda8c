use super::manager::{BreakDecision, BreakHandler, HeldMessage};
use super::registry::{BreakpointRegistry, HeldKind};
use crate::dispatcher::{InterceptContext, ListenerVerdict, ProxyListener};
use crate::message::HttpMessage;
use crate::session::ScopeService;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const BREAKPOINT_LISTENER_ORDER: i32 = 0;

/// Proxy listener that suspends messages matched by the registry.
pub struct BreakpointListener {
    registry: Arc<BreakpointRegistry>,
    handler: Arc<dyn BreakHandler>,
    scope: Arc<dyn ScopeService>,
}

impl BreakpointListener {
    pub fn new(
        registry: Arc<BreakpointRegistry>,
        handler: Arc<dyn BreakHandler>,
        scope: Arc<dyn ScopeService>,
    ) -> Self {
        Self {
            registry,
            handler,
            scope,
        }
    }

    async fn check(&self, kind: HeldKind, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict {
        if !self.registry.should_break(msg, kind, self.scope.as_ref()) {
            return ListenerVerdict::Forward;
        }

        debug!(url = %msg.request.url, ?kind, "Breakpoint matched");
        let held = HeldMessage::new(kind, msg.clone());
        match self.handler.on_break(held, &ctx.cancel).await {
            BreakDecision::Continue => ListenerVerdict::Forward,
            BreakDecision::ContinueModified(edited) => {
                apply_edit(kind, msg, edited);
                ListenerVerdict::Forward
            }
            BreakDecision::Step(edited) => {
                if let Some(edited) = edited {
                    apply_edit(kind, msg, edited);
                }
                self.registry.set_stepping(true);
                ListenerVerdict::Forward
            }
            BreakDecision::Drop => ListenerVerdict::Drop,
        }
    }
}

/// Only the held half of the exchange is taken from the edited copy.
fn apply_edit(kind: HeldKind, msg: &mut HttpMessage, edited: HttpMessage) {
    match kind {
        HeldKind::Request => msg.request = edited.request,
        HeldKind::Response => msg.response = edited.response,
    }
}

#[async_trait]
impl ProxyListener for BreakpointListener {
    fn name(&self) -> &str {
        "breakpoints"
    }

    fn observing_order(&self) -> i32 {
        BREAKPOINT_LISTENER_ORDER
    }

    async fn on_request(&self, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict {
        self.check(HeldKind::Request, msg, ctx).await
    }

    async fn on_response(&self, msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict {
        self.check(HeldKind::Response, msg, ctx).await
    }
}
