use super::{Filter, FilterOutcome, FilterResult, HttpFilter};
use crate::message::HttpMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Logs the request line of every request it sees.
pub struct LogRequestFilter {
    id: u32,
    enabled: AtomicBool,
}

impl LogRequestFilter {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            enabled: AtomicBool::new(false),
        }
    }
}

impl Filter for LogRequestFilter {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        "Log requests"
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

impl HttpFilter for LogRequestFilter {
    fn on_request(&self, msg: &mut HttpMessage) -> FilterResult {
        info!(
            target: "intercept::requests",
            method = %msg.request.method,
            url = %msg.request.url,
            version = %msg.request.version,
            "Request"
        );
        Ok(FilterOutcome::Applied)
    }

    fn on_response(&self, _msg: &mut HttpMessage) -> FilterResult {
        Ok(FilterOutcome::Skipped)
    }
}
