use super::rule::BreakpointRule;
use crate::message::HttpMessage;
use crate::session::ScopeService;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Which half of an exchange is being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeldKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakpointSummary {
    pub url: String,
    pub enabled: bool,
}

/// Active breakpoint rules plus the global break toggles.
pub struct BreakpointRegistry {
    rules: RwLock<Vec<BreakpointRule>>,
    enabled: AtomicBool,
    break_all_requests: AtomicBool,
    break_all_responses: AtomicBool,
    /// Set by a `Step` decision: the next message breaks unconditionally
    stepping: AtomicBool,
    only_in_scope: AtomicBool,
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(true),
            break_all_requests: AtomicBool::new(false),
            break_all_responses: AtomicBool::new(false),
            stepping: AtomicBool::new(false),
            only_in_scope: AtomicBool::new(false),
        }
    }
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule; a rule with the same string is not added twice.
    pub fn add(&self, url: &str) -> Result<bool, regex::Error> {
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.url() == url) {
            return Ok(false);
        }
        rules.push(BreakpointRule::new(url)?);
        info!(url, "Breakpoint added");
        Ok(true)
    }

    /// Rewrites the rule string of an existing rule in place.
    pub fn edit(&self, old_url: &str, new_url: &str) -> Result<bool, regex::Error> {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.url() == old_url) {
            Some(rule) => {
                rule.set_url(new_url)?;
                info!(old_url, new_url, "Breakpoint edited");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, url: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.url() != url);
        let removed = rules.len() != before;
        if removed {
            info!(url, "Breakpoint removed");
        }
        removed
    }

    pub fn set_rule_enabled(&self, url: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.url() == url) {
            Some(rule) => {
                rule.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<BreakpointSummary> {
        self.rules
            .read()
            .iter()
            .map(|r| BreakpointSummary {
                url: r.url().to_string(),
                enabled: r.is_enabled(),
            })
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_break_all_requests(&self) -> bool {
        self.break_all_requests.load(Ordering::SeqCst)
    }

    pub fn set_break_all_requests(&self, on: bool) {
        self.break_all_requests.store(on, Ordering::SeqCst);
    }

    pub fn is_break_all_responses(&self) -> bool {
        self.break_all_responses.load(Ordering::SeqCst)
    }

    pub fn set_break_all_responses(&self, on: bool) {
        self.break_all_responses.store(on, Ordering::SeqCst);
    }

    pub fn set_stepping(&self, on: bool) {
        self.stepping.store(on, Ordering::SeqCst);
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping.load(Ordering::SeqCst)
    }

    pub fn set_only_in_scope(&self, on: bool) {
        self.only_in_scope.store(on, Ordering::SeqCst);
    }

    pub fn is_only_in_scope(&self) -> bool {
        self.only_in_scope.load(Ordering::SeqCst)
    }

    /// Decides whether `msg` must be held. Consumes a pending step.
    pub fn should_break(&self, msg: &HttpMessage, kind: HeldKind, scope: &dyn ScopeService) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.stepping.swap(false, Ordering::SeqCst) {
            return true;
        }
        let break_all = match kind {
            HeldKind::Request => self.is_break_all_requests(),
            HeldKind::Response => self.is_break_all_responses(),
        };
        if break_all {
            return true;
        }

        let only_in_scope = self.is_only_in_scope();
        self.rules
            .read()
            .iter()
            .any(|rule| rule.matches(msg, only_in_scope, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ScopeConfig;

    fn scope() -> ScopeConfig {
        ScopeConfig::new(vec!["*.in.test".to_string()], vec![])
    }

    #[test]
    fn test_add_edit_remove() {
        let registry = BreakpointRegistry::new();
        assert!(registry.add("*.a.test").unwrap());
        assert!(!registry.add("*.a.test").unwrap());
        assert!(registry.edit("*.a.test", "*.b.test").unwrap());
        assert!(!registry.edit("*.missing", "x").unwrap());
        assert_eq!(registry.rules()[0].url, "*.b.test");

        let msg = HttpMessage::get("http://www.b.test/");
        assert!(registry.should_break(&msg, HeldKind::Request, &scope()));

        assert!(registry.remove("*.b.test"));
        assert!(!registry.remove("*.b.test"));
        assert!(!registry.should_break(&msg, HeldKind::Request, &scope()));
    }

    #[test]
    fn test_global_toggle_and_rule_toggle() {
        let registry = BreakpointRegistry::new();
        registry.add("*").unwrap();
        let msg = HttpMessage::get("http://x.test/");

        registry.set_enabled(false);
        assert!(!registry.should_break(&msg, HeldKind::Request, &scope()));
        registry.set_enabled(true);

        registry.set_rule_enabled("*", false);
        assert!(!registry.should_break(&msg, HeldKind::Request, &scope()));
        assert!(!registry.rules()[0].enabled);
    }

    #[test]
    fn test_break_all_is_per_kind() {
        let registry = BreakpointRegistry::new();
        registry.set_break_all_responses(true);
        let msg = HttpMessage::get("http://x.test/");
        assert!(!registry.should_break(&msg, HeldKind::Request, &scope()));
        assert!(registry.should_break(&msg, HeldKind::Response, &scope()));
    }

    #[test]
    fn test_step_breaks_once() {
        let registry = BreakpointRegistry::new();
        registry.set_stepping(true);
        let msg = HttpMessage::get("http://x.test/");
        assert!(registry.should_break(&msg, HeldKind::Response, &scope()));
        assert!(!registry.should_break(&msg, HeldKind::Response, &scope()));
    }

    #[test]
    fn test_only_in_scope() {
        let registry = BreakpointRegistry::new();
        registry.add("*").unwrap();
        registry.set_only_in_scope(true);
        let inside = HttpMessage::get("http://www.in.test/");
        let outside = HttpMessage::get("http://www.out.test/");
        assert!(registry.should_break(&inside, HeldKind::Request, &scope()));
        assert!(!registry.should_break(&outside, HeldKind::Request, &scope()));
    }
}
