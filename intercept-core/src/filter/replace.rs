//! Match-and-replace on HTTP headers and bodies

use super::{validate_replacement, Filter, FilterError, FilterOutcome, FilterResult, HttpFilter};
use crate::message::{Headers, HttpMessage};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};

/// Automatic Find and Replace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReplaceRule {
    pub match_regex: String,
    pub replace_string: String,
    pub location: MatchLocation,
}

/// Where to apply the match/replace rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchLocation {
    RequestHeader,
    RequestBody,
    ResponseHeader,
    ResponseBody,
}

impl MatchLocation {
    pub fn name(self) -> &'static str {
        match self {
            MatchLocation::RequestHeader => "requestHeader",
            MatchLocation::RequestBody => "requestBody",
            MatchLocation::ResponseHeader => "responseHeader",
            MatchLocation::ResponseBody => "responseBody",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            MatchLocation::RequestHeader,
            MatchLocation::RequestBody,
            MatchLocation::ResponseHeader,
            MatchLocation::ResponseBody,
        ]
        .into_iter()
        .find(|location| location.name().eq_ignore_ascii_case(name))
    }
}

struct CompiledRule {
    rule: MatchReplaceRule,
    pattern: Regex,
}

pub struct ReplaceContentFilter {
    id: u32,
    enabled: AtomicBool,
    rules: RwLock<Vec<CompiledRule>>,
}

impl ReplaceContentFilter {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            enabled: AtomicBool::new(false),
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Compiles and checks a rule before it can touch traffic.
    pub fn add_rule(&self, rule: MatchReplaceRule) -> Result<(), FilterError> {
        let pattern = Regex::new(&rule.match_regex).map_err(|e| FilterError::InvalidPattern {
            filter_id: self.id,
            detail: e.to_string(),
        })?;
        validate_replacement(self.id, &pattern, &rule.replace_string)?;
        self.rules.write().push(CompiledRule { rule, pattern });
        Ok(())
    }

    /// Removes the rule at `index` (0-based, in insertion order).
    pub fn remove_rule(&self, index: usize) -> Option<MatchReplaceRule> {
        let mut rules = self.rules.write();
        (index < rules.len()).then(|| rules.remove(index).rule)
    }

    pub fn rules(&self) -> Vec<MatchReplaceRule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    fn apply(&self, msg: &mut HttpMessage, header: MatchLocation, body: MatchLocation) -> bool {
        let rules = self.rules.read();
        let mut changed = false;

        for compiled in rules.iter().filter(|c| c.rule.location == header || c.rule.location == body) {
            let is_request = matches!(
                compiled.rule.location,
                MatchLocation::RequestHeader | MatchLocation::RequestBody
            );
            let (headers, payload) = if is_request {
                (&mut msg.request.headers, &mut msg.request.body)
            } else {
                match msg.response.as_mut() {
                    Some(response) => (&mut response.headers, &mut response.body),
                    None => continue,
                }
            };

            changed |= if compiled.rule.location == header {
                replace_headers(headers, compiled)
            } else {
                replace_body(headers, payload, compiled)
            };
        }
        changed
    }
}

fn replace_headers(headers: &mut Headers, compiled: &CompiledRule) -> bool {
    let text = headers.to_text();
    match compiled.pattern.replace_all(&text, compiled.rule.replace_string.as_str()) {
        Cow::Owned(replaced) => {
            *headers = Headers::from_text(&replaced);
            true
        }
        Cow::Borrowed(_) => false,
    }
}

fn replace_body(headers: &mut Headers, body: &mut Vec<u8>, compiled: &CompiledRule) -> bool {
    let text = match std::str::from_utf8(body) {
        Ok(text) => text,
        Err(_) => return false,
    };
    let replaced = match compiled.pattern.replace_all(text, compiled.rule.replace_string.as_str()) {
        Cow::Owned(replaced) => replaced,
        Cow::Borrowed(_) => return false,
    };
    *body = replaced.into_bytes();
    if headers.get("Content-Length").is_some() {
        headers.set("Content-Length", body.len().to_string());
    }
    true
}

impl Filter for ReplaceContentFilter {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        "Replace content"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.set_enabled(false);
        self.rules.write().clear();
    }

    fn as_http(&self) -> Option<&dyn HttpFilter> {
        Some(self)
    }
}

fn outcome(changed: bool) -> FilterResult {
    Ok(if changed {
        FilterOutcome::Applied
    } else {
        FilterOutcome::Skipped
    })
}

impl HttpFilter for ReplaceContentFilter {
    fn on_request(&self, msg: &mut HttpMessage) -> FilterResult {
        outcome(self.apply(msg, MatchLocation::RequestHeader, MatchLocation::RequestBody))
    }

    fn on_response(&self, msg: &mut HttpMessage) -> FilterResult {
        outcome(self.apply(msg, MatchLocation::ResponseHeader, MatchLocation::ResponseBody))
    }
}
