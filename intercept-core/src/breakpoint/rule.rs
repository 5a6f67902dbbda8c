//! URL-glob breakpoint rules
//!
//! A rule string such as `*.example.com;*/login` is compiled into one
//! case-insensitive regex. Every literal character is escaped, so any input
//! string yields a valid pattern.

use crate::message::HttpMessage;
use crate::session::ScopeService;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Message kind a breakpoint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakpointKind {
    Http,
}

/// Builds the regex source for a rule string.
///
/// `*` becomes a reluctant wildcard, `;` separates alternatives (leading,
/// trailing and repeated separators are ignored) and the whole alternation is
/// anchored at the end of the URL or at a `/` path boundary.
pub fn pattern_source(url_pattern: &str) -> String {
    let alternatives: Vec<String> = url_pattern
        .split(';')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*?")
        })
        .collect();

    format!("(?i)({})(?:$|/)", alternatives.join("|"))
}

pub fn compile(url_pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&pattern_source(url_pattern))
}

#[derive(Debug, Clone)]
pub struct BreakpointRule {
    url: String,
    pattern: Regex,
    kind: BreakpointKind,
    enabled: bool,
}

impl BreakpointRule {
    pub fn new(url: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            url: url.to_string(),
            pattern: compile(url)?,
            kind: BreakpointKind::Http,
            enabled: true,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Replaces the rule string; the pattern is recompiled before returning.
    pub fn set_url(&mut self, url: &str) -> Result<(), regex::Error> {
        let pattern = compile(url)?;
        self.url = url.to_string();
        self.pattern = pattern;
        Ok(())
    }

    /// Finds the pattern anywhere in the query-less request URL.
    pub fn matches(
        &self,
        msg: &HttpMessage,
        only_if_in_scope: bool,
        scope: &dyn ScopeService,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let url = match msg.url_without_query() {
            Some(url) => url,
            None => {
                warn!(url = %msg.request.url, "Cannot parse request URL for breakpoint matching");
                return false;
            }
        };

        if only_if_in_scope && !scope.is_in_scope(&url) {
            return false;
        }

        self.pattern.is_match(&url)
    }
}
