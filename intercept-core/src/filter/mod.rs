//! Traffic filters
//!
//! A filter declares which message kinds it handles through
//! [`Filter::as_http`] / [`Filter::as_websocket`]; the [`FilterChain`] calls
//! only the capabilities a filter exposes.

pub mod chain;
pub mod log_request;
pub mod replace;
pub mod websocket_payload;

pub use chain::{ChainReport, FilterChain, FILTER_LISTENER_ORDER};
pub use log_request::LogRequestFilter;
pub use replace::{MatchLocation, MatchReplaceRule, ReplaceContentFilter};
pub use websocket_payload::{WebSocketPayloadConfig, WebSocketPayloadFilter};

use crate::message::{HttpMessage, WebSocketMessage};
use regex::Regex;
use thiserror::Error;

/// Result of one filter looking at one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// The filter acted on the message
    Applied,
    /// The filter's gates did not match
    Skipped,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Filter {filter_id}: invalid replacement text: {detail}")]
    ReplacementEscape { filter_id: u32, detail: String },

    #[error("Filter {filter_id}: invalid pattern: {detail}")]
    InvalidPattern { filter_id: u32, detail: String },

    #[error("Filter {filter_id} failed: {reason}")]
    Failed { filter_id: u32, reason: String },

    #[error("Filter {filter_id} panicked")]
    Panicked { filter_id: u32 },

    #[error("{} filter(s) failed", .0.len())]
    Aggregate(Vec<FilterError>),
}

impl FilterError {
    pub fn filter_id(&self) -> Option<u32> {
        match self {
            FilterError::ReplacementEscape { filter_id, .. }
            | FilterError::InvalidPattern { filter_id, .. }
            | FilterError::Failed { filter_id, .. }
            | FilterError::Panicked { filter_id } => Some(*filter_id),
            FilterError::Aggregate(_) => None,
        }
    }
}

pub type FilterResult = Result<FilterOutcome, FilterError>;

pub trait Filter: Send + Sync {
    /// Ordering key within the chain.
    fn id(&self) -> u32;

    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Back to defaults: disabled, no scoping. Called on session change.
    fn reset(&self) {
        self.set_enabled(false);
    }

    fn as_http(&self) -> Option<&dyn HttpFilter> {
        None
    }

    fn as_websocket(&self) -> Option<&dyn WebSocketFilter> {
        None
    }
}

pub trait HttpFilter {
    fn on_request(&self, msg: &mut HttpMessage) -> FilterResult;

    fn on_response(&self, msg: &mut HttpMessage) -> FilterResult;
}

pub trait WebSocketFilter {
    fn on_frame(&self, channel_id: u64, msg: &mut WebSocketMessage) -> FilterResult;
}

/// Rejects replacement text that would not expand as written: a `$` that
/// starts no group reference, or a reference to a group the pattern lacks.
/// `$$` is a literal dollar sign.
pub fn validate_replacement(filter_id: u32, pattern: &Regex, replacement: &str) -> Result<(), FilterError> {
    let escape_error = |detail: String| FilterError::ReplacementEscape { filter_id, detail };
    let bytes = replacement.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let rest = &replacement[i + 1..];
        if rest.starts_with('$') {
            i += 2;
            continue;
        }

        let (reference, consumed) = if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => return Err(escape_error(format!("unclosed '${{' at offset {}", i))),
            }
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            (&rest[..end], end)
        };

        if reference.is_empty() {
            return Err(escape_error(format!(
                "'$' at offset {} is not followed by a group reference (use '$$')",
                i
            )));
        }

        let known = match reference.parse::<usize>() {
            Ok(index) => index < pattern.captures_len(),
            Err(_) => pattern.capture_names().flatten().any(|name| name == reference),
        };
        if !known {
            return Err(escape_error(format!("no group '{}' in pattern", reference)));
        }

        i += 1 + consumed;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(pattern: &str, replacement: &str) -> Result<(), FilterError> {
        validate_replacement(7, &Regex::new(pattern).unwrap(), replacement)
    }

    #[test]
    fn test_valid_replacements() {
        assert!(check("a(b)", "plain").is_ok());
        assert!(check("a(b)", "x$1y").is_ok());
        assert!(check("a(b)", "${1}0").is_ok());
        assert!(check("a(?P<word>b)", "$word").is_ok());
        assert!(check("a", "cost: $$5").is_ok());
        assert!(check("a", r"back\slash").is_ok());
    }

    #[test]
    fn test_escape_errors() {
        let err = check("a", "trailing $").unwrap_err();
        assert!(matches!(err, FilterError::ReplacementEscape { filter_id: 7, .. }));
        assert!(check("a", "$2").is_err());
        assert!(check("a(b)", "$missing").is_err());
        assert!(check("a", "${1").is_err());
        assert!(check("a", "$ alone").is_err());
    }

    #[test]
    fn test_error_ids() {
        let err = FilterError::Panicked { filter_id: 3 };
        assert_eq!(err.filter_id(), Some(3));
        assert_eq!(FilterError::Aggregate(vec![err]).filter_id(), None);
    }
}
