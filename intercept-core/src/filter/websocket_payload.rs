use super::{validate_replacement, Filter, FilterError, FilterOutcome, FilterResult, WebSocketFilter};
use crate::message::{Direction, OpCode, WebSocketMessage};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Settings for [`WebSocketPayloadFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketPayloadConfig {
    /// Regex searched for in the payload; empty disables the filter
    pub pattern: String,
    pub replacement: String,
    pub apply_on_incoming: bool,
    pub apply_on_outgoing: bool,
    /// Only these opcodes, when set
    pub opcodes: Option<Vec<OpCode>>,
    /// Only these channels, when set
    pub channel_ids: Option<Vec<u64>>,
}

impl Default for WebSocketPayloadConfig {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            replacement: String::new(),
            apply_on_incoming: true,
            apply_on_outgoing: true,
            opcodes: None,
            channel_ids: None,
        }
    }
}

impl WebSocketPayloadConfig {
    /// Compiles the pattern and checks the replacement against it.
    pub fn validate(&self, filter_id: u32) -> Result<(), FilterError> {
        if self.pattern.is_empty() {
            return Ok(());
        }
        let pattern = Regex::new(&self.pattern).map_err(|e| FilterError::InvalidPattern {
            filter_id,
            detail: e.to_string(),
        })?;
        validate_replacement(filter_id, &pattern, &self.replacement)
    }

    fn applies_to(&self, channel_id: u64, msg: &WebSocketMessage) -> bool {
        let direction = match msg.direction {
            Direction::Incoming => self.apply_on_incoming,
            Direction::Outgoing => self.apply_on_outgoing,
        };
        let opcode = self
            .opcodes
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&msg.opcode));
        let channel = self
            .channel_ids
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&channel_id));
        direction && opcode && channel
    }
}

struct Compiled {
    config: WebSocketPayloadConfig,
    pattern: Option<Regex>,
}

/// Regex replace-all over the text of WebSocket frames.
pub struct WebSocketPayloadFilter {
    id: u32,
    name: String,
    enabled: AtomicBool,
    state: RwLock<Compiled>,
}

impl WebSocketPayloadFilter {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: AtomicBool::new(false),
            state: RwLock::new(Compiled {
                config: WebSocketPayloadConfig::default(),
                pattern: None,
            }),
        }
    }

    /// Replaces the configuration. An invalid pattern leaves the old one
    /// in place.
    pub fn configure(&self, config: WebSocketPayloadConfig) -> Result<(), FilterError> {
        let pattern = if config.pattern.is_empty() {
            None
        } else {
            Some(Regex::new(&config.pattern).map_err(|e| FilterError::InvalidPattern {
                filter_id: self.id,
                detail: e.to_string(),
            })?)
        };
        *self.state.write() = Compiled { config, pattern };
        Ok(())
    }

    pub fn config(&self) -> WebSocketPayloadConfig {
        self.state.read().config.clone()
    }
}

impl Filter for WebSocketPayloadFilter {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.set_enabled(false);
        *self.state.write() = Compiled {
            config: WebSocketPayloadConfig::default(),
            pattern: None,
        };
    }

    fn as_websocket(&self) -> Option<&dyn WebSocketFilter> {
        Some(self)
    }
}

impl WebSocketFilter for WebSocketPayloadFilter {
    fn on_frame(&self, channel_id: u64, msg: &mut WebSocketMessage) -> FilterResult {
        if !msg.finished || msg.payload.is_empty() {
            return Ok(FilterOutcome::Skipped);
        }

        let state = self.state.read();
        let pattern = match &state.pattern {
            Some(pattern) => pattern,
            None => return Ok(FilterOutcome::Skipped),
        };
        if !state.config.applies_to(channel_id, msg) {
            return Ok(FilterOutcome::Skipped);
        }

        let text = match msg.readable_payload() {
            Some(text) => text,
            None => {
                debug!(filter_id = self.id, channel_id, "Payload is not text, skipping");
                return Ok(FilterOutcome::Skipped);
            }
        };

        validate_replacement(self.id, pattern, &state.config.replacement)?;

        let replaced = match pattern.replace_all(text, state.config.replacement.as_str()) {
            Cow::Owned(replaced) => replaced,
            Cow::Borrowed(_) => return Ok(FilterOutcome::Skipped),
        };
        msg.set_readable_payload(replaced);
        Ok(FilterOutcome::Applied)
    }
}
