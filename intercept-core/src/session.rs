//! Session state: operating mode and target scope
//!
//! The dispatcher, breakpoints and API receive a [`Session`] (or the narrower
//! [`ModeProvider`] / [`ScopeService`] traits) explicitly instead of reaching
//! for process-wide state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use wildmatch::WildMatch;

/// Process-wide safety posture gating interception side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No filter or breakpoint runs
    Safe,
    /// Side effects only for in-scope targets
    Protect,
    /// Everything runs
    Standard,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Safe => "safe",
            Mode::Protect => "protect",
            Mode::Standard => "standard",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Mode::Safe),
            "protect" => Ok(Mode::Protect),
            "standard" => Ok(Mode::Standard),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Source of the current mode. Read on every dispatch, never cached.
pub trait ModeProvider: Send + Sync {
    fn mode(&self) -> Mode;
}

/// Answers whether a URL belongs to the operator's target scope.
pub trait ScopeService: Send + Sync {
    fn is_in_scope(&self, url: &str) -> bool;
}

/// Notified when the operator starts a new session.
pub trait SessionChangedListener: Send + Sync {
    fn session_changed(&self);
}

/// Scope Configuration (Target Definition)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Host globs that are in scope, e.g. `*.example.com`
    pub include: Vec<String>,
    /// Host globs removed from scope; these win over `include`
    pub exclude: Vec<String>,
}

impl ScopeConfig {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Check if a URL is within the defined scope.
    ///
    /// Logic:
    /// 1. Unparsable URLs are out of scope.
    /// 2. If an exclude pattern matches the host, return false.
    /// 3. Otherwise the host must match an include pattern.
    pub fn is_in_scope(&self, url: &str) -> bool {
        let host = match url::Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => host.to_ascii_lowercase(),
                None => return false,
            },
            Err(_) => return false,
        };

        if self
            .exclude
            .iter()
            .any(|pattern| WildMatch::new(&pattern.to_ascii_lowercase()).matches(&host))
        {
            return false;
        }

        self.include
            .iter()
            .any(|pattern| WildMatch::new(&pattern.to_ascii_lowercase()).matches(&host))
    }
}

/// Live session: current mode, scope and session-change subscribers.
pub struct Session {
    mode: RwLock<Mode>,
    scope: RwLock<ScopeConfig>,
    listeners: RwLock<Vec<Arc<dyn SessionChangedListener>>>,
}

impl Session {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: RwLock::new(mode),
            scope: RwLock::new(ScopeConfig::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn with_scope(self, scope: ScopeConfig) -> Self {
        *self.scope.write() = scope;
        self
    }

    pub fn set_mode(&self, mode: Mode) {
        let previous = std::mem::replace(&mut *self.mode.write(), mode);
        if previous != mode {
            info!(from = %previous, to = %mode, "Mode changed");
        }
    }

    pub fn scope(&self) -> ScopeConfig {
        self.scope.read().clone()
    }

    pub fn include_in_scope(&self, pattern: &str) {
        let mut scope = self.scope.write();
        if !scope.include.iter().any(|p| p == pattern) {
            scope.include.push(pattern.to_string());
        }
    }

    pub fn exclude_from_scope(&self, pattern: &str) {
        let mut scope = self.scope.write();
        if !scope.exclude.iter().any(|p| p == pattern) {
            scope.exclude.push(pattern.to_string());
        }
    }

    pub fn add_session_listener(&self, listener: Arc<dyn SessionChangedListener>) {
        self.listeners.write().push(listener);
    }

    /// Starts a fresh session: scope is cleared and every subscriber resets.
    /// The mode is an operator preference and survives.
    pub fn new_session(&self) {
        *self.scope.write() = ScopeConfig::default();
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.session_changed();
        }
        info!("New session started");
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Mode::Standard)
    }
}

impl ModeProvider for Session {
    fn mode(&self) -> Mode {
        *self.mode.read()
    }
}

impl ScopeService for ScopeConfig {
    fn is_in_scope(&self, url: &str) -> bool {
        ScopeConfig::is_in_scope(self, url)
    }
}

impl ScopeService for Session {
    fn is_in_scope(&self, url: &str) -> bool {
        self.scope.read().is_in_scope(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scope_matching() {
        // Empty include list = nothing in scope
        let scope = ScopeConfig::default();
        assert!(!scope.is_in_scope("http://example.com/"));

        let scope = ScopeConfig::new(vec!["*.example.com".to_string()], vec![]);
        assert!(scope.is_in_scope("https://api.example.com/v1?x=1"));
        assert!(scope.is_in_scope("https://API.Example.com/"));
        assert!(!scope.is_in_scope("https://google.com/"));

        // Exclusion wins
        let scope = ScopeConfig::new(
            vec!["*.google.com".to_string()],
            vec!["ads.google.com".to_string()],
        );
        assert!(scope.is_in_scope("http://mail.google.com/"));
        assert!(!scope.is_in_scope("http://ads.google.com/"));
        assert!(!scope.is_in_scope("not a url"));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("SAFE".parse::<Mode>(), Ok(Mode::Safe));
        assert_eq!(" protect ".parse::<Mode>(), Ok(Mode::Protect));
        assert_eq!("standard".parse::<Mode>(), Ok(Mode::Standard));
        assert!("attack".parse::<Mode>().is_err());
        assert_eq!(Mode::Protect.to_string(), "protect");
    }

    struct Counter(AtomicUsize);

    impl SessionChangedListener for Counter {
        fn session_changed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_session_resets_scope_and_notifies() {
        let session = Session::new(Mode::Protect);
        session.include_in_scope("example.com");
        session.include_in_scope("example.com");
        assert_eq!(session.scope().include.len(), 1);
        assert!(session.is_in_scope("http://example.com/"));

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        session.add_session_listener(counter.clone());
        session.new_session();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!session.is_in_scope("http://example.com/"));
        assert_eq!(session.mode(), Mode::Protect);
    }
}
