//! Interception Core Library
//!
//! This library provides the interception pipeline of an intercepting proxy:
//! mode and scope gating, breakpoints, the filter chain, the listener
//! dispatcher, out-of-band callbacks and the path-routed API, plus the
//! hudsucker-based MITM transport that feeds them.

pub mod admin;
pub mod api;
pub mod breakpoint;
pub mod ca;
pub mod callback;
pub mod dispatcher;
pub mod filter;
pub mod handlers;
pub mod history;
pub mod message;
/// hudsucker server that feeds traffic into the pipeline
pub mod proxy;
pub mod report;
pub mod session;

/// Configuration types and utilities
pub mod config;

/// Error types for interception operations
pub mod error;

pub use admin::Metrics;
pub use api::{ApiDispatcher, ApiError, ApiErrorCode, ApiImplementor, ApiResponse};
pub use breakpoint::{BreakManager, BreakpointListener, BreakpointRegistry};
pub use ca::CertificateAuthority;
pub use callback::{CallbackHandler, CallbackOutcome, CallbackRouter, CallbackServer};
pub use config::{ApiConfig, BreakpointConfig, CallbackConfig, CertificateConfig, InterceptConfig};
pub use dispatcher::{InterceptContext, ListenerDispatcher, ListenerVerdict, ProxyListener, WebSocketObserver};
pub use error::InterceptError;
pub use filter::{Filter, FilterChain, FilterError, FilterOutcome};
pub use handlers::InterceptHandler;
pub use history::{HistoryListener, HistoryStore, MemoryHistory};
pub use message::{HttpMessage, WebSocketMessage};
pub use proxy::ProxyServer;
pub use report::{site_report, SiteXmlContributor};
pub use session::{Mode, ScopeConfig, Session};

/// Result type alias for interception operations
pub type Result<T> = std::result::Result<T, InterceptError>;
