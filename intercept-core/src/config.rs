//! Configuration types and utilities

use crate::session::Mode;
use serde::{Deserialize, Serialize};

/// Static startup configuration for the interception pipeline.
/// These settings are set at startup and do not change during runtime;
/// the mode and scope are live state owned by [`crate::Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptConfig {
    /// Address the proxy listens on
    pub listen_address: String,
    /// Port the proxy listens on
    pub listen_port: u16,
    /// Admin API port (health/metrics)
    pub admin_port: u16,
    /// Mode the session starts in
    pub mode: Mode,
    /// Root CA storage
    pub certificate_config: CertificateConfig,
    /// Path-routed API served on a virtual host through the proxy
    pub api: ApiConfig,
    /// Out-of-band callback listener
    pub callback: CallbackConfig,
    /// Breakpoint behaviour
    pub breakpoints: BreakpointConfig,
    /// Most messages kept in history; the oldest are evicted first.
    /// `None` keeps everything.
    pub history_limit: Option<usize>,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8080,
            admin_port: 9091,
            mode: Mode::Standard,
            certificate_config: CertificateConfig::default(),
            api: ApiConfig::default(),
            callback: CallbackConfig::default(),
            breakpoints: BreakpointConfig::default(),
            history_limit: Some(DEFAULT_HISTORY_LIMIT),
        }
    }
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Directory holding the root CA (`ca.pem` / `ca.key`)
    pub cert_store_path: String,
    /// Root CA validity in days
    pub validity_days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            cert_store_path: "./certs".to_string(),
            validity_days: 3650,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// When false only the front page is served
    pub enabled: bool,
    /// Virtual host answered by the API instead of being proxied
    pub host: String,
    /// Function name JSONP responses are wrapped in
    pub jsonp_callback: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "zap".to_string(),
            jsonp_callback: "zapJsonpCallback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub listen_address: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    /// Address advertised in callback URLs when it differs from the bind address
    pub remote_address: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 0,
            remote_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakpointConfig {
    /// Breakpoint rules only match in-scope URLs
    pub only_in_scope: bool,
    /// Release a held message after this many seconds; `None` waits for the operator
    pub hold_timeout_secs: Option<u64>,
}
