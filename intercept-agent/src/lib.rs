//! Intercept Agent
//!
//! Standalone executable that runs the intercepting proxy, the callback
//! listener and the admin API in one process, wired to a shared session.

pub mod logging;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use intercept_core::api::implementors::{BreakApi, CallbackApi, CoreApi, FilterApi};
use intercept_core::breakpoint::{BreakManager, BreakpointListener, BreakpointRegistry};
use intercept_core::callback::{CallbackRouter, CallbackServer};
use intercept_core::filter::{
    Filter, FilterChain, LogRequestFilter, MatchLocation, MatchReplaceRule, ReplaceContentFilter,
    WebSocketPayloadConfig, WebSocketPayloadFilter,
};
use intercept_core::{
    admin::start_admin_server, ApiDispatcher, CertificateAuthority, HistoryListener,
    InterceptConfig, InterceptHandler, ListenerDispatcher, MemoryHistory, Metrics, Mode,
    ProxyServer, ScopeConfig, Session,
};
use logging::LoggingConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Ids of the filters every agent registers (disabled until configured).
pub const LOG_REQUEST_FILTER_ID: u32 = 10;
pub const REPLACE_FILTER_ID: u32 = 20;
pub const WEBSOCKET_PAYLOAD_FILTER_ID: u32 = 30;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_addr: String,

    /// Port to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value_t = 8080)]
    pub listen_port: u16,

    /// Port to expose the Admin API (health/metrics)
    #[arg(long, default_value_t = 9091)]
    pub admin_port: u16,

    /// Address the callback listener binds to
    #[arg(long, default_value = "127.0.0.1")]
    pub callback_addr: String,

    /// Callback listener port (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    pub callback_port: u16,

    /// Host advertised in callback URLs, if different from the bind address
    #[arg(long)]
    pub callback_remote_addr: Option<String>,

    /// Virtual host answered by the API
    #[arg(long, default_value = "zap")]
    pub api_host: String,

    /// Serve only the API front page
    #[arg(long)]
    pub disable_api: bool,

    /// Starting mode: safe, protect or standard
    #[arg(long, default_value = "standard")]
    pub mode: Mode,

    /// Host pattern to include in scope (repeatable)
    #[arg(long = "scope-include")]
    pub scope_include: Vec<String>,

    /// Host pattern to exclude from scope (repeatable)
    #[arg(long = "scope-exclude")]
    pub scope_exclude: Vec<String>,

    /// URL breakpoint pattern, `*` wildcards and `;` alternatives (repeatable)
    #[arg(long = "breakpoint")]
    pub breakpoints: Vec<String>,

    /// Breakpoints only match in-scope URLs
    #[arg(long)]
    pub only_in_scope: bool,

    /// Match-and-replace rule as `location:regex=>replacement`, where
    /// location is requestHeader, requestBody, responseHeader or responseBody
    /// (repeatable; enables the replace filter)
    #[arg(long = "replace-rule", value_parser = parse_replace_rule)]
    pub replace_rules: Vec<MatchReplaceRule>,

    /// Regex rewritten in WebSocket text payloads (enables the payload filter)
    #[arg(long)]
    pub ws_pattern: Option<String>,

    /// Replacement for `--ws-pattern`, `$1` style group references allowed
    #[arg(long, default_value = "")]
    pub ws_replacement: String,

    /// Messages kept in history before the oldest are evicted (0 keeps all)
    #[arg(long, default_value_t = intercept_core::config::DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// Release held messages after this many seconds
    #[arg(long)]
    pub hold_timeout_secs: Option<u64>,

    /// Directory holding the root CA
    #[arg(long, default_value = "./certs")]
    pub ca_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Also write logs to this file, rotated daily
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Args {
    pub fn intercept_config(&self) -> InterceptConfig {
        let mut config = InterceptConfig {
            listen_address: self.listen_addr.clone(),
            listen_port: self.listen_port,
            admin_port: self.admin_port,
            mode: self.mode,
            ..Default::default()
        };
        config.certificate_config.cert_store_path = self.ca_dir.clone();
        config.api.enabled = !self.disable_api;
        config.api.host = self.api_host.clone();
        config.callback.listen_address = self.callback_addr.clone();
        config.callback.port = self.callback_port;
        config.callback.remote_address = self.callback_remote_addr.clone();
        config.breakpoints.only_in_scope = self.only_in_scope;
        config.breakpoints.hold_timeout_secs = self.hold_timeout_secs;
        config.history_limit = (self.history_limit > 0).then_some(self.history_limit);
        config
    }

    pub fn scope(&self) -> ScopeConfig {
        ScopeConfig::new(self.scope_include.clone(), self.scope_exclude.clone())
    }

    /// Loads the filter settings given on the command line.
    pub fn apply_filter_options(&self, components: &Components) -> Result<()> {
        for rule in &self.replace_rules {
            components
                .replace
                .add_rule(rule.clone())
                .with_context(|| format!("Invalid replace rule '{}'", rule.match_regex))?;
        }
        if !self.replace_rules.is_empty() {
            components.replace.set_enabled(true);
        }

        if let Some(pattern) = &self.ws_pattern {
            let config = WebSocketPayloadConfig {
                pattern: pattern.clone(),
                replacement: self.ws_replacement.clone(),
                ..Default::default()
            };
            config
                .validate(WEBSOCKET_PAYLOAD_FILTER_ID)
                .context("Invalid WebSocket payload settings")?;
            components.websocket_payload.configure(config)?;
            components.websocket_payload.set_enabled(true);
        }
        Ok(())
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
            log_file: self.log_file.clone(),
            ..Default::default()
        }
    }
}

/// Every long-lived component, wired together.
pub struct Components {
    pub metrics: Arc<Metrics>,
    pub session: Arc<Session>,
    pub history: Arc<MemoryHistory>,
    pub filters: Arc<FilterChain>,
    pub replace: Arc<ReplaceContentFilter>,
    pub websocket_payload: Arc<WebSocketPayloadFilter>,
    pub breakpoints: Arc<BreakpointRegistry>,
    pub break_manager: BreakManager,
    pub dispatcher: Arc<ListenerDispatcher>,
    pub callbacks: Arc<CallbackRouter>,
    pub api: Arc<ApiDispatcher>,
}

impl Components {
    pub fn build(config: &InterceptConfig, scope: ScopeConfig, breakpoints: &[String]) -> Result<Self> {
        let metrics = Arc::new(Metrics::default());
        let session = Arc::new(Session::new(config.mode).with_scope(scope));

        let history = Arc::new(MemoryHistory::new().with_limit(config.history_limit));
        session.add_session_listener(history.clone());

        let filters = Arc::new(FilterChain::new().with_metrics(metrics.clone()));
        filters.register(Arc::new(LogRequestFilter::new(LOG_REQUEST_FILTER_ID)));
        let replace = Arc::new(ReplaceContentFilter::new(REPLACE_FILTER_ID));
        let websocket_payload = Arc::new(WebSocketPayloadFilter::new(
            WEBSOCKET_PAYLOAD_FILTER_ID,
            "WebSocket payload replace",
        ));
        filters.register(replace.clone());
        filters.register(websocket_payload.clone());
        session.add_session_listener(filters.clone());

        let registry = Arc::new(BreakpointRegistry::new());
        registry.set_only_in_scope(config.breakpoints.only_in_scope);
        for pattern in breakpoints {
            registry
                .add(pattern)
                .with_context(|| format!("Invalid breakpoint pattern '{}'", pattern))?;
        }
        let break_manager = BreakManager::new()
            .with_hold_timeout(config.breakpoints.hold_timeout_secs.map(Duration::from_secs))
            .with_metrics(metrics.clone());

        let dispatcher = Arc::new(
            ListenerDispatcher::new(session.clone(), session.clone()).with_metrics(metrics.clone()),
        );
        dispatcher.add_proxy_listener(filters.clone());
        dispatcher.add_proxy_listener(Arc::new(BreakpointListener::new(
            registry.clone(),
            Arc::new(break_manager.clone()),
            session.clone(),
        )));
        dispatcher.add_proxy_listener(Arc::new(HistoryListener::new(history.clone())));
        dispatcher.add_websocket_observer(filters.clone());

        let callbacks = Arc::new(CallbackRouter::new().with_metrics(metrics.clone()));

        let api = Arc::new(ApiDispatcher::new(config.api.clone()).with_metrics(metrics.clone()));
        api.add_implementor(Arc::new(CoreApi::new(session.clone(), history.clone())));
        api.add_implementor(Arc::new(BreakApi::new(registry.clone(), break_manager.clone())));
        api.add_implementor(Arc::new(
            FilterApi::new(filters.clone())
                .with_replace(replace.clone())
                .with_websocket_payload(websocket_payload.clone()),
        ));
        api.add_implementor(Arc::new(CallbackApi::new(callbacks.clone())));

        Ok(Self {
            metrics,
            session,
            history,
            filters,
            replace,
            websocket_payload,
            breakpoints: registry,
            break_manager,
            dispatcher,
            callbacks,
            api,
        })
    }
}

fn parse_replace_rule(raw: &str) -> std::result::Result<MatchReplaceRule, String> {
    let (location, rest) = raw
        .split_once(':')
        .ok_or_else(|| "expected location:regex=>replacement".to_string())?;
    let location = MatchLocation::from_name(location).ok_or_else(|| format!("unknown location '{}'", location))?;
    let (match_regex, replace_string) = rest.split_once("=>").unwrap_or((rest, ""));
    if match_regex.is_empty() {
        return Err("empty regex".to_string());
    }
    Ok(MatchReplaceRule {
        match_regex: match_regex.to_string(),
        replace_string: replace_string.to_string(),
        location,
    })
}

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid address {}: {}", address, e))?;
    Ok(SocketAddr::new(ip, port))
}

/// Runs proxy, callback listener and admin API until `shutdown` is cancelled
/// or one of them fails.
pub async fn run_agent(args: Args, shutdown: CancellationToken) -> Result<()> {
    let config = args.intercept_config();

    tracing::info!("Starting Intercept Agent...");
    tracing::info!("  Proxy:  {}:{}", config.listen_address, config.listen_port);
    tracing::info!("  Admin:  0.0.0.0:{}", config.admin_port);
    tracing::info!("  Mode:   {}", config.mode);

    let components = Components::build(&config, args.scope(), &args.breakpoints)?;
    args.apply_filter_options(&components)?;

    let callback_server = CallbackServer::bind(
        components.callbacks.clone(),
        socket_addr(&config.callback.listen_address, config.callback.port)?,
    )
    .await?;
    if let Some(remote) = &config.callback.remote_address {
        let port = callback_server.local_addr()?.port();
        components
            .callbacks
            .set_base_url(format!("http://{}:{}", remote, port));
    }
    tracing::info!(
        "  Callbacks: {}",
        components.callbacks.callback_url().unwrap_or_default()
    );

    let ca = CertificateAuthority::load_or_generate(&config.certificate_config)?;
    let handler = InterceptHandler::new(components.dispatcher.clone(), components.api.clone());
    let admin_port = config.admin_port;
    let proxy = ProxyServer::new(config, ca, handler);

    let stop = shutdown.clone();
    let mut admin = tokio::spawn(start_admin_server(
        admin_port,
        components.metrics.clone(),
        async move { stop.cancelled().await },
    ));
    let stop = shutdown.clone();
    let mut callbacks = tokio::spawn(callback_server.run(async move { stop.cancelled().await }));
    let stop = shutdown.clone();
    let mut proxy = tokio::spawn(proxy.run(async move { stop.cancelled().await }));

    // First server to stop takes the others down with it
    let first = tokio::select! {
        res = &mut proxy => ("proxy", res),
        res = &mut callbacks => ("callback listener", res),
        res = &mut admin => ("admin API", res),
    };
    shutdown.cancel();

    let (name, result) = first;
    result
        .with_context(|| format!("{} task panicked", name))?
        .with_context(|| format!("{} failed", name))?;

    for (name, task) in [("proxy", proxy), ("callback listener", callbacks), ("admin API", admin)] {
        if task.is_finished() {
            continue;
        }
        task.await
            .with_context(|| format!("{} task panicked", name))?
            .with_context(|| format!("{} failed", name))?;
    }
    tracing::info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("intercept-agent").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        let config = args.intercept_config();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.mode, Mode::Standard);
        assert!(config.api.enabled);
        assert_eq!(config.api.host, "zap");
        assert_eq!(config.callback.port, 0);
        assert_eq!(config.certificate_config.cert_store_path, "./certs");
        assert_eq!(config.history_limit, Some(10_000));
        assert_eq!(parse(&["--history-limit", "0"]).intercept_config().history_limit, None);
    }

    #[test]
    fn test_flags_map_onto_config() {
        let args = parse(&[
            "--mode",
            "protect",
            "--disable-api",
            "--scope-include",
            "*.target.test",
            "--scope-exclude",
            "static.target.test",
            "--breakpoint",
            "*/login",
            "--breakpoint",
            "*/admin",
            "--only-in-scope",
            "--hold-timeout-secs",
            "30",
            "--callback-remote-addr",
            "10.0.0.5",
            "--log-json",
        ]);
        let config = args.intercept_config();
        assert_eq!(config.mode, Mode::Protect);
        assert!(!config.api.enabled);
        assert!(config.breakpoints.only_in_scope);
        assert_eq!(config.breakpoints.hold_timeout_secs, Some(30));
        assert_eq!(config.callback.remote_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(args.breakpoints, vec!["*/login", "*/admin"]);
        assert!(args.logging_config().json_format);

        let scope = args.scope();
        assert!(scope.is_in_scope("http://www.target.test/"));
        assert!(!scope.is_in_scope("http://static.target.test/"));
    }

    #[test]
    fn test_bad_mode_rejected() {
        let result = Args::try_parse_from(["intercept-agent", "--mode", "reckless"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_components_wired() {
        let args = parse(&["--breakpoint", "*/login"]);
        let components =
            Components::build(&args.intercept_config(), args.scope(), &args.breakpoints).unwrap();

        assert_eq!(
            components.dispatcher.proxy_listener_names(),
            vec!["filters", "breakpoints", "history"]
        );
        assert_eq!(components.api.prefixes(), vec!["break", "callback", "core", "filter"]);
        assert_eq!(components.filters.all().len(), 3);
        assert_eq!(components.breakpoints.rules().len(), 1);
    }

    #[test]
    fn test_filter_options_from_flags() {
        let args = parse(&[
            "--replace-rule",
            "responseBody:secret=>public",
            "--replace-rule",
            "requestHeader:X-Debug: .*",
            "--ws-pattern",
            r"token=(\w+)",
            "--ws-replacement",
            "token=[$1]",
        ]);
        assert_eq!(args.replace_rules[0].location, MatchLocation::ResponseBody);
        assert_eq!(args.replace_rules[0].replace_string, "public");
        assert_eq!(args.replace_rules[1].match_regex, "X-Debug: .*");
        assert_eq!(args.replace_rules[1].replace_string, "");

        let components =
            Components::build(&args.intercept_config(), args.scope(), &args.breakpoints).unwrap();
        args.apply_filter_options(&components).unwrap();
        assert!(components.replace.is_enabled());
        assert_eq!(components.replace.rules().len(), 2);
        assert!(components.websocket_payload.is_enabled());
        assert_eq!(components.websocket_payload.config().replacement, "token=[$1]");

        let json: serde_json::Value = serde_json::from_slice(
            &components
                .api
                .handle(&intercept_core::HttpMessage::get("http://zap/json/filter/view/replaceRules/"))
                .body,
        )
        .unwrap();
        assert_eq!(json[0][0]["matchRegex"], "secret");
    }

    #[test]
    fn test_bad_filter_flags_rejected() {
        assert!(Args::try_parse_from(["intercept-agent", "--replace-rule", "trailer:a=>b"]).is_err());
        assert!(Args::try_parse_from(["intercept-agent", "--replace-rule", "nocolon"]).is_err());

        let args = parse(&["--ws-pattern", "(a)", "--ws-replacement", "$2"]);
        let components =
            Components::build(&args.intercept_config(), args.scope(), &args.breakpoints).unwrap();
        assert!(args.apply_filter_options(&components).is_err());
        assert!(!components.websocket_payload.is_enabled());
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(socket_addr("localhost", 80).is_err());
        assert_eq!(socket_addr("127.0.0.1", 80).unwrap().port(), 80);
    }
}
