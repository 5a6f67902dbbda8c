//! Path-based HTTP API
//!
//! Requests to the API host are answered by the proxy itself:
//!
//! ```text
//! http://<api-host>/<format>/<component>/<type>/<name>/?<query>
//! ```
//!
//! `format` is one of `xml`, `json`, `jsonp`, `html`, `ui`, `other`; `type`
//! is one of `action`, `view`, `other`. Errors are reported in the body in the
//! requested format; the status is always 200.

pub mod error;
pub mod implementor;
pub mod implementors;
pub mod response;

pub use error::{ApiError, ApiErrorCode};
pub use implementor::{ApiImplementor, ApiOperation, ApiParams};
pub use response::ApiResponse;

use crate::admin::Metrics;
use crate::config::ApiConfig;
use crate::message::{HttpMessage, HttpResponse};
use parking_lot::RwLock;
use response::{escape_xml, html_page};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const JSON_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";
const JSONP_CONTENT_TYPE: &str = "application/javascript; charset=UTF-8";
const XML_CONTENT_TYPE: &str = "text/xml; charset=UTF-8";
const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    Xml,
    Json,
    Jsonp,
    Html,
    Ui,
    Other,
}

impl FromStr for ApiFormat {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(ApiFormat::Xml),
            "json" => Ok(ApiFormat::Json),
            "jsonp" => Ok(ApiFormat::Jsonp),
            "html" => Ok(ApiFormat::Html),
            "ui" => Ok(ApiFormat::Ui),
            "other" => Ok(ApiFormat::Other),
            _ => Err(ApiError::with_detail(ApiErrorCode::BadFormat, s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Action,
    View,
    Other,
}

impl RequestType {
    fn as_str(self) -> &'static str {
        match self {
            RequestType::Action => "action",
            RequestType::View => "view",
            RequestType::Other => "other",
        }
    }

    fn unknown(self, name: &str) -> ApiError {
        let code = match self {
            RequestType::Action => ApiErrorCode::BadAction,
            RequestType::View => ApiErrorCode::BadView,
            RequestType::Other => ApiErrorCode::BadOther,
        };
        ApiError::with_detail(code, name)
    }
}

impl FromStr for RequestType {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "action" => Ok(RequestType::Action),
            "view" => Ok(RequestType::View),
            "other" => Ok(RequestType::Other),
            _ => Err(ApiError::with_detail(ApiErrorCode::BadType, s)),
        }
    }
}

/// Splits on `&`, then on the first `=`; `+` is a space. Pairs without
/// `=` or with bad percent-encoding are skipped.
pub fn parse_query(query: &str) -> ApiParams {
    let mut params = ApiParams::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some(split) => split,
            None => {
                warn!(pair, "Ignoring malformed API parameter");
                continue;
            }
        };
        match (decode_component(key), decode_component(value)) {
            (Some(key), Some(value)) => {
                params.insert(key, value);
            }
            _ => warn!(pair, "Ignoring undecodable API parameter"),
        }
    }
    params
}

fn decode_component(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|decoded| decoded.into_owned())
}

fn respond(content_type: &str, body: impl Into<Vec<u8>>) -> HttpResponse {
    let mut response = HttpResponse::with_body(200, content_type, body);
    response
        .headers
        .set("Cache-Control", "no-cache, no-store, must-revalidate");
    response
}

pub struct ApiDispatcher {
    config: ApiConfig,
    implementors: RwLock<BTreeMap<String, Arc<dyn ApiImplementor>>>,
    metrics: Arc<Metrics>,
}

impl ApiDispatcher {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            implementors: RwLock::new(BTreeMap::new()),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Registers an implementor. A second one with the same prefix is
    /// rejected and the first stays.
    pub fn add_implementor(&self, implementor: Arc<dyn ApiImplementor>) -> bool {
        let prefix = implementor.prefix().to_string();
        let mut implementors = self.implementors.write();
        if implementors.contains_key(&prefix) {
            error!(%prefix, "API implementor already registered for prefix");
            return false;
        }
        info!(%prefix, "API implementor registered");
        implementors.insert(prefix, implementor);
        true
    }

    pub fn remove_implementor(&self, prefix: &str) -> bool {
        self.implementors.write().remove(prefix).is_some()
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.implementors.read().keys().cloned().collect()
    }

    fn implementor(&self, prefix: &str) -> Result<Arc<dyn ApiImplementor>, ApiError> {
        self.implementors
            .read()
            .get(prefix)
            .cloned()
            .ok_or_else(|| ApiError::with_detail(ApiErrorCode::NoImplementor, prefix))
    }

    /// True when the request targets the API host rather than a real site.
    pub fn is_api_request(&self, msg: &HttpMessage) -> bool {
        msg.host()
            .map_or(false, |host| host.eq_ignore_ascii_case(&self.config.host))
    }

    /// Query parameters, plus form fields of a urlencoded POST body.
    fn parameters(msg: &HttpMessage) -> ApiParams {
        let mut params = msg.query().map(|q| parse_query(&q)).unwrap_or_default();
        let is_form = msg
            .request
            .headers
            .get("Content-Type")
            .map_or(false, |ct| ct.starts_with("application/x-www-form-urlencoded"));
        if msg.request.method.eq_ignore_ascii_case("POST") && is_form {
            if let Ok(body) = std::str::from_utf8(&msg.request.body) {
                for (key, value) in parse_query(body) {
                    params.entry(key).or_insert(value);
                }
            }
        }
        params
    }

    pub fn handle(&self, msg: &HttpMessage) -> HttpResponse {
        self.metrics.api_requests.fetch_add(1, Ordering::Relaxed);
        let path = msg.path();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let format = match segments.first() {
            None => return self.front_page(),
            Some(token) => match token.parse::<ApiFormat>() {
                Ok(format) => format,
                Err(err) => return self.render_error(ApiFormat::Json, &err),
            },
        };

        let params = Self::parameters(msg);
        match self.dispatch(format, &segments, &params) {
            Ok(response) => response,
            Err(err) => {
                if err.code == ApiErrorCode::InternalError {
                    error!(%path, error = %err, "API request failed");
                } else {
                    debug!(%path, error = %err, "API request rejected");
                }
                self.render_error(format, &err)
            }
        }
    }

    fn dispatch(&self, format: ApiFormat, segments: &[&str], params: &ApiParams) -> Result<HttpResponse, ApiError> {
        if format == ApiFormat::Ui {
            if !self.is_enabled() {
                return Err(ApiError::new(ApiErrorCode::Disabled));
            }
            return self.ui_page(&segments[1..]);
        }

        let (component, request_type, name) = match segments {
            [_, component, request_type, name, ..] => (*component, *request_type, *name),
            _ => return Ok(self.front_page()),
        };

        if !self.is_enabled() {
            return Err(ApiError::new(ApiErrorCode::Disabled));
        }
        let implementor = self.implementor(component)?;
        let request_type: RequestType = request_type.parse()?;
        if format == ApiFormat::Other && request_type != RequestType::Other {
            return Err(ApiError::with_detail(ApiErrorCode::BadFormat, "other"));
        }

        let operations = match request_type {
            RequestType::Action => implementor.actions(),
            RequestType::View => implementor.views(),
            RequestType::Other => implementor.others(),
        };
        let operation = operations
            .iter()
            .find(|op| op.name == name)
            .ok_or_else(|| request_type.unknown(name))?;
        if let Some(missing) = operation.missing_parameter(params) {
            return Err(ApiError::missing_parameter(missing));
        }

        let response = match request_type {
            RequestType::Action => implementor.handle_action(name, params)?,
            RequestType::View => implementor.handle_view(name, params)?,
            RequestType::Other => return implementor.handle_other(name, params),
        };
        self.render(format, name, &response)
    }

    fn render(&self, format: ApiFormat, name: &str, response: &ApiResponse) -> Result<HttpResponse, ApiError> {
        match format {
            ApiFormat::Json => Ok(respond(JSON_CONTENT_TYPE, response.to_json())),
            ApiFormat::Jsonp => Ok(respond(
                JSONP_CONTENT_TYPE,
                format!("{}({});", self.config.jsonp_callback, response.to_json()),
            )),
            ApiFormat::Xml => {
                let body = response.to_xml(name).map_err(|e| {
                    error!("Failed to render XML for {}: {}", name, e);
                    ApiError::new(ApiErrorCode::InternalError)
                })?;
                Ok(respond(XML_CONTENT_TYPE, body))
            }
            ApiFormat::Html => Ok(respond(HTML_CONTENT_TYPE, html_page(name, &response.to_html()))),
            ApiFormat::Ui | ApiFormat::Other => Err(ApiError::with_detail(ApiErrorCode::BadFormat, name)),
        }
    }

    fn render_error(&self, format: ApiFormat, err: &ApiError) -> HttpResponse {
        match format {
            ApiFormat::Json | ApiFormat::Other => respond(JSON_CONTENT_TYPE, err.to_json()),
            ApiFormat::Jsonp => respond(
                JSONP_CONTENT_TYPE,
                format!("{}({});", self.config.jsonp_callback, err.to_json()),
            ),
            ApiFormat::Xml => match err.to_xml() {
                Ok(body) => respond(XML_CONTENT_TYPE, body),
                Err(e) => {
                    error!("Failed to render XML error body: {}", e);
                    respond(JSON_CONTENT_TYPE, err.to_json())
                }
            },
            ApiFormat::Html | ApiFormat::Ui => respond(HTML_CONTENT_TYPE, html_page("Error", &err.to_html())),
        }
    }

    fn front_page(&self) -> HttpResponse {
        let body = format!(
            "<h1>Intercept API</h1>\
             <p>Requests take the form <code>http://{host}/&lt;format&gt;/&lt;component&gt;/&lt;type&gt;/&lt;name&gt;/?&lt;params&gt;</code>.</p>\
             <p>Formats: json, jsonp, xml, html, ui, other. Types: action, view, other.</p>\
             <p><a href=\"/ui/\">Browse the components</a></p>",
            host = escape_xml(&self.config.host)
        );
        respond(HTML_CONTENT_TYPE, html_page("Intercept API", &body))
    }

    fn ui_page(&self, segments: &[&str]) -> Result<HttpResponse, ApiError> {
        let body = match segments {
            [] => {
                let links: String = self
                    .prefixes()
                    .iter()
                    .map(|p| format!("<li><a href=\"/ui/{0}/\">{0}</a></li>", escape_xml(p)))
                    .collect();
                format!("<h1>Components</h1><ul>{}</ul>", links)
            }
            [component] => {
                let implementor = self.implementor(component)?;
                let mut body = format!("<h1>Component: {}</h1>", escape_xml(component));
                for (request_type, operations) in [
                    (RequestType::View, implementor.views()),
                    (RequestType::Action, implementor.actions()),
                    (RequestType::Other, implementor.others()),
                ] {
                    if operations.is_empty() {
                        continue;
                    }
                    let links: String = operations
                        .iter()
                        .map(|op| {
                            format!(
                                "<li><a href=\"/ui/{c}/{t}/{n}/\">{n}</a></li>",
                                c = escape_xml(component),
                                t = request_type.as_str(),
                                n = escape_xml(&op.name)
                            )
                        })
                        .collect();
                    body.push_str(&format!("<h2>{}s</h2><ul>{}</ul>", request_type.as_str(), links));
                }
                body
            }
            [component, request_type, name, ..] => {
                let implementor = self.implementor(component)?;
                let request_type: RequestType = request_type.parse()?;
                let operations = match request_type {
                    RequestType::Action => implementor.actions(),
                    RequestType::View => implementor.views(),
                    RequestType::Other => implementor.others(),
                };
                let operation = operations
                    .iter()
                    .find(|op| op.name == *name)
                    .ok_or_else(|| request_type.unknown(name))?;
                operation_form(component, request_type, operation)
            }
            [_, _] => return Err(ApiError::new(ApiErrorCode::BadType)),
        };
        Ok(respond(HTML_CONTENT_TYPE, html_page("Intercept API UI", &body)))
    }
}

fn operation_form(component: &str, request_type: RequestType, operation: &ApiOperation) -> String {
    let format = match request_type {
        RequestType::Other => "other",
        _ => "html",
    };
    let fields: String = operation
        .mandatory
        .iter()
        .map(|p| (p, true))
        .chain(operation.optional.iter().map(|p| (p, false)))
        .map(|(param, mandatory)| {
            format!(
                "<tr><td>{}{}</td><td><input name=\"{}\"></td></tr>",
                escape_xml(param),
                if mandatory { " *" } else { "" },
                escape_xml(param)
            )
        })
        .collect();
    format!(
        "<h1>{c}: {t} {n}</h1><form action=\"/{f}/{c}/{t}/{n}/\" method=\"GET\"><table>{fields}</table><input type=\"submit\" value=\"{t}\"></form>",
        c = escape_xml(component),
        t = request_type.as_str(),
        n = escape_xml(&operation.name),
        f = format,
        fields = fields
    )
}
