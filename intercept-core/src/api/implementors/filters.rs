use crate::api::implementor::{bool_param, param, ApiImplementor, ApiOperation, ApiParams};
use crate::api::{ApiError, ApiErrorCode, ApiResponse};
use crate::filter::{
    Filter, FilterChain, FilterError, MatchLocation, MatchReplaceRule, ReplaceContentFilter,
    WebSocketPayloadConfig, WebSocketPayloadFilter,
};
use crate::message::OpCode;
use std::sync::Arc;
use tracing::debug;

/// Filter listing and toggles, plus the settings of the shipped
/// configurable filters when they are attached.
pub struct FilterApi {
    chain: Arc<FilterChain>,
    replace: Option<Arc<ReplaceContentFilter>>,
    websocket_payload: Option<Arc<WebSocketPayloadFilter>>,
}

impl FilterApi {
    pub fn new(chain: Arc<FilterChain>) -> Self {
        Self {
            chain,
            replace: None,
            websocket_payload: None,
        }
    }

    pub fn with_replace(mut self, filter: Arc<ReplaceContentFilter>) -> Self {
        self.replace = Some(filter);
        self
    }

    pub fn with_websocket_payload(mut self, filter: Arc<WebSocketPayloadFilter>) -> Self {
        self.websocket_payload = Some(filter);
        self
    }

    fn replace_filter(&self, name: &str) -> Result<&ReplaceContentFilter, ApiError> {
        self.replace
            .as_deref()
            .ok_or_else(|| ApiError::with_detail(ApiErrorCode::BadAction, name))
    }

    fn payload_filter(&self, name: &str) -> Result<&WebSocketPayloadFilter, ApiError> {
        self.websocket_payload
            .as_deref()
            .ok_or_else(|| ApiError::with_detail(ApiErrorCode::BadAction, name))
    }

    fn set_payload_options(&self, name: &str, params: &ApiParams) -> Result<(), ApiError> {
        let filter = self.payload_filter(name)?;
        let mut config = filter.config();
        if let Some(pattern) = params.get("pattern") {
            config.pattern = pattern.clone();
        }
        if let Some(replacement) = params.get("replacement") {
            config.replacement = replacement.clone();
        }
        if params.contains_key("incoming") {
            config.apply_on_incoming = bool_param(params, "incoming")?;
        }
        if params.contains_key("outgoing") {
            config.apply_on_outgoing = bool_param(params, "outgoing")?;
        }
        if let Some(opcodes) = params.get("opcodes") {
            config.opcodes = parse_list(opcodes, "opcodes", OpCode::from_name)?;
        }
        if let Some(channels) = params.get("channelIds") {
            config.channel_ids = parse_list(channels, "channelIds", |id| id.trim().parse().ok())?;
        }

        config.validate(filter.id()).map_err(filter_error)?;
        filter.configure(config).map_err(filter_error)
    }
}

/// Comma separated values; an empty list lifts the restriction.
fn parse_list<T>(raw: &str, name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<Vec<T>>, ApiError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.split(',')
        .map(|item| parse(item).ok_or_else(|| ApiError::illegal_parameter(name)))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn filter_error(err: FilterError) -> ApiError {
    debug!(error = %err, "Rejected filter settings");
    let param = match err {
        FilterError::InvalidPattern { .. } => "pattern",
        FilterError::ReplacementEscape { .. } => "replacement",
        _ => return ApiError::with_detail(ApiErrorCode::InternalError, err.to_string()),
    };
    ApiError::illegal_parameter(param)
}

fn payload_options(name: &str, config: &WebSocketPayloadConfig) -> ApiResponse {
    let listed = |values: Option<Vec<String>>| values.map(|v| v.join(",")).unwrap_or_default();
    ApiResponse::set(
        name,
        vec![
            ("pattern", ApiResponse::element("pattern", &config.pattern)),
            ("replacement", ApiResponse::element("replacement", &config.replacement)),
            ("incoming", ApiResponse::element("incoming", config.apply_on_incoming)),
            ("outgoing", ApiResponse::element("outgoing", config.apply_on_outgoing)),
            (
                "opcodes",
                ApiResponse::element(
                    "opcodes",
                    listed(config.opcodes.as_ref().map(|ops| ops.iter().map(|op| op.name().to_string()).collect())),
                ),
            ),
            (
                "channelIds",
                ApiResponse::element(
                    "channelIds",
                    listed(config.channel_ids.as_ref().map(|ids| ids.iter().map(u64::to_string).collect())),
                ),
            ),
        ],
    )
}

fn replace_rule(index: usize, rule: &MatchReplaceRule) -> ApiResponse {
    ApiResponse::set(
        "rule",
        vec![
            ("index", ApiResponse::element("index", index)),
            ("location", ApiResponse::element("location", rule.location.name())),
            ("matchRegex", ApiResponse::element("matchRegex", &rule.match_regex)),
            ("replacement", ApiResponse::element("replacement", &rule.replace_string)),
        ],
    )
}

impl ApiImplementor for FilterApi {
    fn prefix(&self) -> &str {
        "filter"
    }

    fn views(&self) -> Vec<ApiOperation> {
        let mut views = vec![ApiOperation::new("filters")];
        if self.replace.is_some() {
            views.push(ApiOperation::new("replaceRules"));
        }
        if self.websocket_payload.is_some() {
            views.push(ApiOperation::new("webSocketPayloadOptions"));
        }
        views
    }

    fn actions(&self) -> Vec<ApiOperation> {
        let mut actions = vec![ApiOperation::new("setFilterState").with_mandatory(&["id", "enabled"])];
        if self.replace.is_some() {
            actions.push(
                ApiOperation::new("addReplaceRule")
                    .with_mandatory(&["location", "matchRegex"])
                    .with_optional(&["replacement"]),
            );
            actions.push(ApiOperation::new("removeReplaceRule").with_mandatory(&["index"]));
        }
        if self.websocket_payload.is_some() {
            actions.push(ApiOperation::new("setWebSocketPayloadOptions").with_optional(&[
                "pattern",
                "replacement",
                "incoming",
                "outgoing",
                "opcodes",
                "channelIds",
            ]));
        }
        actions
    }

    fn handle_view(&self, name: &str, _params: &ApiParams) -> Result<ApiResponse, ApiError> {
        match name {
            "filters" => Ok(ApiResponse::list(
                name,
                self.chain
                    .all()
                    .iter()
                    .map(|filter| {
                        ApiResponse::set(
                            "filter",
                            vec![
                                ("id", ApiResponse::element("id", filter.id())),
                                ("name", ApiResponse::element("name", filter.name())),
                                ("enabled", ApiResponse::element("enabled", filter.is_enabled())),
                            ],
                        )
                    })
                    .collect(),
            )),
            "replaceRules" => {
                let filter = self
                    .replace
                    .as_ref()
                    .ok_or_else(|| ApiError::with_detail(ApiErrorCode::BadView, name))?;
                Ok(ApiResponse::list(
                    name,
                    filter
                        .rules()
                        .iter()
                        .enumerate()
                        .map(|(i, rule)| replace_rule(i + 1, rule))
                        .collect(),
                ))
            }
            "webSocketPayloadOptions" => {
                let filter = self
                    .websocket_payload
                    .as_ref()
                    .ok_or_else(|| ApiError::with_detail(ApiErrorCode::BadView, name))?;
                Ok(payload_options(name, &filter.config()))
            }
            _ => Err(ApiError::with_detail(ApiErrorCode::BadView, name)),
        }
    }

    fn handle_action(&self, name: &str, params: &ApiParams) -> Result<ApiResponse, ApiError> {
        match name {
            "setFilterState" => {
                let id: u32 = param(params, "id")?
                    .parse()
                    .map_err(|_| ApiError::illegal_parameter("id"))?;
                let enabled = bool_param(params, "enabled")?;
                if !self.chain.set_enabled(id, enabled) {
                    return Err(ApiError::illegal_parameter("id"));
                }
                Ok(ApiResponse::ok())
            }
            "addReplaceRule" => {
                let filter = self.replace_filter(name)?;
                let location = MatchLocation::from_name(param(params, "location")?)
                    .ok_or_else(|| ApiError::illegal_parameter("location"))?;
                let rule = MatchReplaceRule {
                    match_regex: param(params, "matchRegex")?.to_string(),
                    replace_string: params.get("replacement").cloned().unwrap_or_default(),
                    location,
                };
                filter.add_rule(rule).map_err(|err| match err {
                    FilterError::InvalidPattern { .. } => ApiError::illegal_parameter("matchRegex"),
                    other => filter_error(other),
                })?;
                Ok(ApiResponse::ok())
            }
            "removeReplaceRule" => {
                let filter = self.replace_filter(name)?;
                let index: usize = param(params, "index")?
                    .parse()
                    .map_err(|_| ApiError::illegal_parameter("index"))?;
                index
                    .checked_sub(1)
                    .and_then(|i| filter.remove_rule(i))
                    .ok_or_else(|| ApiError::illegal_parameter("index"))?;
                Ok(ApiResponse::ok())
            }
            "setWebSocketPayloadOptions" => {
                self.set_payload_options(name, params)?;
                Ok(ApiResponse::ok())
            }
            _ => Err(ApiError::with_detail(ApiErrorCode::BadAction, name)),
        }
    }
}
