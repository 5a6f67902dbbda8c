use crate::api::implementor::{param, ApiImplementor, ApiOperation, ApiParams};
use crate::api::{ApiError, ApiErrorCode, ApiResponse};
use crate::history::{HistoryRef, HistoryStore};
use crate::message::{HttpMessage, HttpResponse};
use crate::session::{Mode, ModeProvider, Session};
use std::sync::Arc;

/// Session, scope and history.
pub struct CoreApi {
    session: Arc<Session>,
    history: Arc<dyn HistoryStore>,
}

impl CoreApi {
    pub fn new(session: Arc<Session>, history: Arc<dyn HistoryStore>) -> Self {
        Self { session, history }
    }
}

fn string_list(name: &str, item: &str, values: Vec<String>) -> ApiResponse {
    ApiResponse::list(
        name,
        values.into_iter().map(|v| ApiResponse::element(item, v)).collect(),
    )
}

/// Raw text of an exchange: request head and body, then the response.
fn message_text(msg: &HttpMessage) -> Vec<u8> {
    let request = &msg.request;
    let mut out = format!(
        "{} {} {}\r\n{}\r\n",
        request.method,
        request.url,
        request.version,
        request.headers.to_text()
    )
    .into_bytes();
    out.extend_from_slice(&request.body);

    if let Some(response) = &msg.response {
        out.extend_from_slice(
            format!(
                "\r\n\r\n{} {} {}\r\n{}\r\n",
                request.version,
                response.status,
                response.reason,
                response.headers.to_text()
            )
            .as_bytes(),
        );
        out.extend_from_slice(&response.body);
    }
    out
}

impl ApiImplementor for CoreApi {
    fn prefix(&self) -> &str {
        "core"
    }

    fn views(&self) -> Vec<ApiOperation> {
        vec![
            ApiOperation::new("hosts"),
            ApiOperation::new("sites"),
            ApiOperation::new("urls"),
            ApiOperation::new("mode"),
            ApiOperation::new("numberOfMessages"),
            ApiOperation::new("scope"),
        ]
    }

    fn actions(&self) -> Vec<ApiOperation> {
        vec![
            ApiOperation::new("setMode").with_mandatory(&["mode"]),
            ApiOperation::new("includeInScope").with_mandatory(&["pattern"]),
            ApiOperation::new("excludeFromScope").with_mandatory(&["pattern"]),
            ApiOperation::new("newSession"),
        ]
    }

    fn others(&self) -> Vec<ApiOperation> {
        vec![ApiOperation::new("message").with_mandatory(&["id"])]
    }

    fn handle_view(&self, name: &str, _params: &ApiParams) -> Result<ApiResponse, ApiError> {
        match name {
            "hosts" => Ok(string_list("hosts", "host", self.history.hosts())),
            "sites" => Ok(string_list("sites", "site", self.history.sites())),
            "urls" => Ok(string_list("urls", "url", self.history.urls())),
            "mode" => Ok(ApiResponse::element("mode", self.session.mode())),
            "numberOfMessages" => Ok(ApiResponse::element("numberOfMessages", self.history.len())),
            "scope" => {
                let scope = self.session.scope();
                Ok(ApiResponse::set(
                    "scope",
                    vec![
                        ("include", string_list("include", "pattern", scope.include)),
                        ("exclude", string_list("exclude", "pattern", scope.exclude)),
                    ],
                ))
            }
            _ => Err(ApiError::with_detail(ApiErrorCode::BadView, name)),
        }
    }

    fn handle_action(&self, name: &str, params: &ApiParams) -> Result<ApiResponse, ApiError> {
        match name {
            "setMode" => {
                let mode: Mode = param(params, "mode")?
                    .parse()
                    .map_err(|_| ApiError::illegal_parameter("mode"))?;
                self.session.set_mode(mode);
            }
            "includeInScope" => self.session.include_in_scope(param(params, "pattern")?),
            "excludeFromScope" => self.session.exclude_from_scope(param(params, "pattern")?),
            "newSession" => self.session.new_session(),
            _ => return Err(ApiError::with_detail(ApiErrorCode::BadAction, name)),
        }
        Ok(ApiResponse::ok())
    }

    fn handle_other(&self, name: &str, params: &ApiParams) -> Result<HttpResponse, ApiError> {
        match name {
            "message" => {
                let id: u64 = param(params, "id")?
                    .parse()
                    .map_err(|_| ApiError::illegal_parameter("id"))?;
                let msg = self
                    .history
                    .get(HistoryRef(id))
                    .ok_or_else(|| ApiError::illegal_parameter("id"))?;
                Ok(HttpResponse::with_body(
                    200,
                    "text/plain; charset=UTF-8",
                    message_text(&msg),
                ))
            }
            _ => Err(ApiError::with_detail(ApiErrorCode::BadOther, name)),
        }
    }
}
