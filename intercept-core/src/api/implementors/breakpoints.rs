use crate::api::implementor::{bool_param, param, ApiImplementor, ApiOperation, ApiParams};
use crate::api::{ApiError, ApiErrorCode, ApiResponse};
use crate::breakpoint::{BreakManager, BreakpointRegistry, HeldKind};
use std::sync::Arc;
use uuid::Uuid;

/// Breakpoint rules, break-all toggles and held messages.
pub struct BreakApi {
    registry: Arc<BreakpointRegistry>,
    manager: BreakManager,
}

impl BreakApi {
    pub fn new(registry: Arc<BreakpointRegistry>, manager: BreakManager) -> Self {
        Self { registry, manager }
    }

    fn held_id(params: &ApiParams) -> Result<Uuid, ApiError> {
        param(params, "id")?
            .parse()
            .map_err(|_| ApiError::illegal_parameter("id"))
    }
}

fn kind_name(kind: HeldKind) -> &'static str {
    match kind {
        HeldKind::Request => "request",
        HeldKind::Response => "response",
    }
}

impl ApiImplementor for BreakApi {
    fn prefix(&self) -> &str {
        "break"
    }

    fn views(&self) -> Vec<ApiOperation> {
        vec![
            ApiOperation::new("isBreakAll"),
            ApiOperation::new("isBreakRequest"),
            ApiOperation::new("isBreakResponse"),
            ApiOperation::new("httpBreakpoints"),
            ApiOperation::new("pending"),
        ]
    }

    fn actions(&self) -> Vec<ApiOperation> {
        vec![
            ApiOperation::new("break").with_mandatory(&["type", "state"]),
            ApiOperation::new("addHttpBreakpoint").with_mandatory(&["string"]),
            ApiOperation::new("removeHttpBreakpoint").with_mandatory(&["string"]),
            ApiOperation::new("continue").with_mandatory(&["id"]),
            ApiOperation::new("step").with_mandatory(&["id"]),
            ApiOperation::new("drop").with_mandatory(&["id"]),
        ]
    }

    fn handle_view(&self, name: &str, _params: &ApiParams) -> Result<ApiResponse, ApiError> {
        let registry = &self.registry;
        match name {
            "isBreakAll" => Ok(ApiResponse::element(
                name,
                registry.is_break_all_requests() && registry.is_break_all_responses(),
            )),
            "isBreakRequest" => Ok(ApiResponse::element(name, registry.is_break_all_requests())),
            "isBreakResponse" => Ok(ApiResponse::element(name, registry.is_break_all_responses())),
            "httpBreakpoints" => Ok(ApiResponse::list(
                name,
                registry
                    .rules()
                    .into_iter()
                    .map(|rule| {
                        ApiResponse::set(
                            "httpBreakpoint",
                            vec![
                                ("string", ApiResponse::element("string", rule.url)),
                                ("enabled", ApiResponse::element("enabled", rule.enabled)),
                            ],
                        )
                    })
                    .collect(),
            )),
            "pending" => Ok(ApiResponse::list(
                name,
                self.manager
                    .pending()
                    .into_iter()
                    .map(|held| {
                        ApiResponse::set(
                            "message",
                            vec![
                                ("id", ApiResponse::element("id", held.id)),
                                ("kind", ApiResponse::element("kind", kind_name(held.kind))),
                                ("method", ApiResponse::element("method", &held.message.request.method)),
                                ("url", ApiResponse::element("url", &held.message.request.url)),
                                ("heldAt", ApiResponse::element("heldAt", held.held_at.to_rfc3339())),
                            ],
                        )
                    })
                    .collect(),
            )),
            _ => Err(ApiError::with_detail(ApiErrorCode::BadView, name)),
        }
    }

    fn handle_action(&self, name: &str, params: &ApiParams) -> Result<ApiResponse, ApiError> {
        match name {
            "break" => {
                let state = bool_param(params, "state")?;
                match param(params, "type")? {
                    "http-all" => {
                        self.registry.set_break_all_requests(state);
                        self.registry.set_break_all_responses(state);
                    }
                    "http-request" => self.registry.set_break_all_requests(state),
                    "http-response" => self.registry.set_break_all_responses(state),
                    _ => return Err(ApiError::illegal_parameter("type")),
                }
            }
            "addHttpBreakpoint" => {
                self.registry
                    .add(param(params, "string")?)
                    .map_err(|_| ApiError::illegal_parameter("string"))?;
            }
            "removeHttpBreakpoint" => {
                if !self.registry.remove(param(params, "string")?) {
                    return Err(ApiError::illegal_parameter("string"));
                }
            }
            "continue" | "step" | "drop" => {
                let id = Self::held_id(params)?;
                let resolved = match name {
                    "continue" => self.manager.continue_pending(&id),
                    "step" => self.manager.step(&id),
                    _ => self.manager.drop_message(&id),
                };
                if !resolved {
                    return Err(ApiError::with_detail(
                        ApiErrorCode::IllegalParameter,
                        format!("no held message {}", id),
                    ));
                }
            }
            _ => return Err(ApiError::with_detail(ApiErrorCode::BadAction, name)),
        }
        Ok(ApiResponse::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{BreakDecision, HeldMessage};
    use crate::message::HttpMessage;
    use tokio_util::sync::CancellationToken;

    fn params(pairs: &[(&str, &str)]) -> ApiParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_break_toggles() {
        let registry = Arc::new(BreakpointRegistry::new());
        let api = BreakApi::new(registry.clone(), BreakManager::new());

        api.handle_action("break", &params(&[("type", "http-request"), ("state", "true")]))
            .unwrap();
        assert!(registry.is_break_all_requests());
        assert_eq!(
            api.handle_view("isBreakAll", &params(&[])).unwrap().to_json(),
            r#"["false"]"#
        );

        api.handle_action("break", &params(&[("type", "http-all"), ("state", "true")]))
            .unwrap();
        assert_eq!(
            api.handle_view("isBreakAll", &params(&[])).unwrap().to_json(),
            r#"["true"]"#
        );

        let err = api
            .handle_action("break", &params(&[("type", "ws"), ("state", "true")]))
            .unwrap_err();
        assert_eq!(err.code, ApiErrorCode::IllegalParameter);
    }

    #[test]
    fn test_rule_management() {
        let registry = Arc::new(BreakpointRegistry::new());
        let api = BreakApi::new(registry.clone(), BreakManager::new());

        api.handle_action("addHttpBreakpoint", &params(&[("string", "*/login")]))
            .unwrap();
        let listed = api.handle_view("httpBreakpoints", &params(&[])).unwrap();
        assert!(listed
            .to_xml("httpBreakpoints")
            .unwrap()
            .contains("<httpBreakpoint><string>*/login</string><enabled>true</enabled></httpBreakpoint>"));

        api.handle_action("removeHttpBreakpoint", &params(&[("string", "*/login")]))
            .unwrap();
        assert!(registry.rules().is_empty());
        assert!(api
            .handle_action("removeHttpBreakpoint", &params(&[("string", "*/login")]))
            .is_err());
    }

    #[tokio::test]
    async fn test_resolve_held_message() {
        let manager = BreakManager::new();
        let api = BreakApi::new(Arc::new(BreakpointRegistry::new()), manager.clone());

        let held = HeldMessage::new(HeldKind::Request, HttpMessage::get("http://a.test/"));
        let id = held.id.to_string();
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.hold(held, &CancellationToken::new()).await })
        };
        while manager.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let pending = api.handle_view("pending", &params(&[])).unwrap().to_json();
        assert!(pending.contains(&id));

        api.handle_action("drop", &params(&[("id", id.as_str())])).unwrap();
        assert_eq!(task.await.unwrap(), BreakDecision::Drop);

        let err = api.handle_action("continue", &params(&[("id", id.as_str())])).unwrap_err();
        assert_eq!(err.code, ApiErrorCode::IllegalParameter);
        let err = api.handle_action("step", &params(&[("id", "nope")])).unwrap_err();
        assert_eq!(err.code, ApiErrorCode::IllegalParameter);
    }
}
