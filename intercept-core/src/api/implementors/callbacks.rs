use crate::api::implementor::{ApiImplementor, ApiOperation, ApiParams};
use crate::api::{ApiError, ApiErrorCode, ApiResponse};
use crate::callback::CallbackRouter;
use std::sync::Arc;

pub struct CallbackApi {
    router: Arc<CallbackRouter>,
}

impl CallbackApi {
    pub fn new(router: Arc<CallbackRouter>) -> Self {
        Self { router }
    }
}

impl ApiImplementor for CallbackApi {
    fn prefix(&self) -> &str {
        "callback"
    }

    fn views(&self) -> Vec<ApiOperation> {
        vec![
            ApiOperation::new("url"),
            ApiOperation::new("prefixes"),
            ApiOperation::new("received"),
        ]
    }

    fn handle_view(&self, name: &str, _params: &ApiParams) -> Result<ApiResponse, ApiError> {
        match name {
            "url" => Ok(ApiResponse::element(
                name,
                self.router.callback_url().unwrap_or_default(),
            )),
            "prefixes" => Ok(ApiResponse::list(
                name,
                self.router
                    .prefixes()
                    .into_iter()
                    .map(|prefix| ApiResponse::element("prefix", prefix))
                    .collect(),
            )),
            "received" => Ok(ApiResponse::list(
                name,
                self.router
                    .received()
                    .into_iter()
                    .map(|callback| {
                        ApiResponse::set(
                            "callback",
                            vec![
                                ("prefix", ApiResponse::element("prefix", callback.prefix.unwrap_or_default())),
                                ("method", ApiResponse::element("method", callback.method)),
                                ("url", ApiResponse::element("url", callback.url)),
                                ("receivedAt", ApiResponse::element("receivedAt", callback.received_at.to_rfc3339())),
                                ("source", ApiResponse::element("source", callback.source.unwrap_or_default())),
                            ],
                        )
                    })
                    .collect(),
            )),
            _ => Err(ApiError::with_detail(ApiErrorCode::BadView, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackHandler;
    use crate::message::HttpMessage;

    struct Ignore;

    impl CallbackHandler for Ignore {
        fn handle_callback(&self, _msg: &mut HttpMessage) {}
    }

    #[test]
    fn test_views() {
        let router = Arc::new(CallbackRouter::new());
        router.set_base_url("http://10.0.0.5:4444");
        router.register_prefix("/oast", Arc::new(Ignore)).unwrap();
        router.route(&HttpMessage::get("/oast/abc"));
        let api = CallbackApi::new(router);

        let params = ApiParams::new();
        assert_eq!(
            api.handle_view("url", &params).unwrap().to_json(),
            r#"["http://10.0.0.5:4444"]"#
        );
        assert_eq!(
            api.handle_view("prefixes", &params).unwrap().to_json(),
            r#"[["/oast"]]"#
        );
        let received: serde_json::Value =
            serde_json::from_str(&api.handle_view("received", &params).unwrap().to_json()).unwrap();
        assert_eq!(received[0][0]["prefix"], "/oast");
        assert_eq!(received[0][0]["url"], "/oast/abc");
    }
}
