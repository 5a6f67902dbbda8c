use super::error::{ApiError, ApiErrorCode};
use super::response::ApiResponse;
use crate::message::HttpResponse;
use std::collections::BTreeMap;

/// Decoded query (and form) parameters.
pub type ApiParams = BTreeMap<String, String>;

/// Metadata for one action, view or other endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiOperation {
    pub name: String,
    pub mandatory: Vec<String>,
    pub optional: Vec<String>,
}

impl ApiOperation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mandatory: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn with_mandatory(mut self, params: &[&str]) -> Self {
        self.mandatory = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_optional(mut self, params: &[&str]) -> Self {
        self.optional = params.iter().map(|p| p.to_string()).collect();
        self
    }

    /// First mandatory parameter that is absent or empty.
    pub fn missing_parameter(&self, params: &ApiParams) -> Option<&str> {
        self.mandatory
            .iter()
            .find(|name| params.get(name.as_str()).map_or(true, |v| v.is_empty()))
            .map(String::as_str)
    }
}

/// A component reachable under `/<format>/<prefix>/...`.
pub trait ApiImplementor: Send + Sync {
    fn prefix(&self) -> &str;

    fn actions(&self) -> Vec<ApiOperation> {
        Vec::new()
    }

    fn views(&self) -> Vec<ApiOperation> {
        Vec::new()
    }

    fn others(&self) -> Vec<ApiOperation> {
        Vec::new()
    }

    fn handle_action(&self, name: &str, _params: &ApiParams) -> Result<ApiResponse, ApiError> {
        Err(ApiError::with_detail(ApiErrorCode::BadAction, name))
    }

    fn handle_view(&self, name: &str, _params: &ApiParams) -> Result<ApiResponse, ApiError> {
        Err(ApiError::with_detail(ApiErrorCode::BadView, name))
    }

    /// Raw endpoints that build their own response.
    fn handle_other(&self, name: &str, _params: &ApiParams) -> Result<HttpResponse, ApiError> {
        Err(ApiError::with_detail(ApiErrorCode::BadOther, name))
    }
}

/// Fetches a parameter the dispatcher already checked for presence.
pub fn param<'a>(params: &'a ApiParams, name: &str) -> Result<&'a str, ApiError> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::missing_parameter(name))
}

pub fn bool_param(params: &ApiParams, name: &str) -> Result<bool, ApiError> {
    match param(params, name)?.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ApiError::illegal_parameter(name)),
    }
}
