use super::response::{escape_xml, write_text_element, xml_document};
use quick_xml::events::{BytesStart, Event};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Error codes reported in API response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    BadFormat,
    BadType,
    NoImplementor,
    MissingParameter,
    BadAction,
    BadView,
    BadOther,
    Disabled,
    InternalError,
    IllegalParameter,
}

impl ApiErrorCode {
    pub fn code(self) -> &'static str {
        match self {
            ApiErrorCode::BadFormat => "bad_format",
            ApiErrorCode::BadType => "bad_type",
            ApiErrorCode::NoImplementor => "no_implementor",
            ApiErrorCode::MissingParameter => "missing_parameter",
            ApiErrorCode::BadAction => "bad_action",
            ApiErrorCode::BadView => "bad_view",
            ApiErrorCode::BadOther => "bad_other",
            ApiErrorCode::Disabled => "disabled",
            ApiErrorCode::InternalError => "internal_error",
            ApiErrorCode::IllegalParameter => "illegal_parameter",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ApiErrorCode::BadFormat => "Bad Format",
            ApiErrorCode::BadType => "Bad Type",
            ApiErrorCode::NoImplementor => "No Implementor",
            ApiErrorCode::MissingParameter => "Missing Parameter",
            ApiErrorCode::BadAction => "Bad Action",
            ApiErrorCode::BadView => "Bad View",
            ApiErrorCode::BadOther => "Bad Other",
            ApiErrorCode::Disabled => "API Disabled",
            ApiErrorCode::InternalError => "Internal Error",
            ApiErrorCode::IllegalParameter => "Illegal Parameter",
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}{}", .detail.as_ref().map(|d| format!(" ({})", d)).unwrap_or_default())]
pub struct ApiError {
    pub code: ApiErrorCode,
    /// Extra context, e.g. the name of a missing parameter
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: ApiErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self::with_detail(ApiErrorCode::MissingParameter, name)
    }

    pub fn illegal_parameter(name: &str) -> Self {
        Self::with_detail(ApiErrorCode::IllegalParameter, name)
    }

    pub fn to_json(&self) -> String {
        let mut body = json!({
            "code": self.code.code(),
            "message": self.code.message(),
        });
        if let Some(detail) = &self.detail {
            body["detail"] = json!(detail);
        }
        body.to_string()
    }

    pub fn to_xml(&self) -> quick_xml::Result<String> {
        xml_document(|writer| {
            let start = BytesStart::new("error");
            let end = start.to_end().into_owned();
            writer.write_event(Event::Start(start))?;
            write_text_element(writer, BytesStart::new("code"), self.code.code())?;
            write_text_element(writer, BytesStart::new("message"), self.code.message())?;
            if let Some(detail) = &self.detail {
                write_text_element(writer, BytesStart::new("detail"), detail)?;
            }
            writer.write_event(Event::End(end))
        })
    }

    pub fn to_html(&self) -> String {
        let detail = self
            .detail
            .as_ref()
            .map(|d| format!("<tr><td>detail</td><td>{}</td></tr>", escape_xml(d)))
            .unwrap_or_default();
        format!(
            "<table><tr><td>code</td><td>{}</td></tr><tr><td>message</td><td>{}</td></tr>{}</table>",
            self.code.code(),
            self.code.message(),
            detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_bodies() {
        let err = ApiError::missing_parameter("contextId");
        assert_eq!(err.to_string(), "missing_parameter (contextId)");

        let json: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(json["code"], "missing_parameter");
        assert_eq!(json["detail"], "contextId");

        let xml = ApiError::new(ApiErrorCode::BadView).to_xml().unwrap();
        assert!(xml.ends_with("<error><code>bad_view</code><message>Bad View</message></error>"));
        assert!(!xml.contains("<detail>"));

        let xml = ApiError::with_detail(ApiErrorCode::BadView, "a<b & 'c'").to_xml().unwrap();
        assert!(xml.contains("<detail>a&lt;b &amp; &apos;c&apos;</detail>"));

        let html = ApiError::with_detail(ApiErrorCode::IllegalParameter, "<id>").to_html();
        assert!(html.contains("&lt;id&gt;"));
    }
}
