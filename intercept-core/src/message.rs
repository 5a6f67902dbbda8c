//! Intercepted traffic units
//!
//! An [`HttpMessage`] is a request with an optional response; a
//! [`WebSocketMessage`] is a single frame on a channel. Both own all of their
//! data, so `clone()` is always a deep copy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every value of `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the headers as `Name: value` lines.
    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}: {}\r\n", k, v))
            .collect()
    }

    /// Parses `Name: value` lines, skipping lines without a colon.
    pub fn from_text(text: &str) -> Self {
        let mut headers = Self::new();
        for line in text.lines() {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if !name.is_empty() {
                    headers.append(name, value.trim());
                }
            }
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Builds a response with a body and matching content headers.
    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let mut response = Self::new(status);
        response.headers.set("Content-Type", content_type);
        response.headers.set("Content-Length", body.len().to_string());
        response.body = body;
        response
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// A request and, once received, its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMessage {
    pub id: Uuid,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
}

impl HttpMessage {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
        }
    }

    /// Shorthand for a bodiless request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpRequest::new("GET", url))
    }

    pub fn parsed_url(&self) -> Option<url::Url> {
        url::Url::parse(&self.request.url).ok()
    }

    pub fn host(&self) -> Option<String> {
        self.parsed_url()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    pub fn path(&self) -> String {
        match self.parsed_url() {
            Some(u) => u.path().to_string(),
            // Origin-form requests ("/path?query") reach the callback listener
            None => {
                let url = self.request.url.as_str();
                let end = url.find(['?', '#']).unwrap_or(url.len());
                url[..end].to_string()
            }
        }
    }

    pub fn query(&self) -> Option<String> {
        match self.parsed_url() {
            Some(u) => u.query().map(str::to_string),
            None => self
                .request
                .url
                .split_once('?')
                .map(|(_, q)| q.split('#').next().unwrap_or_default().to_string()),
        }
    }

    /// `scheme://host:port` of the request target.
    pub fn site(&self) -> Option<String> {
        let url = self.parsed_url()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{}://{}:{}", url.scheme(), host.to_ascii_lowercase(), port))
    }

    /// The request URL with query and fragment cleared.
    pub fn url_without_query(&self) -> Option<String> {
        let mut url = self.parsed_url()?;
        url.set_query(None);
        url.set_fragment(None);
        Some(url.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Server to client
    Incoming,
    /// Client to server
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// RFC 6455 opcode number.
    pub fn code(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            OpCode::Continuation,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ]
        .into_iter()
        .find(|op| op.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }
}

/// One WebSocket frame as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub channel_id: u64,
    pub message_id: u64,
    pub direction: Direction,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    /// False for a fragment that more continuation frames will follow
    pub finished: bool,
    /// URL of the upgrade request that opened the channel
    pub handshake_url: String,
}

impl WebSocketMessage {
    pub fn text(channel_id: u64, direction: Direction, payload: &str) -> Self {
        Self {
            channel_id,
            message_id: 0,
            direction,
            opcode: OpCode::Text,
            payload: payload.as_bytes().to_vec(),
            finished: true,
            handshake_url: String::new(),
        }
    }

    /// The payload as text, when it is valid UTF-8.
    pub fn readable_payload(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn set_readable_payload(&mut self, payload: String) {
        self.payload = payload.into_bytes();
    }
}
