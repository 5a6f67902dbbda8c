//! hudsucker glue: converts proxied traffic into [`HttpMessage`] /
//! [`WebSocketMessage`] values, runs them through the listener dispatcher
//! and converts the (possibly rewritten) result back.

use crate::api::ApiDispatcher;
use crate::dispatcher::{InterceptContext, ListenerDispatcher, ListenerVerdict};
use crate::message::{Direction, Headers, HttpMessage, HttpRequest, HttpResponse, OpCode, WebSocketMessage};
use dashmap::DashMap;
use hudsucker::{
    hyper::{
        self,
        header::{HeaderName, HeaderValue},
        Body, HeaderMap, Method, Request, Response, StatusCode, Uri, Version,
    },
    tokio_tungstenite::tungstenite::Message,
    HttpContext, HttpHandler, RequestOrResponse, WebSocketContext, WebSocketHandler,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

const DROPPED_BODY: &str = "dropped";

/// Request in flight on this handler, kept until its response arrives.
/// Dropping it cancels `ctx`.
struct Exchange {
    message: HttpMessage,
    ctx: InterceptContext,
    _guard: DropGuard,
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    id: u64,
    next_message_id: u64,
}

pub struct InterceptHandler {
    dispatcher: Arc<ListenerDispatcher>,
    api: Arc<ApiDispatcher>,
    channels: Arc<DashMap<(SocketAddr, String), ChannelState>>,
    next_channel_id: Arc<AtomicU64>,
    current: Option<Exchange>,
}

impl Clone for InterceptHandler {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            api: self.api.clone(),
            channels: self.channels.clone(),
            next_channel_id: self.next_channel_id.clone(),
            current: None,
        }
    }
}

impl InterceptHandler {
    pub fn new(dispatcher: Arc<ListenerDispatcher>, api: Arc<ApiDispatcher>) -> Self {
        Self {
            dispatcher,
            api,
            channels: Arc::new(DashMap::new()),
            next_channel_id: Arc::new(AtomicU64::new(1)),
            current: None,
        }
    }

    /// Runs a request through the API or the listeners.
    pub async fn intercept_request(&mut self, req: Request<Body>) -> RequestOrResponse {
        let mut req = req;
        // Compressed frames cannot be inspected
        req.headers_mut().remove("sec-websocket-extensions");

        let (parts, mut msg) = match request_to_message(req).await {
            Ok(converted) => converted,
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return RequestOrResponse::Response(status_only(StatusCode::BAD_GATEWAY));
            }
        };

        if self.api.is_api_request(&msg) {
            debug!(url = %msg.request.url, "Answering API request");
            return RequestOrResponse::Response(response_from_message(&self.api.handle(&msg)));
        }

        // Cancels the context if this future is dropped, which hyper does
        // when the client closes the connection mid-request.
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let ctx = InterceptContext::new(cancel);
        if self.dispatcher.on_request(&mut msg, &ctx).await == ListenerVerdict::Drop {
            self.current = None;
            return RequestOrResponse::Response(response_from_message(&HttpResponse::with_body(
                403,
                "text/plain",
                DROPPED_BODY,
            )));
        }

        let req = request_from_message(parts, &msg);
        self.current = Some(Exchange {
            message: msg,
            ctx,
            _guard: guard,
        });
        RequestOrResponse::Request(req)
    }

    /// Runs a response through the listeners, paired with the request this
    /// handler forwarded last.
    pub async fn intercept_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(exchange) = self.current.take() else {
            debug!(status = res.status().as_u16(), "Response without a tracked request");
            return res;
        };
        let Exchange { mut message, ctx, _guard } = exchange;

        let (parts, body) = res.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!(url = %message.request.url, "Failed to read response body: {}", e);
                return status_only(StatusCode::BAD_GATEWAY);
            }
        };
        message.response = Some(HttpResponse {
            status: parts.status.as_u16(),
            reason: parts.status.canonical_reason().unwrap_or_default().to_string(),
            headers: headers_from_map(&parts.headers),
            body,
        });

        if self.dispatcher.on_response(&mut message, &ctx).await == ListenerVerdict::Drop {
            return status_only(StatusCode::BAD_GATEWAY);
        }

        match &message.response {
            Some(response) => {
                let mut rebuilt = response_from_message(response);
                *rebuilt.version_mut() = parts.version;
                rebuilt
            }
            None => status_only(StatusCode::BAD_GATEWAY),
        }
    }

    fn channel(&self, client: SocketAddr, server: &Uri) -> (u64, u64) {
        let mut state = self
            .channels
            .entry((client, server.to_string()))
            .or_insert_with(|| {
                let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
                info!(channel_id = id, url = %server, "WebSocket channel opened");
                ChannelState { id, next_message_id: 0 }
            });
        let message_id = state.next_message_id;
        state.next_message_id += 1;
        (state.id, message_id)
    }

    /// Runs one frame through the WebSocket observers.
    pub async fn intercept_frame(
        &mut self,
        client: SocketAddr,
        server: &Uri,
        direction: Direction,
        frame: Message,
    ) -> Option<Message> {
        let (channel_id, message_id) = self.channel(client, server);
        let Some(mut msg) = frame_to_message(&frame, direction) else {
            return Some(frame);
        };
        msg.channel_id = channel_id;
        msg.message_id = message_id;
        msg.handshake_url = server.to_string();

        if msg.opcode == OpCode::Close {
            self.channels.remove(&(client, server.to_string()));
        }

        let ctx = InterceptContext::default();
        if self.dispatcher.on_frame(channel_id, &mut msg, &ctx).await == ListenerVerdict::Drop {
            return None;
        }
        if msg.opcode == OpCode::Close {
            return Some(frame);
        }
        Some(message_to_frame(msg))
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.intercept_request(req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.intercept_response(res).await
    }
}

#[async_trait::async_trait]
impl WebSocketHandler for InterceptHandler {
    async fn handle_message(&mut self, ctx: &WebSocketContext, message: Message) -> Option<Message> {
        match ctx {
            WebSocketContext::ClientToServer { src, dst, .. } => {
                self.intercept_frame(*src, dst, Direction::Outgoing, message).await
            }
            WebSocketContext::ServerToClient { src, dst, .. } => {
                self.intercept_frame(*dst, src, Direction::Incoming, message).await
            }
        }
    }
}

fn status_only(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res
}

fn version_text(version: Version) -> String {
    format!("{:?}", version)
}

pub fn headers_from_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        headers.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    headers
}

/// Skips headers hyper will not accept.
pub fn headers_to_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => warn!(header = name, "Skipping invalid header"),
        }
    }
    map
}

/// Buffers the body and splits the request into its hyper parts and an
/// [`HttpMessage`].
pub async fn request_to_message(
    req: Request<Body>,
) -> Result<(hyper::http::request::Parts, HttpMessage), hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = hyper::body::to_bytes(body).await?;
    let request = HttpRequest {
        method: parts.method.to_string(),
        url: parts.uri.to_string(),
        version: version_text(parts.version),
        headers: headers_from_map(&parts.headers),
        body: body.to_vec(),
    };
    Ok((parts, HttpMessage::new(request)))
}

/// Rebuilds the outgoing request, keeping the original method or URI when
/// the rewritten one does not parse.
pub fn request_from_message(
    mut parts: hyper::http::request::Parts,
    msg: &HttpMessage,
) -> Request<Body> {
    match Method::from_bytes(msg.request.method.as_bytes()) {
        Ok(method) => parts.method = method,
        Err(_) => warn!(method = %msg.request.method, "Ignoring invalid rewritten method"),
    }
    match msg.request.url.parse::<Uri>() {
        Ok(uri) => parts.uri = uri,
        Err(_) => warn!(url = %msg.request.url, "Ignoring invalid rewritten URL"),
    }
    parts.headers = headers_to_map(&msg.request.headers);
    Request::from_parts(parts, Body::from(msg.request.body.clone()))
}

pub fn response_from_message(response: &HttpResponse) -> Response<Body> {
    let mut res = Response::new(Body::from(response.body.clone()));
    *res.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    *res.headers_mut() = headers_to_map(&response.headers);
    res
}

fn frame_to_message(frame: &Message, direction: Direction) -> Option<WebSocketMessage> {
    let (opcode, payload) = match frame {
        Message::Text(text) => (OpCode::Text, text.as_bytes().to_vec()),
        Message::Binary(data) => (OpCode::Binary, data.clone()),
        Message::Ping(data) => (OpCode::Ping, data.clone()),
        Message::Pong(data) => (OpCode::Pong, data.clone()),
        Message::Close(close) => (
            OpCode::Close,
            close
                .as_ref()
                .map(|c| c.reason.as_bytes().to_vec())
                .unwrap_or_default(),
        ),
        Message::Frame(_) => return None,
    };
    Some(WebSocketMessage {
        channel_id: 0,
        message_id: 0,
        direction,
        opcode,
        payload,
        finished: true,
        handshake_url: String::new(),
    })
}

fn message_to_frame(msg: WebSocketMessage) -> Message {
    match msg.opcode {
        OpCode::Text => match String::from_utf8(msg.payload) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        },
        OpCode::Ping => Message::Ping(msg.payload),
        OpCode::Pong => Message::Pong(msg.payload),
        _ => Message::Binary(msg.payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::dispatcher::{ProxyListener, WebSocketObserver};
    use crate::session::Session;
    use async_trait::async_trait;

    struct Rewriter {
        drop_path: &'static str,
    }

    #[async_trait]
    impl ProxyListener for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }

        fn observing_order(&self) -> i32 {
            0
        }

        async fn on_request(&self, msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
            if msg.path() == self.drop_path {
                return ListenerVerdict::Drop;
            }
            msg.request.headers.set("X-Intercepted", "1");
            ListenerVerdict::Forward
        }

        async fn on_response(&self, msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
            if let Some(response) = msg.response.as_mut() {
                response.body = format!("seen {}", msg.request.url).into_bytes();
                response.headers.remove("Content-Length");
            }
            ListenerVerdict::Forward
        }
    }

    #[async_trait]
    impl WebSocketObserver for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }

        fn observing_order(&self) -> i32 {
            0
        }

        async fn on_frame(
            &self,
            _channel_id: u64,
            msg: &mut WebSocketMessage,
            _ctx: &InterceptContext,
        ) -> ListenerVerdict {
            if msg.readable_payload() == Some("drop me") {
                return ListenerVerdict::Drop;
            }
            if let Some(text) = msg.readable_payload() {
                let upper = text.to_uppercase();
                msg.set_readable_payload(upper);
            }
            ListenerVerdict::Forward
        }
    }

    fn handler() -> InterceptHandler {
        let session = Arc::new(Session::default());
        let dispatcher = Arc::new(ListenerDispatcher::new(session.clone(), session));
        let rewriter = Arc::new(Rewriter { drop_path: "/blocked" });
        dispatcher.add_proxy_listener(rewriter.clone());
        dispatcher.add_websocket_observer(rewriter);
        InterceptHandler::new(dispatcher, Arc::new(ApiDispatcher::new(ApiConfig::default())))
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("sec-websocket-extensions", "permessage-deflate")
            .body(Body::from("payload"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_and_response_rewritten() {
        let mut handler = handler();
        let forwarded = match handler.intercept_request(request("http://site.test/a")).await {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("request was answered"),
        };
        assert_eq!(forwarded.headers()["x-intercepted"], "1");
        assert!(forwarded.headers().get("sec-websocket-extensions").is_none());
        let body = hyper::body::to_bytes(forwarded.into_body()).await.unwrap();
        assert_eq!(&body[..], b"payload");

        let res = handler
            .intercept_response(Response::new(Body::from("original")))
            .await;
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..], b"seen http://site.test/a");
    }

    /// Parks every request and reports when its context is cancelled.
    struct Parker {
        cancelled: Arc<tokio::sync::Notify>,
        entered: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ProxyListener for Parker {
        fn name(&self) -> &str {
            "parker"
        }

        fn observing_order(&self) -> i32 {
            0
        }

        async fn on_request(&self, _msg: &mut HttpMessage, ctx: &InterceptContext) -> ListenerVerdict {
            let token = ctx.cancel.clone();
            let cancelled = self.cancelled.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                cancelled.notify_one();
            });
            self.entered.notify_one();
            std::future::pending::<()>().await;
            ListenerVerdict::Forward
        }

        async fn on_response(&self, _msg: &mut HttpMessage, _ctx: &InterceptContext) -> ListenerVerdict {
            ListenerVerdict::Forward
        }
    }

    #[tokio::test]
    async fn test_abandoned_request_cancels_context() {
        let session = Arc::new(Session::default());
        let dispatcher = Arc::new(ListenerDispatcher::new(session.clone(), session));
        let parker = Arc::new(Parker {
            cancelled: Arc::new(tokio::sync::Notify::new()),
            entered: Arc::new(tokio::sync::Notify::new()),
        });
        dispatcher.add_proxy_listener(parker.clone());
        let mut handler =
            InterceptHandler::new(dispatcher, Arc::new(ApiDispatcher::new(ApiConfig::default())));

        let task = tokio::spawn(async move {
            handler.intercept_request(request("http://site.test/slow")).await;
        });
        parker.entered.notified().await;
        task.abort();

        tokio::time::timeout(std::time::Duration::from_secs(5), parker.cancelled.notified())
            .await
            .expect("context was not cancelled");
    }

    #[tokio::test]
    async fn test_dropped_request_answered_403() {
        let mut handler = handler();
        match handler.intercept_request(request("http://site.test/blocked")).await {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), StatusCode::FORBIDDEN);
                let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
                assert_eq!(&body[..], DROPPED_BODY.as_bytes());
            }
            RequestOrResponse::Request(_) => panic!("request was forwarded"),
        }
    }

    #[tokio::test]
    async fn test_api_host_short_circuits() {
        let mut handler = handler();
        match handler.intercept_request(request("http://zap/json/nope/view/x/")).await {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), StatusCode::OK);
                let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
                assert!(String::from_utf8_lossy(&body).contains("no_implementor"));
            }
            RequestOrResponse::Request(_) => panic!("API request was forwarded"),
        }
    }

    #[tokio::test]
    async fn test_untracked_response_passes_through() {
        let mut handler = handler();
        let res = handler.intercept_response(status_only(StatusCode::NO_CONTENT)).await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_frames_rewritten_and_dropped() {
        let mut handler = handler();
        let client: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let server: Uri = "ws://chat.test/socket".parse().unwrap();

        let out = handler
            .intercept_frame(client, &server, Direction::Outgoing, Message::Text("hi".into()))
            .await;
        assert_eq!(out, Some(Message::Text("HI".into())));

        let dropped = handler
            .intercept_frame(client, &server, Direction::Incoming, Message::Text("drop me".into()))
            .await;
        assert_eq!(dropped, None);

        let binary = handler
            .intercept_frame(client, &server, Direction::Incoming, Message::Binary(vec![0xff, 0xfe]))
            .await;
        assert_eq!(binary, Some(Message::Binary(vec![0xff, 0xfe])));
    }

    #[test]
    fn test_channel_ids_per_connection() {
        let handler = handler();
        let server: Uri = "ws://chat.test/".parse().unwrap();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();

        assert_eq!(handler.channel(a, &server), (1, 0));
        assert_eq!(handler.channel(a, &server), (1, 1));
        assert_eq!(handler.clone().channel(b, &server), (2, 0));
    }

    #[test]
    fn test_invalid_headers_skipped() {
        let mut headers = Headers::new();
        headers.append("Good", "yes");
        headers.append("Bad Name", "x");
        let map = headers_to_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map["good"], "yes");
    }
}
