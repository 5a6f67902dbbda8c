use intercept_core::callback::{CallbackHandler, CallbackRouter, CallbackServer, SELF_TEST_RESPONSE};
use intercept_core::HttpMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    bodies: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CallbackHandler for Recorder {
    fn handle_callback(&self, msg: &mut HttpMessage) {
        self.bodies
            .lock()
            .push((msg.request.url.clone(), msg.request.body.clone()));
        // Must not leak into the reply
        msg.response = None;
        msg.request.body.clear();
    }
}

#[tokio::test]
async fn test_callback_listener_routes_requests() {
    let router = Arc::new(CallbackRouter::new());
    let recorder = Arc::new(Recorder::default());
    router.register_prefix("/oast", recorder.clone()).unwrap();

    let server = CallbackServer::bind(router.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    assert_eq!(router.callback_url(), Some(format!("http://{}", addr)));

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let handle = tokio::spawn(async move { server.run(async move { stop.cancelled().await }).await });

    let client = reqwest::Client::new();

    let res = client
        .get(format!("http://{}/CallbackTest", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), SELF_TEST_RESPONSE);

    let res = client
        .post(format!("http://{}/oast/token123?x=1", addr))
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "");

    let res = client
        .get(format!("http://{}/unknown", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let bodies = recorder.bodies.lock().clone();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].0.starts_with("/oast/token123"));
    assert_eq!(bodies[0].1, b"ping");

    let received = router.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].prefix.as_deref(), Some("/oast"));
    assert_eq!(received[1].prefix, None);
    assert!(received[0].source.is_some());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
