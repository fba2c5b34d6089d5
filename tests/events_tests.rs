use mockproxy::prelude::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn static_rule(body: &str) -> RuleData {
    RuleData::new(ResponseHandler::Static {
        response: ResponseSpec::new(200).body(body),
    })
}

#[tokio::test]
async fn request_then_response_events_test() {
    // Arrange
    let proxy = MockProxy::start_async().await;
    proxy.add_rule(static_rule("ok"));
    let mut events = proxy.subscribe();

    // Act
    let client = reqwest::Client::new();
    client.post(proxy.url("/o")).body("ping").send().await.unwrap();

    // Assert: the headers-received view comes first, then the completed
    // request, then the response.
    let first = timeout(EVENT_WAIT, events.next()).await.unwrap().unwrap();
    let partial = match first {
        ProxyEvent::RequestReceived(req) => req,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(partial.body().is_empty(), true);
    assert_eq!(partial.timings().body_received.is_none(), true);

    let second = timeout(EVENT_WAIT, events.next()).await.unwrap().unwrap();
    let completed = match second {
        ProxyEvent::RequestReceived(req) => req,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(completed.body().text(), "ping");
    assert_eq!(completed.id(), partial.id());

    let third = timeout(EVENT_WAIT, events.next()).await.unwrap().unwrap();
    match third {
        ProxyEvent::ResponseCompleted(res) => {
            assert_eq!(res.request_id, completed.id());
            assert_eq!(res.status, 200);
            assert_eq!(res.body.text(), "ok");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn unmatched_requests_still_emit_response_events_test() {
    let proxy = MockProxy::start_async().await;
    let mut events = proxy.subscribe();

    reqwest::get(proxy.url("/none")).await.unwrap();

    let event = timeout(EVENT_WAIT, events.next_of(EventKind::ResponseCompleted))
        .await
        .unwrap()
        .unwrap();
    match event {
        ProxyEvent::ResponseCompleted(res) => assert_eq!(res.status, 503),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn tls_garbage_emits_failed_tls_request_test() {
    // Arrange
    let proxy = MockProxy::start_async().await;
    let mut events = proxy.subscribe();

    // Act: a handshake record carrying garbage.
    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    stream
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x05, 0xde, 0xad, 0xbe, 0xef, 0x00])
        .await
        .unwrap();
    let _ = stream.shutdown().await;
    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink).await;

    // Assert: exactly a TLS failure, no request lifecycle events.
    let event = timeout(EVENT_WAIT, events.next()).await.unwrap().unwrap();
    match event {
        ProxyEvent::FailedTlsRequest(record) => {
            assert_eq!(record.failure_cause.is_empty(), false);
            assert_eq!(record.remote_ip.is_loopback(), true);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn non_tls_garbage_does_not_touch_the_tls_path_test() {
    let proxy = MockProxy::start_async().await;
    proxy.add_rule(static_rule("ok"));
    let mut events = proxy.subscribe();

    // First byte is not 0x16, so this lands in the HTTP parser and fails there.
    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    stream.write_all(&[0x01, 0x02, 0x03, 0x0d, 0x0a, 0x0d, 0x0a]).await.unwrap();
    let _ = stream.shutdown().await;
    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink).await;

    // A well-formed request afterwards proves the instance kept serving,
    // and the only events seen belong to that request.
    reqwest::get(proxy.url("/")).await.unwrap();

    let event = timeout(EVENT_WAIT, events.next()).await.unwrap().unwrap();
    assert_eq!(event.kind(), EventKind::RequestReceived);
}

#[tokio::test]
async fn handler_timeout_answers_500_and_emits_abort_test() {
    // Arrange: a callback that outlives the configured handler timeout.
    let proxy = MockProxy::start_builder_async(
        MockProxyServerBuilder::new().handler_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    proxy.add_rule(RuleData::new(ResponseHandler::callback_async(|_req| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ResponseSpec::new(200)
    })));
    let mut events = proxy.subscribe();

    // Act
    let response = reqwest::get(proxy.url("/slow")).await.unwrap();

    // Assert
    assert_eq!(response.status(), 500);
    let event = timeout(EVENT_WAIT, events.next_of(EventKind::RequestAborted))
        .await
        .unwrap()
        .unwrap();
    match event {
        ProxyEvent::RequestAborted(req) => {
            assert_eq!(req.path(), "/slow");
            assert_eq!(req.timings().abort.is_some(), true);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // The instance keeps serving after the failed exchange.
    proxy.add_rule(static_rule("alive"));
    let body = reqwest::get(proxy.url("/slow")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "alive");
}

#[tokio::test]
async fn timeout_handler_holds_until_client_disconnect_test() {
    let proxy = MockProxy::start_async().await;
    proxy.add_rule(RuleData::new(ResponseHandler::Timeout));
    let mut events = proxy.subscribe();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let result = client.get(proxy.url("/held")).send().await;

    // The client gives up; the instance reports the exchange as aborted.
    assert_eq!(result.is_err(), true);
    let event = timeout(EVENT_WAIT, events.next_of(EventKind::RequestAborted))
        .await
        .unwrap()
        .unwrap();
    match event {
        ProxyEvent::RequestAborted(req) => assert_eq!(req.path(), "/held"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn push_subscriptions_observe_requests_test() {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    let proxy = MockProxy::start_async().await;
    proxy.add_rule(static_rule("ok"));

    let responses = Arc::new(AtomicUsize::new(0));
    let counter = responses.clone();
    let _subscription = proxy.on_event(EventKind::ResponseCompleted, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    reqwest::get(proxy.url("/")).await.unwrap();
    reqwest::get(proxy.url("/")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(responses.load(Ordering::SeqCst), 2);
}
