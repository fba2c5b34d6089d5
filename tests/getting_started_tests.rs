use mockproxy::prelude::*;

#[test]
fn getting_started_test() {
    // Start a lightweight mock proxy instance.
    let proxy = MockProxy::start();

    // Register a rule on the instance.
    let endpoint = proxy.add_rule(
        RuleData::new(ResponseHandler::Static {
            response: ResponseSpec::new(200)
                .header("content-type", "text/html; charset=UTF-8")
                .body("hello"),
        })
        .matching(RequestMatcher::Method {
            method: "GET".to_string(),
        })
        .matching(RequestMatcher::Path {
            path: "/foo".to_string(),
        }),
    );

    // Send an HTTP request to the instance. This simulates your code.
    let response = reqwest::blocking::get(proxy.url("/foo")).unwrap();

    // Ensure the instance responded as specified and recorded the exchange.
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().unwrap(), "hello");

    let seen = endpoint.seen_requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method(), "GET");
    assert_eq!(seen[0].path(), "/foo");
    assert_eq!(seen[0].protocol(), "http");

    let endpoints = proxy.mocked_endpoints();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].times_called(), 1);
}

#[tokio::test]
async fn async_getting_started_test() {
    // Start a lightweight mock proxy instance.
    let proxy = MockProxy::start_async().await;

    // Register a rule on the instance.
    let endpoint = proxy.add_rule(
        RuleData::new(ResponseHandler::Static {
            response: ResponseSpec::new(200).body("hola"),
        })
        .matching(RequestMatcher::Path {
            path: "/translate".to_string(),
        })
        .matching(RequestMatcher::Query {
            params: vec![("word".to_string(), "hello".to_string())],
        }),
    );

    // Send an HTTP request to the instance. This simulates your code.
    let client = reqwest::Client::new();
    let response = client
        .get(proxy.url("/translate?word=hello"))
        .send()
        .await
        .unwrap();

    // Ensure the instance responded as specified.
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hola");
    assert_eq!(endpoint.times_called(), 1);
}

#[test]
fn unmatched_requests_get_503_test() {
    let proxy = MockProxy::start();

    let response = reqwest::blocking::get(proxy.url("/nothing-here")).unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.text().unwrap().contains("no rule matched"), true);
}
