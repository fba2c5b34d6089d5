use mockproxy::prelude::*;

fn static_rule(body: &str) -> RuleData {
    RuleData::new(ResponseHandler::Static {
        response: ResponseSpec::new(200).body(body),
    })
}

#[tokio::test]
async fn direct_tls_request_test() {
    // Arrange
    let proxy = MockProxy::start_async().await;
    let endpoint = proxy.add_rule(static_rule("secure").matching(RequestMatcher::Protocol {
        protocol: "https".to_string(),
    }));

    // Act: talk TLS straight to the data port; the demultiplexer routes on
    // the first byte.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client
        .get(format!("https://localhost:{}/locked", proxy.port()))
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "secure");

    let seen = endpoint.seen_requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].protocol(), "https");
    assert_eq!(seen[0].path(), "/locked");
}

#[tokio::test]
async fn generated_ca_is_trustable_test() {
    // Arrange
    let proxy = MockProxy::start_async().await;
    proxy.add_rule(static_rule("trusted"));

    // Act: trust the instance's root instead of disabling verification.
    let root = reqwest::Certificate::from_pem(proxy.ca_certificate_pem().as_bytes()).unwrap();
    let client = reqwest::Client::builder()
        .add_root_certificate(root)
        .build()
        .unwrap();
    let response = client
        .get(format!("https://localhost:{}/", proxy.port()))
        .send()
        .await
        .unwrap();

    // Assert: the minted leaf for "localhost" verifies against the root.
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "trusted");
}

#[tokio::test]
async fn connect_tunnel_matches_https_rules_test() {
    // Arrange
    let proxy = MockProxy::start_async().await;
    let endpoint = proxy.add_rule(
        static_rule("tunneled")
            .matching(RequestMatcher::Hostname {
                hostname: "example.com".to_string(),
            })
            .matching(RequestMatcher::Protocol {
                protocol: "https".to_string(),
            }),
    );

    // Act: the client tunnels through CONNECT and then negotiates TLS with
    // the instance itself; no packet ever leaves the machine.
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(proxy.base_url()).unwrap())
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client.get("https://example.com/").send().await.unwrap();

    // Assert
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "tunneled");

    let seen = endpoint.seen_requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].protocol(), "https");
    assert_eq!(seen[0].hostname(), "example.com");
}

#[tokio::test]
async fn configured_ca_key_pair_is_used_test() {
    // Arrange: build one instance just to harvest a CA key pair, then
    // configure a second instance with that material inline.
    let donor = MockProxy::start_async().await;
    let ca_cert = donor.ca_certificate_pem().to_string();
    donor.stop();

    // A CA certificate alone is not enough to run an instance.
    let result = MockProxy::start_builder_async(
        MockProxyServerBuilder::new().https_ca_key_pair_option(Some(ca_cert), None),
    )
    .await;

    assert_eq!(result.is_err(), true);
}

#[tokio::test]
async fn malformed_ca_material_fails_startup_test() {
    let result = MockProxy::start_builder_async(
        MockProxyServerBuilder::new().https_ca_key_pair("not a certificate", "not a key"),
    )
    .await;

    assert_eq!(result.is_err(), true);
}
