use crate::common::data::{RecordedRequest, RequestMatcher};
use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config};
use headers::{Cookie, HeaderMapExt};
use serde_json::Value;
use std::sync::Arc;

/// Evaluates an AND-combined matcher set against a request. An empty set
/// matches everything.
pub(crate) async fn request_matches(
    req: &Arc<RecordedRequest>,
    matchers: &[RequestMatcher],
) -> bool {
    for matcher in matchers {
        if !matches_one(req, matcher).await {
            tracing::debug!(
                "request {} rejected by matcher {:?}",
                req.id(),
                matcher_name(matcher)
            );
            return false;
        }
    }

    true
}

fn matcher_name(matcher: &RequestMatcher) -> &'static str {
    match matcher {
        RequestMatcher::AnyRequest => "any-request",
        RequestMatcher::Method { .. } => "method",
        RequestMatcher::Hostname { .. } => "hostname",
        RequestMatcher::Protocol { .. } => "protocol",
        RequestMatcher::Path { .. } => "path",
        RequestMatcher::PathRegex { .. } => "path-regex",
        RequestMatcher::Query { .. } => "query",
        RequestMatcher::Header { .. } => "header",
        RequestMatcher::Body { .. } => "body",
        RequestMatcher::FormUrlEncodedBody { .. } => "form-urlencoded-body",
        RequestMatcher::BodyRegex { .. } => "body-regex",
        RequestMatcher::JsonBodyIncludes { .. } => "json-body-includes",
        RequestMatcher::Cookie { .. } => "cookie",
        RequestMatcher::Custom { .. } => "custom",
    }
}

async fn matches_one(req: &Arc<RecordedRequest>, matcher: &RequestMatcher) -> bool {
    match matcher {
        RequestMatcher::AnyRequest => true,
        RequestMatcher::Method { method } => req.method().eq_ignore_ascii_case(method),
        RequestMatcher::Hostname { hostname } => req.hostname().eq_ignore_ascii_case(hostname),
        RequestMatcher::Protocol { protocol } => req.protocol() == protocol,
        RequestMatcher::Path { path } => req.path() == path,
        RequestMatcher::PathRegex { pattern } => pattern.is_match(req.path()),
        RequestMatcher::Query { params } => {
            contains_all_pairs(&req.query_params_vec(), params)
        }
        RequestMatcher::Header { name, value } => req
            .headers()
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case(name) && v == value),
        RequestMatcher::Body { content } => req.body() == content,
        RequestMatcher::FormUrlEncodedBody { params } => {
            let pairs: Vec<(String, String)> = form_urlencoded::parse(req.body().as_ref())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            contains_all_pairs(&pairs, params)
        }
        RequestMatcher::BodyRegex { pattern } => pattern.is_match(&req.body().text()),
        RequestMatcher::JsonBodyIncludes { json } => json_body_includes(req, json),
        RequestMatcher::Cookie { name, value } => req
            .header_map()
            .typed_get::<Cookie>()
            .and_then(|cookie| cookie.get(name).map(|v| v == value))
            .unwrap_or(false),
        RequestMatcher::Custom {
            predicate: Some(predicate),
            ..
        } => predicate.evaluate(req.clone()).await,
        RequestMatcher::Custom {
            predicate: None,
            callback_id,
        } => {
            tracing::warn!(
                "custom matcher {:?} has no resolvable predicate, rejecting",
                callback_id
            );
            false
        }
    }
}

/// Multimap containment: every expected pair must appear among the actual
/// pairs. Repetitions on the expected side collapse.
fn contains_all_pairs(actual: &[(String, String)], expected: &[(String, String)]) -> bool {
    expected
        .iter()
        .all(|(k, v)| actual.iter().any(|(ak, av)| ak == k && av == v))
}

fn json_body_includes(req: &Arc<RecordedRequest>, fragment: &Value) -> bool {
    let body: Value = match serde_json::from_slice(req.body().as_ref()) {
        Ok(value) => value,
        Err(_) => return false,
    };

    assert_json_matches_no_panic(&body, fragment, Config::new(CompareMode::Inclusive)).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::Timings;
    use crate::common::util::BodyBytes;
    use regex::Regex;
    use serde_json::json;

    fn request(
        method: &str,
        uri: &str,
        headers: Vec<(String, String)>,
        body: &str,
    ) -> Arc<RecordedRequest> {
        let parsed: http::Uri = uri.parse().unwrap();
        Arc::new(RecordedRequest::new(
            1,
            parsed.scheme_str().unwrap_or("http").to_string(),
            "HTTP/1.1".to_string(),
            method.to_string(),
            uri.to_string(),
            parsed.path().to_string(),
            parsed.host().unwrap_or_default().to_string(),
            headers,
            BodyBytes::from(body),
            Timings::default(),
        ))
    }

    #[tokio::test]
    async fn empty_matcher_set_matches_everything_test() {
        let req = request("GET", "http://localhost/x", Vec::new(), "");

        assert_eq!(request_matches(&req, &[]).await, true);
    }

    #[tokio::test]
    async fn method_and_path_matchers_test() {
        let req = request("POST", "http://localhost/orders", Vec::new(), "");

        assert_eq!(
            request_matches(
                &req,
                &[
                    RequestMatcher::Method {
                        method: "post".to_string()
                    },
                    RequestMatcher::Path {
                        path: "/orders".to_string()
                    }
                ]
            )
            .await,
            true
        );
        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Path {
                    path: "/orders/1".to_string()
                }]
            )
            .await,
            false
        );
    }

    #[tokio::test]
    async fn path_regex_matcher_test() {
        let req = request("GET", "http://localhost/orders/42", Vec::new(), "");

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::PathRegex {
                    pattern: Regex::new(r"^/orders/\d+$").unwrap()
                }]
            )
            .await,
            true
        );
    }

    #[tokio::test]
    async fn hostname_and_protocol_matchers_test() {
        let req = request("GET", "https://Example.COM/x", Vec::new(), "");

        assert_eq!(
            request_matches(
                &req,
                &[
                    RequestMatcher::Hostname {
                        hostname: "example.com".to_string()
                    },
                    RequestMatcher::Protocol {
                        protocol: "https".to_string()
                    }
                ]
            )
            .await,
            true
        );
    }

    #[tokio::test]
    async fn query_matcher_test() {
        let req = request("GET", "http://localhost/s?word=hello&lang=es", Vec::new(), "");

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Query {
                    params: vec![("word".to_string(), "hello".to_string())]
                }]
            )
            .await,
            true
        );
        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Query {
                    params: vec![("word".to_string(), "bye".to_string())]
                }]
            )
            .await,
            false
        );
    }

    #[tokio::test]
    async fn header_matcher_is_name_case_insensitive_test() {
        let req = request(
            "GET",
            "http://localhost/x",
            vec![("X-Api-Key".to_string(), "secret".to_string())],
            "",
        );

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Header {
                    name: "x-api-key".to_string(),
                    value: "secret".to_string()
                }]
            )
            .await,
            true
        );
    }

    #[tokio::test]
    async fn body_matchers_test() {
        let req = request("POST", "http://localhost/x", Vec::new(), "ping pong");

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Body {
                    content: BodyBytes::from("ping pong")
                }]
            )
            .await,
            true
        );
        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::BodyRegex {
                    pattern: Regex::new("^ping").unwrap()
                }]
            )
            .await,
            true
        );
    }

    #[tokio::test]
    async fn form_urlencoded_body_matcher_test() {
        let req = request("POST", "http://localhost/x", Vec::new(), "name=Peter+Griffin&town=Quahog");

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::FormUrlEncodedBody {
                    params: vec![("name".to_string(), "Peter Griffin".to_string())]
                }]
            )
            .await,
            true
        );
    }

    #[tokio::test]
    async fn json_body_includes_matcher_test() {
        let req = request(
            "POST",
            "http://localhost/x",
            Vec::new(),
            r#"{"user": {"name": "ann", "age": 3}, "extra": true}"#,
        );

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::JsonBodyIncludes {
                    json: json!({"user": {"name": "ann"}})
                }]
            )
            .await,
            true
        );
        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::JsonBodyIncludes {
                    json: json!({"user": {"name": "bob"}})
                }]
            )
            .await,
            false
        );
    }

    #[tokio::test]
    async fn cookie_matcher_test() {
        let req = request(
            "GET",
            "http://localhost/x",
            vec![("cookie".to_string(), "sid=abc; theme=dark".to_string())],
            "",
        );

        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Cookie {
                    name: "theme".to_string(),
                    value: "dark".to_string()
                }]
            )
            .await,
            true
        );
        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Cookie {
                    name: "sid".to_string(),
                    value: "nope".to_string()
                }]
            )
            .await,
            false
        );
    }

    #[tokio::test]
    async fn custom_matcher_test() {
        let req = request("GET", "http://localhost/x", Vec::new(), "");

        assert_eq!(
            request_matches(&req, &[RequestMatcher::custom(|r| r.path() == "/x")]).await,
            true
        );
        // A transported custom matcher without a resolvable predicate never matches.
        assert_eq!(
            request_matches(
                &req,
                &[RequestMatcher::Custom {
                    predicate: None,
                    callback_id: Some("remote-1".to_string())
                }]
            )
            .await,
            false
        );
    }
}
