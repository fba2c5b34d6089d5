use crate::common::util::BodyBytes;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    future::Future,
    net::IpAddr,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use url::Url;

/// Timing events of one HTTP exchange, in milliseconds since the instance
/// started (monotonic clock).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Timings {
    pub start: u64,
    pub headers_received: Option<u64>,
    pub body_received: Option<u64>,
    pub response_started: Option<u64>,
    pub response_completed: Option<u64>,
    pub abort: Option<u64>,
}

/// A request as observed by the proxy. Instances are immutable once they
/// have been published on the event bus or appended to a rule's seen list.
///
/// Two views of the same exchange may be published: a headers-received view
/// (empty body, no `body_received` timing) and the completed view.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecordedRequest {
    id: usize,
    protocol: String,
    version: String,
    method: String,
    uri: String,
    path: String,
    hostname: String,
    headers: Vec<(String, String)>,
    body: BodyBytes,
    timings: Timings,
}

impl RecordedRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        protocol: String,
        version: String,
        method: String,
        uri: String,
        path: String,
        hostname: String,
        headers: Vec<(String, String)>,
        body: BodyBytes,
        timings: Timings,
    ) -> Self {
        Self {
            id,
            protocol,
            version,
            method,
            uri,
            path,
            hostname,
            headers,
            body,
            timings,
        }
    }

    /// The request id, unique within the instance.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Either `"http"` or `"https"`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The HTTP version string, e.g. `"HTTP/1.1"`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The absolute URL of the request as seen by the server.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The port the request was addressed to, falling back to the scheme
    /// default when the authority does not carry one.
    pub fn port(&self) -> u16 {
        if let Ok(uri) = self.uri.parse::<http::Uri>() {
            if let Some(port) = uri.port_u16() {
                return port;
            }
        }

        if self.protocol == "https" {
            443
        } else {
            80
        }
    }

    /// Header pairs in the byte order they were received in.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The first header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Converts the recorded header pairs into an `http::HeaderMap`,
    /// skipping pairs that do not form valid header names or values.
    pub fn header_map(&self) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (key, value) in &self.headers {
            let name = match http::HeaderName::from_bytes(key.as_bytes()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            let value = match http::HeaderValue::from_str(value) {
                Ok(value) => value,
                Err(_) => continue,
            };
            map.append(name, value);
        }

        map
    }

    /// Query parameters, decoded, in order of appearance.
    pub fn query_params_vec(&self) -> Vec<(String, String)> {
        // There doesn't seem to be a way to just parse a query string with
        // the `url` crate, so we're prefixing a dummy URL for parsing.
        let query = self
            .uri
            .parse::<http::Uri>()
            .ok()
            .and_then(|u| u.query().map(|q| q.to_string()))
            .unwrap_or_default();

        let url = match Url::parse(&format!("http://dummy?{}", query)) {
            Ok(url) => url,
            Err(_) => return Vec::new(),
        };

        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn body(&self) -> &BodyBytes {
        &self.body
    }

    /// The body decoded as text, honoring the request's `Content-Type`.
    pub fn body_text(&self) -> String {
        self.body
            .text_with_content_type(self.header("content-type"))
            .into_owned()
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// A copy of this record stamped with an abort timing, for publication
    /// on the event bus. The original record stays untouched.
    pub(crate) fn aborted_view(&self, abort_ms: u64) -> RecordedRequest {
        let mut view = self.clone();
        view.timings.abort = Some(abort_ms);
        view
    }
}

/// A response as produced by a handler and written to a client. Immutable
/// once published.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecordedResponse {
    pub request_id: usize,
    pub status: u16,
    pub status_message: String,
    pub headers: Vec<(String, String)>,
    pub body: BodyBytes,
    pub timings: Timings,
}

/// A TLS handshake that never became a request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailedTlsRequest {
    pub failure_cause: String,
    pub hostname: Option<String>,
    pub remote_ip: IpAddr,
}

/// Lifecycle events published by the instance.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    RequestReceived(Arc<RecordedRequest>),
    ResponseCompleted(Arc<RecordedResponse>),
    RequestAborted(Arc<RecordedRequest>),
    FailedTlsRequest(Arc<FailedTlsRequest>),
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::RequestReceived(_) => EventKind::RequestReceived,
            ProxyEvent::ResponseCompleted(_) => EventKind::ResponseCompleted,
            ProxyEvent::RequestAborted(_) => EventKind::RequestAborted,
            ProxyEvent::FailedTlsRequest(_) => EventKind::FailedTlsRequest,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    RequestReceived,
    ResponseCompleted,
    RequestAborted,
    FailedTlsRequest,
}

// =================================================================================================
// Rule data
// =================================================================================================

/// Everything needed to register one rule: an AND-combined matcher set,
/// exactly one handler, and an optional completion checker gating repeated
/// matches.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuleData {
    pub matchers: Vec<RequestMatcher>,
    pub handler: ResponseHandler,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_checker: Option<CompletionChecker>,
}

impl RuleData {
    pub fn new(handler: ResponseHandler) -> Self {
        Self {
            matchers: Vec::new(),
            handler,
            completion_checker: None,
        }
    }

    pub fn matching(mut self, matcher: RequestMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn until(mut self, checker: CompletionChecker) -> Self {
        self.completion_checker = Some(checker);
        self
    }
}

/// A predicate over a recorded request. Variants are tagged so a remote
/// control plane can marshal them as discriminated objects; the `custom`
/// variant transports a callback reference, never code.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RequestMatcher {
    AnyRequest,
    Method {
        method: String,
    },
    Hostname {
        hostname: String,
    },
    Protocol {
        protocol: String,
    },
    Path {
        path: String,
    },
    PathRegex {
        #[serde(with = "serde_regex")]
        pattern: Regex,
    },
    Query {
        params: Vec<(String, String)>,
    },
    Header {
        name: String,
        value: String,
    },
    Body {
        content: BodyBytes,
    },
    FormUrlEncodedBody {
        params: Vec<(String, String)>,
    },
    BodyRegex {
        #[serde(with = "serde_regex")]
        pattern: Regex,
    },
    JsonBodyIncludes {
        json: Value,
    },
    Cookie {
        name: String,
        value: String,
    },
    Custom {
        #[serde(skip)]
        predicate: Option<MatcherFn>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
    },
}

impl RequestMatcher {
    /// A custom matcher from a synchronous predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&RecordedRequest) -> bool + Send + Sync + 'static,
    {
        RequestMatcher::Custom {
            predicate: Some(MatcherFn::from_fn(predicate)),
            callback_id: None,
        }
    }

    /// A custom matcher from an asynchronous predicate.
    pub fn custom_async<F, Fut>(predicate: F) -> Self
    where
        F: Fn(Arc<RecordedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        RequestMatcher::Custom {
            predicate: Some(MatcherFn::new(predicate)),
            callback_id: None,
        }
    }
}

/// The response side of a rule.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponseHandler {
    /// Fixed status, headers and body.
    Static { response: ResponseSpec },
    /// A user function producing the response. Must finish within the
    /// handler timeout or the exchange is aborted with status 500.
    Callback {
        #[serde(skip)]
        callback: Option<HandlerFn>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
    },
    /// Streams a byte stream supplied at rule creation. A drained stream
    /// answers 500.
    Stream {
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(skip)]
        body: StreamBody,
    },
    /// Forwards the request to the real origin and streams its answer back.
    Passthrough,
    /// Closes the TCP connection without a response.
    CloseConnection,
    /// Sends a TCP RST.
    ResetConnection,
    /// Holds the connection open until client disconnect or shutdown.
    Timeout,
}

impl ResponseHandler {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Arc<RecordedRequest>) -> ResponseSpec + Send + Sync + 'static,
    {
        ResponseHandler::Callback {
            callback: Some(HandlerFn::from_fn(f)),
            callback_id: None,
        }
    }

    pub fn callback_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RecordedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResponseSpec> + Send + 'static,
    {
        ResponseHandler::Callback {
            callback: Some(HandlerFn::new(f)),
            callback_id: None,
        }
    }
}

/// Gates how often a rule keeps matching, judged against its seen list.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CompletionChecker {
    Always,
    Once,
    Twice,
    Thrice,
    Times {
        count: usize,
    },
    /// Accepts while the predicate over the seen list returns `true`.
    Custom {
        #[serde(skip)]
        predicate: Option<CheckerFn>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
    },
}

impl CompletionChecker {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&[Arc<RecordedRequest>]) -> bool + Send + Sync + 'static,
    {
        CompletionChecker::Custom {
            predicate: Some(CheckerFn::new(predicate)),
            callback_id: None,
        }
    }
}

/// A response descriptor produced by handlers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseSpec {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: BodyBytes,
    /// Artificial delay in milliseconds before the response is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl Default for ResponseSpec {
    fn default() -> Self {
        ResponseSpec::new(200)
    }
}

impl ResponseSpec {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_message: None,
            headers: Vec::new(),
            body: BodyBytes::default(),
            delay: None,
        }
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body<B: Into<BodyBytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn delay_millis(mut self, millis: u64) -> Self {
        self.delay = Some(millis);
        self
    }
}

// =================================================================================================
// Opaque callback wrappers
// =================================================================================================

/// An opaque, possibly asynchronous request predicate.
#[derive(Clone)]
pub struct MatcherFn(Arc<dyn Fn(Arc<RecordedRequest>) -> BoxFuture<'static, bool> + Send + Sync>);

impl MatcherFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RecordedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        MatcherFn(Arc::new(move |req| Box::pin(f(req))))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&RecordedRequest) -> bool + Send + Sync + 'static,
    {
        MatcherFn(Arc::new(move |req| {
            let accepted = f(&req);
            Box::pin(async move { accepted })
        }))
    }

    pub(crate) async fn evaluate(&self, req: Arc<RecordedRequest>) -> bool {
        (self.0)(req).await
    }
}

impl fmt::Debug for MatcherFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MatcherFn")
    }
}

/// An opaque response-producing user function.
#[derive(Clone)]
pub struct HandlerFn(
    Arc<dyn Fn(Arc<RecordedRequest>) -> BoxFuture<'static, ResponseSpec> + Send + Sync>,
);

impl HandlerFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RecordedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResponseSpec> + Send + 'static,
    {
        HandlerFn(Arc::new(move |req| Box::pin(f(req))))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Arc<RecordedRequest>) -> ResponseSpec + Send + Sync + 'static,
    {
        HandlerFn(Arc::new(move |req| {
            let response = f(req);
            Box::pin(async move { response })
        }))
    }

    pub(crate) fn invoke(&self, req: Arc<RecordedRequest>) -> BoxFuture<'static, ResponseSpec> {
        (self.0)(req)
    }
}

impl fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

/// An opaque predicate over a rule's seen-request history.
#[derive(Clone)]
pub struct CheckerFn(Arc<dyn Fn(&[Arc<RecordedRequest>]) -> bool + Send + Sync>);

impl CheckerFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Arc<RecordedRequest>]) -> bool + Send + Sync + 'static,
    {
        CheckerFn(Arc::new(f))
    }

    pub(crate) fn accepts(&self, seen: &[Arc<RecordedRequest>]) -> bool {
        (self.0)(seen)
    }
}

impl fmt::Debug for CheckerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CheckerFn")
    }
}

/// A one-shot byte stream handed to a `Stream` handler at rule creation.
/// The first matching request takes the stream; later requests find it
/// drained.
#[derive(Clone, Default)]
pub struct StreamBody {
    inner: Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>,
}

impl StreamBody {
    /// Creates a stream fed through the returned sender. Chunks sent while
    /// no request is attached are buffered up to `buffer` entries.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Bytes>, StreamBody) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            StreamBody {
                inner: Arc::new(Mutex::new(Some(rx))),
            },
        )
    }

    /// A stream preloaded with the given chunks.
    pub fn from_chunks<I, B>(chunks: I) -> StreamBody
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Bytes> = chunks.into_iter().map(Into::into).collect();
        let (tx, body) = StreamBody::channel(chunks.len().max(1));
        for chunk in chunks {
            // Cannot fail: the channel was sized for exactly these chunks.
            let _ = tx.try_send(chunk);
        }

        body
    }

    pub(crate) fn take(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inner.lock().expect("stream body lock poisoned").take()
    }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drained = self
            .inner
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(true);
        f.debug_struct("StreamBody").field("drained", &drained).finish()
    }
}
