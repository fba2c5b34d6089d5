//! HTTP/HTTPS mocking and intercepting proxy for automated tests.
//!
//! A `mockproxy` instance binds one local port and serves three kinds of
//! traffic on it with no prior signal of which is which: plain HTTP,
//! implicit TLS (terminated on the fly with a per-hostname leaf
//! certificate minted by a dynamic CA), and HTTP `CONNECT` tunnels, nested
//! to any depth. Every decrypted request is matched against an ordered
//! list of rules; the first rule whose matchers all accept and whose
//! completion checker still admits it records the request and produces the
//! response - fixed, computed, streamed, passed through to the real
//! origin, or a deliberate connection failure.
//!
//! # Getting Started
//!
//! ```no_run
//! use mockproxy::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Start an instance on a free local port.
//!     let proxy = MockProxy::start_async().await;
//!
//!     // Serve `200 hello` for GET /hello, but only once.
//!     let endpoint = proxy.add_rule(
//!         RuleData::new(ResponseHandler::Static {
//!             response: ResponseSpec::new(200).body("hello"),
//!         })
//!         .matching(RequestMatcher::Method { method: "GET".into() })
//!         .matching(RequestMatcher::Path { path: "/hello".into() })
//!         .until(CompletionChecker::Once),
//!     );
//!
//!     // Exercise the code under test against proxy.url("/hello") or via
//!     // proxy.proxy_env(), then inspect what was recorded.
//!     let seen = endpoint.seen_requests();
//!     println!("served {} request(s)", seen.len());
//! }
//! ```
//!
//! # Proxy use
//!
//! Subjects that honor `HTTP_PROXY`/`HTTPS_PROXY` can be pointed at the
//! instance with [`MockProxy::proxy_env`]. HTTPS requests arrive as
//! `CONNECT` tunnels; the instance terminates them itself with a leaf
//! certificate for the requested hostname, so a client that trusts
//! [`MockProxy::ca_certificate_pem`] (or skips verification) sees ordinary
//! TLS. Tunneled requests are matched exactly like direct ones, with
//! `protocol` recorded as `"https"`.
//!
//! # Observability
//!
//! Instances publish `requestReceived`, `responseCompleted`,
//! `requestAborted` and `failedTlsRequest` events on a broadcast bus; see
//! [`MockProxy::subscribe`] and [`MockProxy::on_event`]. Delivery is
//! asynchronous and best-effort: a subscriber that falls behind its buffer
//! loses the oldest events rather than slowing the instance down.
//!
//! # Debugging
//!
//! The crate logs through [tracing](https://crates.io/crates/tracing),
//! with per-rule decisions at `debug` and per-connection steps at `trace`.

pub mod api;
pub mod common;
pub mod server;

pub use api::{MockProxy, MockedEndpoint, ProxyEnv};
pub use common::data::{
    CheckerFn, CompletionChecker, EventKind, FailedTlsRequest, HandlerFn, MatcherFn, ProxyEvent,
    RecordedRequest, RecordedResponse, RequestMatcher, ResponseHandler, ResponseSpec, RuleData,
    StreamBody, Timings,
};
pub use common::util::BodyBytes;
pub use server::MockProxyServerBuilder;

/// The commonly used types in one import.
pub mod prelude {
    pub use crate::{
        api::{MockProxy, MockedEndpoint, ProxyEnv},
        common::data::{
            CompletionChecker, EventKind, ProxyEvent, RequestMatcher, ResponseHandler,
            ResponseSpec, RuleData, StreamBody,
        },
        server::MockProxyServerBuilder,
    };
    pub use regex::Regex;
}
