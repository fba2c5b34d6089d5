use crate::common::{
    data::{RecordedRequest, ResponseHandler, ResponseSpec},
    http::HttpClient,
    util::BodyBytes,
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Hop-by-hop headers are meaningful per connection and never forwarded
/// upstream (RFC 7230 §6.1). `Host` is regenerated from the target URI.
const NON_FORWARDED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// What running a handler produced.
pub enum HandlerOutcome {
    /// Write this response and publish a response event.
    Respond(ProducedResponse),
    /// The handler itself failed (panic, timeout): write this response,
    /// close the connection, and publish an abort event instead of a
    /// response event.
    Failed(ResponseSpec),
    /// Close the TCP connection without a response.
    Close,
    /// Tear the TCP connection down with an RST.
    Reset,
}

/// A response with either a buffered or a streamed body.
pub enum ProducedResponse {
    Full(ResponseSpec),
    Streamed {
        status: u16,
        headers: Vec<(String, String)>,
        chunks: mpsc::Receiver<Bytes>,
    },
}

/// Runs the handler side of rules: owns the upstream client and the
/// callback timeout.
pub(crate) struct HandlerExecutor {
    http_client: Arc<dyn HttpClient + Send + Sync>,
    handler_timeout: Duration,
}

impl HandlerExecutor {
    pub(crate) fn new(
        http_client: Arc<dyn HttpClient + Send + Sync>,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            handler_timeout,
        }
    }

    pub(crate) async fn run(
        &self,
        handler: ResponseHandler,
        req: Arc<RecordedRequest>,
    ) -> HandlerOutcome {
        match handler {
            ResponseHandler::Static { response } => {
                apply_delay(&response).await;
                HandlerOutcome::Respond(ProducedResponse::Full(response))
            }

            ResponseHandler::Callback {
                callback: Some(callback),
                ..
            } => {
                // The user function runs in its own task so a panic is
                // contained instead of unwinding through the connection.
                let future = callback.invoke(req);
                let joined =
                    tokio::time::timeout(self.handler_timeout, tokio::spawn(future)).await;

                match joined {
                    Ok(Ok(response)) => {
                        apply_delay(&response).await;
                        HandlerOutcome::Respond(ProducedResponse::Full(response))
                    }
                    Ok(Err(join_err)) => {
                        tracing::warn!("response callback failed: {}", join_err);
                        HandlerOutcome::Failed(
                            ResponseSpec::new(500).body("mockproxy: response callback panicked"),
                        )
                    }
                    Err(_) => {
                        tracing::warn!(
                            "response callback exceeded the handler timeout of {:?}",
                            self.handler_timeout
                        );
                        HandlerOutcome::Failed(
                            ResponseSpec::new(500)
                                .body("mockproxy: response callback timed out"),
                        )
                    }
                }
            }

            ResponseHandler::Callback { callback: None, .. } => HandlerOutcome::Respond(
                ProducedResponse::Full(
                    ResponseSpec::new(500)
                        .body("mockproxy: response callback cannot be resolved in this process"),
                ),
            ),

            ResponseHandler::Stream {
                status,
                headers,
                body,
            } => match body.take() {
                Some(chunks) => HandlerOutcome::Respond(ProducedResponse::Streamed {
                    status,
                    headers,
                    chunks,
                }),
                None => HandlerOutcome::Respond(ProducedResponse::Full(
                    ResponseSpec::new(500).body("mockproxy: response stream already consumed"),
                )),
            },

            ResponseHandler::Passthrough => self.passthrough(req).await,

            ResponseHandler::CloseConnection => HandlerOutcome::Close,
            ResponseHandler::ResetConnection => HandlerOutcome::Reset,

            ResponseHandler::Timeout => {
                // Held open until the client hangs up or the instance stops;
                // either drops this future.
                futures_util::future::pending::<()>().await;
                HandlerOutcome::Close
            }
        }
    }

    /// Forwards the request to its real origin, reconstructed from the
    /// effective URL. Every passthrough dials its own upstream exchange.
    async fn passthrough(&self, req: Arc<RecordedRequest>) -> HandlerOutcome {
        let upstream_req = match build_upstream_request(&req) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("cannot build upstream request: {}", err);
                return HandlerOutcome::Respond(ProducedResponse::Full(
                    ResponseSpec::new(502)
                        .body(format!("mockproxy: cannot build upstream request: {}", err)),
                ));
            }
        };

        tracing::debug!("passing request {} through to {}", req.id(), req.uri());

        match self.http_client.send(upstream_req).await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| {
                        !NON_FORWARDED_HEADERS.contains(&name.as_str())
                    })
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();

                HandlerOutcome::Respond(ProducedResponse::Full(ResponseSpec {
                    status,
                    status_message: None,
                    headers,
                    body: BodyBytes(response.into_body()),
                    delay: None,
                }))
            }
            Err(err) => {
                tracing::warn!("upstream request for {} failed: {}", req.uri(), err);
                HandlerOutcome::Respond(ProducedResponse::Full(
                    ResponseSpec::new(502)
                        .body(format!("mockproxy: upstream request failed: {}", err)),
                ))
            }
        }
    }
}

fn build_upstream_request(req: &Arc<RecordedRequest>) -> Result<http::Request<Bytes>, http::Error> {
    let mut builder = http::Request::builder().method(req.method()).uri(req.uri());

    for (name, value) in req.headers() {
        if NON_FORWARDED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder.body(req.body().to_bytes())
}

async fn apply_delay(response: &ResponseSpec) {
    if let Some(millis) = response.delay {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}
