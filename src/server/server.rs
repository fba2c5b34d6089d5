use crate::common::data::{ProxyEvent, RecordedRequest, RecordedResponse, Timings};
use crate::common::util::BodyBytes;
use crate::server::{
    events::EventBus,
    handler::{self, Handler},
    handlers::{HandlerOutcome, ProducedResponse},
    io::{ConnectionControl, GuardedStream, PrefixedStream},
    port::{self, PortPolicy},
    tls::{self, CertificateAuthority},
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody as HttpStreamBody};
use hyper::{body::Incoming, service::service_fn, upgrade::on as upgrade_on};
use hyper_util::rt::TokioIo;
use std::{
    future::{pending, Future},
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{oneshot::Sender, watch},
    task::JoinSet,
};

/// First byte of a TLS record carrying a handshake message.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot allocate server port: {0}")]
    PortError(#[from] port::Error),
    #[error("cannot obtain local address: {0}")]
    LocalSocketAddrError(std::io::Error),
    #[error("cannot send reserved TCP address to test thread {0}")]
    PublishSocketAddrError(SocketAddr),
    #[error("TLS configuration error: {0}")]
    TlsError(#[from] tls::Error),
}

/// Per-exchange errors of the connection service. Surfacing one of these
/// tears the connection down; the instance keeps serving.
#[derive(Error, Debug)]
enum ServiceError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),
    #[error("client aborted mid-request: {0}")]
    ClientAbort(hyper::Error),
    #[error("connection closed by rule")]
    ClosedByRule,
    #[error("connection reset by rule")]
    ResetByRule,
    #[error("cannot dispatch request: {0}")]
    HandlerError(#[from] handler::Error),
}

type ServiceBody = BoxBody<Bytes, hyper::Error>;

pub struct ProxyServerTlsConfig {
    pub ca: CertificateAuthority,
    /// Hostname assumed for TLS clients that send no SNI.
    pub default_hostname: String,
}

pub struct ProxyServerConfig {
    pub port_policy: PortPolicy,
    pub expose: bool,
    pub events: EventBus,
    pub tls: ProxyServerTlsConfig,
}

/// Listens on one TCP port and serves plain HTTP, implicit TLS, and
/// `CONNECT` tunnels over it, dispatching every decrypted request through
/// the configured [`Handler`].
pub struct ProxyServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    handler: H,
    config: ProxyServerConfig,
    tls_config: Arc<rustls::ServerConfig>,
    request_counter: AtomicUsize,
    epoch: Instant,
    shutdown: watch::Sender<bool>,
}

/// Per-connection state shared across tunnel nesting levels.
#[derive(Clone)]
struct ConnectionContext {
    scheme: &'static str,
    remote_ip: IpAddr,
    /// Authority assumed for requests without one of their own: the tunnel
    /// target inside a `CONNECT`, the local listener address otherwise.
    default_authority: Option<String>,
    control: Arc<ConnectionControl>,
    /// The request currently in flight on this connection layer, until its
    /// response or abort has been published.
    current: Arc<Mutex<Option<Arc<RecordedRequest>>>>,
}

impl ConnectionContext {
    fn take_current(&self) -> Option<Arc<RecordedRequest>> {
        self.current.lock().expect("in-flight request lock poisoned").take()
    }

    fn set_current(&self, record: Arc<RecordedRequest>) {
        *self.current.lock().expect("in-flight request lock poisoned") = Some(record);
    }
}

impl<H> ProxyServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    pub fn new(handler: H, config: ProxyServerConfig) -> Result<Self, Error> {
        config.port_policy.validate()?;

        let tls_config = tls::server_config(config.tls.ca.clone(), &config.tls.default_hostname);
        let (shutdown, _) = watch::channel(false);

        Ok(ProxyServer {
            handler,
            config,
            tls_config,
            request_counter: AtomicUsize::new(0),
            epoch: Instant::now(),
            shutdown,
        })
    }

    /// The event bus of this instance.
    pub fn events(&self) -> EventBus {
        self.config.events.clone()
    }

    /// The PEM root certificate of the instance's certificate authority.
    pub fn ca_certificate_pem(&self) -> &str {
        self.config.tls.ca.ca_certificate_pem()
    }

    /// Starts the server and runs until the process ends.
    pub async fn start(self) -> Result<(), Error> {
        self.start_with_signals(None, pending()).await
    }

    /// Starts the server, optionally publishing the bound address, and runs
    /// until the shutdown future resolves. Shutdown closes the listener,
    /// cancels every connection task, and waits for them to wind down; any
    /// in-flight exchange is published as aborted.
    pub async fn start_with_signals<F>(
        self,
        socket_addr_sender: Option<Sender<SocketAddr>>,
        shutdown: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = port::bind(&self.config.port_policy, self.config.expose).await?;
        let addr = listener.local_addr().map_err(Error::LocalSocketAddrError)?;

        if let Some(sender) = socket_addr_sender {
            sender.send(addr).map_err(Error::PublishSocketAddrError)?;
        }

        tracing::info!("listening on {}", addr);
        self.run_accept_loop(listener, shutdown).await
    }

    async fn run_accept_loop<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, remote_address)) => {
                            let server = server.clone();
                            connections.spawn(async move {
                                server.handle_tcp_stream(tcp_stream, remote_address).await;
                            });
                        }
                        Err(err) => {
                            tracing::error!("TCP accept error: {}", err);
                        }
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        drop(listener);
        let _ = server.shutdown.send(true);
        while connections.join_next().await.is_some() {}

        Ok(())
    }

    async fn handle_tcp_stream(self: Arc<Self>, tcp_stream: TcpStream, remote: SocketAddr) {
        tracing::trace!("new TCP connection from {}", remote);

        let local_authority = tcp_stream.local_addr().ok().map(|addr| addr.to_string());
        let control = Arc::new(ConnectionControl::default());
        let stream = GuardedStream::new(tcp_stream, control.clone());

        let ctx = ConnectionContext {
            scheme: "http",
            remote_ip: remote.ip(),
            default_authority: local_authority,
            control,
            current: Arc::new(Mutex::new(None)),
        };

        tokio::select! {
            _ = self.clone().serve_stream(stream, ctx.clone()) => {}
            _ = self.shutdown_signal() => {
                self.publish_abort(&ctx);
            }
        }
    }

    /// Resolves once the instance is shutting down, including when the
    /// signal fired before this call.
    async fn shutdown_signal(&self) {
        let mut rx = self.shutdown.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// The socket demultiplexer: reads exactly one byte, re-injects it, and
    /// routes the stream to the TLS terminator or straight to HTTP. Boxed
    /// because tunneled streams re-enter here recursively.
    fn serve_stream<S>(self: Arc<Self>, stream: S, ctx: ConnectionContext) -> BoxFuture<'static, ()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Box::pin(async move {
            let mut stream = stream;
            let mut first_byte = [0u8; 1];
            match stream.read(&mut first_byte).await {
                // Closed before a single byte arrived; nothing to report.
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    tracing::trace!("connection dropped before the first byte: {}", err);
                    return;
                }
            }

            let stream = PrefixedStream::new(Bytes::copy_from_slice(&first_byte), stream);

            if first_byte[0] == TLS_HANDSHAKE_BYTE {
                tracing::trace!("connection speaks TLS");
                match tls::terminate(stream, self.tls_config.clone()).await {
                    Ok((tls_stream, sni)) => {
                        let tls_ctx = ConnectionContext {
                            scheme: "https",
                            remote_ip: ctx.remote_ip,
                            default_authority: sni.or_else(|| ctx.default_authority.clone()),
                            control: ctx.control.clone(),
                            current: ctx.current.clone(),
                        };
                        self.serve_http(tls_stream, tls_ctx).await;
                    }
                    Err(failure) => {
                        tracing::debug!("TLS handshake failed: {}", failure.cause);
                        let hostname = failure
                            .sni
                            .or_else(|| ctx.default_authority.as_deref().map(authority_host));
                        self.config.events.publish(ProxyEvent::FailedTlsRequest(Arc::new(
                            crate::common::data::FailedTlsRequest {
                                failure_cause: failure.cause,
                                hostname,
                                remote_ip: ctx.remote_ip,
                            },
                        )));
                    }
                }
            } else {
                tracing::trace!("connection speaks plain HTTP");
                self.serve_http(stream, ctx).await;
            }
        })
    }

    async fn serve_http<S>(self: Arc<Self>, stream: S, ctx: ConnectionContext)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service_ctx = ctx.clone();

        let conn = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = server.clone();
                    let ctx = service_ctx.clone();
                    async move { server.service(req, ctx).await }
                }),
            )
            .with_upgrades();

        if let Err(err) = conn.await {
            // Client hangup, a malformed request rejected by the parser, or
            // a close/reset disposition chosen by a rule. Whatever exchange
            // was in flight is reported as aborted.
            tracing::trace!("connection ended: {}", err);
            self.publish_abort(&ctx);
        }
    }

    async fn service(
        self: Arc<Self>,
        req: Request<Incoming>,
        ctx: ConnectionContext,
    ) -> Result<Response<ServiceBody>, ServiceError> {
        tracing::trace!("incoming request: {} {}", req.method(), req.uri());

        if req.method() == Method::CONNECT {
            return self.service_connect(req, ctx);
        }

        let request_id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let mut timings = Timings {
            start: self.elapsed_ms(),
            ..Timings::default()
        };

        let version = format!("{:?}", req.version());
        let method = req.method().to_string();
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();

        let uri = match absolute_uri(&req, ctx.scheme, ctx.default_authority.as_deref()) {
            Ok(uri) => uri,
            Err(reason) => {
                tracing::debug!("rejecting unroutable request: {}", reason);
                return error_response(StatusCode::BAD_REQUEST, reason);
            }
        };
        let path = uri.path().to_string();
        let hostname = uri
            .host()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .unwrap_or_default();

        timings.headers_received = Some(self.elapsed_ms());
        let partial = Arc::new(RecordedRequest::new(
            request_id,
            ctx.scheme.to_string(),
            version.clone(),
            method.clone(),
            uri.to_string(),
            path.clone(),
            hostname.clone(),
            headers.clone(),
            BodyBytes::default(),
            timings.clone(),
        ));
        ctx.set_current(partial.clone());
        self.config
            .events
            .publish(ProxyEvent::RequestReceived(partial));

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                self.publish_abort(&ctx);
                return Err(ServiceError::ClientAbort(err));
            }
        };

        timings.body_received = Some(self.elapsed_ms());
        let completed = Arc::new(RecordedRequest::new(
            request_id,
            ctx.scheme.to_string(),
            version,
            method,
            uri.to_string(),
            path,
            hostname,
            headers,
            BodyBytes(body),
            timings,
        ));
        ctx.set_current(completed.clone());
        self.config
            .events
            .publish(ProxyEvent::RequestReceived(completed.clone()));

        let outcome = match self.handler.handle(completed.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!("handler error: {}", err);
                self.publish_abort(&ctx);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        };

        match outcome {
            HandlerOutcome::Respond(produced) => {
                let (response, record) = self.finish_response(&completed, produced)?;
                ctx.take_current();
                self.config
                    .events
                    .publish(ProxyEvent::ResponseCompleted(Arc::new(record)));
                Ok(response)
            }
            HandlerOutcome::Failed(spec) => {
                self.publish_abort(&ctx);
                let (mut response, _) =
                    self.finish_response(&completed, ProducedResponse::Full(spec))?;
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                Ok(response)
            }
            HandlerOutcome::Close => {
                ctx.control.request_close();
                Err(ServiceError::ClosedByRule)
            }
            HandlerOutcome::Reset => {
                ctx.control.request_reset();
                Err(ServiceError::ResetByRule)
            }
        }
    }

    /// CONNECT handling (HTTP proxy tunneling).
    ///
    /// The upgrade to a raw byte tunnel only happens AFTER the
    /// `200 Connection established` response has been flushed, so the
    /// upgrade future must not be awaited inline here; that would wait for
    /// an upgrade that cannot complete until this service returns. The
    /// upgraded stream is therefore handled on a detached task, which hands
    /// it back to the demultiplexer: the tunnel interior may be TLS,
    /// another CONNECT layer, or plain HTTP.
    fn service_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
        ctx: ConnectionContext,
    ) -> Result<Response<ServiceBody>, ServiceError> {
        let authority = req.uri().authority().map(|a| a.to_string());
        tracing::debug!("CONNECT tunnel to {:?}", authority);

        let on_upgrade = upgrade_on(req);
        let server = self.clone();

        tokio::spawn(async move {
            let tunnel = {
                let server = server.clone();
                async move {
                    match on_upgrade.await {
                        Ok(upgraded) => {
                            let inner_ctx = ConnectionContext {
                                scheme: ctx.scheme,
                                remote_ip: ctx.remote_ip,
                                default_authority: authority.or(ctx.default_authority),
                                control: ctx.control,
                                current: Arc::new(Mutex::new(None)),
                            };
                            server.serve_stream(TokioIo::new(upgraded), inner_ctx).await;
                        }
                        Err(err) => {
                            tracing::warn!("CONNECT upgrade failed: {}", err);
                        }
                    }
                }
            };

            tokio::select! {
                _ = tunnel => {}
                _ = server.shutdown_signal() => {}
            }
        });

        Ok(Response::builder().status(StatusCode::OK).body(empty())?)
    }

    fn finish_response(
        &self,
        req: &Arc<RecordedRequest>,
        produced: ProducedResponse,
    ) -> Result<(Response<ServiceBody>, RecordedResponse), ServiceError> {
        let now = self.elapsed_ms();
        let mut timings = req.timings().clone();
        timings.response_started = Some(now);
        timings.response_completed = Some(now);

        match produced {
            ProducedResponse::Full(spec) => {
                let status = StatusCode::from_u16(spec.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

                let mut builder = Response::builder().status(status);
                for (name, value) in &spec.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let response = builder.body(full(spec.body.to_bytes()))?;

                let record = RecordedResponse {
                    request_id: req.id(),
                    status: status.as_u16(),
                    status_message: spec
                        .status_message
                        .clone()
                        .or_else(|| status.canonical_reason().map(String::from))
                        .unwrap_or_default(),
                    headers: spec.headers,
                    body: spec.body,
                    timings,
                };

                Ok((response, record))
            }
            ProducedResponse::Streamed {
                status,
                headers,
                chunks,
            } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

                let stream = futures_util::stream::unfold(chunks, |mut rx| async move {
                    rx.recv()
                        .await
                        .map(|chunk| (Ok::<_, hyper::Error>(hyper::body::Frame::data(chunk)), rx))
                });

                let mut builder = Response::builder().status(status);
                for (name, value) in &headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let response = builder.body(HttpStreamBody::new(stream).boxed())?;

                // The body is fed lazily; the published record carries no
                // body bytes since records are immutable once published.
                let record = RecordedResponse {
                    request_id: req.id(),
                    status: status.as_u16(),
                    status_message: status
                        .canonical_reason()
                        .map(String::from)
                        .unwrap_or_default(),
                    headers,
                    body: BodyBytes::default(),
                    timings,
                };

                Ok((response, record))
            }
        }
    }

    fn publish_abort(&self, ctx: &ConnectionContext) {
        if let Some(record) = ctx.take_current() {
            tracing::debug!("request {} aborted", record.id());
            let aborted = record.aborted_view(self.elapsed_ms());
            self.config
                .events
                .publish(ProxyEvent::RequestAborted(Arc::new(aborted)));
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Normalizes the request URI to absolute form. Clients typically send
/// origin-form ("/path") with a Host header; inside a CONNECT tunnel the
/// tunnel target stands in when even the Host header is missing. Matchers
/// and records rely on scheme/authority being readable off the URI, so the
/// normalization happens once, here.
fn absolute_uri(
    req: &Request<Incoming>,
    scheme: &str,
    default_authority: Option<&str>,
) -> Result<Uri, String> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .or_else(|| default_authority.map(String::from))
        .ok_or_else(|| "request carries no authority and no Host header".to_string())?;

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    format!("{}://{}{}", scheme, authority, path_and_query)
        .parse()
        .map_err(|err| format!("cannot assemble absolute URI: {}", err))
}

/// The host portion of an authority string, without port or brackets.
fn authority_host(authority: &str) -> String {
    authority
        .parse::<http::uri::Authority>()
        .map(|a| a.host().trim_start_matches('[').trim_end_matches(']').to_string())
        .unwrap_or_else(|_| authority.to_string())
}

fn error_response(
    code: StatusCode,
    reason: String,
) -> Result<Response<ServiceBody>, ServiceError> {
    Ok(Response::builder().status(code).body(full(reason))?)
}

fn full<T: Into<Bytes>>(chunk: T) -> ServiceBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

fn empty() -> ServiceBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
