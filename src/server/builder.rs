use crate::common::http::{HttpClient, ProxyHttpClient};
use crate::server::{
    events::EventBus,
    handler::RuleDispatchHandler,
    port::PortPolicy,
    server::{self, ProxyServer, ProxyServerConfig, ProxyServerTlsConfig},
    state::{RuleRegistry, StateManager},
    tls::{self, CertificateAuthority},
    MockProxyServer,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

/// Applied when no handler timeout is configured.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_TLS_HOSTNAME: &str = "localhost";

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("CA setup error: {0}")]
    CaError(#[from] tls::Error),
    #[error("server setup error: {0}")]
    ServerError(#[from] server::Error),
}

/// Collects the CA configuration for on-the-fly TLS termination and
/// resolves it into a [`CertificateAuthority`]: inline PEM wins over PEM
/// files; with neither, an ephemeral root is generated in memory.
pub struct HttpsConfigBuilder {
    ca_cert: Option<String>,
    ca_key: Option<String>,
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    default_hostname: Option<String>,
}

impl HttpsConfigBuilder {
    fn new() -> Self {
        Self {
            ca_cert: None,
            ca_key: None,
            ca_cert_path: None,
            ca_key_path: None,
            default_hostname: None,
        }
    }

    /// Rejects conflicting CA sources before any of them is touched.
    fn validate(&self) -> Result<(), Error> {
        let has_ca_cert = self.ca_cert.is_some() || self.ca_key.is_some();
        let has_ca_cert_path = self.ca_cert_path.is_some() || self.ca_key_path.is_some();

        if has_ca_cert && has_ca_cert_path {
            return Err(Error::ConfigurationError(
                "a CA certificate and a CA certificate path have both been configured; \
                 please choose only one method"
                    .to_string(),
            ));
        }

        if self.ca_cert.is_some() != self.ca_key.is_some() {
            return Err(Error::ConfigurationError(
                "a CA certificate and its private key must be configured together".to_string(),
            ));
        }

        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err(Error::ConfigurationError(
                "a CA certificate path and a private key path must be configured together"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn ca_cert<IntoString: Into<String>>(mut self, ca_cert: Option<IntoString>) -> Self {
        self.ca_cert = ca_cert.map(|c| c.into());
        self
    }

    pub fn ca_key<IntoString: Into<String>>(mut self, ca_key: Option<IntoString>) -> Self {
        self.ca_key = ca_key.map(|k| k.into());
        self
    }

    pub fn ca_cert_path(mut self, ca_cert_path: Option<PathBuf>) -> Self {
        self.ca_cert_path = ca_cert_path;
        self
    }

    pub fn ca_key_path(mut self, ca_key_path: Option<PathBuf>) -> Self {
        self.ca_key_path = ca_key_path;
        self
    }

    pub fn default_hostname(mut self, hostname: Option<String>) -> Self {
        self.default_hostname = hostname;
        self
    }

    pub fn build(self) -> Result<ProxyServerTlsConfig, Error> {
        self.validate()?;

        let ca = match (self.ca_cert, self.ca_key, self.ca_cert_path, self.ca_key_path) {
            (Some(ca_cert), Some(ca_key), _, _) => CertificateAuthority::from_pem(ca_cert, ca_key)?,
            (_, _, Some(ca_cert_path), Some(ca_key_path)) => {
                CertificateAuthority::from_pem_files(ca_cert_path, ca_key_path)?
            }
            _ => CertificateAuthority::generate()?,
        };

        Ok(ProxyServerTlsConfig {
            ca,
            default_hostname: self
                .default_hostname
                .unwrap_or_else(|| DEFAULT_TLS_HOSTNAME.to_string()),
        })
    }
}

/// Configures and builds a [`MockProxyServer`], consolidating defaults and
/// fallbacks into one place.
pub struct MockProxyServerBuilder {
    port_policy: Option<PortPolicy>,
    expose: Option<bool>,
    handler_timeout: Option<Duration>,
    http_client: Option<Arc<dyn HttpClient + Send + Sync + 'static>>,
    https_config_builder: HttpsConfigBuilder,
}

impl Default for MockProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProxyServerBuilder {
    pub fn new() -> Self {
        MockProxyServerBuilder {
            port_policy: None,
            expose: None,
            handler_timeout: None,
            http_client: None,
            https_config_builder: HttpsConfigBuilder::new(),
        }
    }

    /// Binds exactly this port, failing when it is taken.
    pub fn port(mut self, port: u16) -> Self {
        self.port_policy = Some(PortPolicy::Fixed(port));
        self
    }

    pub fn port_option(mut self, port: Option<u16>) -> Self {
        self.port_policy = port.map(PortPolicy::Fixed);
        self
    }

    /// Scans `[start, end)` ascending for the first free port.
    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.port_policy = Some(PortPolicy::Range { start, end });
        self
    }

    pub fn port_policy(mut self, policy: PortPolicy) -> Self {
        self.port_policy = Some(policy);
        self
    }

    /// Exposes the server on all interfaces instead of loopback.
    pub fn expose(mut self, expose: bool) -> Self {
        self.expose = Some(expose);
        self
    }

    pub fn expose_option(mut self, expose: Option<bool>) -> Self {
        self.expose = expose;
        self
    }

    /// Bounds how long response callbacks may run before the exchange is
    /// aborted with status 500.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Replaces the upstream client used by passthrough rules.
    pub fn http_client(mut self, client: Arc<dyn HttpClient + Send + Sync + 'static>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the CA certificate and private key for HTTPS, PEM-encoded.
    pub fn https_ca_key_pair<IntoString: Into<String>>(
        mut self,
        cert: IntoString,
        private_key: IntoString,
    ) -> Self {
        self.https_config_builder = self.https_config_builder.ca_cert(Some(cert));
        self.https_config_builder = self.https_config_builder.ca_key(Some(private_key));
        self
    }

    pub fn https_ca_key_pair_option<IntoString: Into<String>>(
        mut self,
        cert: Option<IntoString>,
        private_key: Option<IntoString>,
    ) -> Self {
        self.https_config_builder = self.https_config_builder.ca_cert(cert);
        self.https_config_builder = self.https_config_builder.ca_key(private_key);
        self
    }

    /// Sets the paths to the CA certificate and private key files.
    pub fn https_ca_key_pair_files<P: Into<PathBuf>>(
        mut self,
        cert_path: P,
        private_key_path: P,
    ) -> Self {
        self.https_config_builder = self
            .https_config_builder
            .ca_cert_path(Some(cert_path.into()));
        self.https_config_builder = self
            .https_config_builder
            .ca_key_path(Some(private_key_path.into()));
        self
    }

    pub fn https_ca_key_pair_files_option<P: Into<PathBuf>>(
        mut self,
        cert_path: Option<P>,
        private_key_path: Option<P>,
    ) -> Self {
        self.https_config_builder = self
            .https_config_builder
            .ca_cert_path(cert_path.map(|p| p.into()));
        self.https_config_builder = self
            .https_config_builder
            .ca_key_path(private_key_path.map(|p| p.into()));
        self
    }

    /// Hostname assumed for TLS clients that send no SNI.
    pub fn tls_default_hostname<IntoString: Into<String>>(mut self, hostname: IntoString) -> Self {
        self.https_config_builder = self
            .https_config_builder
            .default_hostname(Some(hostname.into()));
        self
    }

    /// Builds the server with a fresh rule registry.
    pub fn build(self) -> Result<MockProxyServer, Error> {
        self.build_with_state(Arc::new(RuleRegistry::new()))
    }

    /// Builds the server around an externally owned rule registry, so the
    /// caller can keep registering rules and reading seen requests while
    /// the server runs.
    pub fn build_with_state<S>(
        self,
        state: Arc<S>,
    ) -> Result<ProxyServer<RuleDispatchHandler<S>>, Error>
    where
        S: StateManager + Send + Sync + 'static,
    {
        let http_client = self
            .http_client
            .unwrap_or_else(|| Arc::new(ProxyHttpClient::new()));

        let handler = RuleDispatchHandler::new(
            state,
            http_client,
            self.handler_timeout.unwrap_or(DEFAULT_HANDLER_TIMEOUT),
        );

        Ok(ProxyServer::new(
            handler,
            ProxyServerConfig {
                port_policy: self.port_policy.unwrap_or_default(),
                expose: self.expose.unwrap_or(false),
                events: EventBus::new(),
                tls: self.https_config_builder.build()?,
            },
        )?)
    }
}
