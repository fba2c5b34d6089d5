use crate::server::tls::Error::{CaCertificateError, GenerateCertificateError};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::{
    crypto::ring::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{Acceptor, ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use std::{
    collections::HashMap,
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;

#[derive(Error, Debug)]
pub enum Error {
    #[error("CA certificate error: {0}")]
    CaCertificateError(String),
    #[error("cannot generate certificate: {0}")]
    GenerateCertificateError(String),
}

/// Hostnames carrying anything beyond DNS label characters fall back to a
/// wildcard certificate for this name.
const FALLBACK_HOSTNAME: &str = "*.invalid";

struct CaState {
    certificates: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    ca_cert_pem: String,
    ca_key_pem: String,
    next_serial: AtomicU64,
}

impl std::fmt::Debug for CaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaState")
            .field(
                "certificates",
                &self
                    .certificates
                    .read()
                    .map(|c| c.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default(),
            )
            .finish()
    }
}

/// A certificate authority that mints leaf certificates on demand, one per
/// requested hostname, cached for the life of the instance.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    state: Arc<CaState>,
}

impl CertificateAuthority {
    /// Builds the authority from PEM-encoded root material. Malformed input
    /// fails here, before the instance starts serving.
    pub fn from_pem<IntoString: Into<String>>(
        ca_cert: IntoString,
        ca_key: IntoString,
    ) -> Result<Self, Error> {
        let ca_cert = ca_cert.into();
        let ca_key = ca_key.into();

        KeyPair::from_pem(&ca_key)
            .map_err(|err| CaCertificateError(format!("cannot parse CA private key: {}", err)))?;
        CertificateParams::from_ca_cert_pem(&ca_cert)
            .map_err(|err| CaCertificateError(format!("cannot parse CA certificate: {}", err)))?;

        Ok(Self {
            state: Arc::new(CaState {
                certificates: RwLock::new(HashMap::new()),
                locks: RwLock::new(HashMap::new()),
                ca_cert_pem: ca_cert,
                ca_key_pem: ca_key,
                next_serial: AtomicU64::new(1),
            }),
        })
    }

    /// Builds the authority from PEM files on disk. The files are only ever
    /// read, never written.
    pub fn from_pem_files<P: AsRef<Path>>(ca_cert_path: P, ca_key_path: P) -> Result<Self, Error> {
        let ca_cert = std::fs::read_to_string(&ca_cert_path).map_err(|err| {
            CaCertificateError(format!(
                "cannot read CA certificate {}: {}",
                ca_cert_path.as_ref().display(),
                err
            ))
        })?;
        let ca_key = std::fs::read_to_string(&ca_key_path).map_err(|err| {
            CaCertificateError(format!(
                "cannot read CA private key {}: {}",
                ca_key_path.as_ref().display(),
                err
            ))
        })?;

        Self::from_pem(ca_cert, ca_key)
    }

    /// Generates a fresh self-signed root in memory. Instances built this
    /// way share no trust with each other.
    pub fn generate() -> Result<Self, Error> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "mockproxy root CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365 * 10);

        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|err| {
            GenerateCertificateError(format!("cannot generate CA key pair: {}", err))
        })?;
        let cert = params.self_signed(&key).map_err(|err| {
            GenerateCertificateError(format!("cannot self-sign CA certificate: {}", err))
        })?;

        Self::from_pem(cert.pem(), key.serialize_pem())
    }

    /// The root certificate in PEM form, for handing to clients that should
    /// trust this instance.
    pub fn ca_certificate_pem(&self) -> &str {
        &self.state.ca_cert_pem
    }

    /// Returns the cached leaf for the hostname, minting it on first use.
    /// Generation happens outside the cache lock; concurrent requests for
    /// the same hostname serialize on a per-hostname lock.
    pub fn cert_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        let hostname = effective_hostname(hostname);

        {
            let certs = self
                .state
                .certificates
                .read()
                .expect("certificate cache lock poisoned");
            if let Some(existing) = certs.get(hostname) {
                return Ok(existing.clone());
            }
        }

        let lock = self.lock_for_hostname(hostname);
        let _guard = lock.lock().expect("hostname lock poisoned");
        {
            let certs = self
                .state
                .certificates
                .read()
                .expect("certificate cache lock poisoned");
            if let Some(existing) = certs.get(hostname) {
                return Ok(existing.clone());
            }
        }

        let minted = self.mint(hostname)?;
        {
            let mut certs = self
                .state
                .certificates
                .write()
                .expect("certificate cache lock poisoned");
            certs.insert(hostname.to_string(), minted.clone());
        }

        Ok(minted)
    }

    fn lock_for_hostname(&self, hostname: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .state
            .locks
            .write()
            .expect("hostname lock table poisoned");
        locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn mint(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        tracing::debug!("minting leaf certificate for {}", hostname);

        let ca_key = KeyPair::from_pem(&self.state.ca_key_pem)
            .map_err(|err| CaCertificateError(format!("cannot parse CA private key: {}", err)))?;
        let issuer_params = CertificateParams::from_ca_cert_pem(&self.state.ca_cert_pem)
            .map_err(|err| CaCertificateError(format!("cannot parse CA certificate: {}", err)))?;
        let issuer = issuer_params.self_signed(&ca_key).map_err(|err| {
            GenerateCertificateError(format!("cannot reconstruct CA certificate: {}", err))
        })?;

        let mut params = if let Ok(ip) = hostname.parse::<std::net::IpAddr>() {
            let mut p = CertificateParams::default();
            p.subject_alt_names.push(SanType::IpAddress(ip));
            p
        } else {
            CertificateParams::new(vec![hostname.to_owned()]).map_err(|err| {
                GenerateCertificateError(format!(
                    "cannot build certificate parameters for {}: {}",
                    hostname, err
                ))
            })?
        };

        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);
        params.serial_number = Some(SerialNumber::from(
            self.state
                .next_serial
                .fetch_add(1, Ordering::SeqCst)
                .to_be_bytes()
                .to_vec(),
        ));

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|err| {
            GenerateCertificateError(format!("cannot generate key pair for {}: {}", hostname, err))
        })?;

        let leaf = params.signed_by(&leaf_key, &issuer, &ca_key).map_err(|err| {
            GenerateCertificateError(format!("cannot sign certificate for {}: {}", hostname, err))
        })?;

        let private_key = load_private_key(leaf_key.serialize_pem())?;
        let certificates = load_certificates(leaf.pem())?;
        let signing_key = any_supported_type(&private_key).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot convert private key for {} into a signing key: {}",
                hostname, err
            ))
        })?;

        Ok(Arc::new(CertifiedKey::new(certificates, signing_key)))
    }
}

fn load_certificates<'a>(cert_pem: String) -> Result<Vec<CertificateDer<'a>>, Error> {
    let mut reader = Cursor::new(cert_pem.into_bytes());
    let mut certificates = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        certificates.push(cert.map_err(|err| {
            GenerateCertificateError(format!("cannot use generated certificate: {}", err))
        })?);
    }

    Ok(certificates)
}

fn load_private_key<'a>(key_pem: String) -> Result<PrivateKeyDer<'a>, Error> {
    let mut reader = Cursor::new(key_pem.into_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| GenerateCertificateError(format!("cannot use generated key: {}", err)))?
        .ok_or_else(|| GenerateCertificateError("generated key PEM holds no key".to_string()))
}

/// Collapses hostnames that cannot appear in a certificate onto the
/// wildcard fallback.
fn effective_hostname(hostname: &str) -> &str {
    let sane = !hostname.is_empty()
        && (hostname.parse::<std::net::IpAddr>().is_ok()
            || hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '*')));

    if sane {
        hostname
    } else {
        FALLBACK_HOSTNAME
    }
}

/// Resolves server certificates from the dynamic CA, using the SNI when the
/// client sent one and the configured default hostname otherwise.
#[derive(Debug)]
pub struct LeafCertResolver {
    ca: CertificateAuthority,
    default_hostname: String,
}

impl ResolvesServerCert for LeafCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        // Clients may omit the SNI extension (RFC 6066 §3), typically when
        // they connected to an IP address.
        let hostname = client_hello
            .server_name()
            .map(|name| name.to_string())
            .unwrap_or_else(|| self.default_hostname.clone());

        match self.ca.cert_for(&hostname) {
            Ok(certified) => Some(certified),
            Err(err) => {
                tracing::error!("cannot resolve certificate for {}: {}", hostname, err);
                None
            }
        }
    }
}

/// Builds the rustls server configuration backed by the dynamic CA.
pub(crate) fn server_config(ca: CertificateAuthority, default_hostname: &str) -> Arc<ServerConfig> {
    let resolver = Arc::new(LeafCertResolver {
        ca,
        default_hostname: default_hostname.to_string(),
    });

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec(), b"http/1.0".to_vec()];

    Arc::new(config)
}

/// A handshake that did not produce a usable stream.
#[derive(Debug)]
pub(crate) struct HandshakeFailure {
    pub cause: String,
    pub sni: Option<String>,
}

/// Terminates TLS on the given stream. The acceptor is driven lazily so the
/// SNI is known even when the handshake fails afterwards.
pub(crate) async fn terminate<S>(
    stream: S,
    config: Arc<ServerConfig>,
) -> Result<(tokio_rustls::server::TlsStream<S>, Option<String>), HandshakeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);

    match acceptor.await {
        Ok(start) => {
            let sni = start.client_hello().server_name().map(|s| s.to_string());
            match start.into_stream(config).await {
                Ok(tls_stream) => Ok((tls_stream, sni)),
                Err(err) => Err(HandshakeFailure {
                    cause: err.to_string(),
                    sni,
                }),
            }
        }
        Err(err) => Err(HandshakeFailure {
            cause: err.to_string(),
            sni: None,
        }),
    }
}
