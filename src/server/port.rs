use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::net::TcpListener;

/// Ports tried by [`PortPolicy::Auto`], ascending, end exclusive.
pub const DEFAULT_PORT_RANGE: std::ops::Range<u16> = 8000..9000;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to port {0}: {1}")]
    Bind(u16, std::io::Error),
    #[error("no free port in range [{0}, {1})")]
    NoFreePort(u16, u16),
    #[error("invalid port range [{0}, {1})")]
    InvalidRange(u16, u16),
}

/// How the listening port is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPolicy {
    /// Scan [`DEFAULT_PORT_RANGE`] for the first free port.
    Auto,
    /// Bind exactly this port, failing when it is taken.
    Fixed(u16),
    /// Scan `[start, end)` ascending for the first free port.
    Range { start: u16, end: u16 },
}

impl Default for PortPolicy {
    fn default() -> Self {
        PortPolicy::Auto
    }
}

impl PortPolicy {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let PortPolicy::Range { start, end } = self {
            if start >= end {
                return Err(Error::InvalidRange(*start, *end));
            }
        }

        Ok(())
    }
}

/// Binds a listener according to the policy. `expose` switches the bind
/// address from loopback to all interfaces.
///
/// Candidate liveness within a range is probed by transiently binding the
/// IPv6 loopback as well, so a port that is only half-free is skipped.
pub async fn bind(policy: &PortPolicy, expose: bool) -> Result<TcpListener, Error> {
    policy.validate()?;

    let host: std::net::IpAddr = if expose {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv4Addr::LOCALHOST.into()
    };

    match policy {
        PortPolicy::Fixed(port) => TcpListener::bind(SocketAddr::new(host, *port))
            .await
            .map_err(|e| Error::Bind(*port, e)),
        PortPolicy::Auto => scan(host, DEFAULT_PORT_RANGE.start, DEFAULT_PORT_RANGE.end).await,
        PortPolicy::Range { start, end } => scan(host, *start, *end).await,
    }
}

async fn scan(host: std::net::IpAddr, start: u16, end: u16) -> Result<TcpListener, Error> {
    let probe_v6 = has_ipv6_loopback().await;

    for port in start..end {
        let listener = match TcpListener::bind(SocketAddr::new(host, port)).await {
            Ok(listener) => listener,
            Err(_) => continue,
        };

        if probe_v6 {
            // Transient probe; the binding is dropped immediately.
            if TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await.is_err() {
                tracing::debug!("port {} free on IPv4 but taken on ::1, skipping", port);
                continue;
            }
        }

        return Ok(listener);
    }

    Err(Error::NoFreePort(start, end))
}

async fn has_ipv6_loopback() -> bool {
    TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).await.is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fixed_port_bind_test() {
        // Reserve a free port first, then release it and bind it explicitly.
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let listener = bind(&PortPolicy::Fixed(port), false).await.unwrap();

        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn fixed_port_in_use_test() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = bind(&PortPolicy::Fixed(port), false).await;

        assert_eq!(result.is_err(), true);
        assert_eq!(
            matches!(result.err().unwrap(), Error::Bind(p, _) if p == port),
            true
        );
    }

    #[tokio::test]
    async fn range_scan_skips_taken_ports_test() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let start = taken.local_addr().unwrap().port();

        // First candidate is occupied, the scan must move past it.
        let listener = bind(
            &PortPolicy::Range {
                start,
                end: start.checked_add(20).unwrap(),
            },
            false,
        )
        .await
        .unwrap();

        assert_eq!(listener.local_addr().unwrap().port() > start, true);
    }

    #[tokio::test]
    async fn range_exhaustion_test() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let start = taken.local_addr().unwrap().port();

        let result = bind(
            &PortPolicy::Range {
                start,
                end: start + 1,
            },
            false,
        )
        .await;

        assert_eq!(
            matches!(result.err().unwrap(), Error::NoFreePort(s, e) if s == start && e == start + 1),
            true
        );
    }

    #[tokio::test]
    async fn invalid_range_test() {
        let result = bind(&PortPolicy::Range { start: 90, end: 90 }, false).await;

        assert_eq!(
            matches!(result.err().unwrap(), Error::InvalidRange(90, 90)),
            true
        );
    }
}
