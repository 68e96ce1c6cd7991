pub mod direct;
pub mod socks5;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{UpstreamConfig, UpstreamProtocol};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),
    #[error("address type not supported")]
    AddressTypeNotSupported,
    #[error("upstream does not support UDP")]
    UdpNotSupported,
    #[error("invalid target address: {0}")]
    InvalidTarget(String),
    #[error("invalid upstream configuration: {0}")]
    InvalidConfig(String),
}

/// Target address for upstream connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// IP address and port.
    SocketAddr(SocketAddr),
    /// Domain name and port (resolved by the upstream).
    Domain(String, u16),
}

impl Destination {
    pub fn port(&self) -> u16 {
        match self {
            Destination::SocketAddr(addr) => addr.port(),
            Destination::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::SocketAddr(addr) => write!(f, "{}", addr),
            Destination::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Destination {
    type Err = UpstreamError;

    /// Parses `1.2.3.4:80`, `[::1]:80` or `example.com:80`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Destination::SocketAddr(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| UpstreamError::InvalidTarget(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| UpstreamError::InvalidTarget(s.to_string()))?;
        if host.is_empty() || host.contains(':') {
            return Err(UpstreamError::InvalidTarget(s.to_string()));
        }
        Ok(Destination::Domain(host.to_string(), port))
    }
}

/// Byte stream returned by [`Upstream::dial_tcp`].
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxStream = Box<dyn ProxyStream>;

/// Datagram endpoint returned by [`Upstream::dial_udp`].
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> Result<usize, UpstreamError>;

    /// Receive one datagram, returning its length and the remote it came from.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), UpstreamError>;

    fn local_addr(&self) -> Result<SocketAddr, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Outbound transport that carries redirected traffic.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;

    async fn dial_tcp(&self, target: &Destination) -> Result<BoxStream, UpstreamError>;

    async fn dial_udp(&self, target: &Destination) -> Result<Arc<dyn PacketConn>, UpstreamError>;

    fn supports_udp(&self) -> bool;

    /// Probe the upstream with an HTTP request to `url`.
    async fn connectivity_test(&self, url: &str, timeout: Duration) -> bool {
        crate::checker::probe(self, url, timeout).await.reachable
    }
}

/// Build the upstream described by `config`.
pub fn from_config(config: &UpstreamConfig) -> Result<Arc<dyn Upstream>, UpstreamError> {
    match config.protocol {
        UpstreamProtocol::Direct => Ok(Arc::new(direct::Direct::new())),
        UpstreamProtocol::Socks5 => {
            let address = config.address.clone().ok_or_else(|| {
                UpstreamError::InvalidConfig("socks5 upstream requires an address".to_string())
            })?;
            Ok(Arc::new(socks5::Socks5Upstream::new(
                address,
                config.auth.clone(),
                config.udp,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            "1.2.3.4:80".parse::<Destination>().unwrap(),
            Destination::SocketAddr("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            "[2001:db8::1]:443".parse::<Destination>().unwrap(),
            Destination::SocketAddr("[2001:db8::1]:443".parse().unwrap())
        );
        assert_eq!(
            "example.com:53".parse::<Destination>().unwrap(),
            Destination::Domain("example.com".to_string(), 53)
        );
        assert!("example.com".parse::<Destination>().is_err());
        assert!("example.com:http".parse::<Destination>().is_err());
        assert!("::1:80".parse::<Destination>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for s in ["10.0.0.1:8080", "[::1]:53", "example.org:443"] {
            assert_eq!(s.parse::<Destination>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_from_config_requires_address() {
        let config = UpstreamConfig {
            protocol: UpstreamProtocol::Socks5,
            address: None,
            auth: None,
            udp: true,
        };
        assert!(from_config(&config).is_err());

        let direct = UpstreamConfig {
            protocol: UpstreamProtocol::Direct,
            ..config
        };
        let upstream = from_config(&direct).unwrap();
        assert!(upstream.supports_udp());
        assert_eq!(upstream.name(), "direct");
    }
}
