use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream, UdpSocket};

use super::{BoxStream, Destination, PacketConn, Upstream, UpstreamError};

/// Upstream that dials targets itself, without any proxy.
#[derive(Debug, Default)]
pub struct Direct;

impl Direct {
    pub fn new() -> Self {
        Self
    }
}

async fn resolve(target: &Destination) -> Result<SocketAddr, UpstreamError> {
    match target {
        Destination::SocketAddr(addr) => Ok(*addr),
        Destination::Domain(domain, port) => lookup_host((domain.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| UpstreamError::ConnectionFailed(format!("no address for {}", domain))),
    }
}

#[async_trait]
impl Upstream for Direct {
    fn name(&self) -> &str {
        "direct"
    }

    async fn dial_tcp(&self, target: &Destination) -> Result<BoxStream, UpstreamError> {
        let addr = resolve(target).await?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, target: &Destination) -> Result<Arc<dyn PacketConn>, UpstreamError> {
        let addr = resolve(target).await?;
        let bind: IpAddr = if addr.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind, 0)).await?;
        Ok(Arc::new(DirectPacketConn { socket }))
    }

    fn supports_udp(&self) -> bool {
        true
    }
}

struct DirectPacketConn {
    socket: UdpSocket,
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> Result<usize, UpstreamError> {
        let addr = resolve(target).await?;
        Ok(self.socket.send_to(buf, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), UpstreamError> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, Destination::SocketAddr(from)))
    }

    fn local_addr(&self) -> Result<SocketAddr, UpstreamError> {
        Ok(self.socket.local_addr()?)
    }
}
