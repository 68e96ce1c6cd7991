use std::net::SocketAddr;
use std::sync::Arc;

use graftlink_core::config::{Config, DnsConfig, RedirectConfig};
use graftlink_core::mapping::AddressTable;
use graftlink_core::upstream::direct::Direct;
use graftlink_core::upstream::Upstream;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::error::RedirectError;
use crate::mtu::MtuTable;
use crate::nat::SessionTable;
use crate::{tcp, udp};

/// Ports the redirector listens on; synthetic destinations point here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPorts {
    pub tcp: u16,
    pub udp: u16,
}

#[derive(Debug, Clone, Default)]
pub struct RedirectSettings {
    /// Carry only DNS over UDP, and only directly.
    pub no_udp: bool,
    pub dns: DnsConfig,
    pub redirect: RedirectConfig,
}

impl RedirectSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            no_udp: config.general.no_udp,
            dns: config.dns.clone(),
            redirect: config.redirect.clone(),
        }
    }
}

/// State shared by every relay task.
pub(crate) struct Context {
    pub(crate) table: Arc<AddressTable>,
    pub(crate) upstream: Arc<dyn Upstream>,
    direct: Arc<dyn Upstream>,
    udp_enabled: bool,
    pub(crate) settings: RedirectSettings,
    pub(crate) sessions: SessionTable,
    pub(crate) mtu: MtuTable,
    pub(crate) ports: RedirectPorts,
    pub(crate) cancel: CancellationToken,
}

impl Context {
    /// Upstream used for UDP sessions: the configured one when it carries
    /// UDP, otherwise a direct dialer for the DNS traffic that still flows.
    pub(crate) fn udp_upstream(&self) -> &Arc<dyn Upstream> {
        if self.udp_enabled {
            &self.upstream
        } else {
            &self.direct
        }
    }
}

/// Local endpoint that receives rewritten connections and datagrams and
/// forwards them through the upstream.
pub struct Redirector {
    listener: TcpListener,
    udp: UdpSocket,
    ports: RedirectPorts,
    table: Arc<AddressTable>,
    upstream: Arc<dyn Upstream>,
    settings: RedirectSettings,
    mtu: MtuTable,
}

impl Redirector {
    /// Bind the TCP listener on an ephemeral port and the UDP socket on the same port.
    pub async fn bind(
        table: Arc<AddressTable>,
        upstream: Arc<dyn Upstream>,
        settings: RedirectSettings,
    ) -> Result<Self, RedirectError> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .map_err(|source| RedirectError::Bind { proto: "tcp", source })?;
        let port = listener
            .local_addr()
            .map_err(|source| RedirectError::Bind { proto: "tcp", source })?
            .port();
        let udp = udp::bind(port).map_err(|source| RedirectError::Bind { proto: "udp", source })?;

        let ports = RedirectPorts { tcp: port, udp: port };
        tracing::info!(port, upstream = upstream.name(), "redirector bound");

        Ok(Self {
            listener,
            udp,
            ports,
            table,
            upstream,
            settings,
            mtu: MtuTable::from_system(),
        })
    }

    pub fn ports(&self) -> RedirectPorts {
        self.ports
    }

    /// Whether UDP other than DNS is forwarded through the upstream.
    pub fn udp_enabled(&self) -> bool {
        !self.settings.no_udp && self.upstream.supports_udp()
    }

    /// Serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let udp_enabled = self.udp_enabled();
        if !udp_enabled {
            tracing::info!("UDP forwarding disabled, DNS is resolved directly");
        }

        let Redirector {
            listener,
            udp,
            ports,
            table,
            upstream,
            settings,
            mtu,
        } = self;

        let ctx = Arc::new(Context {
            table,
            upstream,
            direct: Arc::new(Direct::new()),
            udp_enabled,
            settings,
            sessions: SessionTable::new(),
            mtu,
            ports,
            cancel: cancel.clone(),
        });

        let udp_task = tokio::spawn(udp::serve(Arc::new(udp), ctx.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = tcp::handle_connection(stream, &ctx).await {
                                tracing::debug!(peer = %peer, error = %e, "TCP relay failed");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept error"),
                }
            }
        }

        let _ = udp_task.await;
        tracing::debug!("redirector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use graftlink_core::upstream::{BoxStream, Destination, PacketConn, UpstreamError};
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RData, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, Mutex};

    /// Packet conn that echoes every datagram back.
    struct EchoConn {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    #[async_trait]
    impl PacketConn for EchoConn {
        async fn send_to(&self, buf: &[u8], _target: &Destination) -> Result<usize, UpstreamError> {
            let _ = self.tx.send(buf.to_vec());
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), UpstreamError> {
            let data = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(UpstreamError::ConnectionFailed("closed".to_string()))?;
            buf[..data.len()].copy_from_slice(&data);
            Ok((data.len(), Destination::SocketAddr(SocketAddr::from(([10, 0, 0, 1], 9999)))))
        }

        fn local_addr(&self) -> Result<SocketAddr, UpstreamError> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    /// Upstream that counts UDP dials and hands out echo conns after a delay.
    #[derive(Default)]
    struct CountingUpstream {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for CountingUpstream {
        fn name(&self) -> &str {
            "counting"
        }

        async fn dial_tcp(&self, _target: &Destination) -> Result<BoxStream, UpstreamError> {
            Err(UpstreamError::ConnectionFailed("tcp not supported".to_string()))
        }

        async fn dial_udp(&self, _target: &Destination) -> Result<Arc<dyn PacketConn>, UpstreamError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(Arc::new(EchoConn { tx, rx: Mutex::new(rx) }))
        }

        fn supports_udp(&self) -> bool {
            true
        }
    }

    /// Packet conn that emits a datagram every 300ms regardless of input.
    struct TickingConn;

    #[async_trait]
    impl PacketConn for TickingConn {
        async fn send_to(&self, buf: &[u8], _target: &Destination) -> Result<usize, UpstreamError> {
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), UpstreamError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            buf[..4].copy_from_slice(b"tick");
            Ok((4, Destination::SocketAddr(SocketAddr::from(([10, 0, 0, 2], 7000)))))
        }

        fn local_addr(&self) -> Result<SocketAddr, UpstreamError> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    struct TickingUpstream;

    #[async_trait]
    impl Upstream for TickingUpstream {
        fn name(&self) -> &str {
            "ticking"
        }

        async fn dial_tcp(&self, _target: &Destination) -> Result<BoxStream, UpstreamError> {
            Err(UpstreamError::ConnectionFailed("tcp not supported".to_string()))
        }

        async fn dial_udp(&self, _target: &Destination) -> Result<Arc<dyn PacketConn>, UpstreamError> {
            Ok(Arc::new(TickingConn))
        }

        fn supports_udp(&self) -> bool {
            true
        }
    }

    fn test_settings() -> RedirectSettings {
        let mut settings = RedirectSettings::default();
        // nothing listens here; background lookups fail fast
        settings.dns.real_resolver = SocketAddr::from(([127, 0, 0, 1], 9));
        settings
    }

    async fn start(
        upstream: Arc<dyn Upstream>,
    ) -> (Arc<AddressTable>, RedirectPorts, CancellationToken) {
        start_with(upstream, test_settings()).await
    }

    async fn start_with(
        upstream: Arc<dyn Upstream>,
        settings: RedirectSettings,
    ) -> (Arc<AddressTable>, RedirectPorts, CancellationToken) {
        let table = Arc::new(AddressTable::new());
        let redirector = Redirector::bind(table.clone(), upstream, settings)
            .await
            .unwrap();
        let ports = redirector.ports();
        assert_eq!(ports.tcp, ports.udp);

        let cancel = CancellationToken::new();
        tokio::spawn(redirector.run(cancel.clone()));
        (table, ports, cancel)
    }

    #[tokio::test]
    async fn test_tcp_through_synthetic_address() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let (table, ports, cancel) = start(Arc::new(Direct::new())).await;
        let synthetic = table.alloc_projection(&echo_addr.to_string());
        assert_ne!(synthetic, Ipv4Addr::LOCALHOST);

        let mut client = TcpStream::connect((synthetic, ports.tcp)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unmapped_address_is_closed() {
        let (_table, ports, cancel) = start(Arc::new(Direct::new())).await;

        let mut client = TcpStream::connect((Ipv4Addr::new(127, 0, 0, 200), ports.tcp))
            .await
            .unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dns_hijack_over_udp() {
        let (table, ports, cancel) = start(Arc::new(CountingUpstream::default())).await;
        let resolver = table.alloc_projection("8.8.8.8:53");

        let mut query = Message::new();
        query.set_id(7);
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query.to_bytes().unwrap(), (resolver, ports.udp))
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        // replies come from the address the query was sent to
        assert_eq!(from, SocketAddr::from((resolver, ports.udp)));

        let response = Message::from_bytes(&buf[..n]).unwrap();
        assert_eq!(response.id(), 7);
        match response.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, table.alloc_projection("example.com")),
            other => panic!("unexpected answer {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_datagrams_dial_once() {
        let upstream = Arc::new(CountingUpstream::default());
        let (table, ports, cancel) = start(upstream.clone()).await;
        let synthetic = table.alloc_projection("10.0.0.1:9999");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sent: HashSet<Vec<u8>> = (0..10u8).map(|i| vec![b'x', i]).collect();
        for payload in &sent {
            client.send_to(payload, (synthetic, ports.udp)).await.unwrap();
        }

        let mut received = HashSet::new();
        let mut buf = [0u8; 64];
        while received.len() < sent.len() {
            let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(from, SocketAddr::from((synthetic, ports.udp)));
            received.insert(buf[..n].to_vec());
        }

        assert_eq!(received, sent);
        assert_eq!(upstream.dials.load(Ordering::SeqCst), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_responses_keep_session_alive() {
        let mut settings = test_settings();
        settings.redirect.udp_idle_timeout_secs = 1;
        let (table, ports, cancel) = start_with(Arc::new(TickingUpstream), settings).await;
        let synthetic = table.alloc_projection("10.0.0.2:7000");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"subscribe", (synthetic, ports.udp)).await.unwrap();

        // one outbound datagram, then three seconds of upstream traffic
        let until = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut received = 0;
        let mut buf = [0u8; 64];
        while let Ok(Ok((n, _))) = tokio::time::timeout_at(until, client.recv_from(&mut buf)).await {
            assert_eq!(&buf[..n], b"tick");
            received += 1;
        }
        assert!(received >= 7, "session closed early: {} responses", received);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dns_query_to_any_port_is_hijacked() {
        let upstream = Arc::new(CountingUpstream::default());
        let (table, ports, cancel) = start(upstream.clone()).await;
        let resolver = table.alloc_projection("10.0.0.53:5353");

        let mut query = Message::new();
        query.set_id(9);
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(Query::query(Name::from_ascii("example.org.").unwrap(), RecordType::A));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query.to_bytes().unwrap(), (resolver, ports.udp))
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_bytes(&buf[..n]).unwrap();
        assert_eq!(response.id(), 9);
        match response.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, table.alloc_projection("example.org")),
            other => panic!("unexpected answer {:?}", other),
        }
        assert_eq!(upstream.dials.load(Ordering::SeqCst), 0);

        cancel.cancel();
    }
}
