use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use super::{BoxStream, Destination, PacketConn, Upstream, UpstreamError};
use crate::config::UpstreamAuth;

// SOCKS5 constants
const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// SOCKS5 proxy used as the outbound transport.
#[derive(Debug, Clone)]
pub struct Socks5Upstream {
    name: String,
    server: String,
    auth: Option<UpstreamAuth>,
    udp: bool,
}

impl Socks5Upstream {
    pub fn new(server: String, auth: Option<UpstreamAuth>, udp: bool) -> Self {
        Self {
            name: format!("socks5://{}", server),
            server,
            auth,
            udp,
        }
    }

    async fn handshake(&self) -> Result<TcpStream, UpstreamError> {
        let mut stream = TcpStream::connect(self.server.as_str())
            .await
            .map_err(|e| UpstreamError::ConnectionFailed(format!("{}: {}", self.server, e)))?;
        stream.set_nodelay(true)?;
        negotiate_auth(&mut stream, &self.auth).await?;
        Ok(stream)
    }
}

#[async_trait]
impl Upstream for Socks5Upstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dial_tcp(&self, target: &Destination) -> Result<BoxStream, UpstreamError> {
        let mut stream = self.handshake().await?;
        send_request(&mut stream, CMD_CONNECT, target).await?;
        read_reply(&mut stream).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, _target: &Destination) -> Result<Arc<dyn PacketConn>, UpstreamError> {
        if !self.udp {
            return Err(UpstreamError::UdpNotSupported);
        }
        let mut control = self.handshake().await?;
        let server_addr = control.peer_addr()?;

        let bind: IpAddr = match server_addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind, 0)).await?;
        let client = Destination::SocketAddr(socket.local_addr()?);

        send_request(&mut control, CMD_UDP_ASSOCIATE, &client).await?;
        let mut relay_addr = match read_reply(&mut control).await? {
            Destination::SocketAddr(addr) => addr,
            Destination::Domain(..) => return Err(UpstreamError::AddressTypeNotSupported),
        };
        // If the proxy replies with 0.0.0.0, use the proxy server's IP
        if relay_addr.ip().is_unspecified() {
            relay_addr.set_ip(server_addr.ip());
        }
        socket.connect(relay_addr).await?;

        tracing::debug!(relay = %relay_addr, proxy = %self.server, "SOCKS5 UDP association established");

        Ok(Arc::new(Socks5PacketConn {
            _control: control,
            socket,
        }))
    }

    fn supports_udp(&self) -> bool {
        self.udp
    }
}

/// UDP association; dropping it closes the control connection, which ends
/// the association on the proxy side.
struct Socks5PacketConn {
    _control: TcpStream,
    socket: UdpSocket,
}

#[async_trait]
impl PacketConn for Socks5PacketConn {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> Result<usize, UpstreamError> {
        let datagram = encode_udp_datagram(target, buf)?;
        self.socket.send(&datagram).await?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), UpstreamError> {
        let mut datagram = vec![0u8; buf.len() + 262];
        let n = self.socket.recv(&mut datagram).await?;
        let (source, payload) = decode_udp_datagram(&datagram[..n])?;
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, source))
    }

    fn local_addr(&self) -> Result<SocketAddr, UpstreamError> {
        Ok(self.socket.local_addr()?)
    }
}

async fn negotiate_auth(
    stream: &mut TcpStream,
    auth: &Option<UpstreamAuth>,
) -> Result<(), UpstreamError> {
    let methods: Vec<u8> = if auth.is_some() {
        vec![AUTH_NONE, AUTH_USERNAME_PASSWORD]
    } else {
        vec![AUTH_NONE]
    };

    // Send: VER | NMETHODS | METHODS
    let mut buf = vec![SOCKS5_VERSION, methods.len() as u8];
    buf.extend_from_slice(&methods);
    stream.write_all(&buf).await?;

    // Receive: VER | METHOD
    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;

    if resp[0] != SOCKS5_VERSION {
        return Err(UpstreamError::ProtocolError(format!(
            "unexpected version: {}",
            resp[0]
        )));
    }

    match resp[1] {
        AUTH_NONE => Ok(()),
        AUTH_USERNAME_PASSWORD => {
            let auth = auth.as_ref().ok_or(UpstreamError::AuthenticationFailed)?;
            authenticate_username_password(stream, auth).await
        }
        AUTH_NO_ACCEPTABLE => Err(UpstreamError::AuthenticationFailed),
        other => Err(UpstreamError::ProtocolError(format!(
            "unsupported auth method: {}",
            other
        ))),
    }
}

async fn authenticate_username_password(
    stream: &mut TcpStream,
    auth: &UpstreamAuth,
) -> Result<(), UpstreamError> {
    if auth.username.len() > u8::MAX as usize || auth.password.len() > u8::MAX as usize {
        return Err(UpstreamError::InvalidConfig(
            "credentials longer than 255 bytes".to_string(),
        ));
    }

    // Sub-negotiation version 0x01
    let mut buf = vec![0x01];
    buf.push(auth.username.len() as u8);
    buf.extend_from_slice(auth.username.as_bytes());
    buf.push(auth.password.len() as u8);
    buf.extend_from_slice(auth.password.as_bytes());
    stream.write_all(&buf).await?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;

    if resp[1] != 0x00 {
        return Err(UpstreamError::AuthenticationFailed);
    }

    Ok(())
}

fn encode_address(buf: &mut Vec<u8>, dest: &Destination) -> Result<(), UpstreamError> {
    match dest {
        Destination::SocketAddr(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        Destination::SocketAddr(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
        Destination::Domain(domain, port) => {
            if domain.len() > u8::MAX as usize {
                return Err(UpstreamError::InvalidTarget(domain.clone()));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

async fn send_request(
    stream: &mut TcpStream,
    cmd: u8,
    dest: &Destination,
) -> Result<(), UpstreamError> {
    let mut buf = vec![SOCKS5_VERSION, cmd, 0x00]; // VER | CMD | RSV
    encode_address(&mut buf, dest)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read VER | REP | RSV | ATYP | BND.ADDR | BND.PORT and return the bound address.
async fn read_reply(stream: &mut TcpStream) -> Result<Destination, UpstreamError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(UpstreamError::ProtocolError(format!(
            "unexpected version in reply: {}",
            header[0]
        )));
    }

    if header[1] != REPLY_SUCCEEDED {
        return Err(UpstreamError::ConnectionFailed(format!(
            "SOCKS5 reply code: 0x{:02x}",
            header[1]
        )));
    }

    match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 6]; // 4 bytes IP + 2 bytes port
            stream.read_exact(&mut addr).await?;
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = u16::from_be_bytes([addr[4], addr[5]]);
            Ok(Destination::SocketAddr(SocketAddr::new(ip.into(), port)))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 18]; // 16 bytes IP + 2 bytes port
            stream.read_exact(&mut addr).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&addr[..16]);
            let port = u16::from_be_bytes([addr[16], addr[17]]);
            Ok(Destination::SocketAddr(SocketAddr::new(Ipv6Addr::from(ip).into(), port)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize + 2]; // domain + port
            stream.read_exact(&mut domain).await?;
            let n = len[0] as usize;
            let port = u16::from_be_bytes([domain[n], domain[n + 1]]);
            Ok(Destination::Domain(
                String::from_utf8_lossy(&domain[..n]).to_string(),
                port,
            ))
        }
        _ => Err(UpstreamError::AddressTypeNotSupported),
    }
}

/// Encapsulate a UDP payload into a SOCKS5 UDP request datagram.
/// Format: RSV(2) | FRAG(1) | ATYP(1) | DST.ADDR | DST.PORT | DATA
pub fn encode_udp_datagram(dest: &Destination, payload: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    let mut buf = vec![0x00, 0x00, 0x00]; // RSV + FRAG
    encode_address(&mut buf, dest)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a SOCKS5 UDP reply datagram.
/// Returns (source address, payload data).
pub fn decode_udp_datagram(data: &[u8]) -> Result<(Destination, &[u8]), UpstreamError> {
    if data.len() < 4 {
        return Err(UpstreamError::ProtocolError("UDP datagram too short".to_string()));
    }

    // data[0..2] = RSV, data[2] = FRAG
    let frag = data[2];
    if frag != 0 {
        return Err(UpstreamError::UnsupportedCommand(frag));
    }

    match data[3] {
        ATYP_IPV4 => {
            if data.len() < 10 {
                return Err(UpstreamError::ProtocolError(
                    "UDP datagram too short for IPv4".to_string(),
                ));
            }
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            Ok((Destination::SocketAddr(SocketAddr::new(ip.into(), port)), &data[10..]))
        }
        ATYP_IPV6 => {
            if data.len() < 22 {
                return Err(UpstreamError::ProtocolError(
                    "UDP datagram too short for IPv6".to_string(),
                ));
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[4..20]);
            let port = u16::from_be_bytes([data[20], data[21]]);
            Ok((
                Destination::SocketAddr(SocketAddr::new(Ipv6Addr::from(ip).into(), port)),
                &data[22..],
            ))
        }
        ATYP_DOMAIN => {
            if data.len() < 5 {
                return Err(UpstreamError::ProtocolError(
                    "UDP datagram too short for domain".to_string(),
                ));
            }
            let domain_len = data[4] as usize;
            let header_len = 5 + domain_len + 2;
            if data.len() < header_len {
                return Err(UpstreamError::ProtocolError("UDP datagram too short".to_string()));
            }
            let domain = String::from_utf8_lossy(&data[5..5 + domain_len]).to_string();
            let port = u16::from_be_bytes([data[5 + domain_len], data[6 + domain_len]]);
            Ok((Destination::Domain(domain, port), &data[header_len..]))
        }
        _ => Err(UpstreamError::AddressTypeNotSupported),
    }
}
