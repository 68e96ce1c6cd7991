use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use graftlink_core::upstream::Destination;
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn,
};
use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::dns_hijack;
use crate::error::RedirectError;
use crate::mtu::MAX_MTU;
use crate::nat::{Claim, UdpSession};
use crate::redirector::Context;

/// Bind the redirector's UDP socket on `port` with `IP_PKTINFO` enabled.
pub(crate) fn bind(port: u16) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    setsockopt(&socket, sockopt::Ipv4PacketInfo, &true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// A received datagram with the address it was sent to.
struct Received {
    len: usize,
    peer: SocketAddrV4,
    dst: Option<Ipv4Addr>,
}

fn recv_with_dst(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!(libc::in_pktinfo);
    let msg = recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())?;

    let peer = msg
        .address
        .map(SocketAddrV4::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without source address"))?;
    let mut dst = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
            dst = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
        }
    }

    Ok(Received {
        len: msg.bytes,
        peer,
        dst,
    })
}

fn send_from(fd: RawFd, buf: &[u8], from: Ipv4Addr, to: SocketAddrV4) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let info = libc::in_pktinfo {
        ipi_ifindex: 0,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from(from).to_be(),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };
    let cmsgs = [ControlMessage::Ipv4PacketInfo(&info)];
    let dst = SockaddrIn::from(to);
    Ok(sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&dst))?)
}

/// Send `buf` to `to` with `from` as the source address.
pub(crate) async fn reply(socket: &UdpSocket, buf: &[u8], from: Ipv4Addr, to: SocketAddrV4) -> io::Result<usize> {
    let fd = socket.as_raw_fd();
    socket
        .async_io(Interest::WRITABLE, || send_from(fd, buf, from, to))
        .await
}

/// Receive loop of the redirector's UDP socket.
pub(crate) async fn serve(socket: Arc<UdpSocket>, ctx: Arc<Context>) {
    let fd = socket.as_raw_fd();
    let mut buf = vec![0u8; MAX_MTU];

    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            res = socket.async_io(Interest::READABLE, || recv_with_dst(fd, &mut buf)) => res,
        };

        let received = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "UDP receive error");
                continue;
            }
        };

        let Some(dst) = received.dst.filter(|dst| dst.is_loopback()) else {
            tracing::debug!(peer = %received.peer, dst = ?received.dst, "dropping datagram not sent to a loopback address");
            continue;
        };

        let payload = buf[..received.len].to_vec();
        let socket = socket.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_datagram(&socket, &ctx, payload, received.peer, dst).await {
                tracing::debug!(peer = %received.peer, error = %e, "UDP datagram dropped");
            }
        });
    }
}

/// Forward one datagram from `peer` that was sent to the synthetic address `dst`.
///
/// Any payload that decodes as a DNS query is answered locally when it asks
/// for A or AAAA, whatever the destination port; other DNS queries go to the
/// fallback resolver.
pub(crate) async fn handle_datagram(
    socket: &Arc<UdpSocket>,
    ctx: &Arc<Context>,
    payload: Vec<u8>,
    peer: SocketAddrV4,
    dst: Ipv4Addr,
) -> Result<(), RedirectError> {
    let local = SocketAddr::from((dst, ctx.ports.udp));
    let target = ctx
        .table
        .get_projection(dst.into())
        .ok_or(RedirectError::TargetNotFound(local))?;
    let mut dest: Destination = target.parse()?;

    let is_dns = dns_hijack::is_dns_query(&payload);
    if is_dns {
        if let Some(hijacked) = dns_hijack::hijack(&payload, &ctx.table, ctx.settings.dns.hijack_ttl) {
            reply(socket, &hijacked.response, dst, peer).await?;
            if let Some((domain, fake)) = hijacked.resolve {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    dns_hijack::learn_real_ip(
                        &ctx.table,
                        &domain,
                        fake,
                        ctx.settings.dns.real_resolver,
                        ctx.settings.redirect.dns_timeout(),
                    )
                    .await;
                });
            }
            return Ok(());
        }
        dest = Destination::SocketAddr(ctx.settings.dns.fallback_resolver);
    }

    let timeout = if is_dns {
        ctx.settings.redirect.dns_timeout()
    } else {
        ctx.settings.redirect.udp_idle_timeout()
    };
    let key = peer.to_string();

    let session = match ctx.sessions.claim(&key, dst, timeout) {
        Claim::Active(session) => session,
        Claim::Wait(mut rx) => {
            let _ = rx.changed().await;
            ctx.sessions
                .touch(&key, dst, timeout)
                .ok_or_else(|| RedirectError::DialTimeout(format!("{} (session establishment failed)", dest)))?
        }
        Claim::Build(guard) => {
            let upstream = ctx.udp_upstream();
            let conn = tokio::time::timeout(ctx.settings.redirect.dial_timeout(), upstream.dial_udp(&dest))
                .await
                .map_err(|_| RedirectError::DialTimeout(dest.to_string()))??;
            tracing::debug!(peer = %peer, dest = %dest, upstream = upstream.name(), "UDP session established");

            let session = Arc::new(UdpSession::new(conn, dst, timeout));
            guard.complete(session.clone());

            let socket = socket.clone();
            let ctx = ctx.clone();
            let relay_session = session.clone();
            tokio::spawn(async move {
                relay_back(&socket, &ctx, &key, relay_session, peer).await;
            });
            session
        }
    };

    session.conn.send_to(&payload, &dest).await?;
    Ok(())
}

/// Copy datagrams from the upstream back to the tracee until the session
/// idles out or the upstream fails. Traffic in either direction keeps the
/// session alive.
async fn relay_back(socket: &UdpSocket, ctx: &Context, key: &str, session: Arc<UdpSession>, peer: SocketAddrV4) {
    let size = match session.conn.local_addr() {
        Ok(addr) => ctx.mtu.buffer_size(addr.ip()),
        Err(_) => MAX_MTU,
    };
    let mut buf = vec![0u8; size];

    loop {
        let deadline = session.deadline();
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                if ctx.sessions.remove_idle(key, &session) {
                    tracing::trace!(peer = %peer, "UDP session idle, closing");
                    return;
                }
                if session.deadline() <= tokio::time::Instant::now() {
                    // replaced or removed elsewhere
                    break;
                }
            }
            res = session.conn.recv_from(&mut buf) => match res {
                Ok((n, from)) => {
                    session.refresh();
                    if let Err(e) = reply(socket, &buf[..n], session.reply_from(), peer).await {
                        tracing::debug!(peer = %peer, error = %e, "failed to deliver UDP reply");
                        break;
                    }
                    tracing::trace!(peer = %peer, from = %from, len = n, "UDP reply relayed");
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "UDP upstream read failed");
                    break;
                }
            }
        }
    }

    ctx.sessions.remove(key, &session);
}
