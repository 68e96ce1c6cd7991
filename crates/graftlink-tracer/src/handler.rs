use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use graftlink_core::mapping::{canonical_v4, is_reserved, AddressTable};
use graftlink_core::upstream::Network;

use crate::error::TraceError;
use crate::event::{Syscall, SyscallEvent};
use crate::memory::TraceeMemory;
use crate::scratch::Scratch;
use crate::sockaddr::{self, msghdr};
use crate::sockets::{SocketMeta, SocketTables};

const DNS_PORT: u16 = 53;

/// Where rewritten destinations point, and what gets rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewritePolicy {
    pub tcp_port: u16,
    pub udp_port: u16,
    /// Leave UDP alone except DNS queries.
    pub no_udp: bool,
}

impl RewritePolicy {
    fn port_for(&self, network: Network) -> u16 {
        match network {
            Network::Tcp => self.tcp_port,
            Network::Udp => self.udp_port,
        }
    }
}

/// Location of a destination address in the tracee.
#[derive(Debug, Clone, Copy)]
enum Site {
    /// Address pointer and length are syscall arguments (connect, sendto).
    Args { addr: usize, len: usize },
    /// Address lives behind `msghdr.msg_name` (sendmsg).
    MsgName { msghdr: u64 },
}

/// Syscall entry/exit logic, independent of registers and of ptrace itself.
pub struct Handler {
    table: Arc<AddressTable>,
    policy: RewritePolicy,
    sockets: SocketTables,
    scratch: Scratch,
}

impl Handler {
    pub fn new(table: Arc<AddressTable>, policy: RewritePolicy) -> Self {
        Self {
            table,
            policy,
            sockets: SocketTables::new(),
            scratch: Scratch::new(),
        }
    }

    pub fn sockets(&self) -> &SocketTables {
        &self.sockets
    }

    pub fn on_fork(&mut self, parent: i32, child: i32) {
        self.sockets.fork(parent, child);
    }

    pub fn on_clone(&mut self, parent: i32, child: i32) {
        self.sockets.share(parent, child);
    }

    pub fn on_process_exit(&mut self, pid: i32) {
        self.sockets.remove_process(pid);
        self.scratch.remove_process(pid);
    }

    pub fn on_entry(&mut self, mem: &mut dyn TraceeMemory, event: &mut SyscallEvent) {
        let pid = event.pid;
        match event.syscall {
            Syscall::Socket => {
                let family = event.arg(0) as i32;
                let sock_type = event.arg(1) as i32 & 0xf;
                if family == libc::AF_INET6 && matches!(sock_type, libc::SOCK_STREAM | libc::SOCK_DGRAM) {
                    // many loopback addresses exist for IPv4, only one for IPv6
                    event.set_arg(0, libc::AF_INET as u64);
                    tracing::trace!(pid, "forcing AF_INET6 socket to AF_INET");
                }
                self.scratch.save(pid, Syscall::Socket, event.args());
            }
            Syscall::Fcntl => self.scratch.save(pid, Syscall::Fcntl, event.args()),
            Syscall::Close => {
                self.sockets.remove(pid, event.arg(0) as i32);
            }
            Syscall::Connect => self.rewrite(mem, event, Site::Args { addr: 1, len: 2 }),
            Syscall::SendTo => {
                // plain send(): no destination
                if event.arg(5) == 0 || event.arg(4) == 0 {
                    return;
                }
                self.rewrite(mem, event, Site::Args { addr: 4, len: 5 });
            }
            Syscall::SendMsg => {
                let site = Site::MsgName { msghdr: event.arg(1) };
                self.rewrite(mem, event, site);
            }
        }
    }

    pub fn on_exit(&mut self, event: &SyscallEvent) {
        let pid = event.pid;
        match event.syscall {
            Syscall::Socket => {
                let Some(args) = self.scratch.take(pid, Syscall::Socket) else {
                    return;
                };
                if event.ret() < 0 {
                    return;
                }
                let fd = event.ret() as i32;
                let meta = SocketMeta::new(args[0] as i32, args[1] as i32, args[2] as i32);
                tracing::trace!(pid, fd, family = meta.family, network = ?meta.network(), "socket created");
                self.sockets.insert(pid, fd, meta);
            }
            Syscall::Fcntl => {
                let Some(args) = self.scratch.take(pid, Syscall::Fcntl) else {
                    return;
                };
                if !matches!(args[1] as i32, libc::F_DUPFD | libc::F_DUPFD_CLOEXEC) || event.ret() < 0 {
                    return;
                }
                let (fd, new_fd) = (args[0] as i32, event.ret() as i32);
                if let Some(meta) = self.sockets.get(pid, fd) {
                    tracing::trace!(pid, fd, new_fd, "socket duplicated");
                    self.sockets.insert(pid, new_fd, meta);
                }
            }
            _ => {}
        }
    }

    fn rewrite(&mut self, mem: &mut dyn TraceeMemory, event: &mut SyscallEvent, site: Site) {
        if let Err(e) = self.try_rewrite(mem, event, site) {
            tracing::debug!(pid = event.pid, syscall = ?event.syscall, error = %e, "destination left unmodified");
        }
    }

    fn try_rewrite(&mut self, mem: &mut dyn TraceeMemory, event: &mut SyscallEvent, site: Site) -> Result<(), TraceError> {
        let pid = event.pid;
        let fd = event.arg(0) as i32;
        let Some(meta) = self.sockets.get(pid, fd) else {
            tracing::trace!(pid, fd, "no metadata for descriptor");
            return Ok(());
        };
        if !meta.is_inet() {
            return Ok(());
        }
        let Some(network) = meta.network() else {
            return Ok(());
        };

        let (addr_ptr, addr_len) = match site {
            Site::Args { addr, len } => (event.arg(addr), event.arg(len) as usize),
            Site::MsgName { msghdr: ptr } => {
                let mut raw = [0u8; msghdr::LEN];
                mem.read(pid, ptr, &mut raw)?;
                (msghdr::name(&raw), msghdr::namelen(&raw) as usize)
            }
        };
        if addr_ptr == 0 || addr_len == 0 {
            return Ok(());
        }

        let mut raw = vec![0u8; addr_len.min(sockaddr::SOCKADDR_MAX_LEN)];
        mem.read(pid, addr_ptr, &mut raw)?;
        let dest = sockaddr::parse(&raw)?;

        let Some(new_dest) = self.plan(meta, network, dest) else {
            return Ok(());
        };
        let Some(encoded) = encode_for(meta.family, new_dest) else {
            tracing::trace!(pid, dest = %new_dest, "destination cannot be expressed in the socket's family");
            return Ok(());
        };
        if encoded.len() > addr_len {
            // never write past the tracee's buffer
            return Ok(());
        }

        mem.write(pid, addr_ptr, &encoded)?;
        if encoded.len() != addr_len {
            match site {
                Site::Args { len, .. } => event.set_arg(len, encoded.len() as u64),
                Site::MsgName { msghdr: ptr } => {
                    let len = (encoded.len() as u32).to_ne_bytes();
                    mem.write(pid, ptr + msghdr::NAMELEN_OFFSET as u64, &len)?;
                }
            }
        }

        tracing::debug!(pid, network = %network, from = %dest, to = %new_dest, "destination rewritten");
        Ok(())
    }

    /// Decide the new destination for `dest`, or `None` to leave it alone.
    fn plan(&self, meta: SocketMeta, network: Network, dest: SocketAddr) -> Option<SocketAddr> {
        let port = dest.port();
        if network == Network::Udp && port == 0 {
            return None;
        }
        let is_dns = network == Network::Udp && port == DNS_PORT;
        let ip = canonical_v4(dest.ip()).map(IpAddr::V4).unwrap_or(dest.ip());

        if network == Network::Udp && self.policy.no_udp && !is_dns {
            // UDP bypasses the redirector, but reserved addresses mean nothing
            // outside this process
            if is_reserved(ip) {
                return self.table.real_ip(ip).map(|real| SocketAddr::new(real, port));
            }
            return None;
        }

        if ip.is_loopback() && !is_dns {
            if ip.is_ipv6() && meta.family == libc::AF_INET {
                return Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
            }
            return None;
        }

        let target = if is_reserved(ip) {
            match self.table.get_projection(ip) {
                Some(domain) => format!("{}:{}", domain, port),
                None => SocketAddr::new(ip, port).to_string(),
            }
        } else {
            SocketAddr::new(ip, port).to_string()
        };
        let synthetic = self.table.alloc_projection(&target);
        Some(SocketAddr::from((synthetic, self.policy.port_for(network))))
    }
}

/// Encode `addr` for a socket of `family`: IPv4 destinations on a genuine
/// AF_INET6 socket become IPv4-mapped IPv6 addresses.
fn encode_for(family: i32, addr: SocketAddr) -> Option<Vec<u8>> {
    match (family, addr) {
        (libc::AF_INET, SocketAddr::V4(v4)) => Some(sockaddr::encode_v4(v4)),
        (libc::AF_INET6, SocketAddr::V4(v4)) => Some(sockaddr::encode_v6(SocketAddrV6::new(
            v4.ip().to_ipv6_mapped(),
            v4.port(),
            0,
            0,
        ))),
        (libc::AF_INET6, SocketAddr::V6(v6)) => Some(sockaddr::encode_v6(v6)),
        (libc::AF_INET, SocketAddr::V6(v6)) => canonical_v4(IpAddr::V6(*v6.ip()))
            .map(|ip| sockaddr::encode_v4(SocketAddrV4::new(ip, v6.port()))),
        _ => None,
    }
}
