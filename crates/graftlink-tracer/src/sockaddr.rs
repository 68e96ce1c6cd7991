//! Raw `sockaddr` and `msghdr` layouts as seen in tracee memory.

use std::mem::{offset_of, size_of};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::TraceError;

pub const SOCKADDR_IN_LEN: usize = size_of::<libc::sockaddr_in>();
pub const SOCKADDR_IN6_LEN: usize = size_of::<libc::sockaddr_in6>();
/// Upper bound for reading a tracee-supplied address.
pub const SOCKADDR_MAX_LEN: usize = size_of::<libc::sockaddr_storage>();

/// Decode an AF_INET or AF_INET6 socket address.
pub fn parse(bytes: &[u8]) -> Result<SocketAddr, TraceError> {
    if bytes.len() < 2 {
        return Err(TraceError::Sockaddr("shorter than the family field"));
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    match family as i32 {
        libc::AF_INET => {
            if bytes.len() < SOCKADDR_IN_LEN {
                return Err(TraceError::Sockaddr("truncated sockaddr_in"));
            }
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            if bytes.len() < SOCKADDR_IN6_LEN {
                return Err(TraceError::Sockaddr("truncated sockaddr_in6"));
            }
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let flowinfo = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[8..24]);
            let scope_id = u32::from_ne_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        _ => Err(TraceError::UnsupportedFamily(family)),
    }
}

/// Encode a `sockaddr_in`.
pub fn encode_v4(addr: SocketAddrV4) -> Vec<u8> {
    let mut out = vec![0u8; SOCKADDR_IN_LEN];
    out[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..8].copy_from_slice(&addr.ip().octets());
    out
}

/// Encode a `sockaddr_in6`.
pub fn encode_v6(addr: SocketAddrV6) -> Vec<u8> {
    let mut out = vec![0u8; SOCKADDR_IN6_LEN];
    out[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..8].copy_from_slice(&addr.flowinfo().to_be_bytes());
    out[8..24].copy_from_slice(&addr.ip().octets());
    out[24..28].copy_from_slice(&addr.scope_id().to_ne_bytes());
    out
}

/// Native `struct msghdr` layout of the tracee.
pub mod msghdr {
    use super::*;

    pub const LEN: usize = size_of::<libc::msghdr>();
    pub const NAME_OFFSET: usize = offset_of!(libc::msghdr, msg_name);
    pub const NAMELEN_OFFSET: usize = offset_of!(libc::msghdr, msg_namelen);
    const PTR_LEN: usize = size_of::<*mut libc::c_void>();

    /// The `msg_name` pointer of a raw msghdr.
    pub fn name(raw: &[u8]) -> u64 {
        let bytes = &raw[NAME_OFFSET..NAME_OFFSET + PTR_LEN];
        let mut word = [0u8; 8];
        if cfg!(target_endian = "little") {
            word[..PTR_LEN].copy_from_slice(bytes);
            u64::from_le_bytes(word)
        } else {
            word[8 - PTR_LEN..].copy_from_slice(bytes);
            u64::from_be_bytes(word)
        }
    }

    /// The `msg_namelen` field of a raw msghdr.
    pub fn namelen(raw: &[u8]) -> u32 {
        let bytes = &raw[NAMELEN_OFFSET..NAMELEN_OFFSET + 4];
        u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4() {
        let bytes = encode_v4("93.184.216.34:443".parse().unwrap());
        assert_eq!(bytes.len(), 16);
        assert_eq!(parse(&bytes).unwrap(), "93.184.216.34:443".parse().unwrap());
        assert!(parse(&bytes[..8]).is_err());
    }

    #[test]
    fn test_parse_v6_keeps_scope() {
        let addr = SocketAddrV6::new("fe80::1".parse().unwrap(), 8080, 0, 2);
        let bytes = encode_v6(addr);
        assert_eq!(bytes.len(), 28);
        assert_eq!(parse(&bytes).unwrap(), SocketAddr::V6(addr));
    }

    #[test]
    fn test_unix_family_is_unsupported() {
        let mut bytes = vec![0u8; 110];
        bytes[0..2].copy_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
        assert!(matches!(parse(&bytes), Err(TraceError::UnsupportedFamily(_))));
    }

    #[test]
    fn test_msghdr_fields() {
        let mut raw = vec![0u8; msghdr::LEN];
        let name = 0x7fff_0000_1000u64 as usize;
        raw[msghdr::NAME_OFFSET..msghdr::NAME_OFFSET + size_of::<usize>()]
            .copy_from_slice(&name.to_ne_bytes());
        raw[msghdr::NAMELEN_OFFSET..msghdr::NAMELEN_OFFSET + 4].copy_from_slice(&28u32.to_ne_bytes());
        assert_eq!(msghdr::name(&raw), name as u64);
        assert_eq!(msghdr::namelen(&raw), 28);
    }
}
