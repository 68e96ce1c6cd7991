use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use ipnet::IpNet;

/// Largest datagram buffer ever used for a relay.
pub const MAX_MTU: usize = 65535;

/// Longest-prefix table from interface networks to their MTU.
#[derive(Debug, Default, Clone)]
pub struct MtuTable {
    /// Sorted by prefix length, longest first.
    entries: Vec<(IpNet, usize)>,
}

impl MtuTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, mtu: usize) {
        let net = net.trunc();
        self.entries.retain(|(existing, _)| *existing != net);
        let pos = self
            .entries
            .iter()
            .position(|(existing, _)| existing.prefix_len() < net.prefix_len())
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (net, mtu));
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<usize> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, mtu)| *mtu)
    }

    /// Buffer size for a socket bound to `ip`; unknown or unspecified
    /// addresses get [`MAX_MTU`].
    pub fn buffer_size(&self, ip: IpAddr) -> usize {
        self.lookup(ip).unwrap_or(MAX_MTU).clamp(1, MAX_MTU)
    }

    /// Build the table from the host's interfaces.
    pub fn from_system() -> Self {
        let mut table = Self::new();
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate interfaces, using maximum MTU");
                return table;
            }
        };

        for ifaddr in addrs {
            let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
                continue;
            };
            let Some(mtu) = read_mtu(&ifaddr.interface_name) else {
                continue;
            };

            let net = if let (Some(addr), Some(mask)) = (address.as_sockaddr_in(), netmask.as_sockaddr_in()) {
                let ip = *SocketAddrV4::from(*addr).ip();
                let prefix = u32::from(*SocketAddrV4::from(*mask).ip()).count_ones() as u8;
                IpNet::new(IpAddr::V4(ip), prefix).ok()
            } else if let (Some(addr), Some(mask)) = (address.as_sockaddr_in6(), netmask.as_sockaddr_in6()) {
                let ip = *SocketAddrV6::from(*addr).ip();
                let prefix = u128::from(*SocketAddrV6::from(*mask).ip()).count_ones() as u8;
                IpNet::new(IpAddr::V6(ip), prefix).ok()
            } else {
                None
            };

            if let Some(net) = net {
                tracing::trace!(interface = %ifaddr.interface_name, net = %net, mtu, "interface MTU");
                table.insert(net, mtu);
            }
        }

        table
    }
}

fn read_mtu(interface: &str) -> Option<usize> {
    std::fs::read_to_string(format!("/sys/class/net/{}/mtu", interface))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let mut table = MtuTable::new();
        table.insert("10.0.0.0/8".parse().unwrap(), 1500);
        table.insert("10.1.0.0/16".parse().unwrap(), 1400);
        table.insert("0.0.0.0/0".parse().unwrap(), 9000);

        assert_eq!(table.lookup("10.1.2.3".parse().unwrap()), Some(1400));
        assert_eq!(table.lookup("10.2.2.3".parse().unwrap()), Some(1500));
        assert_eq!(table.lookup("192.168.1.1".parse().unwrap()), Some(9000));
        assert_eq!(table.lookup("::1".parse().unwrap()), None);
    }

    #[test]
    fn test_insert_normalizes_host_bits() {
        let mut table = MtuTable::new();
        table.insert("192.168.1.77/24".parse().unwrap(), 1500);
        table.insert("192.168.1.0/24".parse().unwrap(), 1492);
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.lookup("192.168.1.1".parse().unwrap()), Some(1492));
    }

    #[test]
    fn test_unknown_address_gets_max_buffer() {
        let mut table = MtuTable::new();
        table.insert("127.0.0.0/8".parse().unwrap(), 65536);
        assert_eq!(table.buffer_size("0.0.0.0".parse().unwrap()), MAX_MTU);
        assert_eq!(table.buffer_size("127.0.0.1".parse().unwrap()), MAX_MTU);
    }
}
