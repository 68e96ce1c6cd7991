mod ring;

pub use ring::RingAllocator;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use dashmap::DashMap;

/// First and last address handed out for literal `host:port` targets.
pub const LOOPBACK_RANGE: (Ipv4Addr, Ipv4Addr) =
    (Ipv4Addr::new(127, 0, 0, 2), Ipv4Addr::new(127, 255, 255, 254));

/// First and last address handed out for domain names (RFC 2544 benchmarking range).
pub const RESERVED_RANGE: (Ipv4Addr, Ipv4Addr) =
    (Ipv4Addr::new(198, 18, 0, 1), Ipv4Addr::new(198, 19, 255, 254));

/// Returns true for addresses inside `198.18.0.0/15`, including the
/// IPv4-mapped IPv6 form.
pub fn is_reserved(ip: IpAddr) -> bool {
    match canonical_v4(ip) {
        Some(v4) => {
            let [a, b, _, _] = v4.octets();
            a == 198 && b & 0xfe == 18
        }
        None => false,
    }
}

/// Unwrap `::ffff:a.b.c.d` to its IPv4 form.
pub fn canonical_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

struct Allocators {
    loopback: RingAllocator,
    reserved: RingAllocator,
}

/// Address virtualization table shared by the tracer and the redirector.
///
/// Literal targets (anything containing `:`, i.e. `host:port`) are
/// projected onto `127.0.0.2 - 127.255.255.254`; bare domain names are
/// projected onto `198.18.0.1 - 198.19.255.254`. Both directions are
/// memoized until the range wraps around.
pub struct AddressTable {
    allocators: Mutex<Allocators>,
    /// Fake IP -> real resolved IP, filled in after DNS hijacking.
    real_ips: DashMap<Ipv4Addr, IpAddr>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::with_ranges(LOOPBACK_RANGE, RESERVED_RANGE)
    }

    /// Build a table over custom inclusive ranges.
    pub fn with_ranges(loopback: (Ipv4Addr, Ipv4Addr), reserved: (Ipv4Addr, Ipv4Addr)) -> Self {
        Self {
            allocators: Mutex::new(Allocators {
                loopback: RingAllocator::new(loopback.0, loopback.1),
                reserved: RingAllocator::new(reserved.0, reserved.1),
            }),
            real_ips: DashMap::new(),
        }
    }

    /// Allocate (or reuse) the synthetic address for `target`.
    pub fn alloc_projection(&self, target: &str) -> Ipv4Addr {
        let mut allocators = self.lock();
        if target.contains(':') {
            allocators.loopback.allocate(target)
        } else {
            let fresh = allocators.reserved.get(target).is_none();
            let ip = allocators.reserved.allocate(target);
            if fresh {
                // a recycled fake IP must not keep the previous domain's real address
                self.real_ips.remove(&ip);
            }
            ip
        }
    }

    /// Resolve a synthetic address back to the target it was allocated for.
    pub fn get_projection(&self, ip: IpAddr) -> Option<String> {
        let v4 = canonical_v4(ip)?;
        let allocators = self.lock();
        if allocators.reserved.contains(v4) {
            allocators.reserved.lookup(v4).map(str::to_owned)
        } else if allocators.loopback.contains(v4) {
            allocators.loopback.lookup(v4).map(str::to_owned)
        } else {
            None
        }
    }

    pub fn set_real_ip(&self, fake: Ipv4Addr, real: IpAddr) {
        self.real_ips.insert(fake, real);
    }

    pub fn real_ip(&self, fake: IpAddr) -> Option<IpAddr> {
        let v4 = canonical_v4(fake)?;
        self.real_ips.get(&v4).map(|entry| *entry.value())
    }

    /// Number of live projections (literal, domain).
    pub fn allocated_count(&self) -> (usize, usize) {
        let allocators = self.lock();
        (allocators.loopback.len(), allocators.reserved.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Allocators> {
        self.allocators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}
