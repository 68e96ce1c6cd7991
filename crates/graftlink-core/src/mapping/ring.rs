use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Bidirectional allocator handing out addresses from a fixed IPv4 range.
///
/// The cursor wraps to the start of the range once the last address has
/// been handed out. Reusing an address evicts the target that held it, in
/// both directions, so a stale synthetic address never resolves to the
/// wrong target.
#[derive(Debug)]
pub struct RingAllocator {
    first: u32,
    last: u32,
    next: u32,
    forward: HashMap<String, Ipv4Addr>,
    reverse: HashMap<Ipv4Addr, String>,
}

impl RingAllocator {
    /// Create an allocator over `first..=last`. Arguments are swapped if
    /// given in the wrong order.
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        let (a, b) = (u32::from(first), u32::from(last));
        let (first, last) = if a <= b { (a, b) } else { (b, a) };
        Self {
            first,
            last,
            next: first,
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Return the address memoized for `target`, allocating one if needed.
    pub fn allocate(&mut self, target: &str) -> Ipv4Addr {
        if let Some(&ip) = self.forward.get(target) {
            return ip;
        }

        let ip = Ipv4Addr::from(self.next);
        self.next = if self.next >= self.last {
            self.first
        } else {
            self.next + 1
        };

        if let Some(evicted) = self.reverse.insert(ip, target.to_owned()) {
            self.forward.remove(&evicted);
            tracing::debug!(addr = %ip, evicted = %evicted, target, "address range wrapped, evicting mapping");
        }
        self.forward.insert(target.to_owned(), ip);

        ip
    }

    /// Whether `ip` falls inside this allocator's range.
    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.first..=self.last).contains(&u32::from(ip))
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<&str> {
        self.reverse.get(&ip).map(String::as_str)
    }

    pub fn get(&self, target: &str) -> Option<Ipv4Addr> {
        self.forward.get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
