use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use graftlink_core::upstream::Network;

/// What `socket(2)` was called with, as executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketMeta {
    pub family: i32,
    pub sock_type: i32,
    pub protocol: i32,
}

impl SocketMeta {
    pub fn new(family: i32, sock_type: i32, protocol: i32) -> Self {
        Self {
            family,
            sock_type,
            protocol,
        }
    }

    pub fn is_inet(&self) -> bool {
        matches!(self.family, libc::AF_INET | libc::AF_INET6)
    }

    /// Transport carried by the socket; `None` for anything but TCP and UDP.
    pub fn network(&self) -> Option<Network> {
        // the type argument carries SOCK_NONBLOCK / SOCK_CLOEXEC flags
        match self.sock_type & 0xf {
            libc::SOCK_STREAM => match self.protocol {
                0 | libc::IPPROTO_TCP => Some(Network::Tcp),
                _ => None,
            },
            libc::SOCK_DGRAM => match self.protocol {
                0 | libc::IPPROTO_UDP | libc::IPPROTO_UDPLITE => Some(Network::Udp),
                _ => None,
            },
            _ => None,
        }
    }
}

type FdTable = Arc<Mutex<HashMap<i32, SocketMeta>>>;

fn lock(table: &FdTable) -> MutexGuard<'_, HashMap<i32, SocketMeta>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Socket metadata per traced process.
///
/// Processes created by fork/vfork get a copy of the parent's table; threads
/// created by clone share the parent's table, as they share descriptors.
#[derive(Debug, Default)]
pub struct SocketTables {
    tables: HashMap<i32, FdTable>,
}

impl SocketTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pid: i32, fd: i32) -> Option<SocketMeta> {
        lock(self.tables.get(&pid)?).get(&fd).copied()
    }

    pub fn insert(&mut self, pid: i32, fd: i32, meta: SocketMeta) {
        lock(self.tables.entry(pid).or_default()).insert(fd, meta);
    }

    pub fn remove(&mut self, pid: i32, fd: i32) -> Option<SocketMeta> {
        lock(self.tables.get(&pid)?).remove(&fd)
    }

    /// `child` starts with a snapshot of `parent`'s descriptors.
    pub fn fork(&mut self, parent: i32, child: i32) {
        let copy = self
            .tables
            .get(&parent)
            .map(|table| lock(table).clone())
            .unwrap_or_default();
        self.tables.insert(child, Arc::new(Mutex::new(copy)));
    }

    /// `child` shares `parent`'s descriptor table.
    pub fn share(&mut self, parent: i32, child: i32) {
        let table = self.tables.entry(parent).or_default().clone();
        self.tables.insert(child, table);
    }

    /// Forget `pid`; a shared table survives while another thread uses it.
    pub fn remove_process(&mut self, pid: i32) {
        self.tables.remove(&pid);
    }

    pub fn process_count(&self) -> usize {
        self.tables.len()
    }
}
