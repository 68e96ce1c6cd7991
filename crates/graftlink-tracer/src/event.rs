/// Syscalls the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Socket,
    Connect,
    SendTo,
    SendMsg,
    /// `fcntl`, or `fcntl64` on 32-bit targets.
    Fcntl,
    Close,
}

/// Architecture-neutral view of one syscall stop.
///
/// Handlers read and change arguments here; the tracer writes the
/// registers back only when something changed.
#[derive(Debug, Clone)]
pub struct SyscallEvent {
    pub pid: i32,
    pub syscall: Syscall,
    args: [u64; 6],
    ret: i64,
    dirty: bool,
}

impl SyscallEvent {
    pub fn new(pid: i32, syscall: Syscall, args: [u64; 6], ret: i64) -> Self {
        Self {
            pid,
            syscall,
            args,
            ret,
            dirty: false,
        }
    }

    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    pub fn args(&self) -> [u64; 6] {
        self.args
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.args.get_mut(index) {
            if *slot != value {
                *slot = value;
                self.dirty = true;
            }
        }
    }

    /// Return value at an exit stop; negative values are `-errno`.
    pub fn ret(&self) -> i64 {
        self.ret
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_arg_tracks_changes() {
        let mut event = SyscallEvent::new(1, Syscall::Connect, [3, 0x1000, 16, 0, 0, 0], 0);
        event.set_arg(2, 16);
        assert!(!event.is_dirty());
        event.set_arg(2, 28);
        assert!(event.is_dirty());
        assert_eq!(event.arg(2), 28);
        event.set_arg(9, 1);
        assert_eq!(event.arg(9), 0);
    }
}
