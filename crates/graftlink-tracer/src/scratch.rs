use std::collections::HashMap;

use crate::event::Syscall;

/// Arguments saved at a syscall's entry for use at its exit.
///
/// The exit stop of `socket` and `fcntl` needs the arguments as they were
/// executed; registers may have been clobbered by then.
#[derive(Debug, Default)]
pub struct Scratch {
    saved: HashMap<(i32, Syscall), [u64; 6]>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&mut self, pid: i32, syscall: Syscall, args: [u64; 6]) {
        self.saved.insert((pid, syscall), args);
    }

    pub fn take(&mut self, pid: i32, syscall: Syscall) -> Option<[u64; 6]> {
        self.saved.remove(&(pid, syscall))
    }

    pub fn remove_process(&mut self, pid: i32) {
        self.saved.retain(|(owner, _), _| *owner != pid);
    }
}
