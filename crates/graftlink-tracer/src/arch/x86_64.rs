use nix::sys::ptrace;
use nix::unistd::Pid;

/// x86_64: arguments in rdi, rsi, rdx, r10, r8, r9; number in orig_rax.
#[derive(Clone, Copy)]
pub struct Registers(libc::user_regs_struct);

impl Registers {
    pub fn fetch(pid: Pid) -> nix::Result<Self> {
        ptrace::getregs(pid).map(Self)
    }

    pub fn store(&self, pid: Pid) -> nix::Result<()> {
        ptrace::setregs(pid, self.0)
    }

    pub fn syscall_number(&self) -> i64 {
        self.0.orig_rax as i64
    }

    /// The kernel sets rax to -ENOSYS before entering the syscall.
    pub fn is_entry(&self) -> bool {
        self.0.rax as i64 == -(libc::ENOSYS as i64)
    }

    pub fn return_value(&self) -> i64 {
        self.0.rax as i64
    }

    pub fn args(&self) -> [u64; 6] {
        let r = &self.0;
        [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9]
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        let r = &mut self.0;
        match index {
            0 => r.rdi = value,
            1 => r.rsi = value,
            2 => r.rdx = value,
            3 => r.r10 = value,
            4 => r.r8 = value,
            5 => r.r9 = value,
            _ => {}
        }
    }
}
