use nix::sys::ptrace;
use nix::unistd::Pid;

/// i386: arguments in ebx, ecx, edx, esi, edi, ebp; number in orig_eax.
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
        self.0.orig_eax as i64
    }

    pub fn is_entry(&self) -> bool {
        self.0.eax as i64 == -(libc::ENOSYS as i64)
    }

    pub fn return_value(&self) -> i64 {
        self.0.eax as i64
    }

    pub fn args(&self) -> [u64; 6] {
        let r = &self.0;
        [r.ebx, r.ecx, r.edx, r.esi, r.edi, r.ebp].map(|v| v as u32 as u64)
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        let r = &mut self.0;
        let value = value as u32 as libc::c_long;
        match index {
            0 => r.ebx = value,
            1 => r.ecx = value,
            2 => r.edx = value,
            3 => r.esi = value,
            4 => r.edi = value,
            5 => r.ebp = value,
            _ => {}
        }
    }
}
