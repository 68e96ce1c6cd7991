use nix::unistd::Pid;

/// `struct user_pt_regs`.
#[repr(C)]
#[derive(Clone, Copy)]
struct UserPtRegs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

/// aarch64: arguments in x0..x5; number in x8.
#[derive(Clone, Copy)]
pub struct Registers(UserPtRegs);

impl Registers {
    pub fn fetch(pid: Pid) -> nix::Result<Self> {
        let mut regs = UserPtRegs {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        };
        super::get_regset(pid, &mut regs)?;
        Ok(Self(regs))
    }

    pub fn store(&self, pid: Pid) -> nix::Result<()> {
        super::set_regset(pid, &self.0)
    }

    pub fn syscall_number(&self) -> i64 {
        self.0.regs[8] as i64
    }

    /// x7 is 0 at syscall entry and 1 at exit.
    pub fn is_entry(&self) -> bool {
        self.0.regs[7] == 0
    }

    pub fn return_value(&self) -> i64 {
        self.0.regs[0] as i64
    }

    pub fn args(&self) -> [u64; 6] {
        let r = &self.0.regs;
        [r[0], r[1], r[2], r[3], r[4], r[5]]
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        if index < 6 {
            self.0.regs[index] = value;
        }
    }
}
