use nix::unistd::Pid;

/// `struct pt_regs` on 32-bit arm.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Uregs([u32; 18]);

const ARM_IP: usize = 12;
const ARM_ORIG_R0: usize = 17;

/// arm: first argument in ORIG_r0, the rest in r1..r5; number in r7.
#[derive(Clone, Copy)]
pub struct Registers(Uregs);

impl Registers {
    pub fn fetch(pid: Pid) -> nix::Result<Self> {
        let mut regs = Uregs::default();
        super::get_regset(pid, &mut regs)?;
        Ok(Self(regs))
    }

    pub fn store(&self, pid: Pid) -> nix::Result<()> {
        super::set_regset(pid, &self.0)
    }

    pub fn syscall_number(&self) -> i64 {
        self.0 .0[7] as i64
    }

    /// ip (r12) is 0 at syscall entry and 1 at exit.
    pub fn is_entry(&self) -> bool {
        self.0 .0[ARM_IP] == 0
    }

    pub fn return_value(&self) -> i64 {
        self.0 .0[0] as i32 as i64
    }

    pub fn args(&self) -> [u64; 6] {
        let r = &self.0 .0;
        [r[ARM_ORIG_R0], r[1], r[2], r[3], r[4], r[5]].map(u64::from)
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        let slot = match index {
            0 => ARM_ORIG_R0,
            1..=5 => index,
            _ => return,
        };
        self.0 .0[slot] = value as u32;
    }
}
