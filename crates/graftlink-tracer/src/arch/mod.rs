//! Per-architecture register access. Each backend exposes the same
//! `Registers` surface; the rest of the engine never touches raw registers.

use crate::event::Syscall;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::Registers;

#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86")]
pub use self::x86::Registers;

#[cfg(target_arch = "arm")]
mod arm;
#[cfg(target_arch = "arm")]
pub use self::arm::Registers;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::Registers;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
compile_error!("graftlink-tracer supports x86, x86_64, arm and aarch64");

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
const NT_PRSTATUS: usize = 1;

/// Map a raw syscall number to the syscalls the engine handles.
pub fn classify(nr: i64) -> Option<Syscall> {
    let syscall = match nr {
        n if n == libc::SYS_socket as i64 => Syscall::Socket,
        n if n == libc::SYS_connect as i64 => Syscall::Connect,
        n if n == libc::SYS_sendto as i64 => Syscall::SendTo,
        n if n == libc::SYS_sendmsg as i64 => Syscall::SendMsg,
        n if n == libc::SYS_fcntl as i64 => Syscall::Fcntl,
        #[cfg(any(target_arch = "x86", target_arch = "arm"))]
        n if n == libc::SYS_fcntl64 as i64 => Syscall::Fcntl,
        n if n == libc::SYS_close as i64 => Syscall::Close,
        _ => return None,
    };
    Some(syscall)
}

/// Read a full `NT_PRSTATUS` register set into `regs`.
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
fn get_regset<T>(pid: nix::unistd::Pid, regs: &mut T) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: regs as *mut T as *mut libc::c_void,
        iov_len: std::mem::size_of::<T>(),
    };
    // SAFETY: the kernel writes at most `iov_len` bytes into `regs`.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc == -1 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
fn set_regset<T>(pid: nix::unistd::Pid, regs: &T) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: regs as *const T as *mut libc::c_void,
        iov_len: std::mem::size_of::<T>(),
    };
    // SAFETY: SETREGSET only reads `iov_len` bytes from `regs`.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc == -1 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_syscalls() {
        assert_eq!(classify(libc::SYS_connect as i64), Some(Syscall::Connect));
        assert_eq!(classify(libc::SYS_close as i64), Some(Syscall::Close));
        assert_eq!(classify(libc::SYS_read as i64), None);
    }
}
