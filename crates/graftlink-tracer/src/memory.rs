use std::mem::size_of;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::error::TraceError;

const WORD: usize = size_of::<libc::c_long>();

/// Byte-level access to a tracee's address space.
pub trait TraceeMemory {
    fn read(&mut self, pid: i32, addr: u64, buf: &mut [u8]) -> Result<(), TraceError>;

    fn write(&mut self, pid: i32, addr: u64, data: &[u8]) -> Result<(), TraceError>;
}

/// Word-wise `PTRACE_PEEKDATA` / `PTRACE_POKEDATA` access.
#[derive(Debug, Default)]
pub struct PtraceMemory;

impl PtraceMemory {
    fn peek(pid: i32, addr: u64) -> Result<[u8; WORD], TraceError> {
        ptrace::read(Pid::from_raw(pid), addr as ptrace::AddressType)
            .map(|word| word.to_ne_bytes())
            .map_err(|source| TraceError::Memory { addr, source })
    }

    fn poke(pid: i32, addr: u64, word: [u8; WORD]) -> Result<(), TraceError> {
        let value = libc::c_long::from_ne_bytes(word);
        // SAFETY: POKEDATA only touches the tracee's memory; the kernel
        // validates the address.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                pid,
                addr as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        if rc == -1 {
            return Err(TraceError::Memory {
                addr,
                source: Errno::last(),
            });
        }
        Ok(())
    }
}

impl TraceeMemory for PtraceMemory {
    fn read(&mut self, pid: i32, addr: u64, buf: &mut [u8]) -> Result<(), TraceError> {
        for (i, chunk) in buf.chunks_mut(WORD).enumerate() {
            let word = Self::peek(pid, addr + (i * WORD) as u64)?;
            let len = chunk.len();
            chunk.copy_from_slice(&word[..len]);
        }
        Ok(())
    }

    fn write(&mut self, pid: i32, addr: u64, data: &[u8]) -> Result<(), TraceError> {
        for (i, chunk) in data.chunks(WORD).enumerate() {
            let at = addr + (i * WORD) as u64;
            // a trailing partial word keeps the tracee's bytes after it
            let mut word = if chunk.len() < WORD {
                Self::peek(pid, at)?
            } else {
                [0u8; WORD]
            };
            word[..chunk.len()].copy_from_slice(chunk);
            Self::poke(pid, at, word)?;
        }
        Ok(())
    }
}

/// In-memory stand-in for a tracee used by tests: one flat region at `base`.
#[cfg(test)]
pub(crate) struct FakeMemory {
    pub base: u64,
    pub data: Vec<u8>,
}

#[cfg(test)]
impl FakeMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, TraceError> {
        let start = addr
            .checked_sub(self.base)
            .map(|off| off as usize)
            .filter(|off| off + len <= self.data.len())
            .ok_or(TraceError::Memory {
                addr,
                source: Errno::EFAULT,
            })?;
        Ok(start..start + len)
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = (addr - self.base) as usize;
        &self.data[start..start + len]
    }
}

#[cfg(test)]
impl TraceeMemory for FakeMemory {
    fn read(&mut self, _pid: i32, addr: u64, buf: &mut [u8]) -> Result<(), TraceError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, _pid: i32, addr: u64, data: &[u8]) -> Result<(), TraceError> {
        let range = self.range(addr, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_memory_bounds() {
        let mut mem = FakeMemory::new(0x1000, 32);
        mem.write(1, 0x1010, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        mem.read(1, 0x1010, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert!(mem.read(1, 0x0fff, &mut buf).is_err());
        assert!(mem.write(1, 0x101e, b"abcd").is_err());
    }
}
