//! Byte-level access to a tracee's address space.

use std::cmp::min;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Transfer unit of the `PEEKDATA`/`POKEDATA` requests.
const WORD: usize = std::mem::size_of::<libc::c_long>();

/// Errors from tracee memory access.
#[derive(thiserror::Error, Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemError {
    /// The address is not mapped in the tracee.
    #[error("unmapped tracee address {addr:#x}")]
    Faulted { addr: u64 },

    /// The tracee is gone, or not traceable by this thread.
    #[error("tracee {pid} is not traceable")]
    Detached { pid: Pid },
}

/// Capability to read and write the memory of a stopped tracee.
///
/// Only valid while the tracee is in a ptrace-stop; results are undefined
/// while it runs.
pub trait MemIo {
    /// Read up to `buf.len()` bytes at `addr`, returning how many were read.
    ///
    /// A fault behind a mapped prefix yields a short read rather than an
    /// error, so callers can consume data up to a page boundary.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemError>;

    /// Write up to `data.len()` bytes at `addr`, returning how many were
    /// written.
    fn write(&self, addr: u64, data: &[u8]) -> Result<usize, MemError>;
}

/// [`MemIo`] over word-sized ptrace peeks and pokes.
#[derive(Clone, Copy, Debug)]
pub struct PtraceMem {
    pid: Pid,
}

impl PtraceMem {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn peek(&self, addr: u64) -> Result<libc::c_long, MemError> {
        ptrace::read(self.pid, addr as usize as ptrace::AddressType)
            .map_err(|errno| self.classify(errno, addr))
    }

    fn poke(&self, addr: u64, word: libc::c_long) -> Result<(), MemError> {
        ptrace::write(self.pid, addr as usize as ptrace::AddressType, word)
            .map_err(|errno| self.classify(errno, addr))
    }

    fn classify(&self, errno: Errno, addr: u64) -> MemError {
        match errno {
            Errno::ESRCH => MemError::Detached { pid: self.pid },
            _ => MemError::Faulted { addr },
        }
    }
}

impl MemIo for PtraceMem {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemError> {
        let mut done = 0;
        while done < buf.len() {
            let word = match self.peek(addr + done as u64) {
                Ok(word) => word.to_ne_bytes(),
                Err(err @ MemError::Detached { .. }) => return Err(err),
                Err(err) => return if done > 0 { Ok(done) } else { Err(err) },
            };

            let n = min(WORD, buf.len() - done);
            buf[done..done + n].copy_from_slice(&word[..n]);
            done += n;
        }

        Ok(done)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<usize, MemError> {
        let mut done = 0;

        let mut words = data.chunks_exact(WORD);
        for chunk in &mut words {
            let word = libc::c_long::from_ne_bytes(chunk.try_into().expect("word-sized chunk"));

            match self.poke(addr + done as u64, word) {
                Ok(()) => done += WORD,
                Err(err @ MemError::Detached { .. }) => return Err(err),
                Err(err) => return if done > 0 { Ok(done) } else { Err(err) },
            }
        }

        let tail = words.remainder();
        if !tail.is_empty() {
            // Patch the trailing partial word with a read-modify-write, so
            // the bytes past `data` are preserved.
            let at = addr + done as u64;

            let mut word = match self.peek(at) {
                Ok(word) => word.to_ne_bytes(),
                Err(err @ MemError::Detached { .. }) => return Err(err),
                Err(err) => return if done > 0 { Ok(done) } else { Err(err) },
            };
            word[..tail.len()].copy_from_slice(tail);

            match self.poke(at, libc::c_long::from_ne_bytes(word)) {
                Ok(()) => done += tail.len(),
                Err(err @ MemError::Detached { .. }) => return Err(err),
                Err(err) => return if done > 0 { Ok(done) } else { Err(err) },
            }
        }

        Ok(done)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{MemError, MemIo};

    /// In-memory [`MemIo`] backing decoder tests.
    pub(crate) struct SliceMem {
        pub base: u64,
        pub bytes: Vec<u8>,
    }

    impl MemIo for SliceMem {
        fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemError> {
            let off = addr
                .checked_sub(self.base)
                .map(|off| off as usize)
                .filter(|off| *off < self.bytes.len())
                .ok_or(MemError::Faulted { addr })?;

            let n = buf.len().min(self.bytes.len() - off);
            buf[..n].copy_from_slice(&self.bytes[off..off + n]);
            Ok(n)
        }

        fn write(&self, addr: u64, _data: &[u8]) -> Result<usize, MemError> {
            Err(MemError::Faulted { addr })
        }
    }
}
