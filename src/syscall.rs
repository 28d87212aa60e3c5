//! Syscall identity and argument decoding.
//!
//! [`SyscallTable`] maps a syscall number to its symbolic name and
//! per-argument metadata, and turns a raw `(number, args, ret)` triple into a
//! typed [`Syscall`], chasing pointer arguments through the tracee's memory.

use std::cmp::min;
use std::fmt;

use nix::errno::Errno;
use syscalls::Sysno;

use crate::memio::{MemError, MemIo};

/// Cap on a single decoded string argument.
pub const STRING_LIMIT: usize = 4096;

/// Cap on decoded `argv`/`envp` entries.
pub const ARRAY_LIMIT: usize = 64;

/// Cap on decoded I/O buffer dumps.
pub const BYTES_LIMIT: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arch {
    X86_64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Os {
    Linux,
}

/// Pointed-to structures the decoder identifies but does not chase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StructKind {
    Stat,
    Timespec,
    Sigaction,
    Sockaddr,
}

/// Per-argument decode metadata.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArgKind {
    Int,
    UInt,
    Hex,
    Fd,
    /// Pointer to a NUL-terminated string.
    Path,
    /// Pointer to a NULL-terminated array of string pointers.
    StringArray,
    /// I/O buffer whose length lives in another argument slot.
    Bytes { len_arg: usize },
    Ptr,
    StructPtr(StructKind),
}

/// A decoded argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ArgValue {
    Int(i64),
    UInt(u64),
    Hex(u64),
    Fd(i32),
    Path(String),
    Strings(Vec<String>),
    Bytes(Vec<u8>),
    Ptr(u64),
    Struct { kind: StructKind, addr: u64 },
}

/// The `execve` payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Execve {
    pub path: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

/// Syscall-specific payloads.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SyscallData {
    Execve(Execve),
}

/// One decoded syscall.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Syscall {
    /// Syscall number, as captured from the entry stop.
    pub num: u64,

    /// Symbolic name; empty for numbers unknown to the table.
    pub name: &'static str,

    /// The six argument registers in canonical order.
    pub raw_args: [u64; 6],

    /// Typed rendering of the meaningful arguments.
    pub args: Vec<ArgValue>,

    /// Return value, as captured from the exit stop.
    pub ret: i64,

    /// Specialized payload, for calls that carry one.
    pub data: Option<SyscallData>,
}

const GENERIC_ARGS: &[ArgKind] = &[
    ArgKind::Hex,
    ArgKind::Hex,
    ArgKind::Hex,
    ArgKind::Hex,
    ArgKind::Hex,
    ArgKind::Hex,
];

/// Syscall metadata for one `(architecture, os)` pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyscallTable {
    arch: Arch,
    os: Os,
}

impl SyscallTable {
    pub fn new(arch: Arch, os: Os) -> Self {
        Self { arch, os }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn os(&self) -> Os {
        self.os
    }

    /// Symbolic name of `num`, or the empty string when unknown.
    pub fn name(&self, num: u64) -> &'static str {
        Sysno::new(num as usize).map(|sysno| sysno.name()).unwrap_or("")
    }

    pub fn is_execve(&self, num: u64) -> bool {
        num == Sysno::execve as u64
    }

    /// Calls that terminate the task and never reach an exit stop.
    pub fn is_exit_family(&self, num: u64) -> bool {
        num == Sysno::exit as u64 || num == Sysno::exit_group as u64
    }

    /// Decode metadata for the meaningful arguments of `num`.
    ///
    /// Unknown and uncurated numbers fall back to six opaque values.
    pub fn arg_kinds(&self, num: u64) -> &'static [ArgKind] {
        use ArgKind::*;
        use StructKind::*;

        let Some(sysno) = Sysno::new(num as usize) else {
            return GENERIC_ARGS;
        };

        match sysno {
            Sysno::read | Sysno::write => &[Fd, Bytes { len_arg: 2 }, UInt],
            Sysno::pread64 | Sysno::pwrite64 => &[Fd, Bytes { len_arg: 2 }, UInt, UInt],
            Sysno::readv | Sysno::writev => &[Fd, Ptr, UInt],
            Sysno::open => &[Path, Hex, UInt],
            Sysno::openat => &[Fd, Path, Hex],
            Sysno::close => &[Fd],
            Sysno::stat | Sysno::lstat => &[Path, StructPtr(Stat)],
            Sysno::fstat => &[Fd, StructPtr(Stat)],
            Sysno::newfstatat => &[Fd, Path, StructPtr(Stat), Hex],
            Sysno::access => &[Path, Hex],
            Sysno::faccessat | Sysno::faccessat2 => &[Fd, Path, Hex],
            Sysno::pipe | Sysno::pipe2 => &[Ptr],
            Sysno::dup => &[Fd],
            Sysno::dup2 => &[Fd, Fd],
            Sysno::lseek => &[Fd, Int, UInt],
            Sysno::mmap => &[Ptr, UInt, Hex, Hex, Fd, UInt],
            Sysno::mprotect => &[Ptr, UInt, Hex],
            Sysno::munmap => &[Ptr, UInt],
            Sysno::brk => &[Ptr],
            Sysno::ioctl => &[Fd, Hex, Hex],
            Sysno::getpid | Sysno::getppid | Sysno::gettid => &[],
            Sysno::fork | Sysno::vfork => &[],
            Sysno::clone => &[Hex, Ptr, Ptr, Ptr, Hex],
            Sysno::execve => &[Path, StringArray, StringArray],
            Sysno::execveat => &[Fd, Path, StringArray, StringArray, Hex],
            Sysno::exit | Sysno::exit_group => &[Int],
            Sysno::wait4 => &[Int, Ptr, Hex, Ptr],
            Sysno::kill | Sysno::tkill => &[Int, Int],
            Sysno::unlink | Sysno::chdir | Sysno::rmdir => &[Path],
            Sysno::unlinkat => &[Fd, Path, Hex],
            Sysno::mkdir => &[Path, UInt],
            Sysno::mkdirat => &[Fd, Path, UInt],
            Sysno::rename => &[Path, Path],
            Sysno::renameat => &[Fd, Path, Fd, Path],
            Sysno::readlink => &[Path, Ptr, UInt],
            Sysno::readlinkat => &[Fd, Path, Ptr, UInt],
            Sysno::chmod => &[Path, UInt],
            Sysno::chown => &[Path, Int, Int],
            Sysno::getcwd => &[Ptr, UInt],
            Sysno::socket => &[Int, Hex, Int],
            Sysno::connect | Sysno::bind => &[Fd, StructPtr(Sockaddr), UInt],
            Sysno::accept | Sysno::accept4 => &[Fd, StructPtr(Sockaddr), Ptr],
            Sysno::listen => &[Fd, Int],
            Sysno::sendto => &[Fd, Bytes { len_arg: 2 }, UInt, Hex, StructPtr(Sockaddr), UInt],
            Sysno::recvfrom => &[Fd, Bytes { len_arg: 2 }, UInt, Hex, StructPtr(Sockaddr), Ptr],
            Sysno::nanosleep => &[StructPtr(Timespec), StructPtr(Timespec)],
            Sysno::rt_sigaction => &[Int, StructPtr(Sigaction), StructPtr(Sigaction), UInt],
            Sysno::getrandom => &[Bytes { len_arg: 1 }, UInt, Hex],
            _ => GENERIC_ARGS,
        }
    }

    /// Produce the typed event for one completed (or one-way) call.
    ///
    /// Unknown numbers decode to a generic event, never an error; errors come
    /// only from chasing pointer arguments in the tracee.
    pub fn decode(
        &self,
        num: u64,
        raw_args: [u64; 6],
        ret: i64,
        mem: &dyn MemIo,
    ) -> Result<Syscall, MemError> {
        let name = self.name(num);
        let kinds = self.arg_kinds(num);

        let mut args = Vec::with_capacity(kinds.len());
        for (slot, kind) in kinds.iter().enumerate() {
            args.push(self.decode_arg(*kind, slot, &raw_args, ret, mem)?);
        }

        let data = self.payload(num, &args);

        Ok(Syscall {
            num,
            name,
            raw_args,
            args,
            ret,
            data,
        })
    }

    fn decode_arg(
        &self,
        kind: ArgKind,
        slot: usize,
        raw_args: &[u64; 6],
        ret: i64,
        mem: &dyn MemIo,
    ) -> Result<ArgValue, MemError> {
        let raw = raw_args[slot];

        let value = match kind {
            ArgKind::Int => ArgValue::Int(raw as i64),
            ArgKind::UInt => ArgValue::UInt(raw),
            ArgKind::Hex => ArgValue::Hex(raw),
            ArgKind::Fd => ArgValue::Fd(raw as i32),
            ArgKind::Ptr => ArgValue::Ptr(raw),
            ArgKind::StructPtr(_) if raw == 0 => ArgValue::Ptr(0),
            ArgKind::StructPtr(kind) => ArgValue::Struct { kind, addr: raw },
            ArgKind::Path if raw == 0 => ArgValue::Ptr(0),
            ArgKind::Path => ArgValue::Path(read_string(mem, raw)?),
            ArgKind::StringArray if raw == 0 => ArgValue::Ptr(0),
            ArgKind::StringArray => ArgValue::Strings(read_string_array(mem, raw)?),
            ArgKind::Bytes { .. } if raw == 0 => ArgValue::Ptr(0),
            ArgKind::Bytes { len_arg } => {
                let mut len = min(raw_args[len_arg] as usize, BYTES_LIMIT);
                if ret >= 0 {
                    // The kernel reports how much of the buffer is live.
                    len = min(len, ret as usize);
                }
                ArgValue::Bytes(read_bytes(mem, raw, len)?)
            }
        };

        Ok(value)
    }

    fn payload(&self, num: u64, args: &[ArgValue]) -> Option<SyscallData> {
        if !self.is_execve(num) {
            return None;
        }

        let path = match args.first() {
            Some(ArgValue::Path(path)) => path.clone(),
            _ => String::new(),
        };
        let argv = match args.get(1) {
            Some(ArgValue::Strings(argv)) => argv.clone(),
            _ => Vec::new(),
        };
        let envp = match args.get(2) {
            Some(ArgValue::Strings(envp)) => envp.clone(),
            _ => Vec::new(),
        };

        Some(SyscallData::Execve(Execve { path, argv, envp }))
    }
}

fn read_string(mem: &dyn MemIo, addr: u64) -> Result<String, MemError> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 64];

    while out.len() < STRING_LIMIT {
        let n = mem.read(addr + out.len() as u64, &mut chunk)?;

        if let Some(nul) = chunk[..n].iter().position(|b| *b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(lossy(out));
        }

        out.extend_from_slice(&chunk[..n]);
    }

    out.truncate(STRING_LIMIT);
    Ok(lossy(out))
}

fn read_string_array(mem: &dyn MemIo, addr: u64) -> Result<Vec<String>, MemError> {
    const PTR: usize = std::mem::size_of::<u64>();

    let mut out = Vec::new();

    for slot in 0..ARRAY_LIMIT {
        let at = addr + (slot * PTR) as u64;

        let mut word = [0u8; PTR];
        if mem.read(at, &mut word)? < PTR {
            return Err(MemError::Faulted { addr: at });
        }

        let ptr = u64::from_ne_bytes(word);
        if ptr == 0 {
            break;
        }

        out.push(read_string(mem, ptr)?);
    }

    Ok(out)
}

fn read_bytes(mem: &dyn MemIo, addr: u64, len: usize) -> Result<Vec<u8>, MemError> {
    let mut buf = vec![0u8; len];
    let n = mem.read(addr, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Int(v) => write!(f, "{v}"),
            ArgValue::UInt(v) => write!(f, "{v}"),
            ArgValue::Hex(v) => write!(f, "{v:#x}"),
            ArgValue::Fd(v) => write!(f, "{v}"),
            ArgValue::Path(path) => write!(f, "{path:?}"),
            ArgValue::Strings(strings) => {
                f.write_str("[")?;
                for (i, s) in strings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{s:?}")?;
                }
                f.write_str("]")
            }
            ArgValue::Bytes(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            ArgValue::Ptr(0) => f.write_str("NULL"),
            ArgValue::Ptr(v) => write!(f, "{v:#x}"),
            ArgValue::Struct { kind, addr } => write!(f, "{kind:?}@{addr:#x}"),
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "syscall_{}", self.num)?;
        } else {
            f.write_str(self.name)?;
        }

        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") = {}", self.ret)?;

        if self.ret < 0 && -self.ret < 4096 {
            write!(f, " ({:?})", Errno::from_raw(-self.ret as i32))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::memio::testing::SliceMem;

    fn table() -> SyscallTable {
        SyscallTable::new(Arch::X86_64, Os::Linux)
    }

    #[test]
    fn test_name_lookup() {
        let table = table();

        assert_eq!(table.name(Sysno::openat as u64), "openat");
        assert_eq!(table.name(Sysno::execve as u64), "execve");
        assert_eq!(table.name(u64::MAX), "");
    }

    #[test]
    fn test_decode_openat_path() {
        let mem = SliceMem {
            base: 0x1000,
            bytes: b"/etc/hostname\0".to_vec(),
        };

        const AT_FDCWD: u64 = -100i64 as u64;
        let args = [AT_FDCWD, 0x1000, 0, 0, 0, 0];

        let sc = table()
            .decode(Sysno::openat as u64, args, 3, &mem)
            .unwrap();

        assert_eq!(sc.name, "openat");
        assert_eq!(sc.args[0], ArgValue::Fd(-100));
        assert_eq!(sc.args[1], ArgValue::Path("/etc/hostname".into()));
        assert_eq!(sc.ret, 3);
        assert!(sc.data.is_none());
    }

    #[test]
    fn test_decode_execve_payload() {
        // Layout: path at +0, "ls" at +0x10, "/" at +0x18, argv array at
        // +0x20, envp array (empty) at +0x38.
        let base: u64 = 0x7f00_0000;
        let mut bytes = vec![0u8; 0x40];

        bytes[..8].copy_from_slice(b"/bin/ls\0");
        bytes[0x10..0x13].copy_from_slice(b"ls\0");
        bytes[0x18..0x1a].copy_from_slice(b"/\0");
        bytes[0x20..0x28].copy_from_slice(&(base + 0x10).to_ne_bytes());
        bytes[0x28..0x30].copy_from_slice(&(base + 0x18).to_ne_bytes());
        // argv terminator at +0x30 and the empty envp at +0x38 are zero

        let mem = SliceMem { base, bytes };
        let args = [base, base + 0x20, base + 0x38, 0, 0, 0];

        let sc = table().decode(Sysno::execve as u64, args, 0, &mem).unwrap();

        let Some(SyscallData::Execve(exec)) = sc.data else {
            panic!("execve payload missing");
        };
        assert_eq!(exec.path, "/bin/ls");
        assert_eq!(exec.argv, vec!["ls".to_string(), "/".to_string()]);
        assert!(exec.envp.is_empty());
    }

    #[test]
    fn test_decode_unknown_is_generic() {
        let mem = SliceMem {
            base: 0,
            bytes: Vec::new(),
        };

        let sc = table().decode(u64::MAX, [1, 2, 3, 4, 5, 6], -38, &mem).unwrap();

        assert_eq!(sc.name, "");
        assert_eq!(sc.args.len(), 6);
        assert_eq!(sc.args[0], ArgValue::Hex(1));
    }

    #[test]
    fn test_null_path_decodes_as_null() {
        let mem = SliceMem {
            base: 0x1000,
            bytes: vec![0; 8],
        };

        let args = [0, 0, 0, 0, 0, 0];
        let sc = table().decode(Sysno::chdir as u64, args, -14, &mem).unwrap();

        assert_eq!(sc.args[0], ArgValue::Ptr(0));
    }

    #[test]
    fn test_write_buffer_respects_ret_and_cap() {
        let mem = SliceMem {
            base: 0x2000,
            bytes: vec![b'a'; 256],
        };

        // Claimed length 200, but the call only moved 100 bytes.
        let args = [1, 0x2000, 200, 0, 0, 0];
        let sc = table().decode(Sysno::write as u64, args, 100, &mem).unwrap();

        assert_eq!(sc.args[1], ArgValue::Bytes(vec![b'a'; BYTES_LIMIT]));
    }

    #[test]
    fn test_faulted_pointer_is_an_error() {
        let mem = SliceMem {
            base: 0x1000,
            bytes: b"x\0".to_vec(),
        };

        let args = [0xdead_0000, 0, 0, 0, 0, 0];
        let err = table()
            .decode(Sysno::chdir as u64, args, 0, &mem)
            .unwrap_err();

        assert_eq!(err, MemError::Faulted { addr: 0xdead_0000 });
    }

    #[test]
    fn test_display_formats_like_strace() {
        let mem = SliceMem {
            base: 0x1000,
            bytes: b"/tmp\0".to_vec(),
        };

        let sc = table()
            .decode(Sysno::chdir as u64, [0x1000, 0, 0, 0, 0, 0], -2, &mem)
            .unwrap();

        assert_eq!(sc.to_string(), "chdir(\"/tmp\") = -2 (ENOENT)");
    }
}
