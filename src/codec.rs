//! Pairing of entry and exit register snapshots into decoded syscalls.

use crate::memio::{MemError, MemIo};
use crate::syscall::{Syscall, SyscallTable};
use crate::x86 as arch;

/// Decoder bound to a single tracee's address space.
pub struct Codec<M> {
    table: SyscallTable,
    mem: M,
}

impl<M: MemIo> Codec<M> {
    pub fn new(table: SyscallTable, mem: M) -> Self {
        Self { table, mem }
    }

    pub fn table(&self) -> &SyscallTable {
        &self.table
    }

    /// Decode a completed syscall from its two register snapshots.
    ///
    /// The number and arguments come from the entry snapshot; only the
    /// return register is read from the exit snapshot.
    pub fn decode_completed(
        &self,
        entry: &arch::Registers,
        exit: &arch::Registers,
    ) -> Result<Syscall, MemError> {
        self.table.decode(
            arch::syscall_number(entry),
            arch::syscall_args(entry),
            arch::return_value(exit),
            &self.mem,
        )
    }

    /// Decode at a single stop, for calls that never produce an exit stop.
    ///
    /// The return value is reported as zero.
    pub fn decode_inflight(&self, regs: &arch::Registers) -> Result<Syscall, MemError> {
        self.table
            .decode(arch::syscall_number(regs), arch::syscall_args(regs), 0, &self.mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use syscalls::Sysno;

    use crate::memio::testing::SliceMem;
    use crate::syscall::{Arch, ArgValue, Os};

    fn regs() -> arch::Registers {
        unsafe { std::mem::zeroed() }
    }

    fn codec(mem: SliceMem) -> Codec<SliceMem> {
        Codec::new(SyscallTable::new(Arch::X86_64, Os::Linux), mem)
    }

    #[test]
    fn test_decode_completed_pairs_snapshots() {
        let mem = SliceMem {
            base: 0x3000,
            bytes: b"hi\n".to_vec(),
        };

        let mut entry = regs();
        entry.orig_rax = Sysno::write as u64;
        entry.rdi = 1;
        entry.rsi = 0x3000;
        entry.rdx = 3;

        let mut exit = regs();
        exit.orig_rax = Sysno::write as u64;
        exit.rax = 3;

        let sc = codec(mem).decode_completed(&entry, &exit).unwrap();

        assert_eq!(sc.name, "write");
        assert_eq!(sc.ret, 3);
        assert_eq!(sc.args[1], ArgValue::Bytes(b"hi\n".to_vec()));
    }

    #[test]
    fn test_decode_inflight_reports_zero_return() {
        let mem = SliceMem {
            base: 0,
            bytes: Vec::new(),
        };

        let mut entry = regs();
        entry.orig_rax = Sysno::exit_group as u64;
        entry.rdi = 7;
        entry.rax = -38i64 as u64; // ENOSYS placeholder the kernel parks in rax

        let sc = codec(mem).decode_inflight(&entry).unwrap();

        assert_eq!(sc.name, "exit_group");
        assert_eq!(sc.ret, 0);
        assert_eq!(sc.args[0], ArgValue::Int(7));
    }
}
