//! Follow-fork syscall tracing for Linux process trees.
//!
//! A [`Tracer`] spawns a command (or attaches to a running pid) and hands
//! back an [`EventStream`]: a bounded stream carrying one [`Event`] per
//! completed syscall, across the target and every child it forks, vforks, or
//! clones. Each event pairs the calling process with a typed [`Syscall`]
//! holding the number, symbolic name, decoded arguments, and return value.
//! Pointer arguments are chased through the tracee's memory, so `openat`
//! shows its path and `execve` its argv.
//!
//! `ptrace(2)` demands that every request against a tracee come from the
//! thread that attached it. Each session therefore runs on a dedicated OS
//! thread owning the `waitpid(2)` loop and all ptrace calls, while consumers
//! iterate the stream from wherever they like. A slow consumer exerts
//! backpressure: tracees rest in their syscall stops until events drain.
//!
//! ```no_run
//! use wiretap::{Command, Tracer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cmd = Command::new(vec!["/bin/ls", "/"])?;
//!
//! for event in Tracer::new().spawn(cmd)? {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Only Linux on x86_64 is supported.

#[macro_use]
pub mod error;

pub mod cmd;
pub mod codec;
pub mod memio;
pub mod process;
pub mod syscall;
pub mod tracer;
pub mod x86;

mod engine;

#[doc(inline)]
pub use cmd::Command;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use memio::{MemError, MemIo, PtraceMem};
#[doc(inline)]
pub use process::ProcessInfo;
#[doc(inline)]
pub use syscall::{ArgKind, ArgValue, Execve, StructKind, Syscall, SyscallData, SyscallTable};
#[doc(inline)]
pub use tracer::{Event, EventStream, Tracer};

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;
