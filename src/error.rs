use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::memio::MemError;

pub type Result<T> = std::result::Result<T, Error>;

/// Return an [`Error::Internal`] from the enclosing function.
macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not fork tracee")]
    Spawn { source: Errno },

    #[error("could not attach to tracee = {pid}")]
    Attach { pid: Pid, source: Errno },

    #[error("could not apply trace options to tracee = {pid}")]
    Options { pid: Pid, source: Errno },

    #[error("error waiting on tracees")]
    Wait { source: Errno },

    #[error("could not resume tracee = {pid}")]
    Resume { pid: Pid, source: Errno },

    #[error("tracee {pid} died mid-request")]
    TraceeDied { pid: Pid, source: Errno },

    #[error("could not read process metadata for pid = {pid}")]
    Process { pid: Pid, source: io::Error },

    #[error("could not decode syscall {num}")]
    Decode { num: u64, source: MemError },

    #[error("tracee memory access failed")]
    Mem(#[from] MemError),

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("unexpected internal error: {0}")]
    Internal(String),

    #[error("unexpected system error")]
    Sys(#[from] Errno),
}

impl Error {
    /// True when the underlying cause was the disappearance of a tracee.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

pub(crate) trait ResultExt<T> {
    /// Convert an `ESRCH` into [`Error::TraceeDied`] for `pid`.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|errno| match errno {
            Errno::ESRCH => Error::TraceeDied { pid, source: errno },
            other => Error::Sys(other),
        })
    }
}
