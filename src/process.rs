//! Process metadata discovery through procfs.

use std::fs;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Identity of a traced process, captured at attach time.
///
/// The fields reflect `/proc/<pid>` at the moment of the lookup; a later
/// `execve` invalidates `exe` and `cmdline` until the record is refreshed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub exe: PathBuf,
    pub cmdline: Vec<String>,
    pub uid: u32,
}

impl ProcessInfo {
    /// Look up a live pid in procfs.
    pub fn find(pid: Pid) -> Result<Self> {
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));
        let proc_err = |source| Error::Process { pid, source };

        let exe = fs::read_link(proc_dir.join("exe")).map_err(proc_err)?;

        let cmdline = fs::read(proc_dir.join("cmdline"))
            .map_err(proc_err)?
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();

        let status = fs::read_to_string(proc_dir.join("status")).map_err(proc_err)?;
        let Some(uid) = parse_uid(&status) else {
            internal_error!(format!("no Uid line in status of pid {pid}"));
        };

        Ok(Self {
            pid,
            exe,
            cmdline,
            uid,
        })
    }
}

// The `Uid:` line carries real, effective, saved, and filesystem uids; the
// first column is the real uid.
fn parse_uid(status: &str) -> Option<u32> {
    let uids = status.lines().find_map(|line| line.strip_prefix("Uid:"))?;
    uids.split_whitespace().next()?.parse().ok()
}
