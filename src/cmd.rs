use std::ffi::{CString, NulError};
use std::os::raw::c_char;

use nix::sys::ptrace;
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::Error;

/// Command to spawn as a traced child process.
///
/// Stdio is inherited from the tracer.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector for `execve()`; `argv[0]` names the executable.
    argv: Vec<CString>,

    /// Environment entries of the form `KEY=value`.
    ///
    /// Inherits the parent's environment by default.
    env: Vec<CString>,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, NulError> {
        if argv.is_empty() {
            panic!("Command exe required");
        }

        let argv = argv
            .into_iter()
            .map(CString::new)
            .collect::<Result<_, _>>()?;

        let mut env = Vec::new();
        for (key, val) in std::env::vars_os() {
            use std::os::unix::ffi::OsStrExt;

            let mut kv = key.as_bytes().to_vec();
            kv.push(b'=');
            kv.extend_from_slice(val.as_bytes());
            env.push(CString::new(kv)?);
        }

        Ok(Self { argv, env })
    }

    /// Drop every inherited environment entry.
    pub fn env_clear(&mut self) -> &mut Self {
        self.env.clear();
        self
    }

    /// Add or replace an environment entry.
    pub fn env_set(&mut self, key: &str, val: &str) -> Result<&mut Self, NulError> {
        let prefix = format!("{key}=");
        self.env
            .retain(|kv| !kv.as_bytes().starts_with(prefix.as_bytes()));
        self.env.push(CString::new(format!("{prefix}{val}"))?);
        Ok(self)
    }

    /// Fork and exec the command with a pre-exec `PTRACE_TRACEME` request.
    ///
    /// The kernel stops the child with a `SIGTRAP` once the exec completes,
    /// so the caller observes it before the new image runs. Must be called
    /// from the thread that will issue all subsequent ptrace requests.
    pub(crate) fn fork_exec(&self) -> Result<Pid, Error> {
        // Pointer arrays heap-allocate and must be built pre-fork.
        let argv = NullTerminatedPointerArray::new(&self.argv);
        let env = NullTerminatedPointerArray::new(&self.env);

        match unsafe { fork() }.map_err(|source| Error::Spawn { source })? {
            ForkResult::Child => {
                // Only async-signal-safe calls from here on; failures leave
                // through `_exit` without touching the heap.
                if ptrace::traceme().is_err() {
                    unsafe { libc::_exit(126) };
                }

                unsafe {
                    libc::execve(argv[0], argv.as_ptr(), env.as_ptr());

                    // Only reached when the exec failed.
                    libc::_exit(127)
                }
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }
}

// View of a slice of `CString` values as a null-terminated array of pointers
// to `c_char`, for handing to `execve()`.
struct NullTerminatedPointerArray<'a> {
    // Owned pointer array, always NULL-terminated.
    array: Vec<*const libc::c_char>,

    // Borrow of the pointed-to data; the pointers in `array` are valid only
    // while this borrow lives.
    _data: &'a [CString],
}

impl<'a> NullTerminatedPointerArray<'a> {
    pub fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data.iter().map(|s| s.as_ptr()).collect();
        array.push(std::ptr::null());

        Self { array, _data: data }
    }
}

impl std::ops::Deref for NullTerminatedPointerArray<'_> {
    type Target = [*const c_char];

    fn deref(&self) -> &Self::Target {
        &self.array
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_set_replaces_existing() {
        let mut cmd = Command::new(vec!["/bin/true"]).unwrap();

        cmd.env_clear();
        cmd.env_set("PATH", "/bin").unwrap();
        cmd.env_set("PATH", "/usr/bin").unwrap();

        assert_eq!(cmd.env.len(), 1);
        assert_eq!(cmd.env[0].as_bytes(), b"PATH=/usr/bin");
    }

    #[test]
    fn test_pointer_array_is_null_terminated() {
        let data = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let array = NullTerminatedPointerArray::new(&data);

        assert_eq!(array.len(), 3);
        assert!(array[2].is_null());
    }
}
