//! Public tracing surface: spawn or attach, then iterate events.

use std::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use nix::unistd::Pid;

use crate::cmd::Command;
use crate::engine::{self, Target};
use crate::error::Result;
use crate::process::ProcessInfo;
use crate::syscall::{Execve, Syscall};

/// Capacity of the event hand-off between the engine thread and the
/// consumer. Once full, tracees rest in their stops until events drain.
const EVENT_BUFFER: usize = 256;

/// One completed syscall, attributed to its calling process.
#[derive(Clone, Debug)]
pub struct Event {
    pub process: Arc<ProcessInfo>,
    pub syscall: Syscall,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.process.pid, self.syscall)
    }
}

/// Predicate deciding whether to keep following a tracee across an exec.
pub(crate) type ExecFilter = Box<dyn FnMut(&Execve) -> bool + Send>;

/// Entry point for tracing sessions.
///
/// Spawning or attaching consumes the tracer and moves it onto a dedicated
/// engine thread; the returned [`EventStream`] is the session's only handle.
/// Startup failures surface synchronously, before any stream exists.
#[derive(Default)]
pub struct Tracer {
    exec_filter: Option<ExecFilter>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a predicate consulted on every decoded `execve`.
    ///
    /// Returning `false` detaches that tracee on the spot: the program runs
    /// on, untraced, and emits no further events.
    pub fn set_exec_filter(&mut self, filter: impl FnMut(&Execve) -> bool + Send + 'static) {
        self.exec_filter = Some(Box::new(filter));
    }

    /// Launch `cmd` as a traced child and stream its syscalls.
    ///
    /// The child and every process it forks, vforks, or clones are followed.
    /// On shutdown the spawned root is signalled rather than left running.
    pub fn spawn(self, cmd: Command) -> Result<EventStream> {
        self.start(Target::Spawn(cmd))
    }

    /// Attach to a running process and stream its syscalls.
    ///
    /// An interrupt-driven shutdown detaches the tracee, leaving it
    /// runnable.
    pub fn attach(self, pid: Pid) -> Result<EventStream> {
        self.start(Target::Attach(pid))
    }

    fn start(self, target: Target) -> Result<EventStream> {
        let (event_tx, event_rx) = bounded(EVENT_BUFFER);
        let (ready_tx, ready_rx) = bounded(1);

        let filter = self.exec_filter;
        thread::Builder::new()
            .name("wiretap-engine".into())
            .spawn(move || engine::run(target, filter, event_tx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(EventStream { events: event_rx }),
            Ok(Err(err)) => Err(err),
            Err(_) => internal_error!("engine exited before reporting readiness"),
        }
    }
}

/// Stream of [`Event`]s from one tracing session.
///
/// Iteration blocks on the engine and ends when the session does: the target
/// tree exited, a shutdown signal arrived, or the engine hit a fatal error.
/// Dropping the stream mid-session makes the engine wind down at its next
/// event, killing a spawned root or detaching an attached tracee.
pub struct EventStream {
    events: Receiver<Event>,
}

impl Iterator for EventStream {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.events.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;

    #[test]
    fn test_attach_to_missing_pid_fails_synchronously() {
        // Way past any plausible pid_max.
        let err = Tracer::new().attach(Pid::from_raw(i32::MAX)).err().unwrap();

        assert!(matches!(err, Error::Attach { .. }));
    }
}
