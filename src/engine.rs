//! The tracing engine: one thread, one wait loop, all the ptrace traffic.
//!
//! `ptrace(2)` requests against a tracee must come from the thread that
//! attached it, so a session's engine owns every attach, resume, register
//! read, and detach for its whole lifetime. The loop multiplexes
//! `waitpid(-1)` across the tracee tree, classifies each stop, drives each
//! tracee through the syscall entry/exit two-step, and pushes decoded events
//! into the session's bounded channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::cmd::Command;
use crate::codec::Codec;
use crate::error::{Error, Result, ResultExt};
use crate::memio::PtraceMem;
use crate::process::ProcessInfo;
use crate::syscall::{Arch, Os, Syscall, SyscallData, SyscallTable};
use crate::tracer::{Event, ExecFilter};
use crate::x86 as arch;

/// Options applied to every tracee on first sighting.
///
/// `TRACESYSGOOD` marks syscall stops with the `0x80` bit; the fork-family
/// options auto-attach children so the whole tree is covered.
const TRACE_OPTIONS: ptrace::Options = ptrace::Options::PTRACE_O_TRACESYSGOOD
    .union(ptrace::Options::PTRACE_O_TRACECLONE)
    .union(ptrace::Options::PTRACE_O_TRACEFORK)
    .union(ptrace::Options::PTRACE_O_TRACEVFORK);

/// Signals that initiate a graceful shutdown of the wait loop.
const SHUTDOWN_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
];

// Latch written by the signal handler, polled by the wait loop. Process-wide,
// like signal dispositions themselves.
static INTERRUPTED: AtomicI32 = AtomicI32::new(0);

extern "C" fn note_interrupt(signo: libc::c_int) {
    INTERRUPTED.store(signo, Ordering::SeqCst);
}

fn interrupted() -> Option<Signal> {
    match INTERRUPTED.load(Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

fn install_shutdown_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(note_interrupt),
        // No SA_RESTART: a pending shutdown must surface as EINTR from
        // waitpid instead of being retried by the kernel.
        SaFlags::empty(),
        SigSet::empty(),
    );

    for sig in SHUTDOWN_SIGNALS {
        unsafe { signal::sigaction(sig, &action) }?;
    }

    Ok(())
}

/// Where a tracee is in the syscall two-step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    AwaitingEntry,
    AwaitingExit,
}

/// Per-tracee state.
struct TracedProc {
    pid: Pid,
    process: Arc<ProcessInfo>,
    codec: Codec<PtraceMem>,
    phase: Phase,

    /// Registers captured at the entry stop of the in-flight syscall.
    /// `None` exactly while `phase` is `AwaitingEntry`.
    saved_entry_regs: Option<arch::Registers>,

    /// An `execve` decoded at its entry stop, parked until the exit stop
    /// supplies the return value.
    pending_exec: Option<Syscall>,

    /// True until the `SIGSTOP` induced by `PTRACE_ATTACH` has been seen.
    /// Never set for spawned roots or auto-attached children.
    eat_one_sigstop: bool,
}

impl TracedProc {
    fn new(process: ProcessInfo, eat_one_sigstop: bool) -> Result<Self> {
        let pid = process.pid;

        ptrace::setoptions(pid, TRACE_OPTIONS).map_err(|source| Error::Options { pid, source })?;

        let codec = Codec::new(SyscallTable::new(Arch::X86_64, Os::Linux), PtraceMem::new(pid));

        Ok(Self {
            pid,
            process: Arc::new(process),
            codec,
            phase: Phase::AwaitingEntry,
            saved_entry_regs: None,
            pending_exec: None,
            eat_one_sigstop,
        })
    }

    /// Advance the entry/exit state machine for one syscall stop.
    ///
    /// Returns the decoded syscall when this stop completes one.
    fn step(&mut self) -> Result<Option<Syscall>> {
        let regs = ptrace::getregs(self.pid).died_if_esrch(self.pid)?;
        let num = arch::syscall_number(&regs);

        if self.codec.table().is_execve(num) {
            return self.step_execve(&regs);
        }

        if self.codec.table().is_exit_family(num) {
            // exit and exit_group never come back; report them at entry.
            self.phase = Phase::AwaitingEntry;
            self.saved_entry_regs = None;

            let sc = self
                .codec
                .decode_inflight(&regs)
                .map_err(|source| Error::Decode { num, source })?;
            return Ok(Some(sc));
        }

        match self.phase {
            Phase::AwaitingEntry => {
                self.saved_entry_regs = Some(regs);
                self.phase = Phase::AwaitingExit;
                Ok(None)
            }
            Phase::AwaitingExit => {
                self.phase = Phase::AwaitingEntry;

                let Some(entry) = self.saved_entry_regs.take() else {
                    internal_error!("syscall-exit-stop without saved entry registers");
                };

                let sc = self
                    .codec
                    .decode_completed(&entry, &regs)
                    .map_err(|source| Error::Decode { num, source })?;
                Ok(Some(sc))
            }
        }
    }

    // An execve that succeeds reports its exit stop from the new image, where
    // the argument pointers are gone. Decode the arguments while the old
    // image is still mapped, and emit once the return value is known: one
    // event per execve, whether it succeeded or failed.
    fn step_execve(&mut self, regs: &arch::Registers) -> Result<Option<Syscall>> {
        match self.phase {
            Phase::AwaitingEntry => {
                match self.codec.decode_inflight(regs) {
                    Ok(sc) => self.pending_exec = Some(sc),
                    Err(err) => {
                        debug!(pid = self.pid.as_raw(), %err, "could not decode execve arguments");
                        self.pending_exec = None;
                    }
                }
                self.phase = Phase::AwaitingExit;
                Ok(None)
            }
            Phase::AwaitingExit => {
                self.phase = Phase::AwaitingEntry;
                self.saved_entry_regs = None;

                let Some(mut sc) = self.pending_exec.take() else {
                    // Entry decode failed, or we attached mid-call.
                    return Ok(None);
                };
                sc.ret = arch::return_value(regs);
                Ok(Some(sc))
            }
        }
    }
}

/// What the engine should trace.
pub(crate) enum Target {
    Spawn(Command),
    Attach(Pid),
}

enum Flow {
    Continue,
    /// The consumer dropped the stream; stop tracing.
    Hangup,
}

enum Emit {
    Kept,
    Detached,
    Hangup,
}

pub(crate) struct Engine {
    table: HashMap<Pid, TracedProc>,

    /// True until the first tracee is registered; decides `eat_one_sigstop`
    /// for the initial non-spawned attach.
    first: bool,

    /// Set iff this engine spawned the root tracee and owns killing it on
    /// shutdown.
    spawn_root: Option<Pid>,

    /// Set iff this engine attached to an existing root. Covers the window
    /// where shutdown arrives before the attach-stop was ever observed.
    attach_root: Option<Pid>,

    exec_filter: Option<ExecFilter>,
    events: Sender<Event>,
}

/// Run a tracing session to completion on the current thread.
///
/// The startup outcome is reported over `ready` before any event flows; on
/// error, nothing was attached and the event channel closes immediately.
pub(crate) fn run(
    target: Target,
    exec_filter: Option<ExecFilter>,
    events: Sender<Event>,
    ready: Sender<Result<()>>,
) {
    INTERRUPTED.store(0, Ordering::SeqCst);

    let mut engine = Engine {
        table: HashMap::new(),
        first: true,
        spawn_root: None,
        attach_root: None,
        exec_filter,
        events,
    };

    match engine.start(target) {
        Ok(()) => {
            let _ = ready.send(Ok(()));
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    }

    if let Err(err) = engine.wait_loop() {
        warn!(%err, "wait loop terminated");
    }

    engine.shutdown();

    // Dropping `engine.events` here closes the stream.
}

impl Engine {
    fn start(&mut self, target: Target) -> Result<()> {
        match target {
            Target::Spawn(cmd) => {
                let pid = cmd.fork_exec()?;
                info!(pid = pid.as_raw(), "spawned tracee");
                self.spawn_root = Some(pid);
            }
            Target::Attach(pid) => {
                ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;
                info!(pid = pid.as_raw(), "attached to tracee");
                self.attach_root = Some(pid);
            }
        }

        install_shutdown_handlers()
    }

    fn wait_loop(&mut self) -> Result<()> {
        loop {
            if interrupted().is_some() {
                return Ok(());
            }

            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Err(Errno::EINTR) => continue,
                // Nothing left to wait on: the tracee tree has wound down.
                Err(Errno::ECHILD) if self.table.is_empty() => return Ok(()),
                Err(source) => return Err(Error::Wait { source }),
                Ok(status) => status,
            };

            match self.on_wake(status)? {
                Flow::Continue => {}
                Flow::Hangup => return Ok(()),
            }
        }
    }

    fn on_wake(&mut self, status: WaitStatus) -> Result<Flow> {
        let Some(pid) = status.pid() else {
            return Ok(Flow::Continue);
        };

        match status {
            WaitStatus::Exited(_, code) => {
                if self.table.remove(&pid).is_some() {
                    debug!(pid = pid.as_raw(), code, "tracee exited");
                }
                return Ok(Flow::Continue);
            }
            WaitStatus::Signaled(_, sig, _) => {
                if self.table.remove(&pid).is_some() {
                    debug!(pid = pid.as_raw(), signal = %sig, "tracee killed");
                }
                return Ok(Flow::Continue);
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => return Ok(Flow::Continue),
            _ => {}
        }

        // Children stop before their parent's fork/clone call has returned,
        // so a stop can arrive from a pid we have never seen. Register
        // lazily on first sighting; this also covers the root.
        if !self.table.contains_key(&pid) {
            if let Err(err) = self.register(pid) {
                debug!(pid = pid.as_raw(), %err, "cannot trace new pid");

                // Do not leave an unregistered tracee stopped.
                let _ = ptrace::syscall(pid, None);
                return Ok(Flow::Continue);
            }
        }

        let mut forward: Option<Signal> = None;

        match status {
            WaitStatus::PtraceEvent(..) => {
                // Fork/clone/vfork notification. The child announces itself
                // with its own first stop; nothing to emit here.
            }
            WaitStatus::PtraceSyscall(_) => {
                let stepped = match self.table.get_mut(&pid) {
                    Some(traced) => traced.step(),
                    None => Ok(None),
                };

                match stepped {
                    Ok(Some(syscall)) => match self.emit(pid, syscall) {
                        Emit::Kept => {}
                        Emit::Detached => return Ok(Flow::Continue),
                        Emit::Hangup => return Ok(Flow::Hangup),
                    },
                    Ok(None) => {}
                    Err(err) => {
                        debug!(pid = pid.as_raw(), %err, "skipping undecodable syscall stop")
                    }
                }
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                // A trap with no event bits and no 0x80 is the kernel's
                // post-execve notification; injecting it would kill the
                // tracee.
            }
            WaitStatus::Stopped(_, Signal::SIGSTOP) if self.consume_attach_sigstop(pid) => {}
            WaitStatus::Stopped(_, sig) => forward = Some(sig),
            _ => {}
        }

        match ptrace::syscall(pid, forward) {
            Ok(()) => Ok(Flow::Continue),
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "tracee vanished at resume");
                self.table.remove(&pid);
                Ok(Flow::Continue)
            }
            Err(source) => Err(Error::Resume { pid, source }),
        }
    }

    fn register(&mut self, pid: Pid) -> Result<()> {
        let process = ProcessInfo::find(pid)?;

        let eat_one_sigstop = self.first && self.spawn_root.is_none();
        let traced = TracedProc::new(process, eat_one_sigstop)?;
        self.first = false;

        info!(pid = pid.as_raw(), eat_one_sigstop, "tracing new pid");
        self.table.insert(pid, traced);

        Ok(())
    }

    fn consume_attach_sigstop(&mut self, pid: Pid) -> bool {
        match self.table.get_mut(&pid) {
            Some(traced) if traced.eat_one_sigstop => {
                traced.eat_one_sigstop = false;
                true
            }
            _ => false,
        }
    }

    fn emit(&mut self, pid: Pid, syscall: Syscall) -> Emit {
        let exec = match &syscall.data {
            Some(SyscallData::Execve(exec)) => Some(exec.clone()),
            _ => None,
        };

        let Some(traced) = self.table.get_mut(&pid) else {
            return Emit::Kept;
        };

        let event = Event {
            process: Arc::clone(&traced.process),
            syscall,
        };

        // Blocking push: backpressure leaves the tracee stopped until the
        // consumer accepts the event. A disconnect means the consumer is
        // gone for good.
        if self.events.send(event).is_err() {
            return Emit::Hangup;
        }

        if let Some(exec) = exec {
            // The exec replaced the image; /proc now describes the new one.
            if let Ok(process) = ProcessInfo::find(pid) {
                traced.process = Arc::new(process);
            }

            if let Some(filter) = self.exec_filter.as_mut() {
                if !filter(&exec) {
                    info!(pid = pid.as_raw(), path = %exec.path, "exec filter declined; detaching");
                    let _ = ptrace::detach(pid, None);
                    self.table.remove(&pid);
                    return Emit::Detached;
                }
            }
        }

        Emit::Kept
    }

    fn shutdown(&mut self) {
        let exit_signal = interrupted().unwrap_or(Signal::SIGTERM);

        if let Some(root) = self.spawn_root {
            // The root is ours to reap; wake it if stopped, then pass the
            // shutdown signal along.
            let _ = signal::kill(root, Signal::SIGCONT);
            let _ = signal::kill(root, exit_signal);
        }

        // An attach root whose attach-stop was never observed is still owed
        // a detach; its induced SIGSTOP is on its way.
        if let Some(root) = self.attach_root {
            if !self.table.contains_key(&root) {
                detach_resumable(root, true);
            }
        }

        for (pid, traced) in self.table.drain() {
            detach_resumable(pid, traced.eat_one_sigstop);
        }
    }
}

// Leave `pid` detached and runnable.
//
// The kernel only guarantees a clean detach from a signal-delivery-stop on
// SIGSTOP. A plain PTRACE_DETACH covers a tracee already sitting in some
// ptrace-stop; otherwise stop it explicitly and ride the stops until the
// SIGSTOP arrives, stripping traps and forwarding unrelated signals on the
// way. ESRCH at any point means the tracee is gone and the job is done.
fn detach_resumable(pid: Pid, sigstop_en_route: bool) {
    if !sigstop_en_route {
        if ptrace::detach(pid, None).is_ok() {
            return;
        }

        // Not currently in a ptrace-stop. Probe for liveness, then stop it.
        if signal::kill(pid, None).is_err() {
            return;
        }
        if signal::kill(pid, Signal::SIGSTOP).is_err() {
            return;
        }
    }

    loop {
        let status = match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            Err(_) => return,
            Ok(status) => status,
        };

        match status {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                let _ = ptrace::detach(pid, None);
                return;
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP)
            | WaitStatus::PtraceSyscall(_)
            | WaitStatus::PtraceEvent(..) => {
                // Strip incidental traps; the SIGSTOP is still on its way.
                if ptrace::cont(pid, None).is_err() {
                    return;
                }
            }
            WaitStatus::Stopped(_, sig) => {
                if ptrace::cont(pid, sig).is_err() {
                    return;
                }
            }
            // Exited or was killed under us.
            _ => return,
        }
    }
}
