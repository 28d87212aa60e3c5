use anyhow::Result;
use ntest::timeout;
use wiretap::{Command, SyscallData, Tracer};

#[test]
#[timeout(10000)]
fn test_exec_filter_detaches_declined_program() -> Result<()> {
    let mut tracer = Tracer::new();
    tracer.set_exec_filter(|exec| exec.path != "/bin/ls");

    let cmd = Command::new(vec!["/bin/sh", "-c", "/bin/ls /"])?;
    let events: Vec<_> = tracer.spawn(cmd)?.collect();

    let declined = events
        .iter()
        .position(|event| {
            matches!(&event.syscall.data, Some(SyscallData::Execve(exec)) if exec.path == "/bin/ls")
        })
        .expect("execve of /bin/ls not observed");

    // Nothing more from that pid once it was detached; ls runs free.
    let pid = events[declined].process.pid;
    assert!(
        events[declined + 1..]
            .iter()
            .all(|event| event.process.pid != pid),
        "events emitted after detaching"
    );

    Ok(())
}
