use anyhow::Result;
use ntest::timeout;
use wiretap::SyscallData;

mod support;
use support::*;

// A failed execve leaves the old image in place, and its exit stop carries
// the error. Exactly one event should surface, with the failure code.
#[test]
#[timeout(10000)]
fn test_failed_exec_reports_error_return() -> Result<()> {
    let events = trace_to_completion(&["/bin/sh", "-c", "/wiretap-does-not-exist"])?;

    let execs: Vec<_> = events
        .iter()
        .filter(|event| {
            matches!(
                &event.syscall.data,
                Some(SyscallData::Execve(exec)) if exec.path == "/wiretap-does-not-exist"
            )
        })
        .collect();

    assert_eq!(execs.len(), 1, "expected one event for the failed execve");
    assert_eq!(execs[0].syscall.ret, -2); // ENOENT

    Ok(())
}
