use anyhow::Result;
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_trace_true_runs_to_clean_close() -> Result<()> {
    let events = trace_to_completion(&["/bin/true"])?;

    assert!(!events.is_empty());

    // Every event belongs to the single tracee.
    let root = events[0].process.pid;
    assert!(events.iter().all(|event| event.process.pid == root));

    // A clean run ends with a successful exit-family call.
    let last = &events.last().unwrap().syscall;
    assert!(
        last.name == "exit" || last.name == "exit_group",
        "final syscall was {:?}",
        last.name
    );
    assert_eq!(last.raw_args[0], 0);

    Ok(())
}
