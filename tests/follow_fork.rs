use anyhow::Result;
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_forked_children_are_traced() -> Result<()> {
    let events = trace_to_completion(&["/bin/sh", "-c", "/bin/true & wait"])?;

    let mut pids: Vec<i32> = events
        .iter()
        .map(|event| event.process.pid.as_raw())
        .collect();
    pids.sort_unstable();
    pids.dedup();

    assert!(
        pids.len() >= 2,
        "expected events from more than one pid, got {pids:?}"
    );

    Ok(())
}
