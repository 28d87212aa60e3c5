use std::process::Command as StdCommand;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use ntest::timeout;
use wiretap::{Pid, Signal, Tracer};

// Interrupt-driven shutdown must leave an attached tracee detached and
// runnable, not parked in a stop.
#[test]
#[timeout(15000)]
fn test_interrupt_detaches_sleeping_tracee() -> Result<()> {
    let mut sleeper = StdCommand::new("sleep").arg("30").spawn()?;
    let pid = Pid::from_raw(sleeper.id() as i32);

    // Let it settle into nanosleep.
    sleep(Duration::from_millis(300));

    let stream = Tracer::new().attach(pid)?;

    // Set the shutdown latch, then poke the tracee so the parked wait loop
    // has a stop to wake up on.
    nix::sys::signal::raise(Signal::SIGINT)?;
    nix::sys::signal::kill(pid, Signal::SIGCONT)?;

    // The stream closing means the engine finished its shutdown.
    let _leftover: Vec<_> = stream.collect();

    let status = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    let state = status
        .lines()
        .find(|line| line.starts_with("State:"))
        .unwrap_or_default()
        .to_string();
    assert!(
        state.contains('S') || state.contains('R'),
        "tracee not left runnable: {state}"
    );

    sleeper.kill()?;
    sleeper.wait()?;

    Ok(())
}
