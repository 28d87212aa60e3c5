#![allow(dead_code)]

use anyhow::Result;
use wiretap::{Command, Event, EventStream, Tracer};

/// Spawn `argv` under a fresh tracer and return its event stream.
pub fn spawn_traced(argv: &[&str]) -> Result<EventStream> {
    let cmd = Command::new(argv.to_vec())?;
    Ok(Tracer::new().spawn(cmd)?)
}

/// Trace `argv` to completion, collecting every event.
pub fn trace_to_completion(argv: &[&str]) -> Result<Vec<Event>> {
    Ok(spawn_traced(argv)?.collect())
}
