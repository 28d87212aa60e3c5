//! Minimal strace-alike: trace a command line and print every event.

use std::env;

use wiretap::{Command, Tracer};

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = env::args().skip(1).collect();
    if argv.is_empty() {
        eprintln!("usage: strace PROG [ARGS...]");
        std::process::exit(2);
    }

    let cmd = Command::new(argv)?;

    for event in Tracer::new().spawn(cmd)? {
        eprintln!("{event}");
    }

    Ok(())
}
