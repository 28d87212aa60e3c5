use anyhow::Result;
use ntest::timeout;
use wiretap::ArgValue;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_openat_path_is_read_from_tracee() -> Result<()> {
    let events = trace_to_completion(&["/bin/cat", "/etc/passwd"])?;

    let open = events
        .iter()
        .find(|event| {
            event.syscall.name == "openat"
                && event
                    .syscall
                    .args
                    .iter()
                    .any(|arg| matches!(arg, ArgValue::Path(path) if path == "/etc/passwd"))
        })
        .expect("no openat of /etc/passwd observed");

    assert!(open.syscall.ret >= 0);

    Ok(())
}
