use anyhow::Result;
use ntest::timeout;
use wiretap::ArgValue;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_echo_write_is_decoded() -> Result<()> {
    let events = trace_to_completion(&["/bin/sh", "-c", "echo hi"])?;

    let write = events
        .iter()
        .find(|event| event.syscall.name == "write" && event.syscall.raw_args[0] == 1)
        .expect("no write to stdout observed");

    assert_eq!(write.syscall.ret, 3);
    assert_eq!(write.syscall.args[0], ArgValue::Fd(1));
    assert_eq!(write.syscall.args[1], ArgValue::Bytes(b"hi\n".to_vec()));

    Ok(())
}
