//! Runs the `proxy-relay` binary itself.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

#[test]
fn test_startup_line_is_logged_first() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_proxy-relay"))
        .args(["--target", "http://127.0.0.1:1", "--port", "0"])
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut first = String::new();
    BufReader::new(stdout).read_line(&mut first).unwrap();
    let _ = child.kill();
    let _ = child.wait();

    assert!(first.contains("proxy-relay v"), "first log line was {:?}", first);
}
