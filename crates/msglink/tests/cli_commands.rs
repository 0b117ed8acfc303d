#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::Command;

fn unique_temp_file(tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/msglink-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

#[test]
fn send_then_recv_round_trips_over_a_file() {
    let path = unique_temp_file("roundtrip");

    let send = Command::new(env!("CARGO_BIN_EXE_msglink"))
        .arg("--log-level")
        .arg("error")
        .arg("send")
        .arg("chat")
        .arg("--transport")
        .arg("file")
        .arg("--address")
        .arg(&path)
        .arg("--json")
        .arg(r#"[7, "hello"]"#)
        .arg("--eof")
        .output()
        .expect("send should run");
    assert!(
        send.status.success(),
        "send failed: {}",
        String::from_utf8_lossy(&send.stderr)
    );

    let recv = Command::new(env!("CARGO_BIN_EXE_msglink"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("recv")
        .arg("chat")
        .arg("--transport")
        .arg("file")
        .arg("--address")
        .arg(&path)
        .output()
        .expect("recv should run");
    assert!(
        recv.status.success(),
        "recv failed: {}",
        String::from_utf8_lossy(&recv.stderr)
    );

    let stdout = String::from_utf8_lossy(&recv.stdout);
    assert!(stdout.contains("message.schema.json"));
    assert!(stdout.contains(r#""values":[7,"hello"]"#));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn recv_without_an_address_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_msglink"))
        .arg("--log-level")
        .arg("error")
        .arg("recv")
        .arg("no_such_channel")
        .output()
        .expect("recv should run");
    assert_eq!(output.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no_such_channel"));
}

#[test]
fn envinfo_reports_the_default_transport() {
    let output = Command::new(env!("CARGO_BIN_EXE_msglink"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("envinfo")
        .output()
        .expect("envinfo should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("envinfo.schema.json"));
    assert!(stdout.contains("\"default_transport\""));
}
