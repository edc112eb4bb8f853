use assert_cmd::Command;

const ECHO_LOOP: &str = r#"while IFS= read -r line; do printf '%s world.\n' "$line"; done"#;

fn ptymux() -> Command {
    let mut cmd = Command::cargo_bin("ptymux").unwrap();
    cmd.args(["--config", "/nonexistent/ptymux.toml", "--log-level", "warn"]);
    cmd
}

#[test]
fn answers_each_stdin_line() {
    let output = ptymux()
        .args(["--timeout", "10", "--", "/bin/sh", "-c", ECHO_LOOP])
        .write_stdin("hello\nagain\n:quit\n")
        .timeout(std::time::Duration::from_secs(30))
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines, vec!["hello world.", "again world."]);
}

#[test]
fn status_dumps_session_json() {
    let output = ptymux()
        .args(["--id", "probe", "--", "/bin/sh", "-c", ECHO_LOOP])
        .write_stdin(":status\n")
        .timeout(std::time::Duration::from_secs(30))
        .output()
        .unwrap();
    assert!(output.status.success());
    let sessions: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(sessions[0]["id"], "probe");
    assert_eq!(sessions[0]["state"], "ready");
}

#[test]
fn missing_command_fails() {
    ptymux().write_stdin("").assert().failure();
}

#[test]
fn unresolvable_command_fails() {
    ptymux()
        .args(["--", "no-such-assistant-ptymux"])
        .write_stdin("hi\n")
        .assert()
        .failure();
}
