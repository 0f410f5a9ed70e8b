use assert_cmd::Command;

#[test]
fn version_flag_prints_and_exits() {
    let mut cmd = Command::cargo_bin("overdrive_agent").expect("binary exists");
    cmd.arg("--version");
    let assert = cmd.assert().success();
    let output = assert.get_output();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("overdrive_agent "));
}

#[test]
fn unreadable_config_is_fatal() {
    let mut cmd = Command::cargo_bin("overdrive_agent").expect("binary exists");
    cmd.args(["--config", "/nonexistent/overdrive/agent.conf"]);
    cmd.assert().failure();
}

#[test]
fn invalid_config_is_fatal() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("agent.conf");
    std::fs::write(&path, "renicer_interval=0").expect("write config");

    let mut cmd = Command::cargo_bin("overdrive_agent").expect("binary exists");
    cmd.args(["--config", path.to_str().expect("utf-8 path")]);
    cmd.assert().failure();
}
