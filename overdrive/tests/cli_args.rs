use assert_cmd::Command;

#[test]
fn version_flag_prints_and_exits() {
    let mut cmd = Command::cargo_bin("overdrive").expect("binary exists");
    cmd.arg("--version");
    let assert = cmd.assert().success();
    let output = assert.get_output();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("overdrive "));
}

#[test]
fn missing_command_aborts() {
    let mut cmd = Command::cargo_bin("overdrive").expect("binary exists");
    cmd.assert().failure();
}
