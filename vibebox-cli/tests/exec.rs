use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vibebox() -> Command {
    Command::new(env!("CARGO_BIN_EXE_vibebox"))
}

#[test]
fn test_exec_off_json() {
    let project = TempDir::new().unwrap();
    let output = vibebox()
        .args([
            "exec",
            "--provider",
            "off",
            "--json",
            "--command",
            "echo vibebox-off",
        ])
        .arg("--project-root")
        .arg(project.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["selected"], "off");
    assert_eq!(payload["exitCode"], 0);
    assert_eq!(payload["stdout"], "vibebox-off\n");
    assert_eq!(payload["stderr"], "");
}

#[test]
fn test_exec_propagates_exit_code() {
    let project = TempDir::new().unwrap();
    let output = vibebox()
        .args(["exec", "--provider", "off", "--json", "--command", "exit 7"])
        .arg("--project-root")
        .arg(project.path())
        .output()
        .unwrap();
    // The process exit code mirrors the command's.
    assert_eq!(output.status.code(), Some(7));

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["exitCode"], 7);
}

#[test]
fn test_exec_plain_streams() {
    let project = TempDir::new().unwrap();
    vibebox()
        .args([
            "exec",
            "--provider",
            "off",
            "--command",
            "echo out-line; echo err-line >&2",
        ])
        .arg("--project-root")
        .arg(project.path())
        .assert()
        .success()
        .stdout("out-line\n")
        .stderr(predicate::str::contains("err-line"));
}

#[test]
fn test_exec_env_flag() {
    let project = TempDir::new().unwrap();
    vibebox()
        .args([
            "exec",
            "--provider",
            "off",
            "--command",
            "echo $VIBEBOX_FLAG",
            "--env",
            "VIBEBOX_FLAG=from-cli",
        ])
        .arg("--project-root")
        .arg(project.path())
        .assert()
        .success()
        .stdout("from-cli\n");
}

#[test]
fn test_exec_bad_env_json() {
    let output = vibebox()
        .args([
            "exec",
            "--provider",
            "off",
            "--json",
            "--command",
            "true",
            "--env",
            "NOEQUALS",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], false);
    assert!(payload["error"].as_str().unwrap().contains("invalid env"));
}

#[cfg(not(target_os = "macos"))]
#[test]
fn test_exec_unavailable_backend_reports_diagnostics() {
    let project = TempDir::new().unwrap();
    let output = vibebox()
        .args([
            "exec",
            "--provider",
            "apple-vm",
            "--json",
            "--command",
            "true",
        ])
        .arg("--project-root")
        .arg(project.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["diagnostics"]["apple-vm"]["available"], false);
}
