use assert_cmd::Command;
use predicates::prelude::*;

fn vibebox() -> Command {
    Command::new(env!("CARGO_BIN_EXE_vibebox"))
}

#[test]
fn test_probe_off_json() {
    let output = vibebox()
        .args(["probe", "--provider", "off", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["selected"], "off");
    assert_eq!(payload["wasFallback"], false);
    assert_eq!(payload["diagnostics"]["off"]["available"], true);
    // All three backends always show up in diagnostics.
    assert!(payload["diagnostics"]["apple-vm"].is_object());
    assert!(payload["diagnostics"]["docker"].is_object());
}

#[test]
fn test_probe_invalid_provider() {
    vibebox()
        .args(["probe", "--provider", "qemu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid provider"));
}

#[test]
fn test_probe_invalid_provider_json_exit_code() {
    let output = vibebox()
        .args(["probe", "--provider", "qemu", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], false);
    assert!(payload["error"].as_str().unwrap().contains("invalid provider"));
}

#[cfg(not(target_os = "macos"))]
#[test]
fn test_probe_apple_vm_unavailable_off_darwin() {
    let output = vibebox()
        .args(["probe", "--provider", "apple-vm", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["diagnostics"]["apple-vm"]["available"], false);
    assert_eq!(
        payload["diagnostics"]["apple-vm"]["reason"],
        "apple-vm backend is only available on darwin"
    );
}

#[test]
fn test_probe_missing_project_root() {
    vibebox()
        .args(["probe", "--project-root", "/definitely/not/here"])
        .assert()
        .failure();
}
