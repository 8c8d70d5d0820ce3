//! CLI subprocess integration tests.
//!
//! These tests invoke the `flotilla` binary as a subprocess against the mock
//! engine and verify exit codes, stdout content, and JSON output stability.

use std::path::{Path, PathBuf};
use std::process::Command;

fn flotilla_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_flotilla"));
    cmd.arg("--engine").arg("mock");
    cmd
}

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("flotilla.yml");
    std::fs::write(&path, content).unwrap();
    path
}

const TWO_SERVICES: &str = r#"services:
  simple:
    image: busybox
    command: top
  another:
    image: busybox
"#;

#[test]
fn version_flag_exits_zero() {
    let output = flotilla_bin().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("flotilla"));
}

#[test]
fn config_lists_services() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "-p", "demo"])
        .args(["config", "--services"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("simple"));
    assert!(stdout.contains("another"));
}

#[test]
fn config_json_is_canonical() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "-p", "demo"])
        .args(["--json", "config"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["name"], "demo");
    assert_eq!(value["services"].as_array().unwrap().len(), 2);
}

#[test]
fn config_quiet_validates_silently() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string()])
        .args(["config", "--quiet"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn malformed_config_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "services:\n  bad:\n    image: busybox\n    unknown_option: true\n",
    );
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string()])
        .args(["config", "--quiet"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("config error"));
}

#[test]
fn missing_config_file_exits_two() {
    let output = flotilla_bin()
        .args(["-f", "/definitely/not/here.yml", "config"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn dependency_cycle_exits_two_and_names_services() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "services:\n  a:\n    image: busybox\n    depends_on: [b]\n  b:\n    image: busybox\n    depends_on: [a]\n",
    );
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "up", "--detach"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains('a') && stderr.contains('b'));
    assert!(stderr.contains("circular"));
}

#[test]
fn up_detached_converges_all_services() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "-p", "demo"])
        .args(["up", "--detach"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("demo_simple_1"));
    assert!(stdout.contains("demo_another_1"));
}

#[test]
fn up_json_reports_per_service_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "-p", "demo"])
        .args(["--json", "up", "--detach"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["outcomes"]["simple"]["result"], "converged");
    assert_eq!(value["outcomes"]["another"]["result"], "converged");
}

#[test]
fn conflicting_recreate_flags_exit_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string()])
        .args(["up", "--detach", "--force-recreate", "--no-recreate"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("mutually exclusive"));
}

#[test]
fn up_unknown_service_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "up", "--detach", "ghost"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no such service"));
}

#[test]
fn stop_without_containers_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "stop"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no containers"));
}

#[test]
fn scale_rejects_malformed_spec() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "scale", "simple"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("SERVICE=COUNT"));
}

#[test]
fn run_detached_prints_one_off_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "-p", "demo"])
        .args(["run", "--detach", "simple", "--", "echo", "hi"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("demo_simple_run_1"));
}

#[test]
fn ps_on_empty_engine_prints_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "ps"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("no containers found"));
}

#[test]
fn interpolation_uses_process_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "services:\n  app:\n    image: \"busybox:${APP_TAG:-latest}\"\n",
    );
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "--json", "config"])
        .env("APP_TAG", "9.9")
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["services"][0]["image"], "busybox:9.9");
}

#[test]
fn unset_variable_warns_but_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "services:\n  app:\n    image: \"busybox:${SURELY_UNSET_VARIABLE_42}\"\n",
    );
    let output = flotilla_bin()
        .args(["-f", &path.display().to_string(), "config", "--quiet"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("SURELY_UNSET_VARIABLE_42"));
}

#[test]
fn completions_generate_for_bash() {
    let output = flotilla_bin().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(!output.stdout.is_empty());
}

#[test]
fn man_pages_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let man_dir = dir.path().join("man");
    let output = flotilla_bin()
        .args(["man-pages", &man_dir.display().to_string()])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(man_dir.join("flotilla.1").exists());
    assert!(man_dir.join("flotilla-up.1").exists());
}

#[test]
fn invalid_engine_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), TWO_SERVICES);
    let output = Command::new(env!("CARGO_BIN_EXE_flotilla"))
        .args(["--engine", "warpdrive", "-f", &path.display().to_string(), "ps"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unavailable"));
}
