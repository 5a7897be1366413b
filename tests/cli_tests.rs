#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cmd() -> Command {
    Command::cargo_bin("convertd").unwrap()
}

#[test]
fn test_version_command() {
    cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("convertd"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_version_flags() {
    for flag in ["--version", "-V"] {
        cmd()
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }
}

#[test]
fn test_help_lists_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--verbose"));
}

#[test]
fn test_no_args_shows_help() {
    cmd()
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: convertd"));
}

#[test]
fn test_unknown_command_exits_1() {
    cmd()
        .arg("frobnicate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown command: frobnicate"));
}

#[test]
fn test_invalid_flag_exits_2() {
    cmd().arg("--no-such-flag").assert().code(2);
}

#[test]
fn test_verbose_flag_enables_debug_logging() {
    // Logs go to stderr, command output to stdout
    cmd()
        .args(["--verbose", "version"])
        .assert()
        .success()
        .stdout(predicate::str::contains("convertd"))
        .stdout(predicate::str::contains("DEBUG").not())
        .stderr(predicate::str::contains("DEBUG"));
}

#[test]
fn test_default_mode_hides_debug() {
    cmd()
        .arg("version")
        .assert()
        .success()
        .stderr(predicate::str::contains("DEBUG").not());
}

#[test]
fn test_init_writes_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");

    cmd()
        .args(["--config", path.to_str().unwrap(), "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default configuration"));

    let content = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["bind_addr"], "127.0.0.1:8080");
    assert!(value["categories"].as_array().unwrap().len() >= 3);

    // A second init without --force refuses
    cmd()
        .args(["--config", path.to_str().unwrap(), "init"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_serve_with_missing_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("missing.json");

    cmd()
        .args(["--config", path.to_str().unwrap(), "serve"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_serve_rejects_invalid_bind() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    cmd()
        .args(["--config", path.to_str().unwrap(), "init"])
        .assert()
        .success();

    cmd()
        .args(["--config", path.to_str().unwrap(), "serve", "--bind", "not-an-address"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid configuration"));
}
