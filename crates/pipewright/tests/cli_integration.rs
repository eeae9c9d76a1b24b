//! CLI integration tests for the pipewright binary.
//!
//! These cover argument parsing, configuration resolution and the
//! migrate command; none of them start the server.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pipewright() -> Command {
    let mut cmd = Command::cargo_bin("pipewright").unwrap();
    cmd.env_remove("PIPEWRIGHT_CONFIG");
    cmd
}

/// A config file whose storage and logs live in `dir`.
fn write_config(dir: &TempDir, extra: &str) -> std::path::PathBuf {
    let path = dir.path().join("pipewright.yaml");
    let yaml = format!(
        "storage:\n  path: {}\nengine:\n  log_dir: {}\n{extra}",
        dir.path().join("data/pipewright.db").display(),
        dir.path().join("logs").display(),
    );
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    pipewright()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn test_version_displays() {
    pipewright()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pipewright"));
}

#[test]
fn test_unknown_command_fails() {
    pipewright().arg("frobnicate").assert().failure();
}

#[test]
fn test_migrate_creates_database() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    pipewright()
        .arg("--config")
        .arg(&config)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Database ready"));

    assert!(dir.path().join("data/pipewright.db").exists());
}

#[test]
fn test_config_show_applies_file_over_defaults() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "http:\n  addr: \"127.0.0.1:9999\"\n");

    pipewright()
        .env("PIPEWRIGHT_CONFIG", &config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("127.0.0.1:9999"))
        .stdout(predicate::str::contains("function-out"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "services_ping:\n  interval_secs: 0\n");

    pipewright()
        .arg("--config")
        .arg(&config)
        .args(["config", "which"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("interval_secs"));
}
