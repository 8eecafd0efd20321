//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

fn cli_cmd() -> Command {
    Command::cargo_bin("chanweave").expect("Failed to find chanweave binary")
}

/// Write a config with a tiny retry delay so failure paths finish quickly.
fn fast_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("engine.json");
    fs::write(
        &path,
        r#"{"retry": {"max_attempts": 3, "base_delay_ms": 1}, "default_history_count": 5}"#,
    )
    .unwrap();
    path
}

/// Extract the value after `  <label>: ` from CLI output.
fn extract_field(output: &str, label: &str) -> Option<String> {
    let prefix = format!("  {}: ", label);
    output
        .lines()
        .find_map(|line| line.strip_prefix(&prefix).map(|v| v.trim().to_string()))
}

// ============================================================================
// Naming Command Tests
// ============================================================================

#[test]
fn test_sanitize_command() {
    cli_cmd()
        .args(["sanitize", "Team   Chat!!"])
        .assert()
        .success()
        .stdout("Team-Chat\n");
}

#[test]
fn test_sanitize_falls_back_to_default() {
    cli_cmd()
        .args(["sanitize", "!!!"])
        .assert()
        .success()
        .stdout("channel\n");
}

#[test]
fn test_derive_from_ephemeral() {
    cli_cmd()
        .args(["derive", "0xaa/room-abc-2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Input: ephemeral"))
        .stdout(predicate::str::contains("Persistent: 0xaa/room-abc-1"))
        .stdout(predicate::str::contains("Ephemeral: 0xaa/room-abc-2"));
}

#[test]
fn test_derive_from_base_id() {
    cli_cmd()
        .args(["derive", "0xaa/room-abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Input: base"))
        .stdout(predicate::str::contains("Persistent: 0xaa/room-abc-1"));
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_defaults() {
    cli_cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_attempts\": 5"))
        .stdout(predicate::str::contains("\"retention_days\": 365"));
}

#[test]
fn test_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = fast_config(&dir);

    cli_cmd()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_attempts\": 3"))
        .stdout(predicate::str::contains("\"default_history_count\": 5"));
}

#[test]
fn test_config_missing_file_fails() {
    let dir = TempDir::new().unwrap();

    cli_cmd()
        .arg("--config")
        .arg(dir.path().join("missing.json"))
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

// ============================================================================
// Demo Command Tests
// ============================================================================

#[test]
fn test_demo_public_channel() {
    let output = cli_cmd()
        .args(["demo", "--name", "Team Chat"])
        .assert()
        .success()
        .stdout(predicate::str::contains("State: PERMISSIONS_SET"))
        .stdout(predicate::str::contains("Received [message]: text \"hello\""))
        .stdout(predicate::str::contains("Received [control]: presence online"))
        .stdout(predicate::str::contains("History: 2 records"))
        .stdout(predicate::str::contains("Channel deleted"))
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).unwrap();
    let persistent = extract_field(&stdout, "Persistent").unwrap();
    let ephemeral = extract_field(&stdout, "Ephemeral").unwrap();
    assert!(persistent.contains("/Team-Chat-"));
    assert!(persistent.ends_with("-1"));
    assert_eq!(
        persistent.trim_end_matches("-1"),
        ephemeral.trim_end_matches("-2")
    );
}

#[test]
fn test_demo_hidden_channel_omits_name() {
    let output = cli_cmd()
        .args(["demo", "--name", "Secret Plans", "--hidden"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).unwrap();
    let persistent = extract_field(&stdout, "Persistent").unwrap();
    assert!(!persistent.contains("Secret"));
}

#[test]
fn test_demo_password_channel() {
    cli_cmd()
        .args(["demo", "--type", "password", "--secret", "hunter2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Received [message]: text \"second message\""))
        .stdout(predicate::str::contains("History: 2 records"));
}

#[test]
fn test_demo_degraded_channel() {
    let dir = TempDir::new().unwrap();
    let path = fast_config(&dir);

    cli_cmd()
        .arg("--config")
        .arg(&path)
        .args(["demo", "--fail-ephemeral"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ephemeral: (none, degraded)"))
        .stdout(predicate::str::contains("State: DEGRADED_PERSISTENT_ONLY"))
        .stdout(predicate::str::contains("Received [control]").not())
        .stdout(predicate::str::contains("Channel deleted"));
}

#[test]
fn test_demo_rejects_invalid_member() {
    cli_cmd()
        .args(["demo", "--type", "restricted", "--member", "not-an-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid principal"));
}

#[test]
fn test_demo_restricted_channel() {
    cli_cmd()
        .args([
            "demo",
            "--type",
            "restricted",
            "--member",
            "0x00000000000000000000000000000000000000BB",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("State: PERMISSIONS_SET"))
        .stdout(predicate::str::contains("Owner: true"));
}
