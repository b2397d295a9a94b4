//! Basic CLI tests for the applycar command-line interface.

use assert_cmd::Command;
use predicates::prelude::*;

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("debounce"))
        .stdout(predicate::str::contains("config"));
}

/// Test that the CLI shows version information.
#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("applycar"));
}

/// Test that providing no subcommand shows an error.
#[test]
fn test_no_subcommand_shows_error() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();

    cmd.assert().failure().code(2);
}

#[test]
fn test_simulate_accept() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args(["simulate", "--delay-ms", "5", "--count", "2"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("command 1: ok"))
        .stdout(predicate::str::contains("command 2: ok"));
}

#[test]
fn test_simulate_reject_json() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args([
        "simulate",
        "--behaviour",
        "reject",
        "--message",
        "out of range",
        "--json",
    ]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"success\":false"))
        .stdout(predicate::str::contains("out of range"));
}

#[test]
fn test_simulate_silent_times_out() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args(["simulate", "--behaviour", "silent", "--timeout-ms", "50"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Timeout waiting for command completion"));
}

#[test]
fn test_simulate_silent_without_timeout_is_refused() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args(["simulate", "--behaviour", "silent", "--timeout-ms", "0"]);

    cmd.assert().failure();
}

#[test]
fn test_simulate_transitions() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args(["simulate", "--delay-ms", "1", "--transitions"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Post: Idle -> WaitPreset"));
}

#[test]
fn test_debounce_publishes_only_settled_value() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args(["debounce", "a,b,c", "--settle-ms", "50", "--interval-ms", "1"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(": c"))
        .stdout(predicate::str::contains(": a").not())
        .stdout(predicate::str::contains(": b").not());
}

#[test]
fn test_debounce_requires_values() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.arg("debounce");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_config_json() {
    let mut cmd = Command::cargo_bin("applycar").unwrap();
    cmd.args(["config", "--json"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"settle_ms\""))
        .stdout(predicate::str::contains("APPLYCAR_TRACE"));
}
