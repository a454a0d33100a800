//! CLI integration tests
//!
//! These tests verify the command-line surface: help output, the version
//! flag, and rejection of unknown arguments. The extractors themselves are
//! exercised by their unit tests; running them for real needs the system
//! directories they scrape.

use std::process::Command;

fn serverfacts_bin() -> &'static str {
    env!("CARGO_BIN_EXE_serverfacts")
}

#[test]
fn test_cli_help() {
    let output = Command::new(serverfacts_bin())
        .arg("--help")
        .output()
        .expect("Failed to execute serverfacts");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serverfacts"));
    assert!(stdout.contains("nginx"));
    assert!(stdout.contains("apache"));
    assert!(stdout.contains("haproxy"));
    assert!(stdout.contains("all"));
}

#[test]
fn test_cli_version() {
    let output = Command::new(serverfacts_bin())
        .arg("--version")
        .output()
        .expect("Failed to execute serverfacts");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_short_version_flag() {
    let output = Command::new(serverfacts_bin())
        .arg("-V")
        .output()
        .expect("Failed to execute serverfacts");

    assert!(output.status.success());
}

#[test]
fn test_cli_requires_subcommand() {
    let output = Command::new(serverfacts_bin())
        .output()
        .expect("Failed to execute serverfacts");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"));
}

#[test]
fn test_cli_rejects_unknown_subcommand() {
    let output = Command::new(serverfacts_bin())
        .arg("bogus")
        .output()
        .expect("Failed to execute serverfacts");

    assert!(!output.status.success());
}

#[test]
fn test_cli_subcommand_help() {
    let output = Command::new(serverfacts_bin())
        .args(["nginx", "--help"])
        .output()
        .expect("Failed to execute serverfacts");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("nginx"));
    assert!(stdout.contains("--verbose"));
}
