//! CLI Argument Parsing Tests for vcp
//!
//! These tests verify that command-line arguments are parsed correctly: value formats, aliases and
//! conflicting flags.

use assert_cmd::Command;

#[test]
fn test_help_runs() {
    Command::cargo_bin("vcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("vcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_missing_arguments_fail() {
    Command::cargo_bin("vcp").unwrap().assert().failure();
}

// ============================================================================
// ProgressType Argument Parsing Tests
// ============================================================================

#[test]
fn test_progress_type_values() {
    for value in [
        "auto",
        "Auto",
        "progress-bar",
        "ProgressBar",
        "text-updates",
        "TextUpdates",
    ] {
        Command::cargo_bin("vcp")
            .unwrap()
            .args(["--progress-type", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_progress_type_invalid() {
    Command::cargo_bin("vcp")
        .unwrap()
        .args(["--progress-type", "sparkles", "src", "dst"])
        .assert()
        .failure();
}

// ============================================================================
// Size and count arguments
// ============================================================================

#[test]
fn test_chunk_size_human_readable() {
    for value in ["1MiB", "256KiB", "4096", "64KB"] {
        Command::cargo_bin("vcp")
            .unwrap()
            .args(["--chunk-size", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_chunk_size_invalid() {
    Command::cargo_bin("vcp")
        .unwrap()
        .args(["--chunk-size", "lots", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_regions_must_be_a_number() {
    Command::cargo_bin("vcp")
        .unwrap()
        .args(["--concurrent", "--regions", "four", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_ledger_formats_conflict() {
    Command::cargo_bin("vcp")
        .unwrap()
        .args(["--ledger", "--ledger-json", "src", "dst"])
        .assert()
        .failure();
}
