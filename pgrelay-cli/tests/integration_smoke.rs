//! Smoke tests to verify command wiring

use assert_cmd::Command;
use predicates::prelude::*;

fn pgrelay() -> Command {
    let mut cmd = Command::cargo_bin("pgrelay").unwrap();
    // Keep a developer's .env or shell settings out of the picture.
    for var in ["DB_HOST", "DB_USER", "DB_NAME", "DB_PASSWORD", "DB_PORT", "PORT", "PGRELAY_ADDR"] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    pgrelay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("listen"));
}

#[test]
fn test_serve_help() {
    pgrelay()
        .arg("serve")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Port to listen on"));
}

#[test]
fn test_query_help() {
    pgrelay()
        .arg("query")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--param"))
        .stdout(predicate::str::contains("Gateway address"));
}

#[test]
fn test_listen_requires_channel() {
    pgrelay()
        .arg("listen")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<CHANNEL>"));
}

#[test]
fn test_check_without_config_fails() {
    pgrelay()
        .current_dir(std::env::temp_dir())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DB_HOST environment variable is required"));
}
