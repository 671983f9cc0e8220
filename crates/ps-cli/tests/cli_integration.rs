//! CLI integration tests
//!
//! Tests the pairsync CLI using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn pairsync() -> Command {
    let mut cmd = Command::cargo_bin("pairsync")
        .expect("Failed to locate pairsync binary - ensure it's built before running tests");
    cmd.env_remove("PAIRSYNC_API_URL")
        .env_remove("PAIRSYNC_POLL_INTERVAL")
        .env_remove("RUST_LOG");
    cmd
}

/// Address with nothing listening on it
fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[test]
fn test_cli_help() {
    pairsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pairsync"))
        .stdout(predicate::str::contains("pairing status"));
}

#[test]
fn test_cli_version() {
    pairsync()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pairsync"));
}

#[test]
fn test_cli_watch_help() {
    pairsync()
        .args(["watch", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--until-paired"))
        .stdout(predicate::str::contains("--save-code"));
}

#[test]
fn test_cli_chat_help() {
    pairsync()
        .args(["chat", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-stream"));
}

#[test]
fn test_cli_unknown_command() {
    pairsync()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_cli_config_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    pairsync()
        .args(["config", "path", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_cli_config_show_without_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    pairsync()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("api_url"));
}

#[test]
fn test_cli_config_init_set_get() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    pairsync()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    pairsync()
        .args(["config", "set", "client.endpoints.chat_channel", "/stream/chat", "--config"])
        .arg(&path)
        .assert()
        .success();

    pairsync()
        .args(["config", "get", "client.endpoints.chat_channel", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("/stream/chat"));
}

#[test]
fn test_cli_config_set_rejects_bad_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    pairsync()
        .args(["config", "set", "client.api_url", "ftp://example.com", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("api_url"));
}

#[test]
fn test_cli_status_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    pairsync()
        .args(["status", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_cli_status_unreachable_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    pairsync()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();

    pairsync()
        .args(["status", "--config"])
        .arg(&path)
        .args(["--api-url", &dead_address()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Status request failed"));
}

#[test]
fn test_cli_invalid_api_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    pairsync()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();

    pairsync()
        .args(["health", "--api-url", "localhost:8000", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_cli_empty_chat_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    pairsync()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();

    pairsync()
        .args(["chat", "   ", "--config"])
        .arg(&path)
        .args(["--api-url", &dead_address()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Message is empty"));
}
