use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Config with host and user filled in, so runs only need a source.
fn config_dir() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{"host": "127.0.0.1", "port": 1, "username": "deploy", "baseDir": "/data/"}"#,
    )
    .expect("write config");
    (dir, path)
}

fn deliver() -> Command {
    let mut cmd = Command::cargo_bin("deliver").expect("binary exists");
    cmd.env_remove("DELIVER_PASSWORD")
        .env_remove("DELIVER_KEY_PASSPHRASE")
        .env("RUST_LOG", "info");
    cmd
}

#[test]
fn help_lists_options() {
    deliver()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--current-year")
                .and(predicate::str::contains("--transport"))
                .and(predicate::str::contains("<SOURCE>")),
        );
}

#[test]
fn missing_secret_is_invalid_input() {
    let (dir, config) = config_dir();
    let source = dir.path().join("a.txt");
    fs::write(&source, "a").unwrap();

    deliver()
        .arg(&source)
        .arg("--config")
        .arg(&config)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("ABORTED"));
}

#[test]
fn traversal_is_rejected_before_connecting() {
    let (dir, config) = config_dir();
    let report = dir.path().join("report.json");

    deliver()
        .arg(dir.path())
        .args(["--subdir", "../etc", "--report"])
        .arg(&report)
        .arg("--config")
        .arg(&config)
        .env("DELIVER_PASSWORD", "pw")
        .assert()
        .code(2);

    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(value["status"], "aborted");
    assert_eq!(value["abortReason"]["kind"], "invalidInput");
}

#[test]
fn unreachable_host_is_connection_failure() {
    let (dir, config) = config_dir();

    deliver()
        .arg(dir.path())
        .arg("--config")
        .arg(&config)
        .env("DELIVER_PASSWORD", "pw")
        .assert()
        .code(6);
}

#[test]
fn malformed_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, "{ nope").unwrap();

    deliver()
        .arg("a.txt")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid config file"));
}

#[test]
fn conflicting_subdir_flags_fail_to_parse() {
    deliver()
        .args(["a.txt", "--subdir", "2023", "--current-year"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
