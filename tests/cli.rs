//! End-to-end tests for the `keyward` CLI binary.
//!
//! Mirrors `envvault`'s `tests/cli_integration.rs`: exercise the compiled
//! binary with `assert_cmd`, supplying the password non-interactively via
//! `KEYWARD_PASSWORD` rather than piping stdin.

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::prelude::*;

fn keyward(vault_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("keyward").expect("binary should exist");
    cmd.arg("--vault-dir").arg(vault_dir);
    cmd
}

#[test]
fn set_then_get_round_trips() {
    let tmp = TempDir::new().unwrap();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["set", "app", "API_KEY", "s3cr3t"])
        .assert()
        .success();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["get", "app", "API_KEY"])
        .assert()
        .success()
        .stdout(predicate::str::contains("s3cr3t"));
}

#[test]
fn list_shows_created_project() {
    let tmp = TempDir::new().unwrap();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["set", "app", "K", "v1"])
        .assert()
        .success();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("app"))
        .stdout(predicate::str::contains("1 secrets"));
}

#[test]
fn get_missing_key_fails() {
    let tmp = TempDir::new().unwrap();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["set", "app", "K", "v1"])
        .assert()
        .success();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["get", "app", "MISSING"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn wrong_password_on_existing_vault_fails() {
    let tmp = TempDir::new().unwrap();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["set", "app", "K", "v1"])
        .assert()
        .success();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "WRONG")
        .args(["get", "app", "K"])
        .assert()
        .failure();
}

#[test]
fn run_injects_secrets_into_child_environment() {
    let tmp = TempDir::new().unwrap();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["set", "app", "GREETING", "hello-from-vault"])
        .assert()
        .success();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["run", "--project", "app", "--", "sh", "-c", "echo $GREETING"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello-from-vault"));
}

#[test]
fn run_forwards_child_exit_code() {
    let tmp = TempDir::new().unwrap();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["set", "app", "K", "v1"])
        .assert()
        .success();

    keyward(tmp.path())
        .env("KEYWARD_PASSWORD", "hunter2")
        .args(["run", "--project", "app", "--", "sh", "-c", "exit 7"])
        .assert()
        .failure()
        .code(7);
}
