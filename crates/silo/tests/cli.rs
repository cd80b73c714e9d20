//! End-to-end runs of the `silo` binary against a directory pool.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn silo(tmp: &TempDir) -> Command {
    let config = tmp.path().join("config.toml");
    if !config.exists() {
        std::fs::write(&config, "").unwrap();
    }
    let mut cmd = Command::cargo_bin("silo").unwrap();
    cmd.arg("--root")
        .arg(tmp.path().join("var"))
        .arg("--config-file")
        .arg(config);
    cmd
}

fn root(tmp: &TempDir) -> std::path::PathBuf {
    tmp.path().join("var")
}

#[test]
fn init_creates_layout() {
    let tmp = tempfile::tempdir().unwrap();
    silo(&tmp)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));
    assert!(root(&tmp).is_dir());
}

#[test]
fn directory_pool_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();

    silo(&tmp)
        .args(["pool", "create", "p1", "--driver", "dir"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Storage pool p1 created (dir)"));

    silo(&tmp)
        .args(["create", "c1", "--pool", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Instance c1 created on pool p1"));

    silo(&tmp)
        .args(["snapshot", "c1", "s0"])
        .assert()
        .success();

    silo(&tmp)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("c1"))
        .stdout(predicate::str::contains("c1/s0"));

    silo(&tmp)
        .args(["pool", "list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"p1\""));

    // The pool is busy until its instance is gone
    silo(&tmp).args(["pool", "delete", "p1"]).assert().failure();
    silo(&tmp).args(["delete", "c1"]).assert().success();
    silo(&tmp).args(["pool", "delete", "p1"]).assert().success();
    silo(&tmp)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("c1").not());
}

#[test]
fn quota_on_directory_pool_fails_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    silo(&tmp)
        .args(["pool", "create", "p1", "--driver", "dir"])
        .assert()
        .success();

    silo(&tmp)
        .args(["create", "c1", "--pool", "p1", "--size", "1GiB"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to create instance"));
    silo(&tmp)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("c1").not());
}

#[test]
fn missing_config_file_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("silo")
        .unwrap()
        .arg("--config-file")
        .arg(Path::new("/nonexistent/silo.toml"))
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
    assert!(!root(&tmp).exists());
}

#[test]
fn invalid_names_are_rejected_by_the_parser() {
    let tmp = tempfile::tempdir().unwrap();
    silo(&tmp)
        .args(["create", "bad name"])
        .assert()
        .failure();
}

#[test]
fn custom_volumes_on_a_directory_pool() {
    let tmp = tempfile::tempdir().unwrap();
    silo(&tmp)
        .args(["pool", "create", "p1", "--driver", "dir"])
        .assert()
        .success();

    silo(&tmp)
        .args(["volume", "create", "data", "--pool", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Volume data created on pool p1"));
    silo(&tmp)
        .args(["volume", "snapshot", "data", "s0", "--pool", "p1"])
        .assert()
        .success();
    silo(&tmp)
        .args(["volume", "snapshots", "data", "--pool", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/s0"));
    silo(&tmp)
        .args(["volume", "list", "--pool", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data"));

    silo(&tmp).args(["pool", "delete", "p1"]).assert().failure();
    silo(&tmp)
        .args(["volume", "delete", "data", "--pool", "p1"])
        .assert()
        .success();
    silo(&tmp).args(["pool", "delete", "p1"]).assert().success();
}
