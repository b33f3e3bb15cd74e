use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn chainvault(data: &Path) -> Command {
    let mut cmd = Command::cargo_bin("chainvault").unwrap();
    cmd.env("CHAINVAULT_DATA_DIR", data).env("RUST_LOG", "off");
    cmd
}

/// Data dir with one project whose files live in `src`
fn setup() -> (TempDir, TempDir) {
    let data = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("app")).unwrap();
    fs::write(src.path().join("index.php"), "<?php echo 'hi';").unwrap();
    fs::write(src.path().join("app/Kernel.php"), "<?php class Kernel {}").unwrap();
    fs::write(src.path().join("debug.log"), "noise").unwrap();

    chainvault(data.path()).arg("init").assert().success();
    chainvault(data.path())
        .args(["project", "add", "shop", "--path"])
        .arg(src.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Added project: shop"));

    (data, src)
}

fn backup_id(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .lines()
        .find_map(|line| line.strip_prefix("Backup: "))
        .map(|id| id.trim().to_string())
        .expect("backup id in output")
}

#[test]
fn test_no_command_prints_usage_hint() {
    let data = TempDir::new().unwrap();
    chainvault(data.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("chainvault --help"));
}

#[test]
fn test_backup_and_restore_round_trip() {
    let (data, _src) = setup();

    let output = chainvault(data.path())
        .args(["backup", "create", "shop"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("Status:    completed"));
    assert!(stdout.contains("Files:     2"));
    let id = backup_id(&output.stdout);

    chainvault(data.path())
        .args(["backup", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("Total: 1 backup(s)"));

    chainvault(data.path())
        .args(["backup", "verify", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Checksum OK"));

    let dest = TempDir::new().unwrap();
    chainvault(data.path())
        .args(["restore", &id, "--to"])
        .arg(dest.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored 1 artifact(s)"));

    assert_eq!(
        fs::read_to_string(dest.path().join("app/Kernel.php")).unwrap(),
        "<?php class Kernel {}"
    );
    assert!(!dest.path().join("debug.log").exists());

    // second restore into the same place conflicts unless overwriting
    chainvault(data.path())
        .args(["restore", &id, "--to"])
        .arg(dest.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already contains"));

    chainvault(data.path())
        .args(["restore", &id, "--overwrite", "--to"])
        .arg(dest.path())
        .assert()
        .success();
}

#[test]
fn test_incremental_requires_parent() {
    let (data, _src) = setup();

    chainvault(data.path())
        .args(["backup", "create", "shop", "--type", "incremental"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("requires a parent"));

    chainvault(data.path())
        .args(["backup", "create", "shop", "--type", "incremental", "--parent", "latest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no completed file backup"));
}

#[test]
fn test_incremental_on_latest_and_delete_rules() {
    let (data, _src) = setup();

    let full = chainvault(data.path())
        .args(["backup", "create", "shop"])
        .output()
        .unwrap();
    assert!(full.status.success());
    let full_id = backup_id(&full.stdout);

    let inc = chainvault(data.path())
        .args(["backup", "create", "shop", "--type", "incremental", "--parent", "latest"])
        .output()
        .unwrap();
    assert!(inc.status.success());
    let inc_stdout = String::from_utf8_lossy(&inc.stdout).to_string();
    assert!(inc_stdout.contains("Depth:     1"));
    let inc_id = backup_id(&inc.stdout);

    // without --force nothing happens
    chainvault(data.path())
        .args(["backup", "delete", &full_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("--force"));

    chainvault(data.path())
        .args(["backup", "delete", &full_id, "--force"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dependent"));

    chainvault(data.path())
        .args(["backup", "delete", &inc_id, "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 1 backup(s)."));

    chainvault(data.path())
        .args(["backup", "delete", &full_id, "--force"])
        .assert()
        .success();

    chainvault(data.path())
        .args(["backup", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups found."));
}

#[test]
fn test_schedule_lifecycle() {
    let (data, _src) = setup();

    chainvault(data.path())
        .args(["schedule", "add", "shop", "--kind", "file", "--time", "03:30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Daily at 03:30"));

    chainvault(data.path())
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("active"));

    // a second active schedule for the same project and kind is refused
    chainvault(data.path())
        .args(["schedule", "add", "shop", "--kind", "file"])
        .assert()
        .failure();

    chainvault(data.path())
        .args(["schedule", "add", "shop", "--kind", "file", "--retention-days", "0"])
        .assert()
        .failure();

    chainvault(data.path())
        .args(["retention", "enforce"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 0"));
}

#[test]
fn test_retention_without_schedules() {
    let data = TempDir::new().unwrap();
    chainvault(data.path())
        .args(["retention", "enforce"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active schedules."));
}

#[test]
fn test_unknown_project() {
    let data = TempDir::new().unwrap();
    chainvault(data.path())
        .args(["backup", "create", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_disk_test_local() {
    let data = TempDir::new().unwrap();
    chainvault(data.path()).arg("init").assert().success();

    chainvault(data.path())
        .args(["disk", "test", "local"])
        .assert()
        .success()
        .stdout(predicate::str::contains("delete  ok"))
        .stdout(predicate::str::contains("Disk local is reachable."));

    chainvault(data.path())
        .args(["disk", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("local"));
}

#[test]
fn test_disk_test_unconfigured_disk_fails() {
    let data = TempDir::new().unwrap();
    chainvault(data.path())
        .args(["disk", "test", "s3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not configured"));
}
