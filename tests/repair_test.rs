use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn plexcache(root: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("plexcache");
    cmd.current_dir(root)
        .env("PLEXCACHE_HOME", root.join("home"))
        .env("PLEXCACHE_CACHE_DIR", root.join("cache"))
        .env("PLEXCACHE_ARRAY_DIR", root.join("array"))
        .env("PLEXCACHE_SHARE_DIR", root.join("share"))
        .env("PLEXCACHE_LOG", "warn");
    cmd
}

fn orphaned_backup(root: &Path) {
    fs::create_dir_all(root.join("cache")).expect("mkdir cache");
    fs::create_dir_all(root.join("array/movies")).expect("mkdir array");
    fs::write(root.join("array/movies/Heat.mkv.plexcached"), "heat").expect("write backup");
}

#[test]
fn health_fails_while_anomalies_exist() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    orphaned_backup(root);

    plexcache(root)
        .arg("health")
        .assert()
        .failure()
        .stdout(predicate::str::contains("orphaned_backup=1"));
}

#[test]
fn repairs_preview_by_default_and_execute_with_apply() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    orphaned_backup(root);

    plexcache(root)
        .args(["repair", "restore_plexcached", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode=dry-run"))
        .stdout(predicate::str::contains("summary fixed=1 skipped=0 failed=0"));
    assert!(root.join("array/movies/Heat.mkv.plexcached").exists());

    plexcache(root)
        .args(["repair", "restore_plexcached", "--all", "--apply"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode=apply"));
    assert!(!root.join("array/movies/Heat.mkv.plexcached").exists());
    assert_eq!(
        fs::read_to_string(root.join("array/movies/Heat.mkv")).expect("restored"),
        "heat"
    );

    plexcache(root).arg("health").assert().success();
}

#[test]
fn audit_json_lists_findings() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    orphaned_backup(root);

    let output = plexcache(root)
        .args(["--json", "audit"])
        .output()
        .expect("run audit");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["command"], "audit");
    let orphaned = report["data"]["orphaned_backup"].as_array().expect("array");
    assert_eq!(orphaned.len(), 1);
    assert!(
        orphaned[0]
            .as_str()
            .expect("path")
            .ends_with("cache/movies/Heat.mkv")
    );
}

#[test]
fn repair_requires_paths_or_all() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    orphaned_backup(root);

    plexcache(root)
        .args(["repair", "clean_exclude"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no paths given"));
}

#[test]
fn resolve_duplicate_requires_keep() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    fs::create_dir_all(root.join("cache")).expect("mkdir cache");
    fs::create_dir_all(root.join("array")).expect("mkdir array");
    fs::write(root.join("cache/dup.mkv"), "same").expect("write cache");
    fs::write(root.join("array/dup.mkv"), "same").expect("write array");

    plexcache(root)
        .args(["repair", "resolve_duplicate", "--all"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--keep"));

    plexcache(root)
        .args(["repair", "resolve_duplicate", "--all", "--keep", "array", "--apply"])
        .assert()
        .success();
    assert!(!root.join("cache/dup.mkv").exists());
    assert!(root.join("array/dup.mkv").exists());
}
