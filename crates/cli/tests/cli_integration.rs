//! CLI integration tests for the administrative subcommands.
//!
//! Uses `assert_cmd` to spawn the `cohort` binary against a throwaway SQLite
//! database and verify exit codes, stdout, and written files.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper: a `cohort` command whose database lives in `dir`.
fn cohort(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("cohort");
    cmd.current_dir(dir);
    cmd.env("DATABASE_URL", format!("sqlite://{}", dir.join("cohort.db").display()));
    cmd.env("RUST_LOG", "warn");
    cmd
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Participant lifecycle server for online experiments",
        ));
}

#[test]
fn version_exits_0() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cohort"));
}

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("sweep"))
        .stdout(predicate::str::contains("reset-db"))
        .stdout(predicate::str::contains("extract-trials"));
}

// ──────────────────────────────────────────────
// 2. Schema management
// ──────────────────────────────────────────────

#[test]
fn create_tables_creates_database_file() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("create-tables")
        .assert()
        .success()
        .stdout(predicate::str::contains("created tables"));
    assert!(dir.path().join("cohort.db").exists());
}

#[test]
fn drop_then_reset_succeed() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("drop-tables")
        .assert()
        .success()
        .stdout(predicate::str::contains("dropped tables"));
    cohort(dir.path())
        .arg("reset-db")
        .assert()
        .success()
        .stdout(predicate::str::contains("reset database"));
}

#[test]
fn memory_database_has_no_schema() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .env("DATABASE_URL", "memory")
        .arg("create-tables")
        .assert()
        .success()
        .stdout(predicate::str::contains("no schema"));
}

// ──────────────────────────────────────────────
// 3. Sweep and export on an empty database
// ──────────────────────────────────────────────

#[test]
fn sweep_on_empty_database() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains("no participants timed out"));
}

#[test]
fn export_writes_both_tables() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("export");
    cohort(dir.path())
        .arg("export")
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote 0 participants"));

    let participants = fs::read_to_string(out.join("participant.csv")).unwrap();
    assert!(participants.starts_with("id,worker_id,hit_id"));
    let data = fs::read_to_string(out.join("data.csv")).unwrap();
    assert_eq!(data, "id,worker_id,condition,json_data\n");
}

#[test]
fn extract_trials_writes_header_only() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("extract-trials")
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote 0 trials"));
    let trials = fs::read_to_string(dir.path().join("trials.csv")).unwrap();
    assert_eq!(trials, "worker_id,condition\n");
}

// ──────────────────────────────────────────────
// 4. Settings errors
// ──────────────────────────────────────────────

#[test]
fn postgres_url_is_rejected() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .env("DATABASE_URL", "postgres://user@localhost/exp")
        .arg("sweep")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported database url"));
}

#[test]
fn bad_env_override_is_rejected() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .env("ALLOTTED_TIME", "an hour")
        .arg("sweep")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ALLOTTED_TIME"));
}

#[test]
fn missing_config_file_is_reported() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("--config")
        .arg("nope.toml")
        .arg("sweep")
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.toml"));
}

#[test]
fn config_file_selects_database() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("cohort.toml");
    fs::write(&config, "database_url = \"from-config.db\"\n").unwrap();
    let mut cmd = cargo_bin_cmd!("cohort");
    cmd.current_dir(dir.path())
        .env_remove("DATABASE_URL")
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(&config)
        .arg("create-tables")
        .assert()
        .success();
    assert!(dir.path().join("from-config.db").exists());
}

#[test]
fn cohort_toml_in_working_directory_is_loaded() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("cohort.toml"), "database_url = \"implicit.db\"\n").unwrap();
    let mut cmd = cargo_bin_cmd!("cohort");
    cmd.current_dir(dir.path())
        .env_remove("DATABASE_URL")
        .env("RUST_LOG", "warn")
        .arg("create-tables")
        .assert()
        .success();
    assert!(dir.path().join("implicit.db").exists());
}

#[test]
fn help_points_at_settings_file() {
    let dir = TempDir::new().unwrap();
    cohort(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cohort.toml"));
}
