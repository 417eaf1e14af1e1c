//! Binary-level tests for the cs-workers CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn workers() -> Command {
    let mut cmd = cargo_bin_cmd!("cs-workers");
    cmd.env_remove("CS_WORKERS_DB")
        .env_remove("CS_CLIENT_ID")
        .env_remove("CS_CLIENT_SECRET")
        .env_remove("RUST_LOG");
    cmd
}

fn add_user(dir: &TempDir, username: &str) -> assert_cmd::assert::Assert {
    workers()
        .current_dir(dir.path())
        .args([
            "users",
            "add",
            username,
            "--url",
            "https://compute.studio/",
            "--client-id",
            "cid",
            "--client-secret",
            "secret",
        ])
        .assert()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        workers()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"))
            .stdout(predicate::str::contains("users"));
    }

    #[test]
    fn test_version() {
        workers()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        workers().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("workers.toml"), "[server\nport = ").unwrap();
        workers()
            .current_dir(dir.path())
            .arg("init-db")
            .assert()
            .failure()
            .stderr(predicate::str::contains("workers.toml"));
    }
}

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("workers.db");
        workers()
            .current_dir(dir.path())
            .arg("init-db")
            .arg("--db-path")
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_uses_configured_path() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("workers.toml"),
            "[database]\npath = \"configured.db\"\n",
        )
        .unwrap();
        workers()
            .current_dir(dir.path())
            .arg("init-db")
            .assert()
            .success();
        assert!(dir.path().join("configured.db").exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            workers()
                .current_dir(dir.path())
                .arg("init-db")
                .assert()
                .success();
        }
        assert!(dir.path().join("cs-workers.db").exists());
    }
}

mod users {
    use super::*;

    #[test]
    fn test_add_user_prints_token() {
        let dir = TempDir::new().unwrap();
        add_user(&dir, "webapp")
            .success()
            .stdout(predicate::str::contains("Registered webapp"))
            .stdout(predicate::str::is_match(r"API token: [0-9a-f]{32}").unwrap());
    }

    #[test]
    fn test_duplicate_user_fails() {
        let dir = TempDir::new().unwrap();
        add_user(&dir, "webapp").success();
        add_user(&dir, "webapp")
            .failure()
            .stderr(predicate::str::contains("Could not register webapp"));
    }

    #[test]
    fn test_add_user_requires_url() {
        let dir = TempDir::new().unwrap();
        workers()
            .current_dir(dir.path())
            .args(["users", "add", "webapp", "--client-id", "a", "--client-secret", "b"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--url"));
    }
}
