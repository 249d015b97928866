//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

fn checkrun() -> Command {
    let mut cmd = Command::cargo_bin("checkrun").unwrap();
    // Keep host configuration out of the picture.
    cmd.env_remove("CHECKRUN_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    checkrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("On-demand verification runs"));
}

#[test]
fn test_cli_version() {
    checkrun()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("checkrun"));
}

#[test]
fn test_run_subcommand_exists() {
    checkrun()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--parallel"));
}

#[test]
fn test_history_and_show_subcommands_exist() {
    checkrun().args(["history", "--help"]).assert().success();
    checkrun().args(["show", "--help"]).assert().success();
    checkrun().args(["serve", "--help"]).assert().success();
}

#[test]
fn test_suites_lists_builtin_checks() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("checkrun.toml");
    std::fs::write(&config, "").unwrap();

    checkrun()
        .arg("--config")
        .arg(&config)
        .arg("suites")
        .assert()
        .success()
        .stdout(predicates::str::contains("api-auth-flow"))
        .stdout(predicates::str::contains("data-integrity"));
}

#[test]
fn test_bad_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("checkrun.toml");
    std::fs::write(&config, "[runner]\nmax_parallel_checks = 0\n").unwrap();

    checkrun()
        .arg("--config")
        .arg(&config)
        .arg("suites")
        .assert()
        .failure();
}

#[test]
fn test_history_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("checkrun.toml");
    let db = dir.path().join("runs.db");
    std::fs::write(
        &config,
        format!("[storage]\ndb_path = {:?}\n", db.to_str().unwrap()),
    )
    .unwrap();

    checkrun()
        .arg("--config")
        .arg(&config)
        .arg("history")
        .assert()
        .success()
        .stdout(predicates::str::contains("No runs recorded."));
}
