use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)]
fn ws() -> Command {
    Command::cargo_bin("ws").unwrap()
}

fn write_fs_config(dir: &TempDir) -> std::path::PathBuf {
    let data_root = dir.path().join("data");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, format!("backend = \"filesystem\"\n\n[workspace]\nroot = {:?}\n", data_root)).unwrap();
    config_path
}

#[test]
fn create_project_then_list_projects_round_trips() {
    let dir = TempDir::new().unwrap();
    let config = write_fs_config(&dir);

    ws().arg("--config")
        .arg(&config)
        .args(["create-project", "alice", "My Project"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"My Project\""));

    ws().arg("--config")
        .arg(&config)
        .args(["list-projects", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("My Project"));
}

#[test]
fn head_project_on_unknown_id_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = write_fs_config(&dir);

    ws().arg("--config")
        .arg(&config)
        .args(["head-project", "alice", "00000000-0000-0000-0000-000000000000"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn doctor_reports_filesystem_backend_as_reachable() {
    let dir = TempDir::new().unwrap();
    let config = write_fs_config(&dir);

    ws().arg("--config").arg(&config).arg("doctor").assert().success().stdout(predicate::str::contains("object store: reachable"));
}

#[test]
fn invalid_config_file_exits_with_code_one() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "not valid toml [[[").unwrap();

    ws().arg("--config").arg(&config_path).arg("doctor").assert().failure().code(1);
}
