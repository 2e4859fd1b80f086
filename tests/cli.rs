use assert_cmd::Command;
use predicates::prelude::*;

fn convoy(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.current_dir(dir);
    cmd
}

#[test]
fn test_list_shows_builtin_tests() {
    let dir = tempfile::tempdir().unwrap();
    convoy(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("basic.ssh"))
        .stdout(predicate::str::contains("basic.manual.sleep"))
        .stdout(predicate::str::contains("(manual)"));
}

#[test]
fn test_list_json() {
    let dir = tempfile::tempdir().unwrap();
    let output = convoy(dir.path()).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());

    let tests: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let native = tests
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "basic.native")
        .unwrap();
    assert_eq!(native["native_funcs"].as_array().unwrap().len(), 3);
}

#[test]
fn test_validate_without_config_file() {
    let dir = tempfile::tempdir().unwrap();
    convoy(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("local (local)"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("convoy.toml"), "[convoy]\nparallel = 0\n").unwrap();
    convoy(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("parallel"));
}

#[test]
fn test_unknown_platform() {
    let dir = tempfile::tempdir().unwrap();
    convoy(dir.path())
        .args(["run", "basic.ssh", "--platform", "gce"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown platform \"gce\""));
}

#[test]
fn test_run_ssh_on_local() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("convoy.toml"),
        "[convoy]\ncluster_splay_ms = 0\nteardown_delay_ms = 0\n",
    )
    .unwrap();

    convoy(dir.path())
        .args(["run", "basic.ssh", "--output-dir", "out", "--parallel", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--- PASS: basic.ssh"))
        .stdout(predicate::str::contains("PASS, output in out"));

    let tap = std::fs::read_to_string(dir.path().join("out").join("test.tap")).unwrap();
    assert_eq!(tap, "1..1\nok 1 - basic.ssh\n");
}

#[test]
fn test_run_nothing_selected() {
    let dir = tempfile::tempdir().unwrap();
    convoy(dir.path())
        .args(["run", "no.such.*", "--output-dir", "out"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PASS, output in out"));
}
