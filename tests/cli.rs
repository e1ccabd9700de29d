use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

/// Config that keeps every directory under `root` and the peer layer off
fn write_config(root: &Path, extra: &str) -> PathBuf {
    let path = root.join("config.yaml");
    let contents = format!(
        "cache:\n  dir: {cache}\ncredentials:\n  dir: {creds}\n  keyring: false\nscan:\n  dir: {scans}\np2p:\n  enabled: false\n{extra}",
        cache = root.join("cache").display(),
        creds = root.join("creds").display(),
        scans = root.join("scans").display(),
    );
    fs::write(&path, contents).expect("failed to write config");
    path
}

fn fleetcache(config: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("fleetcache"));
    cmd.env("FLEETCACHE_CONFIG", config)
        .env_remove("FLEETCACHE_FORMAT")
        .env_remove("FLEETCACHE_NO_CACHE")
        .env_remove("GITHUB_TOKEN");
    cmd
}

#[test]
fn cache_path_uses_configured_dir() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let config = write_config(temp.path(), "");

    fleetcache(&config)
        .args(["cache", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(temp.path().join("cache").display().to_string()));

    Ok(())
}

#[test]
fn completions_generate_for_bash() {
    Command::new(assert_cmd::cargo::cargo_bin!("fleetcache"))
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fleetcache"));
}

#[test]
fn invalid_config_is_reported() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let config = temp.path().join("config.yaml");
    fs::write(&config, "p2p:\n  port_start: 9010\n  port_end: 9000\n")?;

    fleetcache(&config)
        .args(["cache", "path"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("port_start"));

    Ok(())
}

#[test]
fn secret_round_trip_and_scope_denial() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let config = write_config(temp.path(), "");

    fleetcache(&config)
        .args(["secret", "put", "deploy-key", "--scope", "repo:octo/*"])
        .write_stdin("s3cret\n")
        .assert()
        .success();

    fleetcache(&config)
        .args(["secret", "get", "deploy-key", "--scope", "repo:octo/app"])
        .assert()
        .success()
        .stdout("s3cret\n");

    fleetcache(&config)
        .args(["secret", "get", "deploy-key", "--scope", "repo:other/app"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("scope mismatch"))
        .stdout(predicate::str::contains("s3cret").not());

    let assert = fleetcache(&config)
        .args(["--format", "json", "secret", "audit"])
        .assert()
        .success();
    let records: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout)?;
    let decisions: Vec<&str> = records
        .as_array()
        .expect("audit is a list")
        .iter()
        .filter_map(|r| r["decision"].as_str())
        .collect();
    assert_eq!(decisions, vec!["stored", "granted", "denied"]);

    Ok(())
}

#[test]
fn get_serves_second_call_from_disk() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = mockito::Server::new();
    let repo = server
        .mock("GET", "/repos/octo/app")
        .with_status(200)
        .with_body(r#"{"full_name":"octo/app"}"#)
        .expect(1)
        .create();

    let temp = tempdir()?;
    let config = write_config(temp.path(), &format!("github:\n  api_url: {}\n", server.url()));

    for expected_origin in ["origin", "disk"] {
        let assert = fleetcache(&config)
            .args(["--format", "json", "get", "get_repo", "-p", "owner=octo", "-p", "repo=app"])
            .assert()
            .success();
        let json: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout)?;
        assert_eq!(json["origin"], expected_origin);
        assert_eq!(json["value"]["full_name"], "octo/app");
    }

    repo.assert();
    Ok(())
}

#[test]
fn get_surfaces_origin_errors() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = mockito::Server::new();
    let _missing = server.mock("GET", "/repos/octo/gone").with_status(404).create();

    let temp = tempdir()?;
    let config = write_config(temp.path(), &format!("github:\n  api_url: {}\n", server.url()));

    fleetcache(&config)
        .args(["get", "get_repo", "-p", "owner=octo", "-p", "repo=gone"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));

    Ok(())
}

#[test]
fn scan_check_without_history_says_run() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let config = write_config(temp.path(), "");

    fleetcache(&config)
        .args(["scan", "check", "--repo", "octo/app", "--commit", "abc123"])
        .args(["--repo-dir", &temp.path().display().to_string()])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Run:"));

    Ok(())
}

#[test]
fn scan_record_then_same_commit_skips() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let config = write_config(temp.path(), "");
    let repo_dir = temp.path().display().to_string();
    let target = [
        "--repo", "octo/app", "--commit", "abc123", "--repo-dir", &repo_dir, "--language", "python",
    ];

    fleetcache(&config)
        .args(["scan", "record", "--result-ref", "sarif-1"])
        .args(target)
        .assert()
        .success();

    fleetcache(&config)
        .args(["scan", "check"])
        .args(target)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("sarif-1"));

    fleetcache(&config)
        .args(["--format", "json", "scan", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"scans_skipped\": 1"));

    Ok(())
}
