#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;

fn thelma(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("thelma").unwrap();
    cmd.current_dir(dir.path())
        .env("THELMA_HOME", dir.path())
        .env("TZ", "UTC")
        .env_remove("THELMA_CONFIG")
        .env_remove("THELMA_STATE_PATH")
        .env_remove("THELMA_SHERLOCK_ADDR")
        .env_remove("SLACK_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

fn state_path(dir: &TempDir) -> PathBuf {
    dir.path().join("state/bees.json")
}

fn release(name: &str, env: &str) -> Value {
    json!({
        "name": name,
        "chartName": name,
        "chartVersion": "1.0.0",
        "repo": "terra-helm",
        "cluster": "terra-qa-bees",
        "namespace": format!("terra-{env}"),
        "type": "app",
        "environment": env,
        "appVersion": "a1b2c3d",
    })
}

fn environment(name: &str, lifecycle: &str, template: &str, owner: &str) -> Value {
    json!({
        "name": name,
        "template": template,
        "lifecycle": lifecycle,
        "owner": owner,
        "offline": false,
        "createdAt": "2024-03-12T10:00:00Z",
        "defaultCluster": "terra-qa-bees",
        "releases": [release("leonardo", name), release("sam", name)],
    })
}

/// `swatomation` template plus two BEEs: `my-bee` stops daily at 17:00
/// US-Eastern and is due for deletion, `other-bee` has neither.
fn seed_state(dir: &TempDir) {
    let mut mine = environment("my-bee", "dynamic", "swatomation", "jdoe@broadinstitute.org");
    mine["offlineScheduleBegin"] = json!({ "enabled": true, "time": "2024-03-12T17:00:00-05:00" });
    mine["autoDelete"] = json!({ "enabled": true, "after": "2024-03-13T10:00:00Z" });
    let other = environment("other-bee", "dynamic", "swatomation", "someone@broadinstitute.org");

    let doc = json!({
        "generation": 1,
        "environments": [
            environment("swatomation", "template", "", ""),
            mine,
            other,
        ],
        "clusters": [{ "name": "terra-qa-bees", "project": "broad-dsde-qa" }],
    });
    let path = state_path(dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
}

fn stored(dir: &TempDir, name: &str) -> Value {
    let doc: Value = serde_json::from_slice(&std::fs::read(state_path(dir)).unwrap()).unwrap();
    doc["environments"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == name)
        .cloned()
        .unwrap_or(Value::Null)
}

fn json_stdout(cmd: &mut Command) -> Value {
    let out = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

// ---------------------------------------------------------------------------
// thelma bee list / describe
// ---------------------------------------------------------------------------

#[test]
fn list_shows_only_bees() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("my-bee"))
        .stdout(predicate::str::contains("other-bee"))
        .stdout(predicate::str::contains("swatomation").count(2));
}

#[test]
fn list_filters_by_owner() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    let v = json_stdout(thelma(&dir).args(["bee", "list", "--owner", "JDOE@broadinstitute.org", "--json"]));
    let names: Vec<&str> = v.as_array().unwrap().iter().map(|b| b["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["my-bee"]);
}

#[test]
fn list_with_no_state_is_empty() {
    let dir = TempDir::new().unwrap();
    thelma(&dir)
        .args(["bee", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No BEEs."));
}

#[test]
fn describe_prints_schedule_and_releases() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "describe", "my-bee"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stops daily at: 17:00 -05:00"))
        .stdout(predicate::str::contains("leonardo"))
        .stdout(predicate::str::contains("https://terraui.my-bee."));
}

#[test]
fn describe_json_includes_state_and_url() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    let v = json_stdout(thelma(&dir).args(["bee", "describe", "my-bee", "-j"]));
    assert_eq!(v["name"], "my-bee");
    assert_eq!(v["lifecycle"], "dynamic");
    assert!(v["url"].as_str().unwrap().starts_with("https://terraui.my-bee."));
    assert_eq!(v["releases"].as_array().unwrap().len(), 2);
}

#[test]
fn describe_unknown_bee_fails() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "describe", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("nope"));
}

// ---------------------------------------------------------------------------
// thelma bee pin / unpin
// ---------------------------------------------------------------------------

#[test]
fn pin_helmfile_ref_without_sync() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    let v = json_stdout(thelma(&dir).args([
        "bee",
        "pin",
        "my-bee",
        "--terra-helmfile-ref",
        "my-helmfile-ref",
        "--no-sync",
        "--json",
    ]));
    assert_eq!(v["sam"]["terraHelmfileRef"], "my-helmfile-ref");
    assert_eq!(v["leonardo"]["terraHelmfileRef"], "my-helmfile-ref");

    let env = stored(&dir, "my-bee");
    assert_eq!(env["terraHelmfileRef"], "my-helmfile-ref");
    assert_eq!(env["pins"]["sam"]["terraHelmfileRef"], "my-helmfile-ref");
}

#[test]
fn pin_from_versions_file_then_unpin() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    let versions = dir.path().join("versions.yaml");
    std::fs::write(&versions, "sam:\n  appVersion: feature-branch\n").unwrap();

    thelma(&dir)
        .args(["bee", "pin", "my-bee", "--no-sync", "--versions-file"])
        .arg(&versions)
        .assert()
        .success()
        .stdout(predicate::str::contains("feature-branch"));
    assert_eq!(stored(&dir, "my-bee")["pins"]["sam"]["appVersion"], "feature-branch");

    thelma(&dir)
        .args(["bee", "unpin", "my-bee", "--no-sync"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed version overrides"));
    assert!(stored(&dir, "my-bee").get("pins").is_none());
}

#[test]
fn pin_reads_legacy_properties_from_stdin() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args([
            "bee",
            "pin",
            "my-bee",
            "--no-sync",
            "--versions-file",
            "-",
            "--versions-format",
            "legacy-jenkins-properties",
        ])
        .write_stdin("sam_img=abc123\n")
        .assert()
        .success();
    assert_eq!(stored(&dir, "my-bee")["pins"]["sam"]["appVersion"], "abc123");
}

#[test]
fn unknown_versions_format_is_rejected() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "pin", "my-bee", "--no-sync", "--versions-format", "toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("toml"));
}

// ---------------------------------------------------------------------------
// thelma bee start / stop
// ---------------------------------------------------------------------------

#[test]
fn stop_then_start_flips_offline() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "stop", "my-bee", "--no-sync", "--no-notify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("BEE 'my-bee' stopped."));
    assert_eq!(stored(&dir, "my-bee")["offline"], true);

    let v = json_stdout(thelma(&dir).args(["bee", "list", "--offline", "-j"]));
    assert_eq!(v.as_array().unwrap().len(), 1);

    thelma(&dir)
        .args(["bee", "start", "my-bee", "--no-sync", "--no-notify"])
        .assert()
        .success();
    assert_eq!(stored(&dir, "my-bee")["offline"], false);
}

// ---------------------------------------------------------------------------
// thelma bees
// ---------------------------------------------------------------------------

#[test]
fn bulk_delete_dry_run_selects_due_bees_only() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    let v = json_stdout(thelma(&dir).args(["bees", "delete", "--auto-delete-only", "--dry-run", "--json"]));
    assert_eq!(v["dryRun"], true);
    assert_eq!(v["selected"], json!(["my-bee"]));
    assert_eq!(v["deleted"], json!([]));
    assert!(stored(&dir, "my-bee").is_object());
}

#[test]
fn apply_schedule_dry_run_reports_flip() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args([
            "bees",
            "apply-schedule",
            "--dry-run",
            "--now",
            "2024-03-12T17:05:00-05:00",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("would stop my-bee"))
        .stdout(predicate::str::contains("other-bee").not());
    assert_eq!(stored(&dir, "my-bee")["offline"], false);
}

#[test]
fn apply_schedule_outside_window_does_nothing() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bees", "apply-schedule", "--dry-run", "--now", "2024-03-12T12:00:00-05:00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No BEEs to start or stop."));
}

// ---------------------------------------------------------------------------
// Errors and flags
// ---------------------------------------------------------------------------

#[test]
fn deleting_a_template_requires_force() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "delete", "swatomation"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("swatomation"));
    assert!(stored(&dir, "swatomation").is_object());
}

#[test]
fn delete_missing_bee_without_ignore_fails() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    thelma(&dir)
        .args(["bee", "delete", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn bad_duration_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    thelma(&dir)
        .args(["bee", "create", "--delete-after", "5w"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown unit"));
}

#[test]
fn bad_rfc3339_time_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    thelma(&dir)
        .args(["bee", "create", "--daily-stop-time", "6pm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid RFC3339 time"));
}

#[test]
fn sherlock_backend_without_address_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "state:\n  backend: sherlock\n").unwrap();
    thelma(&dir)
        .args(["bee", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn gcs_backend_without_bucket_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "state:\n  backend: gcs\n").unwrap();
    thelma(&dir)
        .args(["bee", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("state.bucket"));
}

#[test]
fn explicit_config_and_state_path() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir);
    let elsewhere = TempDir::new().unwrap();
    let config = elsewhere.path().join("thelma.yaml");
    std::fs::write(
        &config,
        format!("state:\n  path: {}\n", state_path(&dir).display()),
    )
    .unwrap();
    thelma(&elsewhere)
        .args(["bee", "list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("my-bee"));
}
