//! Integration tests for the xp-queue commands

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// Temp dir holding a config file and an empty data directory
fn setup_test_env() -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("data").join("crosspost.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[queue]
backend = "sqlite"
"#,
        escape_path_for_toml(&db_path.to_string_lossy())
    );
    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_string_lossy().to_string())
}

fn xp_queue(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("xp-queue").unwrap();
    cmd.env("CROSSPOST_CONFIG", config_path)
        .env_remove("CROSSPOST_DB_PATH")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_schedule_without_connection_is_pending() {
    let (_temp_dir, config_path) = setup_test_env();

    let output = xp_queue(&config_path)
        .args([
            "schedule",
            "--owner",
            "u1",
            "--caption",
            "Launch day",
            "--at",
            "2h",
            "--platform",
            "pinterest",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let response = stdout_json(&output);
    assert_eq!(response["status"], "scheduled_pending");
    assert!(response["jobId"].is_null());
    let issues = response["issues"][0]["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0], "No pinterest connection found");
    assert_eq!(issues[1], "Pinterest requires a board selection");
}

#[test]
fn test_schedule_in_the_past_is_invalid_input() {
    let (_temp_dir, config_path) = setup_test_env();

    xp_queue(&config_path)
        .args([
            "schedule",
            "--owner",
            "u1",
            "--caption",
            "Too late",
            "--at",
            "2000-01-01T00:00:00Z",
            "--platform",
            "twitter",
        ])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("scheduledAt must be in the future"));

    let output = xp_queue(&config_path).args(["list"]).output().unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), serde_json::json!([]));
}

#[test]
fn test_schedule_from_json_stdin() {
    let (_temp_dir, config_path) = setup_test_env();
    let request = serde_json::json!({
        "ownerId": "u1",
        "caption": "From stdin",
        "scheduledAt": "2099-01-01T00:00:00Z",
        "platforms": [{"provider": "pinterest", "boardId": "42"}],
        "tone": "playful"
    });

    let output = xp_queue(&config_path)
        .args(["schedule", "--json", "-"])
        .write_stdin(request.to_string())
        .output()
        .unwrap();
    assert!(output.status.success());
    let response = stdout_json(&output);
    assert_eq!(response["status"], "scheduled_pending");
    assert_eq!(response["platforms"][0]["boardId"], "42");

    let id = response["id"].as_str().unwrap().to_string();
    let output = xp_queue(&config_path)
        .args(["show", &id])
        .output()
        .unwrap();
    let detail = stdout_json(&output);
    assert_eq!(detail["tone"], "playful");
    assert_eq!(detail["characterCounts"][0]["limit"], 500);
}

#[test]
fn test_unknown_provider_rejected() {
    let (_temp_dir, config_path) = setup_test_env();

    xp_queue(&config_path)
        .args([
            "schedule",
            "--owner",
            "u1",
            "--caption",
            "hi",
            "--at",
            "1h",
            "--platform",
            "myspace",
        ])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Unknown provider"));
}

#[test]
fn test_draft_duplicate_and_list() {
    let (_temp_dir, config_path) = setup_test_env();

    let output = xp_queue(&config_path)
        .args(["draft", "--owner", "u1", "--caption", "An idea", "-p", "linkedin"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let draft = stdout_json(&output);
    assert_eq!(draft["status"], "draft");

    let id = draft["id"].as_str().unwrap().to_string();
    let output = xp_queue(&config_path)
        .args(["duplicate", &id])
        .output()
        .unwrap();
    let copy = stdout_json(&output);
    assert_ne!(copy["id"], draft["id"]);

    xp_queue(&config_path)
        .args(["list", "--owner", "u1", "--status", "draft", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("An idea").count(2));
}

#[test]
fn test_show_missing_post_fails() {
    let (_temp_dir, config_path) = setup_test_env();

    xp_queue(&config_path)
        .args(["show", "no-such-post"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_missing_config_is_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    xp_queue(&missing.to_string_lossy())
        .args(["list"])
        .assert()
        .code(2);
}
