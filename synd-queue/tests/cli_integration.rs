//! Integration tests for synd-queue

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// Temp dir with a config pointing the database and master key inside it
fn setup_test_env() -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("scheduler.db");
    let key_path = temp_dir.path().join("master.key");

    let config_content = format!(
        r#"
[database]
path = "{}"

[credentials]
master_key_file = "{}"
"#,
        escape_path_for_toml(&db_path.to_string_lossy()),
        escape_path_for_toml(&key_path.to_string_lossy())
    );
    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_string_lossy().to_string())
}

fn synd_queue(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("synd-queue").unwrap();
    cmd.env("SYNDICATE_CONFIG", config_path)
        .env_remove("SYNDICATE_DB_PATH")
        .env_remove("SYNDICATE_MASTER_KEY");
    cmd
}

/// Environment with a master key and one connected TikTok account
fn setup_connected() -> (TempDir, String) {
    let (temp_dir, config_path) = setup_test_env();

    synd_queue(&config_path).arg("keygen").assert().success();
    synd_queue(&config_path)
        .args(["connect", "tt-1", "--platform", "tiktok", "--stdin", "--expires-in", "24h"])
        .write_stdin("access-token\nrefresh-token\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Connected tt-1 on tiktok"));

    (temp_dir, config_path)
}

fn enqueue_json(config_path: &str, args: &[&str]) -> serde_json::Value {
    let output = synd_queue(config_path)
        .arg("enqueue")
        .args(args)
        .args(["--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "enqueue failed: {:?}", output);
    serde_json::from_slice(&output.stdout).unwrap()
}

// KEYGEN

#[test]
fn test_keygen_writes_key_once() {
    let (temp_dir, config_path) = setup_test_env();

    synd_queue(&config_path)
        .arg("keygen")
        .assert()
        .success()
        .stdout(predicate::str::contains("Public key: age1"));
    assert!(temp_dir.path().join("master.key").exists());

    // Never overwrites an existing key
    synd_queue(&config_path).arg("keygen").assert().code(1);
}

// ENQUEUE / STATUS / LIST

#[test]
fn test_enqueue_then_status_and_list() {
    let (_temp_dir, config_path) = setup_connected();

    let outcome = enqueue_json(
        &config_path,
        &["--token", "tt-1", "--platform", "tiktok", "--caption", "hello", "--at", "2h"],
    );
    assert_eq!(outcome["result"], "created");
    let job_id = outcome["job_id"].as_str().unwrap().to_string();

    let output = synd_queue(&config_path)
        .args(["status", job_id.as_str(), "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state["status"], "pending");
    assert_eq!(state["token_id"], "tt-1");
    assert_eq!(state["platform"], "tiktok");
    assert_eq!(state["attempts"], 0);

    synd_queue(&config_path)
        .args(["list", "--status", "pending"])
        .assert()
        .success()
        .stdout(predicate::str::contains(job_id.as_str()))
        .stdout(predicate::str::contains("in 1 hour").or(predicate::str::contains("in 2 hours")));
}

#[test]
fn test_enqueue_duplicate_returns_original_job() {
    let (_temp_dir, config_path) = setup_connected();
    let args = [
        "--token", "tt-1", "--platform", "tiktok", "--caption", "launch", "--dedupe", "campaign-1",
    ];

    let first = enqueue_json(&config_path, &args);
    let second = enqueue_json(&config_path, &args);

    assert_eq!(first["result"], "created");
    assert_eq!(second["result"], "duplicate");
    assert_eq!(first["job_id"], second["job_id"]);
}

#[test]
fn test_resubmitting_same_post_now_is_a_duplicate() {
    let (_temp_dir, config_path) = setup_connected();
    let args = ["--token", "tt-1", "--platform", "tiktok", "--caption", "same words"];

    let first = enqueue_json(&config_path, &args);
    let second = enqueue_json(&config_path, &args);

    assert_eq!(second["result"], "duplicate");
    assert_eq!(first["job_id"], second["job_id"]);
}

#[test]
fn test_enqueue_auto_picks_connected_account() {
    let (_temp_dir, config_path) = setup_connected();

    let outcome = enqueue_json(
        &config_path,
        &["--auto", "--platform", "tiktok", "--caption", "auto post"],
    );
    let job_id = outcome["job_id"].as_str().unwrap();

    synd_queue(&config_path)
        .args(["status", job_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("token:        tt-1"));
}

#[test]
fn test_enqueue_unknown_token_fails() {
    let (_temp_dir, config_path) = setup_connected();

    synd_queue(&config_path)
        .args(["enqueue", "--token", "nobody", "--platform", "tiktok", "--caption", "hi"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_enqueue_invalid_input_exit_code() {
    let (_temp_dir, config_path) = setup_connected();

    // Unknown platform
    synd_queue(&config_path)
        .args(["enqueue", "--token", "tt-1", "--platform", "myspace", "--caption", "hi"])
        .assert()
        .code(3);

    // Neither caption nor media
    synd_queue(&config_path)
        .args(["enqueue", "--token", "tt-1", "--platform", "tiktok"])
        .assert()
        .code(3);

    // Wrong platform for the token
    synd_queue(&config_path)
        .args(["enqueue", "--token", "tt-1", "--platform", "reddit", "--caption", "hi"])
        .assert()
        .code(3);

    // Unparseable time
    synd_queue(&config_path)
        .args(["enqueue", "--token", "tt-1", "--platform", "tiktok", "--caption", "hi", "--at", "whenever"])
        .assert()
        .code(3);
}

#[test]
fn test_invalid_format_rejected() {
    let (_temp_dir, config_path) = setup_test_env();

    synd_queue(&config_path)
        .args(["health", "--format", "yaml"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Invalid format"));
}

// CANCEL

#[test]
fn test_cancel_only_pending() {
    let (_temp_dir, config_path) = setup_connected();
    let outcome = enqueue_json(
        &config_path,
        &["--token", "tt-1", "--platform", "tiktok", "--caption", "bye", "--at", "1h"],
    );
    let job_id = outcome["job_id"].as_str().unwrap().to_string();

    synd_queue(&config_path)
        .args(["cancel", job_id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Cancelled {}", job_id)));

    synd_queue(&config_path)
        .args(["cancel", job_id.as_str()])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("cancelled"));

    synd_queue(&config_path)
        .args(["cancel", "no-such-job"])
        .assert()
        .code(1);
}

// ACCOUNTS

#[test]
fn test_connect_requires_master_key() {
    let (_temp_dir, config_path) = setup_test_env();

    synd_queue(&config_path)
        .args(["connect", "x-1", "--platform", "x", "--stdin"])
        .write_stdin("token\n")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Master key not configured"));
}

#[test]
fn test_connect_rejects_empty_token() {
    let (_temp_dir, config_path) = setup_test_env();
    synd_queue(&config_path).arg("keygen").assert().success();

    synd_queue(&config_path)
        .args(["connect", "x-1", "--platform", "x", "--stdin"])
        .write_stdin("\n")
        .assert()
        .code(3);
}

#[test]
fn test_accounts_never_print_tokens() {
    let (_temp_dir, config_path) = setup_connected();

    let output = synd_queue(&config_path)
        .args(["accounts", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(!stdout.contains("access-token"));
    assert!(!stdout.contains("refresh-token"));

    let accounts: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(accounts[0]["account_id"], "tt-1");
    assert_eq!(accounts[0]["has_refresh_token"], true);
    assert_eq!(accounts[0]["is_active"], true);
}

#[test]
fn test_disconnect_blocks_new_jobs() {
    let (_temp_dir, config_path) = setup_connected();

    synd_queue(&config_path)
        .args(["disconnect", "tt-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Disconnected tt-1"));

    synd_queue(&config_path)
        .args(["enqueue", "--token", "tt-1", "--platform", "tiktok", "--caption", "hi"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("disconnected"));
}

// TUNE / HEALTH

#[test]
fn test_tune_updates_record() {
    let (_temp_dir, config_path) = setup_connected();

    let output = synd_queue(&config_path)
        .args([
            "tune", "tt-1", "--priority", "10", "--weight", "3", "--cooldown", "1h", "--format",
            "json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["priority"], 10);
    assert_eq!(record["weight"], 3);
    assert!(record["cooldown_until"].is_i64());

    synd_queue(&config_path)
        .args(["tune", "tt-1", "--clear-cooldown", "--pause"])
        .assert()
        .success()
        .stdout(predicate::str::contains("paused"))
        .stdout(predicate::str::contains("cooldown none"));

    synd_queue(&config_path)
        .args(["tune", "ghost", "--priority", "1"])
        .assert()
        .code(1);
}

#[test]
fn test_health_report() {
    let (_temp_dir, config_path) = setup_connected();
    enqueue_json(
        &config_path,
        &["--token", "tt-1", "--platform", "tiktok", "--caption", "later", "--at", "3h"],
    );

    synd_queue(&config_path)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("tt-1 | tiktok | closed"))
        .stdout(predicate::str::contains("pending: 1"))
        .stdout(predicate::str::contains("jobs: 1 enqueued"))
        .stdout(predicate::str::contains("Status: healthy"));

    let output = synd_queue(&config_path)
        .args(["health", "--format", "json"])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["tokens"][0]["token_id"], "tt-1");
    assert_eq!(report["jobs"]["pending"], 1);
    // Counted by the enqueue process, read back by this one
    assert_eq!(report["metrics"]["jobs_enqueued"], 1);
}
