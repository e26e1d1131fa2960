//! Integration tests for synd-worker --once

use assert_cmd::Command;
use libsyndicate::clock::{Clock, SystemClock};
use libsyndicate::config::DatabaseConfig;
use libsyndicate::credentials::ConnectRequest;
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::types::DAY_MS;
use libsyndicate::{
    Config, EnqueueRequest, JobPayload, JobStatus, OAuthGrant, Platform, SyndicateService,
    TokenCipher,
};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

struct TestEnv {
    temp_dir: TempDir,
    config_path: String,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let config_content = format!(
            r#"
[database]
path = "{}"

[credentials]
master_key_file = "{}"

[worker]
workers = 1
poll_interval_ms = 50
"#,
            escape_path_for_toml(&temp_dir.path().join("scheduler.db").to_string_lossy()),
            escape_path_for_toml(&temp_dir.path().join("master.key").to_string_lossy())
        );
        fs::write(&config_path, config_content).unwrap();
        TokenCipher::generate_key_file(&temp_dir.path().join("master.key")).unwrap();

        Self {
            config_path: config_path.to_string_lossy().to_string(),
            temp_dir,
        }
    }

    async fn service(&self) -> SyndicateService {
        let mut config = Config::default_config();
        config.database = DatabaseConfig {
            path: self
                .temp_dir
                .path()
                .join("scheduler.db")
                .to_string_lossy()
                .to_string(),
        };
        let cipher = TokenCipher::from_key_file(&self.temp_dir.path().join("master.key")).unwrap();
        SyndicateService::with_cipher(config, AdapterRegistry::new(), cipher)
            .await
            .unwrap()
    }

    fn worker(&self) -> Command {
        let mut cmd = Command::cargo_bin("synd-worker").unwrap();
        cmd.env("SYNDICATE_CONFIG", &self.config_path)
            .env_remove("SYNDICATE_DB_PATH")
            .env_remove("SYNDICATE_MASTER_KEY");
        cmd
    }
}

#[test]
fn test_refuses_to_run_without_adapters() {
    let env = TestEnv::new();

    env.worker()
        .arg("--once")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("No platform adapters registered"));
}

#[tokio::test]
async fn test_dry_run_once_publishes_due_jobs() {
    let env = TestEnv::new();
    let now = SystemClock.now_ms();

    let service = env.service().await;
    service
        .credentials()
        .unwrap()
        .connect_account(
            ConnectRequest {
                account_id: "ig-1".to_string(),
                user_id: None,
                platform: Platform::Instagram,
                grant: OAuthGrant::new("access").expires_in(DAY_MS),
            },
            now,
        )
        .await
        .unwrap();

    let due = service
        .queue()
        .enqueue(
            EnqueueRequest::new("ig-1", Platform::Instagram, JobPayload::text("due now")),
            now,
        )
        .await
        .unwrap();
    let later = service
        .queue()
        .enqueue(
            EnqueueRequest::new("ig-1", Platform::Instagram, JobPayload::text("tomorrow"))
                .at(now + DAY_MS),
            now,
        )
        .await
        .unwrap();

    env.worker()
        .args(["--once", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 job attempt(s) processed"));

    let due_state = service.queue().get_status(due.job_id()).await.unwrap();
    assert_eq!(due_state.status, JobStatus::Succeeded);
    assert!(due_state.external_id.unwrap().starts_with("mock-instagram-"));

    let later_state = service.queue().get_status(later.job_id()).await.unwrap();
    assert_eq!(later_state.status, JobStatus::Pending);
}
