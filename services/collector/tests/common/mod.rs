//! Shared fixtures for collector integration tests.

#![allow(dead_code)]

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, TimeZone, Utc};
use collector::config::{CollectorConfig, load_config_from_str};
use collector::dispatcher::Dispatcher;
use collector::ndac::NdacClient;
use collector::session::SessionManager;
use ndac_test_utils::MockNdacServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;

pub const PM_PATH: &str = "/api/v1/pm/radio";
pub const FM_PATH: &str = "/api/v1/fm/alarms";

pub const PM_API: &str = r#"
[[apis]]
path = "/api/v1/pm/radio"
kind = "PM"
metric_type = "radio"
interval = 15
"#;

pub const FM_API: &str = r#"
[[apis]]
path = "/api/v1/fm/alarms"
kind = "FM"
fm_type = "HISTORY"
interval = 60
sync_duration = 120
"#;

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, h, m, s).unwrap()
}

/// Everything a test needs to drive the collector against a mock upstream.
pub struct Fixture {
    pub dir: TempDir,
    pub server: MockNdacServer,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Fixture {
    pub async fn start() -> Self {
        Fixture {
            dir: TempDir::new().unwrap(),
            server: MockNdacServer::start().await.unwrap(),
            shutdown_tx: watch::channel(false).0,
        }
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.dir.path().join("secrets")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.dir.path().join("checkpoints")
    }

    pub fn response_dest(&self, email: &str) -> PathBuf {
        self.dir.path().join("responses").join(email)
    }

    /// Write a secret file whose lines are the base64 of `values`.
    pub fn write_secret(&self, email: &str, values: &[&str]) {
        let dir = self.secrets_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let body: String = values.iter().map(|v| format!("{}\n", B64.encode(v))).collect();
        std::fs::write(dir.join(email), body).unwrap();
    }

    /// Register a password user with the mock and on disk.
    pub async fn password_user(&self, email: &str) {
        let password = format!("pw-{email}");
        self.server.add_user(email, &password).await;
        self.write_secret(email, &[&password]);
    }

    /// Build a config for `users` (email, auth_mode) with the given API
    /// blocks and extra `[collector]`/`[session]` lines.
    pub fn config(
        &self,
        users: &[(&str, &str)],
        apis: &[&str],
        collector_extra: &str,
        tail: &str,
    ) -> CollectorConfig {
        let mut toml = format!(
            r#"
schema_version = 1

[ndac]
base_url = "{base}"
request_timeout_secs = 5

[collector]
limit = 100
delay = 1
max_concurrency = 4
pacing_ms = 0
window_skew_secs = 30
checkpoint_dir = "{ckpt}"
secrets_dir = "{secrets}"
{collector_extra}
{tail}
"#,
            base = self.server.base_url(),
            ckpt = toml_path(&self.checkpoint_dir()),
            secrets = toml_path(&self.secrets_dir()),
        );
        for (email, mode) in users {
            toml.push_str(&format!(
                "\n[[users]]\nemail = \"{email}\"\nauth_mode = \"{mode}\"\nresponse_dest = \"{}\"\n",
                toml_path(&self.response_dest(email))
            ));
        }
        for api in apis {
            toml.push_str(api);
        }
        load_config_from_str(&toml).unwrap()
    }

    pub fn sessions(&self, cfg: &CollectorConfig) -> Arc<SessionManager> {
        let client = NdacClient::new(cfg.ndac.clone()).unwrap();
        Arc::new(SessionManager::new(
            client,
            cfg,
            self.shutdown_tx.subscribe(),
        ))
    }

    pub async fn dispatcher(
        &self,
        cfg: &CollectorConfig,
        sessions: &Arc<SessionManager>,
    ) -> Dispatcher {
        let d = Dispatcher::new(cfg, Arc::clone(sessions), None).unwrap();
        d.schedule_all().await;
        d
    }
}

/// Response files written for one API of one user, sorted by name.
pub fn response_files(dest: &Path, api_basename: &str) -> Vec<PathBuf> {
    let dir = dest.join(api_basename);
    let mut files: Vec<PathBuf> = match std::fs::read_dir(&dir) {
        Ok(rd) => rd.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

fn toml_path(p: &Path) -> String {
    p.display().to_string().replace('\\', "\\\\")
}
