//! FM alarm filtering, de-duplication and webhook delivery.
//!
//! One call to [`AlarmNotifier::notify`] handles one FM fetch batch:
//! reload the alarm config, purge dedup entries older than the alarm-sync
//! window, keep records that pass a filter and have not been notified
//! within the window, then post everything left as a single message.
//! Dedup entries are recorded before delivery and are not rolled back when
//! delivery fails.

use super::config::{AlarmConfig, AlarmConfigError, load_alarm_config};
use chrono::{DateTime, SecondsFormat, Utc};
use ndac_protocol::FmRecord;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Config(#[from] AlarmConfigError),
    #[error("webhook request failed: {0}")]
    Delivery(String),
    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

/// Identity of one alarm occurrence for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlarmKey {
    pub hw_id: String,
    pub dn: String,
    pub alarm_identifier: String,
    pub specific_problem: String,
    pub event_time: String,
}

impl AlarmKey {
    pub fn of(rec: &FmRecord) -> Self {
        AlarmKey {
            hw_id: rec.hw_id.clone(),
            dn: rec.dn.clone(),
            alarm_identifier: rec.alarm_identifier.clone(),
            specific_problem: rec.specific_problem.clone(),
            event_time: normalize_event_time(&rec.event_time),
        }
    }
}

/// One spelling per instant: RFC 3339 times are keyed in UTC with `Z`, so
/// `+00:00` and other offsets collapse onto the same key. Anything else is
/// keyed as written.
fn normalize_event_time(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw.trim()).map_or_else(
        |_| raw.trim().to_owned(),
        |t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true),
    )
}

/// Extract the fault code from a semicolon-delimited additional-text field,
/// e.g. `"Fault code: 1907; Fault description: cell down"`.
pub fn parse_fault_code(additional_text: &str) -> Option<String> {
    additional_text.split(';').find_map(|segment| {
        let (key, value) = segment.split_once([':', '='])?;
        let key: String = key
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let value = value.trim();
        (matches!(key.as_str(), "faultcode" | "faultid") && !value.is_empty())
            .then(|| value.to_owned())
    })
}

pub struct AlarmNotifier {
    config_path: PathBuf,
    http: reqwest::Client,
    seen: Mutex<HashMap<AlarmKey, DateTime<Utc>>>,
}

impl AlarmNotifier {
    pub fn new(config_path: impl Into<PathBuf>) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(AlarmNotifier {
            config_path: config_path.into(),
            http,
            seen: Mutex::new(HashMap::new()),
        })
    }

    /// Filter, de-duplicate and deliver one FM batch. Returns how many alarms
    /// were sent.
    pub async fn notify(
        &self,
        source: &str,
        records: &[Value],
        now: DateTime<Utc>,
    ) -> Result<usize, NotifyError> {
        let cfg = load_alarm_config(&self.config_path)?;
        let fresh = self.select(&cfg, records, now).await;
        if fresh.is_empty() {
            debug!(source, "no new alarms in batch");
            return Ok(0);
        }

        let text = format_message(source, &fresh);
        let resp = self
            .http
            .post(&cfg.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        info!(source, alarms = fresh.len(), "alarm notification delivered");
        Ok(fresh.len())
    }

    /// Records from `records` that pass a filter and are not suppressed,
    /// in batch order. Selected keys are recorded at `now`.
    pub async fn select(
        &self,
        cfg: &AlarmConfig,
        records: &[Value],
        now: DateTime<Utc>,
    ) -> Vec<FmRecord> {
        let window = cfg.alarm_sync();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, notified_at| now - *notified_at < window);

        let mut out = Vec::new();
        for raw in records {
            let Ok(rec) = serde_json::from_value::<FmRecord>(raw.clone()) else {
                continue;
            };
            let code = parse_fault_code(&rec.additional_text);
            if !cfg
                .filters
                .iter()
                .any(|f| f.matches(&rec.specific_problem, code.as_deref()))
            {
                continue;
            }
            let key = AlarmKey::of(&rec);
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, now);
            out.push(rec);
        }
        out
    }

    pub async fn tracked(&self) -> usize {
        self.seen.lock().await.len()
    }
}

impl std::fmt::Debug for AlarmNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmNotifier")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

fn format_message(source: &str, alarms: &[FmRecord]) -> String {
    let mut text = format!("{} new alarm(s) from {source}:", alarms.len());
    for a in alarms {
        let _ = write!(
            text,
            "\n- [{}] {} | hw_id={} dn={} alarm_id={} event_time={}",
            if a.severity.is_empty() { "unknown" } else { &a.severity },
            a.specific_problem,
            a.hw_id,
            a.dn,
            a.alarm_identifier,
            a.event_time,
        );
        if let Some(code) = parse_fault_code(&a.additional_text) {
            let _ = write!(text, " fault_code={code}");
        }
        if !a.alarm_text.is_empty() {
            let _ = write!(text, " | {}", a.alarm_text);
        }
    }
    text
}
