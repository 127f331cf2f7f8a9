//! Alarm notifier configuration.
//!
//! Read from its own TOML file on every notification cycle, so edits take
//! effect without a restart:
//!
//! ```toml
//! webhook_url = "https://hooks.example.com/services/T000/B000/XXXX"
//! alarm_sync_minutes = 60
//!
//! [[filters]]
//! specific_problem = "Cell unavailable"
//! fault_codes = ["1907", "1908"]   # empty or omitted: every fault code
//! ```

use chrono::TimeDelta;
use serde::Deserialize;
use std::path::Path;

const DEFAULT_ALARM_SYNC_MINUTES: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmConfig {
    pub webhook_url: String,
    pub alarm_sync_minutes: u32,
    pub filters: Vec<AlarmFilter>,
}

impl AlarmConfig {
    /// Dedup entries older than this are purged.
    pub fn alarm_sync(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.alarm_sync_minutes))
    }
}

/// One `specific_problem` rule. An empty `fault_codes` list matches every
/// fault code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmFilter {
    pub specific_problem: String,
    pub fault_codes: Vec<String>,
}

impl AlarmFilter {
    pub fn matches(&self, specific_problem: &str, fault_code: Option<&str>) -> bool {
        if !self
            .specific_problem
            .eq_ignore_ascii_case(specific_problem.trim())
        {
            return false;
        }
        if self.fault_codes.is_empty() {
            return true;
        }
        fault_code.is_some_and(|code| self.fault_codes.iter().any(|c| c == code))
    }
}

// ---------------------------------------------------------------------------
// Raw TOML types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawAlarmConfig {
    webhook_url: Option<String>,
    alarm_sync_minutes: Option<u32>,
    filters: Option<Vec<RawAlarmFilter>>,
}

#[derive(Debug, Deserialize)]
struct RawAlarmFilter {
    specific_problem: Option<String>,
    fault_codes: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_alarm_config(path: &Path) -> Result<AlarmConfig, AlarmConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AlarmConfigError::Io(format!("reading alarm config '{}': {}", path.display(), e))
    })?;
    parse_alarm_config(&content)
}

pub fn parse_alarm_config(content: &str) -> Result<AlarmConfig, AlarmConfigError> {
    let raw: RawAlarmConfig =
        toml::from_str(content).map_err(|e| AlarmConfigError::Parse(e.to_string()))?;

    let webhook_url = raw
        .webhook_url
        .map(|u| u.trim().to_owned())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AlarmConfigError::MissingField("webhook_url".to_owned()))?;
    let parsed = reqwest::Url::parse(&webhook_url)
        .map_err(|e| AlarmConfigError::InvalidValue(format!("webhook_url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AlarmConfigError::InvalidValue(format!(
            "webhook_url must be http or https, got '{}'",
            parsed.scheme()
        )));
    }

    let alarm_sync_minutes = raw
        .alarm_sync_minutes
        .unwrap_or(DEFAULT_ALARM_SYNC_MINUTES);
    if alarm_sync_minutes == 0 {
        return Err(AlarmConfigError::InvalidValue(
            "alarm_sync_minutes must be at least 1".to_owned(),
        ));
    }

    let mut filters = Vec::new();
    for (i, f) in raw.filters.unwrap_or_default().into_iter().enumerate() {
        let specific_problem = f
            .specific_problem
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AlarmConfigError::MissingField(format!("filters[{i}].specific_problem"))
            })?;
        let fault_codes = f
            .fault_codes
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .collect();
        filters.push(AlarmFilter {
            specific_problem,
            fault_codes,
        });
    }

    Ok(AlarmConfig {
        webhook_url,
        alarm_sync_minutes,
        filters,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AlarmConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid alarm config value: {0}")]
    InvalidValue(String),
}
