//! Collector configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/ndac-collector/collector.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `ndac.base_url`
//! - At least one `[[users]]` entry
//! - At least one `[[apis]]` entry
//!
//! The loaded config is immutable; components receive it (or the part they
//! need) by reference at construction.

use crate::model::{ApiConf, ApiKind, AuthMode, FmType};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ndac-collector/collector.toml";

pub const LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=10_000;
pub const DELAY_RANGE_MINUTES: std::ops::RangeInclusive<u32> = 1..=15;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub schema_version: u32,
    pub ndac: NdacConfig,
    pub polling: PollingConfig,
    pub session: SessionConfig,
    /// `None` disables the status endpoint.
    pub status_http: Option<StatusHttpConfig>,
    /// `None` disables alarm notification.
    pub alarms: Option<AlarmsConfig>,
    pub users: Vec<UserConfig>,
    pub apis: Vec<ApiConf>,
}

#[derive(Debug, Clone)]
pub struct NdacConfig {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub organizations_path: String,
    pub nhg_path: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Max records per upstream page.
    pub limit: u32,
    /// Minutes after each interval boundary at which a tick fires.
    pub delay_minutes: u32,
    /// Capacity of the in-flight request semaphore.
    pub max_concurrency: usize,
    /// Minimum gap between two upstream requests, process-wide.
    pub pacing_ms: u64,
    pub window_skew_secs: u64,
    pub max_pages: u32,
    pub checkpoint_dir: PathBuf,
    pub secrets_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub refresh_lead_secs: u64,
    pub federated_refresh_after_secs: u64,
}

#[derive(Debug, Clone)]
pub struct StatusHttpConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct AlarmsConfig {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UserConfig {
    pub email: String,
    pub auth_mode: AuthMode,
    pub response_dest: PathBuf,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    ndac: Option<RawNdacConfig>,
    collector: Option<RawPollingConfig>,
    session: Option<RawSessionConfig>,
    status_http: Option<RawStatusHttpConfig>,
    alarms: Option<RawAlarmsConfig>,
    users: Option<Vec<RawUserConfig>>,
    apis: Option<Vec<RawApiConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawNdacConfig {
    base_url: Option<String>,
    login_path: Option<String>,
    refresh_path: Option<String>,
    logout_path: Option<String>,
    organizations_path: Option<String>,
    nhg_path: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPollingConfig {
    limit: Option<u32>,
    delay: Option<u32>,
    max_concurrency: Option<usize>,
    pacing_ms: Option<u64>,
    window_skew_secs: Option<u64>,
    max_pages: Option<u32>,
    checkpoint_dir: Option<String>,
    secrets_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSessionConfig {
    refresh_lead_secs: Option<u64>,
    federated_refresh_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttpConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAlarmsConfig {
    config_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUserConfig {
    email: Option<String>,
    auth_mode: Option<String>,
    response_dest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawApiConfig {
    path: Option<String>,
    kind: Option<String>,
    fm_type: Option<String>,
    metric_type: Option<String>,
    interval: Option<u32>,
    sync_duration: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load collector config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<CollectorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load collector config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<CollectorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let ndac = validate_ndac(
        raw.ndac
            .ok_or_else(|| ConfigError::MissingField("ndac".to_owned()))?,
    )?;
    let polling = validate_polling(raw.collector.unwrap_or_default())?;

    let raw_session = raw.session.unwrap_or_default();
    let session = SessionConfig {
        refresh_lead_secs: raw_session.refresh_lead_secs.unwrap_or(60),
        federated_refresh_after_secs: raw_session.federated_refresh_after_secs.unwrap_or(300),
    };

    let status_http = raw.status_http.map(|s| StatusHttpConfig {
        bind: s.bind.unwrap_or_else(|| "127.0.0.1:9110".to_owned()),
    });

    let alarms = match raw.alarms {
        Some(a) => Some(AlarmsConfig {
            config_path: a
                .config_path
                .map(PathBuf::from)
                .ok_or_else(|| ConfigError::MissingField("alarms.config_path".to_owned()))?,
        }),
        None => None,
    };

    let users = validate_users(
        raw.users
            .ok_or_else(|| ConfigError::MissingField("users".to_owned()))?,
    )?;
    let apis = validate_apis(
        raw.apis
            .ok_or_else(|| ConfigError::MissingField("apis".to_owned()))?,
    )?;

    Ok(CollectorConfig {
        schema_version,
        ndac,
        polling,
        session,
        status_http,
        alarms,
        users,
        apis,
    })
}

// ---------------------------------------------------------------------------
// Section validation
// ---------------------------------------------------------------------------

fn validate_ndac(raw: RawNdacConfig) -> Result<NdacConfig, ConfigError> {
    let base_url = raw
        .base_url
        .ok_or_else(|| ConfigError::MissingField("ndac.base_url".to_owned()))?;
    validate_http_url("ndac.base_url", &base_url)?;

    let timeout = raw.request_timeout_secs.unwrap_or(30);
    if timeout == 0 {
        return Err(ConfigError::InvalidValue(
            "ndac.request_timeout_secs must be > 0".to_owned(),
        ));
    }

    Ok(NdacConfig {
        base_url: base_url.trim_end_matches('/').to_owned(),
        login_path: normalize_path(raw.login_path, "/api/v1/session"),
        refresh_path: normalize_path(raw.refresh_path, "/api/v1/session/refresh"),
        logout_path: normalize_path(raw.logout_path, "/api/v1/session"),
        organizations_path: normalize_path(raw.organizations_path, "/api/v1/organizations"),
        nhg_path: normalize_path(raw.nhg_path, "/api/v1/network-hardware-groups"),
        request_timeout_secs: timeout,
    })
}

fn validate_polling(raw: RawPollingConfig) -> Result<PollingConfig, ConfigError> {
    let limit = raw.limit.unwrap_or(500);
    if !LIMIT_RANGE.contains(&limit) {
        return Err(ConfigError::InvalidValue(format!(
            "collector.limit must be within {}..={}, got {}",
            LIMIT_RANGE.start(),
            LIMIT_RANGE.end(),
            limit
        )));
    }

    let delay = raw.delay.unwrap_or(1);
    if !DELAY_RANGE_MINUTES.contains(&delay) {
        return Err(ConfigError::InvalidValue(format!(
            "collector.delay must be within {}..={} minutes, got {}",
            DELAY_RANGE_MINUTES.start(),
            DELAY_RANGE_MINUTES.end(),
            delay
        )));
    }

    let max_concurrency = raw.max_concurrency.unwrap_or(8);
    if max_concurrency == 0 {
        return Err(ConfigError::InvalidValue(
            "collector.max_concurrency must be >= 1".to_owned(),
        ));
    }

    let max_pages = raw.max_pages.unwrap_or(1000);
    if max_pages == 0 {
        return Err(ConfigError::InvalidValue(
            "collector.max_pages must be >= 1".to_owned(),
        ));
    }

    Ok(PollingConfig {
        limit,
        delay_minutes: delay,
        max_concurrency,
        pacing_ms: raw.pacing_ms.unwrap_or(200),
        window_skew_secs: raw.window_skew_secs.unwrap_or(30),
        max_pages,
        checkpoint_dir: PathBuf::from(
            raw.checkpoint_dir
                .unwrap_or_else(|| "/var/lib/ndac-collector/checkpoints".to_owned()),
        ),
        secrets_dir: PathBuf::from(
            raw.secrets_dir
                .unwrap_or_else(|| "/etc/ndac-collector/secrets".to_owned()),
        ),
    })
}

fn validate_users(raw_users: Vec<RawUserConfig>) -> Result<Vec<UserConfig>, ConfigError> {
    if raw_users.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[users]] entry is required".to_owned(),
        ));
    }

    let mut seen = HashSet::new();
    let mut users = Vec::with_capacity(raw_users.len());
    for (i, u) in raw_users.into_iter().enumerate() {
        let email = u
            .email
            .map(|e| e.trim().to_owned())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ConfigError::MissingField(format!("users[{i}].email")))?;
        if !seen.insert(email.to_ascii_lowercase()) {
            return Err(ConfigError::InvalidValue(format!(
                "duplicate user email '{email}'"
            )));
        }

        let auth_mode = match u.auth_mode {
            Some(m) => AuthMode::parse(&m).ok_or_else(|| {
                ConfigError::InvalidValue(format!("users[{i}].auth_mode '{m}' is not recognised"))
            })?,
            None => AuthMode::Password,
        };

        let response_dest = u
            .response_dest
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingField(format!("users[{i}].response_dest")))?;

        users.push(UserConfig {
            email,
            auth_mode,
            response_dest,
        });
    }
    Ok(users)
}

fn validate_apis(raw_apis: Vec<RawApiConfig>) -> Result<Vec<ApiConf>, ConfigError> {
    if raw_apis.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[apis]] entry is required".to_owned(),
        ));
    }

    let mut apis = Vec::with_capacity(raw_apis.len());
    for (i, a) in raw_apis.into_iter().enumerate() {
        let path = a
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField(format!("apis[{i}].path")))?;
        let path = normalize_path(Some(path), "");

        let kind_str = a
            .kind
            .ok_or_else(|| ConfigError::MissingField(format!("apis[{i}].kind")))?;
        let kind = ApiKind::parse(&kind_str).ok_or_else(|| {
            ConfigError::InvalidValue(format!("apis[{i}].kind must be PM or FM, got '{kind_str}'"))
        })?;

        let fm_type = match (kind, a.fm_type) {
            (ApiKind::Fm, Some(t)) => Some(FmType::parse(&t).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "apis[{i}].fm_type must be HISTORY or ACTIVE, got '{t}'"
                ))
            })?),
            (ApiKind::Fm, None) => {
                return Err(ConfigError::MissingField(format!("apis[{i}].fm_type")));
            }
            (ApiKind::Pm, _) => None,
        };

        let metric_type = a.metric_type.filter(|m| !m.trim().is_empty());
        if kind == ApiKind::Pm && metric_type.is_none() {
            return Err(ConfigError::MissingField(format!("apis[{i}].metric_type")));
        }

        let interval = a
            .interval
            .ok_or_else(|| ConfigError::MissingField(format!("apis[{i}].interval")))?;
        if interval == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "apis[{i}].interval must be >= 1 minute"
            )));
        }

        apis.push(ApiConf {
            path,
            kind,
            fm_type,
            metric_type,
            interval_minutes: interval,
            sync_duration_minutes: a.sync_duration.unwrap_or(0),
        });
    }
    Ok(apis)
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(value)
        .map_err(|e| ConfigError::InvalidValue(format!("{field} '{value}' is not a URL: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidValue(format!(
            "{field} must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidValue(format!("{field} has no host")));
    }
    Ok(())
}

fn normalize_path(value: Option<String>, default: &str) -> String {
    let p = value.unwrap_or_else(|| default.to_owned());
    let p = p.trim();
    if p.is_empty() || p.starts_with('/') {
        p.to_owned()
    } else {
        format!("/{p}")
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
