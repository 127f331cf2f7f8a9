//! Response file writer.
//!
//! Each successful fetch becomes one JSON file under
//! `<response_dest>/<api-basename>/`. File names start with the fetch
//! timestamp in a fixed-width UTC format so lexicographic order equals
//! chronological order for anything tailing the directory:
//!
//! `20261019T101500.123Z_<api>_<type>_<nhg>_<txn>.json`
//!
//! Files are staged under `<response_dest>/.staging/` and renamed into the
//! API directory only once complete, so the API directory never holds a
//! partial file. Files are never modified after they appear; retention is
//! handled elsewhere.

use crate::model::{ApiConf, NhgTarget};
use crate::window::{TimeWindow, truncate_to_minute};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("creating response directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serializing response payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing response file '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Document persisted for one fetch.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsePayload {
    pub txn_id: String,
    pub user: String,
    pub api_path: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fm_type: Option<String>,
    pub org_uuid: String,
    pub acc_uuid: String,
    pub nhg_id: String,
    pub window_start: String,
    pub window_end: String,
    pub fetched_at: String,
    pub record_count: usize,
    pub records: Vec<Value>,
}

impl ResponsePayload {
    pub fn new(
        email: &str,
        api: &ApiConf,
        target: &NhgTarget,
        window: &TimeWindow,
        txn_id: Uuid,
        fetched_at: DateTime<Utc>,
        records: Vec<Value>,
    ) -> Self {
        ResponsePayload {
            txn_id: txn_id.to_string(),
            user: email.to_owned(),
            api_path: api.path.clone(),
            kind: api.kind.as_str().to_owned(),
            metric_type: api.metric_type.clone(),
            fm_type: api.fm_type.map(|t| t.as_str().to_owned()),
            org_uuid: target.org_uuid.clone(),
            acc_uuid: target.acc_uuid.clone(),
            nhg_id: target.nhg_id.clone(),
            window_start: window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            window_end: window.query_end().to_rfc3339_opts(SecondsFormat::Secs, true),
            fetched_at: fetched_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            record_count: records.len(),
            records,
        }
    }
}

/// Temp-file directory shared by every API under one destination root.
pub const STAGING_DIR: &str = ".staging";

/// Directory a given API's responses land in.
pub fn response_dir(response_dest: &Path, api: &ApiConf) -> PathBuf {
    response_dest.join(api.basename())
}

/// Lexicographically sortable file name for one fetch.
pub fn response_file_name(
    api: &ApiConf,
    nhg_id: &str,
    fetched_at: DateTime<Utc>,
    txn_id: Uuid,
) -> String {
    let nhg: String = nhg_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "{}_{}_{}_{}_{}.json",
        fetched_at.format("%Y%m%dT%H%M%S%.3fZ"),
        api.basename(),
        api.type_label(),
        nhg,
        txn_id.simple()
    )
}

/// Latest parsable timestamp in `field` across `records`, minute-truncated.
///
/// This, not the requested window end, is what the checkpoint advances to.
pub fn latest_event_time(records: &[Value], field: &str) -> Option<DateTime<Utc>> {
    records
        .iter()
        .filter_map(|r| r.get(field).and_then(Value::as_str))
        .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| truncate_to_minute(t.with_timezone(&Utc)))
        .max()
}

/// Writes response files under a user's destination root.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    response_dest: PathBuf,
}

impl ResponseWriter {
    pub fn new(response_dest: impl Into<PathBuf>) -> Self {
        ResponseWriter {
            response_dest: response_dest.into(),
        }
    }

    /// Serialize `payload` fully, then publish it in one atomic step.
    pub fn write(
        &self,
        api: &ApiConf,
        nhg_id: &str,
        payload: &ResponsePayload,
        txn_id: Uuid,
        fetched_at: DateTime<Utc>,
    ) -> Result<PathBuf, WriteError> {
        let dir = response_dir(&self.response_dest, api);
        let staging = self.response_dest.join(STAGING_DIR);
        for d in [&dir, &staging] {
            std::fs::create_dir_all(d).map_err(|source| WriteError::CreateDir {
                path: d.clone(),
                source,
            })?;
        }

        let bytes = serde_json::to_vec(payload)?;
        let path = dir.join(response_file_name(api, nhg_id, fetched_at, txn_id));
        super::persist_staged(&path, &staging, &bytes).map_err(|source| WriteError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
