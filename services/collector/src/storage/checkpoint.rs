//! Per-polling-unit checkpoint files.
//!
//! # Layout
//! One plain-text file per key under the checkpoint directory, named
//! `<KIND>_<metric>_<fmtype>_<email>_<nhg>.ckpt`. The content is a single
//! RFC 3339 timestamp truncated to the minute, e.g. `2026-10-19T10:15:00Z`.
//!
//! Keys never share a file, so concurrent updates to different keys need no
//! locking. A key is only ever written by its own polling task.

use crate::model::{ApiConf, ApiKind, FmType};
use crate::window::truncate_to_minute;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// (API kind, metric type, FM type, user, network-hardware group).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub kind: ApiKind,
    pub metric_type: Option<String>,
    pub fm_type: Option<FmType>,
    pub email: String,
    pub nhg_id: String,
}

impl CheckpointKey {
    pub fn new(api: &ApiConf, email: &str, nhg_id: &str) -> Self {
        CheckpointKey {
            kind: api.kind,
            metric_type: api.metric_type.clone(),
            fm_type: api.fm_type,
            email: email.to_owned(),
            nhg_id: nhg_id.to_owned(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}.ckpt",
            self.kind.as_str(),
            sanitize(self.metric_type.as_deref().unwrap_or("none")),
            self.fm_type.map_or("none", FmType::as_str),
            sanitize(&self.email),
            sanitize(&self.nhg_id),
        )
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name().trim_end_matches(".ckpt"))
    }
}

/// Keep file names portable: anything outside `[A-Za-z0-9@.+-]` becomes `_`.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("checkpoint file '{path}' holds an invalid timestamp '{value}'")]
    Corrupt { path: PathBuf, value: String },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Directory-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (and create if needed) the checkpoint directory.
    pub fn open(dir: &Path) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(CheckpointStore {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Last accepted data timestamp for `key`, or `None` before the first
    /// successful fetch.
    pub fn load(&self, key: &CheckpointKey) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        let path = self.path_for(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let value = content.trim();
        let ts = DateTime::parse_from_rfc3339(value).map_err(|_| CheckpointError::Corrupt {
            path: path.clone(),
            value: value.to_owned(),
        })?;
        Ok(Some(truncate_to_minute(ts.with_timezone(&Utc))))
    }

    /// Persist `ts` (minute-truncated) for `key` if it moves the checkpoint
    /// forward. Returns whether the stored value changed.
    pub fn advance(&self, key: &CheckpointKey, ts: DateTime<Utc>) -> Result<bool, CheckpointError> {
        let ts = truncate_to_minute(ts);
        match self.load(key) {
            Ok(Some(current)) if ts <= current => {
                debug!(key = %key, current = %current, proposed = %ts, "checkpoint not advanced");
                return Ok(false);
            }
            // A corrupt file is overwritten by the next good value.
            Ok(_) | Err(CheckpointError::Corrupt { .. }) => {}
            Err(e) => return Err(e),
        }
        let path = self.path_for(key);
        let body = format!("{}\n", ts.to_rfc3339_opts(SecondsFormat::Secs, true));
        super::persist_atomically(&path, body.as_bytes())
            .map_err(|source| CheckpointError::Io { path, source })?;
        Ok(true)
    }
}
