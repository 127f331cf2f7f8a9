//! Domain types shared by the session manager, dispatcher and writers.

use chrono::{DateTime, Utc};
use std::fmt;

// ---------------------------------------------------------------------------
// Polling unit classification
// ---------------------------------------------------------------------------

/// Telemetry family served by an API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKind {
    Pm,
    Fm,
}

impl ApiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiKind::Pm => "PM",
            ApiKind::Fm => "FM",
        }
    }

    /// Record field that carries the sample/event time for this family.
    pub fn time_field(self) -> &'static str {
        match self {
            ApiKind::Pm => ndac_protocol::PM_TIME_FIELD,
            ApiKind::Fm => ndac_protocol::FM_TIME_FIELD,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PM" => Some(ApiKind::Pm),
            "FM" => Some(ApiKind::Fm),
            _ => None,
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FM sub-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FmType {
    History,
    Active,
}

impl FmType {
    pub fn as_str(self) -> &'static str {
        match self {
            FmType::History => "HISTORY",
            FmType::Active => "ACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HISTORY" => Some(FmType::History),
            "ACTIVE" => Some(FmType::Active),
            _ => None,
        }
    }
}

impl fmt::Display for FmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a user obtains its bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Password,
    StaticToken,
    FederatedToken,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Password => "password",
            AuthMode::StaticToken => "static_token",
            AuthMode::FederatedToken => "federated_token",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "password" => Some(AuthMode::Password),
            "static_token" | "static" => Some(AuthMode::StaticToken),
            "federated_token" | "federated" => Some(AuthMode::FederatedToken),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// API catalogue entry
// ---------------------------------------------------------------------------

/// One polling unit template from the API catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConf {
    /// URL path appended to the base URL, e.g. `/api/v1/pm/radio`.
    pub path: String,
    pub kind: ApiKind,
    /// Set for FM APIs only.
    pub fm_type: Option<FmType>,
    /// Set for PM APIs; optional label for FM APIs.
    pub metric_type: Option<String>,
    pub interval_minutes: u32,
    /// 0 means no re-sync widening.
    pub sync_duration_minutes: u32,
}

impl ApiConf {
    /// Last non-empty path segment, used as the response directory name.
    pub fn basename(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("api")
    }

    /// Metric type for PM, FM sub-type for FM.
    pub fn type_label(&self) -> String {
        match (self.kind, self.fm_type, &self.metric_type) {
            (ApiKind::Fm, Some(fm), _) => fm.as_str().to_ascii_lowercase(),
            (_, _, Some(m)) => m.clone(),
            _ => "all".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session token
// ---------------------------------------------------------------------------

/// Bearer credentials for one user.
///
/// Replaced as a whole on refresh; never mutated field by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub access_token: String,
    /// Empty for static tokens.
    pub refresh_token: String,
    /// `None` means the token does not expire locally.
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Discovered resources
// ---------------------------------------------------------------------------

/// One network-hardware group and the hardware it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NhgDetails {
    pub nhg_id: String,
    pub hw_ids: Vec<String>,
}

/// Organization/account mapping discovered for a user, with its NHGs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgAccDetails {
    pub org_uuid: String,
    pub acc_uuid: String,
    pub nhgs: Vec<NhgDetails>,
}

/// Fully resolved target of a telemetry request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NhgTarget {
    pub org_uuid: String,
    pub acc_uuid: String,
    pub nhg_id: String,
}

impl OrgAccDetails {
    pub fn targets(&self) -> impl Iterator<Item = NhgTarget> + '_ {
        self.nhgs.iter().map(|nhg| NhgTarget {
            org_uuid: self.org_uuid.clone(),
            acc_uuid: self.acc_uuid.clone(),
            nhg_id: nhg.nhg_id.clone(),
        })
    }
}
