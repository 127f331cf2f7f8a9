// ndac-protocol: NDAC REST API wire types and serialization.
//
// Every response shares one envelope: a `status` block that must carry the
// `SUCCESS` code, and a `data` payload whose shape depends on the endpoint.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

pub mod status_codes {
    pub const SUCCESS: &str = "SUCCESS";
    pub const INVALID_SESSION: &str = "INVALID_SESSION";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Status block present on every upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ResponseStatus {
    pub fn success() -> Self {
        ResponseStatus {
            code: status_codes::SUCCESS.to_owned(),
            message: String::new(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ResponseStatus {
            code: code.to_owned(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == status_codes::SUCCESS
    }

    /// True for codes that mean the bearer token is no longer accepted.
    pub fn is_auth_failure(&self) -> bool {
        self.code == status_codes::INVALID_SESSION || self.code == status_codes::UNAUTHORIZED
    }
}

/// Response envelope. `data` is absent on most error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: ResponseStatus,
    #[serde(
        default = "Option::default",
        bound(deserialize = "T: Deserialize<'de>"),
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope {
            status: ResponseStatus::success(),
            data: Some(data),
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Envelope {
            status: ResponseStatus::error(code, message),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Session endpoints
// ---------------------------------------------------------------------------

/// Body of the password login call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Body of the refresh call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Token pair returned by login and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: u64,
}

// ---------------------------------------------------------------------------
// Discovery endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub acc_uuid: String,
    #[serde(default)]
    pub acc_name: String,
}

/// One organization visible to the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub org_uuid: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

/// One network-hardware group under an (organization, account) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHardwareGroup {
    pub nhg_id: String,
    #[serde(default)]
    pub nhg_alias: String,
    #[serde(default)]
    pub hw_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Telemetry records
// ---------------------------------------------------------------------------

/// Record field carrying the sample time of a PM record.
pub const PM_TIME_FIELD: &str = "timestamp";
/// Record field carrying the event time of an FM record.
pub const FM_TIME_FIELD: &str = "event_time";

/// Typed view over the FM record fields the alarm notifier needs.
///
/// Telemetry is otherwise kept as raw JSON so the response files carry
/// exactly what the upstream returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmRecord {
    pub hw_id: String,
    pub dn: String,
    pub alarm_identifier: String,
    pub specific_problem: String,
    pub event_time: String,
    #[serde(default)]
    pub additional_text: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub alarm_text: String,
}
