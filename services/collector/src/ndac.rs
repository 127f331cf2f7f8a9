//! NDAC REST client.
//!
//! Thin typed wrapper over `reqwest`: builds URLs from the configured base
//! and paths, attaches the bearer header, and unwraps the response envelope.
//! Pacing and concurrency limits are the dispatcher's job, not this client's.

use crate::config::NdacConfig;
use crate::model::{ApiConf, ApiKind, NhgTarget};
use crate::window::TimeWindow;
use chrono::SecondsFormat;
use ndac_protocol::{
    Envelope, LoginRequest, NetworkHardwareGroup, Organization, RefreshRequest, TokenGrant,
};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NdacError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("authorization rejected: {0}")]
    Unauthorized(String),
    #[error("upstream status {code}: {message}")]
    Status { code: String, message: String },
    #[error("unexpected HTTP status {0}")]
    Http(u16),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("response envelope carried no data")]
    MissingData,
    #[error("invalid request URL: {0}")]
    Url(String),
}

impl NdacError {
    /// True when the caller's session must be treated as dead.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, NdacError::Unauthorized(_))
    }
}

// ---------------------------------------------------------------------------
// Page query
// ---------------------------------------------------------------------------

/// One page request against a telemetry API.
#[derive(Debug, Clone)]
pub struct PageQuery<'a> {
    pub api: &'a ApiConf,
    pub target: &'a NhgTarget,
    pub window: &'a TimeWindow,
    pub limit: u32,
    pub offset: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NdacClient {
    cfg: NdacConfig,
    client: Client,
}

impl NdacClient {
    pub fn new(cfg: NdacConfig) -> Result<Self, NdacError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| NdacError::Transport(e.to_string()))?;
        Ok(NdacClient { cfg, client })
    }

    // -----------------------------------------------------------------------
    // Session endpoints
    // -----------------------------------------------------------------------

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenGrant, NdacError> {
        let url = self.url(&self.cfg.login_path)?;
        let body = LoginRequest {
            email: email.to_owned(),
            password: password.to_owned(),
        };
        send_envelope(self.client.post(url).json(&body)).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, NdacError> {
        let url = self.url(&self.cfg.refresh_path)?;
        let body = RefreshRequest {
            refresh_token: refresh_token.to_owned(),
        };
        send_envelope(self.client.post(url).json(&body)).await
    }

    pub async fn logout(&self, access_token: &str) -> Result<(), NdacError> {
        let url = self.url(&self.cfg.logout_path)?;
        let resp: Result<Value, NdacError> =
            send_envelope(self.client.delete(url).bearer_auth(access_token)).await;
        match resp {
            Ok(_) | Err(NdacError::MissingData) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Discovery endpoints
    // -----------------------------------------------------------------------

    pub async fn organizations(&self, access_token: &str) -> Result<Vec<Organization>, NdacError> {
        let url = self.url(&self.cfg.organizations_path)?;
        send_envelope(self.client.get(url).bearer_auth(access_token)).await
    }

    pub async fn network_hardware_groups(
        &self,
        access_token: &str,
        org_uuid: &str,
        acc_uuid: &str,
    ) -> Result<Vec<NetworkHardwareGroup>, NdacError> {
        let mut url = self.url(&self.cfg.nhg_path)?;
        url.query_pairs_mut()
            .append_pair("org_uuid", org_uuid)
            .append_pair("acc_uuid", acc_uuid);
        send_envelope(self.client.get(url).bearer_auth(access_token)).await
    }

    // -----------------------------------------------------------------------
    // Telemetry
    // -----------------------------------------------------------------------

    /// Fetch a single page of records. An envelope without data is an empty
    /// page.
    pub async fn fetch_page(
        &self,
        access_token: &str,
        query: &PageQuery<'_>,
    ) -> Result<Vec<Value>, NdacError> {
        let url = self.page_url(query)?;
        debug!(url = %url, "fetching telemetry page");
        match send_envelope::<Vec<Value>>(self.client.get(url).bearer_auth(access_token)).await {
            Ok(records) => Ok(records),
            Err(NdacError::MissingData) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn page_url(&self, q: &PageQuery<'_>) -> Result<Url, NdacError> {
        let mut url = self.url(&q.api.path)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("org_uuid", &q.target.org_uuid)
                .append_pair("acc_uuid", &q.target.acc_uuid)
                .append_pair("nhg_id", &q.target.nhg_id)
                .append_pair(
                    "start_timestamp",
                    &q.window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair(
                    "end_timestamp",
                    &q.window
                        .query_end()
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair("limit", &q.limit.to_string())
                .append_pair("offset", &q.offset.to_string());
            match q.api.kind {
                ApiKind::Pm => {
                    if let Some(m) = &q.api.metric_type {
                        pairs.append_pair("metric_type", m);
                    }
                }
                ApiKind::Fm => {
                    if let Some(t) = q.api.fm_type {
                        pairs.append_pair("fm_type", t.as_str());
                    }
                }
            }
        }
        Ok(url)
    }

    fn url(&self, path: &str) -> Result<Url, NdacError> {
        let raw = format!("{}{}", self.cfg.base_url, path);
        Url::parse(&raw).map_err(|e| NdacError::Url(format!("'{raw}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Envelope handling
// ---------------------------------------------------------------------------

async fn send_envelope<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, NdacError> {
    let resp = req
        .send()
        .await
        .map_err(|e| NdacError::Transport(e.to_string()))?;
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(NdacError::Unauthorized(format!("HTTP {}", status.as_u16())));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| NdacError::Transport(e.to_string()))?;

    let envelope: Envelope<T> = match serde_json::from_slice(&body) {
        Ok(env) => env,
        Err(e) if status.is_success() => return Err(NdacError::Decode(e.to_string())),
        Err(_) => return Err(NdacError::Http(status.as_u16())),
    };

    if envelope.status.is_auth_failure() {
        return Err(NdacError::Unauthorized(envelope.status.code));
    }
    if !envelope.status.is_success() {
        return Err(NdacError::Status {
            code: envelope.status.code,
            message: envelope.status.message,
        });
    }
    if !status.is_success() {
        return Err(NdacError::Http(status.as_u16()));
    }
    envelope.data.ok_or(NdacError::MissingData)
}
