// mock_ndac_server: An in-process NDAC REST API for collector tests.
//
// Issues tokens on login, honours refresh/logout, serves organization and
// NHG listings, and pages through canned telemetry records filtered by the
// request's nhg_id and [start_timestamp, end_timestamp) range.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ndac_protocol::{
    Account, Envelope, LoginRequest, NetworkHardwareGroup, Organization, RefreshRequest,
    TokenGrant, status_codes,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub const LOGIN_PATH: &str = "/api/v1/session";
pub const REFRESH_PATH: &str = "/api/v1/session/refresh";
pub const ORGANIZATIONS_PATH: &str = "/api/v1/organizations";
pub const NHG_PATH: &str = "/api/v1/network-hardware-groups";

/// One telemetry request as seen by the server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    /// Owner of the bearer token, when it was valid.
    pub email: Option<String>,
    pub query: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    passwords: HashMap<String, String>,
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    failing_refresh: HashSet<String>,
    expires_in: u64,
    orgs: Vec<Organization>,
    nhgs: HashMap<(String, String), Vec<NetworkHardwareGroup>>,
    records: HashMap<String, Vec<Value>>,
    requests: Vec<RecordedRequest>,
    logins: Vec<String>,
    refreshes: Vec<String>,
    logouts: Vec<String>,
    seq: u64,
}

struct MockState {
    inner: Mutex<Inner>,
    record_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a records request finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A mock NDAC server bound to `127.0.0.1:0`.
pub struct MockNdacServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockNdacServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let state = Arc::new(MockState {
            inner: Mutex::new(Inner {
                expires_in: 3600,
                ..Inner::default()
            }),
            record_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route(LOGIN_PATH, post(login).delete(logout))
            .route(REFRESH_PATH, post(refresh))
            .route(ORGANIZATIONS_PATH, axum::routing::get(organizations))
            .route(NHG_PATH, axum::routing::get(nhgs))
            .fallback(records)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    // -- fixture setup --

    pub async fn add_user(&self, email: &str, password: &str) {
        let mut inner = self.state.inner.lock().await;
        inner.passwords.insert(email.to_owned(), password.to_owned());
    }

    /// Register a pre-issued access token (static or federated users).
    pub async fn add_access_token(&self, token: &str, email: &str) {
        let mut inner = self.state.inner.lock().await;
        inner.access_tokens.insert(token.to_owned(), email.to_owned());
    }

    pub async fn add_refresh_token(&self, token: &str, email: &str) {
        let mut inner = self.state.inner.lock().await;
        inner.refresh_tokens.insert(token.to_owned(), email.to_owned());
    }

    /// Lifetime reported for every token issued from now on.
    pub async fn set_expires_in(&self, secs: u64) {
        self.state.inner.lock().await.expires_in = secs;
    }

    /// Make every refresh for `email` fail with `INVALID_SESSION`.
    pub async fn fail_refresh_for(&self, email: &str) {
        let mut inner = self.state.inner.lock().await;
        inner.failing_refresh.insert(email.to_owned());
    }

    /// Invalidate every access token issued to `email`.
    pub async fn revoke_tokens_for(&self, email: &str) {
        let mut inner = self.state.inner.lock().await;
        inner.access_tokens.retain(|_, owner| owner != email);
    }

    pub async fn add_nhg(&self, org_uuid: &str, acc_uuid: &str, nhg_id: &str, hw_ids: &[&str]) {
        let mut inner = self.state.inner.lock().await;
        match inner.orgs.iter_mut().find(|o| o.org_uuid == org_uuid) {
            Some(org) => {
                if !org.accounts.iter().any(|a| a.acc_uuid == acc_uuid) {
                    org.accounts.push(Account {
                        acc_uuid: acc_uuid.to_owned(),
                        acc_name: String::new(),
                    });
                }
            }
            None => inner.orgs.push(Organization {
                org_uuid: org_uuid.to_owned(),
                org_name: format!("org {org_uuid}"),
                accounts: vec![Account {
                    acc_uuid: acc_uuid.to_owned(),
                    acc_name: String::new(),
                }],
            }),
        }
        inner
            .nhgs
            .entry((org_uuid.to_owned(), acc_uuid.to_owned()))
            .or_default()
            .push(NetworkHardwareGroup {
                nhg_id: nhg_id.to_owned(),
                nhg_alias: String::new(),
                hw_ids: hw_ids.iter().map(|s| (*s).to_owned()).collect(),
            });
    }

    /// Records served from `path`. Each record needs an `nhg_id` field and a
    /// `timestamp` or `event_time` field.
    pub async fn add_records(&self, path: &str, records: Vec<Value>) {
        let mut inner = self.state.inner.lock().await;
        inner.records.entry(path.to_owned()).or_default().extend(records);
    }

    /// Hold every records response for `delay`.
    pub async fn set_record_delay(&self, delay: Duration) {
        *self.state.record_delay.lock().await = delay;
    }

    // -- inspection --

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.inner.lock().await.requests.clone()
    }

    pub async fn requests_for(&self, email: &str) -> Vec<RecordedRequest> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.email.as_deref() == Some(email))
            .collect()
    }

    pub async fn logins(&self) -> Vec<String> {
        self.state.inner.lock().await.logins.clone()
    }

    pub async fn refreshes(&self) -> Vec<String> {
        self.state.inner.lock().await.refreshes.clone()
    }

    pub async fn logouts(&self) -> Vec<String> {
        self.state.inner.lock().await.logouts.clone()
    }

    /// Highest number of records requests ever served at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(Envelope::<Value>::err(
            status_codes::INVALID_SESSION,
            "invalid or expired token",
        )),
    )
        .into_response()
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_owned)
}

fn issue(inner: &mut Inner, email: &str) -> TokenGrant {
    inner.seq += 1;
    let access_token = format!("access-{email}-{}", inner.seq);
    let refresh_token = format!("refresh-{email}-{}", inner.seq);
    inner
        .access_tokens
        .insert(access_token.clone(), email.to_owned());
    inner
        .refresh_tokens
        .insert(refresh_token.clone(), email.to_owned());
    TokenGrant {
        access_token,
        refresh_token,
        expires_in: inner.expires_in,
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(req): Json<LoginRequest>) -> Response {
    let mut inner = state.inner.lock().await;
    if inner.passwords.get(&req.email) != Some(&req.password) {
        return (
            StatusCode::OK,
            Json(Envelope::<Value>::err(
                status_codes::UNAUTHORIZED,
                "bad credentials",
            )),
        )
            .into_response();
    }
    inner.logins.push(req.email.clone());
    let grant = issue(&mut inner, &req.email);
    Json(Envelope::ok(grant)).into_response()
}

async fn refresh(State(state): State<Arc<MockState>>, Json(req): Json<RefreshRequest>) -> Response {
    let mut inner = state.inner.lock().await;
    let Some(email) = inner.refresh_tokens.get(&req.refresh_token).cloned() else {
        return unauthorized();
    };
    inner.refreshes.push(email.clone());
    if inner.failing_refresh.contains(&email) {
        return unauthorized();
    }
    inner.refresh_tokens.remove(&req.refresh_token);
    let grant = issue(&mut inner, &email);
    Json(Envelope::ok(grant)).into_response()
}

async fn logout(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let mut inner = state.inner.lock().await;
    let Some(email) = bearer(&headers).and_then(|t| inner.access_tokens.remove(&t)) else {
        return unauthorized();
    };
    inner.logouts.push(email);
    Json(Envelope::<Value> {
        status: ndac_protocol::ResponseStatus::success(),
        data: None,
    })
    .into_response()
}

async fn organizations(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let inner = state.inner.lock().await;
    if bearer(&headers).and_then(|t| inner.access_tokens.get(&t)).is_none() {
        return unauthorized();
    }
    Json(Envelope::ok(inner.orgs.clone())).into_response()
}

async fn nhgs(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let inner = state.inner.lock().await;
    if bearer(&headers).and_then(|t| inner.access_tokens.get(&t)).is_none() {
        return unauthorized();
    }
    let key = (
        q.get("org_uuid").cloned().unwrap_or_default(),
        q.get("acc_uuid").cloned().unwrap_or_default(),
    );
    let list = inner.nhgs.get(&key).cloned().unwrap_or_default();
    Json(Envelope::ok(list)).into_response()
}

fn parse_ts(v: Option<&String>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(v?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn record_time(rec: &Value) -> Option<DateTime<Utc>> {
    let raw = rec
        .get(ndac_protocol::PM_TIME_FIELD)
        .or_else(|| rec.get(ndac_protocol::FM_TIME_FIELD))?
        .as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

async fn records(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    let _guard = InFlight(&state.in_flight);
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);

    let path = uri.path().to_owned();
    let (email, page) = {
        let mut inner = state.inner.lock().await;
        let email = bearer(&headers).and_then(|t| inner.access_tokens.get(&t).cloned());
        inner.requests.push(RecordedRequest {
            path: path.clone(),
            email: email.clone(),
            query: q.clone(),
        });
        let start = parse_ts(q.get("start_timestamp"));
        let end = parse_ts(q.get("end_timestamp"));
        let limit: usize = q.get("limit").and_then(|v| v.parse().ok()).unwrap_or(100);
        let offset: usize = q.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
        let nhg = q.get("nhg_id").cloned().unwrap_or_default();
        let page: Vec<Value> = inner
            .records
            .get(&path)
            .map(|all| {
                all.iter()
                    .filter(|r| r.get("nhg_id").and_then(Value::as_str) == Some(nhg.as_str()))
                    .filter(|r| match record_time(r) {
                        Some(t) => start.is_none_or(|s| t >= s) && end.is_none_or(|e| t < e),
                        None => true,
                    })
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        (email, page)
    };

    let delay = *state.record_delay.lock().await;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if email.is_none() {
        return unauthorized();
    }
    Json(Envelope::ok(page)).into_response()
}
