//! Per-user authentication lifecycle.
//!
//! Each configured user owns one [`UserSession`]. Its state lives in a
//! `watch` channel so polling tasks and the refresh loop can observe
//! transitions; its token is swapped as a whole under a lock, so a reader
//! always sees a matching (access token, expiry) pair.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Active <-> Refreshing
//!                                        |            |
//!                                        +--> Expired <+
//! ```
//!
//! `Expired` is terminal until [`SessionManager::reauthenticate`] succeeds.

use crate::config::{CollectorConfig, SessionConfig, UserConfig};
use crate::model::{AuthMode, NhgDetails, OrgAccDetails, SessionToken};
use crate::ndac::{NdacClient, NdacError};
use crate::secrets::{Credential, SecretError, load_credential};
use chrono::{DateTime, TimeDelta, Utc};
use ndac_protocol::TokenGrant;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Refreshes are never scheduled closer together than this.
const MIN_REFRESH_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("login failed: {0}")]
    Login(NdacError),
    #[error("token refresh failed: {0}")]
    Refresh(NdacError),
    #[error("resource discovery failed: {0}")]
    Discovery(NdacError),
    #[error("logout failed: {0}")]
    Logout(NdacError),
    #[error("unknown user '{0}'")]
    UnknownUser(String),
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Active,
    Refreshing,
    Expired,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Refreshing => "refreshing",
            SessionState::Expired => "expired",
        }
    }

    /// Polling may proceed. The old token stays valid while a refresh is in
    /// flight.
    pub fn is_alive(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Refreshing)
    }
}

/// Point-in-time view of one user's session, safe to expose over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub email: String,
    pub auth_mode: &'static str,
    pub state: SessionState,
    pub expires_at: Option<DateTime<Utc>>,
    pub nhg_count: usize,
}

// ---------------------------------------------------------------------------
// UserSession
// ---------------------------------------------------------------------------

pub struct UserSession {
    config: UserConfig,
    state: watch::Sender<SessionState>,
    token: RwLock<Option<SessionToken>>,
    org_acc: RwLock<Vec<OrgAccDetails>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl UserSession {
    pub fn new(config: UserConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        UserSession {
            config,
            state,
            token: RwLock::new(None),
            org_acc: RwLock::new(Vec::new()),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn email(&self) -> &str {
        &self.config.email
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(email = %self.config.email, from = prev.as_str(), to = next.as_str(), "session state change");
        }
    }

    /// Current token, cloned as a unit.
    pub async fn token(&self) -> Option<SessionToken> {
        self.token.read().await.clone()
    }

    async fn replace_token(&self, token: Option<SessionToken>) {
        *self.token.write().await = token;
    }

    pub async fn org_acc(&self) -> Vec<OrgAccDetails> {
        self.org_acc.read().await.clone()
    }

    /// Fast invalidation path, taken when any upstream call for this user is
    /// rejected as unauthorized. Idempotent.
    pub fn invalidate(&self, reason: &str) {
        if self.state() == SessionState::Expired {
            return;
        }
        self.set_state(SessionState::Expired);
        warn!(email = %self.config.email, reason, "session invalidated; polling paused until re-authentication");
    }

    pub async fn status(&self) -> SessionStatus {
        let expires_at = self.token.read().await.as_ref().and_then(|t| t.expires_at);
        let nhg_count = self.org_acc.read().await.iter().map(|o| o.nhgs.len()).sum();
        SessionStatus {
            email: self.config.email.clone(),
            auth_mode: self.config.auth_mode.as_str(),
            state: self.state(),
            expires_at,
            nhg_count,
        }
    }

    async fn stop_refresh(&self) {
        if let Some(handle) = self.refresh_task.lock().await.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("email", &self.config.email)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Owns every user's session and the background refresh loops.
pub struct SessionManager {
    client: NdacClient,
    secrets_dir: PathBuf,
    cfg: SessionConfig,
    users: Vec<Arc<UserSession>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(
        client: NdacClient,
        cfg: &CollectorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let users = cfg
            .users
            .iter()
            .cloned()
            .map(|u| Arc::new(UserSession::new(u)))
            .collect();
        SessionManager {
            client,
            secrets_dir: cfg.polling.secrets_dir.clone(),
            cfg: cfg.session.clone(),
            users,
            shutdown_rx,
        }
    }

    pub fn client(&self) -> &NdacClient {
        &self.client
    }

    pub fn users(&self) -> &[Arc<UserSession>] {
        &self.users
    }

    pub fn user(&self, email: &str) -> Option<&Arc<UserSession>> {
        self.users
            .iter()
            .find(|u| u.email().eq_ignore_ascii_case(email))
    }

    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let mut out = Vec::with_capacity(self.users.len());
        for user in &self.users {
            out.push(user.status().await);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Obtain a token for `user` and discover its organizations and NHGs.
    /// On failure the user is left `Unauthenticated` and its tasks skip.
    pub async fn authenticate(&self, user: &UserSession) -> Result<(), AuthError> {
        user.set_state(SessionState::Authenticating);
        match self.establish(user).await {
            Ok(()) => {
                user.set_state(SessionState::Active);
                let expires_at = user.token().await.and_then(|t| t.expires_at);
                info!(
                    email = %user.email(),
                    mode = user.config.auth_mode.as_str(),
                    expires_at = ?expires_at,
                    "session established"
                );
                Ok(())
            }
            Err(e) => {
                user.replace_token(None).await;
                user.set_state(SessionState::Unauthenticated);
                Err(e)
            }
        }
    }

    async fn establish(&self, user: &UserSession) -> Result<(), AuthError> {
        let credential = load_credential(&self.secrets_dir, user.email(), user.config.auth_mode)?;
        let now = Utc::now();
        let token = match credential {
            Credential::Password(password) => {
                let grant = self
                    .client
                    .login(user.email(), &password)
                    .await
                    .map_err(AuthError::Login)?;
                token_from_grant(grant, now)
            }
            Credential::StaticToken(access_token) => SessionToken {
                access_token,
                refresh_token: String::new(),
                expires_at: None,
            },
            Credential::FederatedToken {
                access_token,
                refresh_token,
            } => SessionToken {
                access_token,
                refresh_token,
                expires_at: expiry_after(now, self.cfg.federated_refresh_after_secs),
            },
        };

        let org_acc = self.discover(&token.access_token).await?;
        user.replace_token(Some(token)).await;
        *user.org_acc.write().await = org_acc;
        Ok(())
    }

    /// List organizations/accounts, then the NHGs of each account.
    async fn discover(&self, access_token: &str) -> Result<Vec<OrgAccDetails>, AuthError> {
        let orgs = self
            .client
            .organizations(access_token)
            .await
            .map_err(AuthError::Discovery)?;
        let mut details = Vec::new();
        for org in orgs {
            for acc in org.accounts {
                let nhgs = self
                    .client
                    .network_hardware_groups(access_token, &org.org_uuid, &acc.acc_uuid)
                    .await
                    .map_err(AuthError::Discovery)?;
                details.push(OrgAccDetails {
                    org_uuid: org.org_uuid.clone(),
                    acc_uuid: acc.acc_uuid,
                    nhgs: nhgs
                        .into_iter()
                        .map(|n| NhgDetails {
                            nhg_id: n.nhg_id,
                            hw_ids: n.hw_ids,
                        })
                        .collect(),
                });
            }
        }
        Ok(details)
    }

    /// Authenticate every user and start refresh loops for the ones that
    /// succeed. Returns the number of live sessions.
    pub async fn authenticate_all(&self) -> usize {
        let mut alive = 0;
        for user in &self.users {
            match self.authenticate(user).await {
                Ok(()) => {
                    self.spawn_refresh(Arc::clone(user)).await;
                    alive += 1;
                }
                Err(e) => {
                    error!(email = %user.email(), error = %e, "authentication failed; user's polling disabled");
                }
            }
        }
        alive
    }

    /// Manual recovery from `Expired` or a failed start-up authentication.
    pub async fn reauthenticate(&self, email: &str) -> Result<(), AuthError> {
        let user = self
            .user(email)
            .cloned()
            .ok_or_else(|| AuthError::UnknownUser(email.to_owned()))?;
        user.stop_refresh().await;
        self.authenticate(&user).await?;
        self.spawn_refresh(user).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Start the background refresh loop for `user`, replacing any running
    /// one. Tokens without an expiry get no loop.
    pub async fn spawn_refresh(&self, user: Arc<UserSession>) {
        if user.token().await.and_then(|t| t.expires_at).is_none() {
            debug!(email = %user.email(), "token does not expire; no refresh loop");
            return;
        }
        let client = self.client.clone();
        let lead = secs(self.cfg.refresh_lead_secs);
        let federated_lifetime = secs(self.cfg.federated_refresh_after_secs);
        let shutdown_rx = self.shutdown_rx.clone();
        let loop_user = Arc::clone(&user);
        let handle = tokio::spawn(async move {
            refresh_loop(client, loop_user, lead, federated_lifetime, shutdown_rx).await;
        });
        if let Some(old) = user.refresh_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Logout
    // -----------------------------------------------------------------------

    /// Best-effort logout of every user still holding a token. Static tokens
    /// are never logged out.
    pub async fn logout_all(&self) {
        for user in &self.users {
            user.stop_refresh().await;
            if let Err(e) = self.logout(user).await {
                warn!(email = %user.email(), error = %e, "logout failed");
            }
        }
    }

    pub async fn logout(&self, user: &UserSession) -> Result<(), AuthError> {
        let token = user.token().await;
        user.replace_token(None).await;
        user.set_state(SessionState::Unauthenticated);
        let Some(token) = token else {
            return Ok(());
        };
        if user.config.auth_mode == AuthMode::StaticToken {
            return Ok(());
        }
        self.client
            .logout(&token.access_token)
            .await
            .map_err(AuthError::Logout)?;
        info!(email = %user.email(), "logged out");
        Ok(())
    }
}

/// Wake `lead` before expiry, refresh, repeat. A failed refresh marks the
/// session `Expired` and ends the loop; login is never retried here.
async fn refresh_loop(
    client: NdacClient,
    user: Arc<UserSession>,
    lead: TimeDelta,
    federated_lifetime: TimeDelta,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state_rx = user.subscribe();
    loop {
        state_rx.mark_unchanged();
        if *shutdown_rx.borrow() || user.state() == SessionState::Expired {
            return;
        }
        let Some(token) = user.token().await else {
            return;
        };
        let Some(expires_at) = token.expires_at else {
            return;
        };

        let wait = refresh_wait(Utc::now(), expires_at, lead);
        debug!(email = %user.email(), wait_secs = wait.as_secs(), "next token refresh scheduled");
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
            res = state_rx.changed() => {
                if res.is_err() {
                    return;
                }
                continue;
            }
        }

        if user.state() == SessionState::Expired {
            return;
        }
        user.set_state(SessionState::Refreshing);
        let now = Utc::now();
        match client.refresh(&token.refresh_token).await {
            Ok(grant) => {
                let mut next = token_from_grant(grant, now);
                if user.config.auth_mode == AuthMode::FederatedToken && next.expires_at.is_none() {
                    next.expires_at = now.checked_add_signed(federated_lifetime);
                }
                user.replace_token(Some(next)).await;
                // A concurrent 401 wins over a successful refresh.
                if user.state() == SessionState::Refreshing {
                    user.set_state(SessionState::Active);
                }
                info!(email = %user.email(), "session token refreshed");
            }
            Err(e) => {
                user.set_state(SessionState::Expired);
                let e = AuthError::Refresh(e);
                error!(email = %user.email(), error = %e, "token refresh failed; polling paused until re-authentication");
                return;
            }
        }
    }
}

fn token_from_grant(grant: TokenGrant, now: DateTime<Utc>) -> SessionToken {
    let expires_at = (grant.expires_in > 0)
        .then(|| expiry_after(now, grant.expires_in))
        .flatten();
    SessionToken {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        expires_at,
    }
}

/// `now + s` seconds, or `None` when that lies past the representable range.
/// Such a lifetime is treated as no local expiry.
fn expiry_after(now: DateTime<Utc>, s: u64) -> Option<DateTime<Utc>> {
    let lifetime = TimeDelta::try_seconds(i64::try_from(s).ok()?)?;
    now.checked_add_signed(lifetime)
}

/// Time until the refresh should fire: `lead` before expiry, but no earlier
/// than halfway to expiry and never less than [`MIN_REFRESH_WAIT`].
fn refresh_wait(now: DateTime<Utc>, expires_at: DateTime<Utc>, lead: TimeDelta) -> Duration {
    let remaining = expires_at.signed_duration_since(now);
    let half = remaining / 2;
    let target = remaining.checked_sub(&lead).map_or(half, |t| t.max(half));
    target.to_std().unwrap_or(Duration::ZERO).max(MIN_REFRESH_WAIT)
}

/// Saturating conversion for configured second counts.
fn secs(s: u64) -> TimeDelta {
    i64::try_from(s)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
