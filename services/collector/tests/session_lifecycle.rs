//! Integration tests for the session manager against the mock NDAC server:
//! the three auth modes, background refresh, failure isolation between
//! users, the 401 fast path, manual re-authentication and logout.

mod common;

use collector::dispatcher::TickOutcome;
use collector::session::{AuthError, SessionState, UserSession};
use common::{Fixture, PM_API, PM_PATH, at};
use serde_json::json;
use std::time::Duration;

const A: &str = "a@example.com";
const B: &str = "b@example.com";

async fn wait_for_state(user: &UserSession, want: SessionState) {
    let mut rx = user.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        while *rx.borrow_and_update() != want {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {want:?}", user.email()));
}

#[tokio::test]
async fn password_login_discovers_nhgs() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &["hw-1", "hw-2"]).await;
    fx.server.add_nhg("org-1", "acc-2", "nhg-2", &[]).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);

    let user = sessions.user(A).unwrap();
    sessions.authenticate(user).await.unwrap();

    assert_eq!(user.state(), SessionState::Active);
    let token = user.token().await.unwrap();
    assert!(token.access_token.starts_with("access-a@example.com-"));
    assert!(token.expires_at.is_some());
    let details = user.org_acc().await;
    assert_eq!(details.len(), 2);
    assert_eq!(details[0].nhgs[0].hw_ids, vec!["hw-1".to_owned(), "hw-2".to_owned()]);
    assert_eq!(fx.server.logins().await, vec![A.to_owned()]);
}

#[tokio::test]
async fn wrong_password_leaves_user_unauthenticated() {
    let fx = Fixture::start().await;
    fx.server.add_user(A, "right").await;
    fx.write_secret(A, &["wrong"]);
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);

    let user = sessions.user(A).unwrap();
    let err = sessions.authenticate(user).await.unwrap_err();
    assert!(matches!(err, AuthError::Login(_)), "{err}");
    assert_eq!(user.state(), SessionState::Unauthenticated);
    assert!(user.token().await.is_none());
}

#[tokio::test]
async fn missing_secret_file_is_an_auth_error() {
    let fx = Fixture::start().await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    let err = sessions
        .authenticate(sessions.user(A).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Secret(_)));
}

#[tokio::test]
async fn static_token_binds_without_login_and_is_never_logged_out() {
    let fx = Fixture::start().await;
    fx.server.add_access_token("static-tok", A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.write_secret(A, &["static-tok"]);
    let cfg = fx.config(&[(A, "static_token")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);

    assert_eq!(sessions.authenticate_all().await, 1);
    let user = sessions.user(A).unwrap();
    assert_eq!(user.state(), SessionState::Active);
    assert!(user.token().await.unwrap().expires_at.is_none());
    assert!(fx.server.logins().await.is_empty());

    sessions.logout_all().await;
    assert!(fx.server.logouts().await.is_empty());
    assert_eq!(user.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn federated_token_is_refreshed_in_background() {
    let fx = Fixture::start().await;
    fx.server.add_access_token("fed-access", A).await;
    fx.server.add_refresh_token("fed-refresh", A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.write_secret(A, &["fed-access", "fed-refresh"]);
    let cfg = fx.config(
        &[(A, "federated_token")],
        &[PM_API],
        "",
        "[session]\nrefresh_lead_secs = 1\nfederated_refresh_after_secs = 2\n",
    );
    let sessions = fx.sessions(&cfg);

    assert_eq!(sessions.authenticate_all().await, 1);
    let user = sessions.user(A).unwrap();
    assert_eq!(user.token().await.unwrap().access_token, "fed-access");

    tokio::time::timeout(Duration::from_secs(10), async {
        while fx.server.refreshes().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("refresh never happened");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(user.is_alive());
    assert_ne!(user.token().await.unwrap().access_token, "fed-access");
    fx.shutdown_tx.send(true).ok();
}

#[tokio::test]
async fn refresh_failure_pauses_only_that_user() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.password_user(B).await;
    fx.server.set_expires_in(2).await;
    fx.server.fail_refresh_for(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.server
        .add_records(
            PM_PATH,
            vec![json!({"nhg_id": "nhg-1", "timestamp": "2026-10-19T10:05:00Z", "value": 1})],
        )
        .await;
    let cfg = fx.config(
        &[(A, "password"), (B, "password")],
        &[PM_API],
        "",
        "[session]\nrefresh_lead_secs = 1\n",
    );
    let sessions = fx.sessions(&cfg);
    assert_eq!(sessions.authenticate_all().await, 2);
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    let a = sessions.user(A).unwrap();
    wait_for_state(a, SessionState::Expired).await;
    let b = sessions.user(B).unwrap();
    assert!(b.is_alive());

    let outcomes = dispatcher.run_once(at(10, 16, 0)).await;
    assert_eq!(outcomes.len(), 2);
    for (id, outcome) in &outcomes {
        if id.starts_with(A) {
            assert_eq!(*outcome, TickOutcome::SessionDown);
        } else {
            assert!(matches!(outcome, TickOutcome::Fetched { records: 1, .. }), "{outcome:?}");
        }
    }
    assert!(fx.server.requests_for(A).await.is_empty());
    assert_eq!(fx.server.requests_for(B).await.len(), 1);
    fx.shutdown_tx.send(true).ok();
}

#[tokio::test]
async fn unauthorized_fetch_invalidates_then_reauthenticate_recovers() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    assert_eq!(sessions.authenticate_all().await, 1);
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;
    let user = sessions.user(A).unwrap();

    fx.server.revoke_tokens_for(A).await;
    let outcomes = dispatcher.run_once(at(10, 16, 0)).await;
    assert_eq!(outcomes[0].1, TickOutcome::Unauthorized);
    assert_eq!(user.state(), SessionState::Expired);

    let before = fx.server.requests().await.len();
    let outcomes = dispatcher.run_once(at(10, 31, 0)).await;
    assert_eq!(outcomes[0].1, TickOutcome::SessionDown);
    assert_eq!(fx.server.requests().await.len(), before, "no upstream call while expired");

    sessions.reauthenticate(A).await.unwrap();
    assert_eq!(user.state(), SessionState::Active);
    let outcomes = dispatcher.run_once(at(10, 46, 0)).await;
    assert!(matches!(outcomes[0].1, TickOutcome::Fetched { .. }));
    fx.shutdown_tx.send(true).ok();
}

#[tokio::test]
async fn reauthenticate_unknown_user_fails() {
    let fx = Fixture::start().await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    let err = sessions.reauthenticate("nobody@example.com").await.unwrap_err();
    assert!(matches!(err, AuthError::UnknownUser(_)));
}

#[tokio::test]
async fn logout_all_is_best_effort() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.password_user(B).await;
    let cfg = fx.config(&[(A, "password"), (B, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    assert_eq!(sessions.authenticate_all().await, 2);

    // A's token is already gone upstream; its logout fails but B's still runs.
    fx.server.revoke_tokens_for(A).await;
    sessions.logout_all().await;

    assert_eq!(fx.server.logouts().await, vec![B.to_owned()]);
    for user in sessions.users() {
        assert_eq!(user.state(), SessionState::Unauthenticated);
        assert!(user.token().await.is_none());
    }
}

#[tokio::test]
async fn statuses_never_include_tokens() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;

    let statuses = sessions.statuses().await;
    let json = serde_json::to_string(&statuses).unwrap();
    assert!(json.contains("\"state\":\"active\""));
    assert!(!json.contains("access-"));
    assert!(!json.contains("refresh-"));
    fx.shutdown_tx.send(true).ok();
}
