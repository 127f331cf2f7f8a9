//! Integration tests for polling ticks: window bounds sent upstream,
//! checkpoint advancement from returned records, pagination and the
//! dispatcher lifecycle.

mod common;

use chrono::{DateTime, TimeDelta, Utc};
use collector::dispatcher::{DispatcherState, TickOutcome};
use collector::storage::checkpoint::{CheckpointKey, CheckpointStore};
use common::{FM_API, FM_PATH, Fixture, PM_API, PM_PATH, at, response_files};
use ndac_test_utils::{MockNdacServer, RecordedRequest};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

const A: &str = "a@example.com";
const B: &str = "b@example.com";

fn last_request(requests: &[RecordedRequest], path: &str) -> RecordedRequest {
    requests
        .iter()
        .rev()
        .find(|r| r.path == path)
        .cloned()
        .unwrap_or_else(|| panic!("no request to {path}"))
}

fn fm_record(nhg: &str, event_time: &str) -> Value {
    json!({
        "nhg_id": nhg,
        "hw_id": "hw-1",
        "dn": "NE-1/RADIO-1",
        "alarm_identifier": "7001",
        "specific_problem": "Cell unavailable",
        "event_time": event_time,
    })
}

#[tokio::test]
async fn first_and_second_tick_follow_the_checkpoint() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.password_user(B).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &["hw-1"]).await;
    fx.server
        .add_records(
            PM_PATH,
            vec![json!({"nhg_id": "nhg-1", "timestamp": "2026-10-19T10:50:30Z", "rssi": -71})],
        )
        .await;
    fx.server
        .add_records(FM_PATH, vec![fm_record("nhg-1", "2026-10-19T10:20:10Z")])
        .await;
    let cfg = fx.config(&[(A, "password"), (B, "password")], &[PM_API, FM_API], "", "");
    let sessions = fx.sessions(&cfg);
    assert_eq!(sessions.authenticate_all().await, 2);
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;
    assert_eq!(dispatcher.task_count().await, 4);

    let outcomes = dispatcher.run_once(at(11, 1, 0)).await;
    assert_eq!(outcomes.len(), 4);
    for (id, outcome) in &outcomes {
        let TickOutcome::Fetched {
            records,
            checkpoint,
            ..
        } = outcome
        else {
            panic!("{id}: {outcome:?}");
        };
        assert_eq!(*records, 1, "{id}");
        let want = if id.contains(PM_PATH) {
            at(10, 50, 0)
        } else {
            at(10, 20, 0)
        };
        assert_eq!(*checkpoint, Some(want), "{id}");
    }

    let reqs = fx.server.requests_for(A).await;
    let pm = last_request(&reqs, PM_PATH);
    assert_eq!(pm.query["start_timestamp"], "2026-10-19T10:45:00Z");
    assert_eq!(pm.query["end_timestamp"], "2026-10-19T10:59:00Z");
    assert_eq!(pm.query["metric_type"], "radio");
    assert_eq!(pm.query["org_uuid"], "org-1");
    assert_eq!(pm.query["acc_uuid"], "acc-1");
    assert_eq!(pm.query["nhg_id"], "nhg-1");
    let fm = last_request(&reqs, FM_PATH);
    assert_eq!(fm.query["start_timestamp"], "2026-10-19T09:00:00Z");
    assert_eq!(fm.query["end_timestamp"], "2026-10-19T10:59:00Z");
    assert_eq!(fm.query["fm_type"], "HISTORY");

    for email in [A, B] {
        assert_eq!(response_files(&fx.response_dest(email), "radio").len(), 1);
        assert_eq!(response_files(&fx.response_dest(email), "alarms").len(), 1);
    }

    dispatcher.run_once(at(11, 16, 0)).await;
    let reqs = fx.server.requests_for(A).await;
    let pm = last_request(&reqs, PM_PATH);
    assert_eq!(pm.query["start_timestamp"], "2026-10-19T10:50:00Z");
    assert_eq!(pm.query["end_timestamp"], "2026-10-19T11:14:00Z");
    // The FM re-sync span still reaches back two hours from the boundary.
    let fm = last_request(&reqs, FM_PATH);
    assert_eq!(fm.query["start_timestamp"], "2026-10-19T09:00:00Z");
    assert_eq!(response_files(&fx.response_dest(A), "radio").len(), 2);
}

#[tokio::test]
async fn covered_window_is_skipped_without_a_request() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let store = CheckpointStore::open(&fx.checkpoint_dir()).unwrap();
    store
        .advance(&CheckpointKey::new(&cfg.apis[0], A, "nhg-1"), at(11, 0, 0))
        .unwrap();
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    let outcomes = dispatcher.run_once(at(11, 1, 0)).await;
    assert_eq!(outcomes[0].1, TickOutcome::EmptyWindow);
    assert!(fx.server.requests().await.is_empty());
    assert!(response_files(&fx.response_dest(A), "radio").is_empty());
}

#[tokio::test]
async fn pages_until_a_short_page() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    let records: Vec<Value> = (0..5)
        .map(|i| json!({"nhg_id": "nhg-1", "timestamp": format!("2026-10-19T10:3{i}:00Z")}))
        .collect();
    fx.server.add_records(PM_PATH, records).await;
    let mut cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    cfg.polling.limit = 2;
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    // Window [10:30, 10:44) holds all five records.
    let outcomes = dispatcher.run_once(at(10, 46, 0)).await;
    let TickOutcome::Fetched {
        records, checkpoint, ..
    } = &outcomes[0].1
    else {
        panic!("{:?}", outcomes[0].1);
    };
    assert_eq!(*records, 5);
    assert_eq!(*checkpoint, Some(at(10, 34, 0)));

    let offsets: Vec<String> = fx
        .server
        .requests()
        .await
        .iter()
        .map(|r| r.query["offset"].clone())
        .collect();
    assert_eq!(offsets, vec!["0", "2", "4"]);

    let file = &response_files(&fx.response_dest(A), "radio")[0];
    let body: Value = serde_json::from_slice(&std::fs::read(file).unwrap()).unwrap();
    assert_eq!(body["record_count"], 5);
}

#[tokio::test]
async fn page_cap_stops_paging() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    let records: Vec<Value> = (0..6)
        .map(|i| json!({"nhg_id": "nhg-1", "timestamp": format!("2026-10-19T10:3{i}:00Z")}))
        .collect();
    fx.server.add_records(PM_PATH, records).await;
    let mut cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    cfg.polling.limit = 2;
    cfg.polling.max_pages = 2;
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    let outcomes = dispatcher.run_once(at(10, 46, 0)).await;
    assert!(matches!(outcomes[0].1, TickOutcome::Fetched { records: 4, .. }));
    assert_eq!(fx.server.requests().await.len(), 2);
}

#[tokio::test]
async fn payload_without_timestamps_keeps_checkpoint() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.server
        .add_records(PM_PATH, vec![json!({"nhg_id": "nhg-1", "rssi": -70})])
        .await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    let outcomes = dispatcher.run_once(at(11, 1, 0)).await;
    assert!(matches!(
        outcomes[0].1,
        TickOutcome::Fetched {
            records: 1,
            checkpoint: None,
            ..
        }
    ));
    assert_eq!(response_files(&fx.response_dest(A), "radio").len(), 1);
    let store = CheckpointStore::open(&fx.checkpoint_dir()).unwrap();
    let key = CheckpointKey::new(&cfg.apis[0], A, "nhg-1");
    assert_eq!(store.load(&key).unwrap(), None);
}

#[tokio::test]
async fn unwritable_destination_fails_without_advancing() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.server
        .add_records(
            PM_PATH,
            vec![json!({"nhg_id": "nhg-1", "timestamp": "2026-10-19T10:50:00Z"})],
        )
        .await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let dest = fx.response_dest(A);
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(&dest, "not a directory").unwrap();
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    let outcomes = dispatcher.run_once(at(11, 1, 0)).await;
    assert!(matches!(outcomes[0].1, TickOutcome::Failed(_)));
    let store = CheckpointStore::open(&fx.checkpoint_dir()).unwrap();
    let key = CheckpointKey::new(&cfg.apis[0], A, "nhg-1");
    assert_eq!(store.load(&key).unwrap(), None);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-2", &[]).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API, FM_API], "", "");
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;
    assert_eq!(dispatcher.task_count().await, 4);
    assert_eq!(dispatcher.state(), DispatcherState::Idle);

    assert!(dispatcher.start().await);
    assert!(!dispatcher.start().await);
    assert_eq!(dispatcher.state(), DispatcherState::Running);

    assert!(dispatcher.stop().await);
    assert!(!dispatcher.stop().await);
    assert_eq!(dispatcher.state(), DispatcherState::Idle);

    // Restart after a stop.
    assert!(dispatcher.start().await);
    assert!(dispatcher.stop().await);
}

#[tokio::test]
async fn scheduling_the_same_unit_twice_is_ignored() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx.dispatcher(&cfg, &sessions).await;

    assert_eq!(dispatcher.schedule_all().await, 0);
    assert_eq!(dispatcher.task_count().await, 1);
}

/// 50ms before the 11:01 tick of a 15-minute API with a one-minute delay.
fn just_before_tick() -> DateTime<Utc> {
    at(11, 0, 59) + TimeDelta::milliseconds(950)
}

async fn pm_requests(server: &MockNdacServer) -> usize {
    server
        .requests()
        .await
        .iter()
        .filter(|r| r.path == PM_PATH)
        .count()
}

fn all_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(rd) = std::fs::read_dir(root) else {
        return out;
    };
    for entry in rd.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(all_files(&path));
        } else {
            out.push(path);
        }
    }
    out
}

#[tokio::test]
async fn stop_lets_the_tick_in_flight_finish() {
    let fx = Fixture::start().await;
    fx.password_user(A).await;
    fx.server.add_nhg("org-1", "acc-1", "nhg-1", &[]).await;
    fx.server
        .add_records(
            PM_PATH,
            vec![json!({"nhg_id": "nhg-1", "timestamp": "2026-10-19T10:50:30Z"})],
        )
        .await;
    fx.server.set_record_delay(Duration::from_millis(400)).await;
    let cfg = fx.config(&[(A, "password")], &[PM_API], "", "");
    let sessions = fx.sessions(&cfg);
    sessions.authenticate_all().await;
    let dispatcher = fx
        .dispatcher(&cfg, &sessions)
        .await
        .with_clock(just_before_tick);

    assert!(dispatcher.start().await);
    tokio::time::timeout(Duration::from_secs(5), async {
        while pm_requests(&fx.server).await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scheduled loop never fetched");

    // The fetch is still stalled upstream when shutdown is requested.
    assert!(dispatcher.stop().await);
    assert_eq!(dispatcher.state(), DispatcherState::Idle);

    let fetched = pm_requests(&fx.server).await;
    let files = response_files(&fx.response_dest(A), "radio");
    assert!(fetched >= 1);
    assert_eq!(files.len(), fetched, "every started fetch was written");
    let store = CheckpointStore::open(&fx.checkpoint_dir()).unwrap();
    let key = CheckpointKey::new(&cfg.apis[0], A, "nhg-1");
    assert_eq!(store.load(&key).unwrap(), Some(at(10, 50, 0)));

    let stray: Vec<PathBuf> = all_files(&fx.response_dest(A))
        .into_iter()
        .chain(all_files(&fx.checkpoint_dir()))
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(".tmp-"))
        })
        .collect();
    assert!(stray.is_empty(), "temp files left behind: {stray:?}");

    let statuses = serde_json::to_value(dispatcher.task_statuses().await).unwrap();
    assert_eq!(statuses[0]["last_outcome"], "fetched");

    // Nothing is polled once stopped.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pm_requests(&fx.server).await, fetched);
}
