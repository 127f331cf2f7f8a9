//! Bounded polling dispatcher.
//!
//! One task per (user, API, network-hardware group). Every task shares a
//! [`RequestGate`]: a counting semaphore that caps in-flight fetch+write
//! cycles across the process, plus a pacing lock that spaces out individual
//! upstream requests.
//!
//! Lifecycle is `Idle -> Running -> Stopping -> Idle`. `start` while not idle
//! and `stop` while not running are no-ops. `stop` broadcasts shutdown and
//! waits for every task to return; a task only checks for shutdown between
//! ticks, so a tick in progress always finishes its write.

use crate::alarm::AlarmNotifier;
use crate::config::{CollectorConfig, PollingConfig};
use crate::model::{ApiConf, ApiKind, NhgTarget};
use crate::ndac::{NdacClient, NdacError, PageQuery};
use crate::session::{SessionManager, UserSession};
use crate::storage::checkpoint::{CheckpointError, CheckpointKey, CheckpointStore};
use crate::storage::response_writer::{ResponsePayload, ResponseWriter, latest_event_time};
use crate::window::{TimeWindow, next_tick, window};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request gate
// ---------------------------------------------------------------------------

/// Process-wide admission control for upstream work.
#[derive(Debug)]
pub struct RequestGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    pacing: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(capacity: usize, pacing: Duration) -> Self {
        let capacity = capacity.max(1);
        RequestGate {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            pacing,
            last_request: Mutex::new(None),
        }
    }

    /// Wait for an in-flight slot. The slot is released when the permit is
    /// dropped, on every path.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Wait until at least `pacing` has passed since the previous request
    /// issued by any task.
    pub async fn pace(&self) {
        if self.pacing.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.pacing).await;
        }
        *last = Some(Instant::now());
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Polling units and outcomes
// ---------------------------------------------------------------------------

/// Everything one polling task needs to identify its work.
#[derive(Debug, Clone)]
pub struct PollUnit {
    pub user: Arc<UserSession>,
    pub api: ApiConf,
    pub target: NhgTarget,
}

impl PollUnit {
    pub fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey::new(&self.api, self.user.email(), &self.target.nhg_id)
    }

    /// Registry key; unique per (user, API, NHG).
    pub fn id(&self) -> String {
        format!("{}|{}|{}", self.user.email(), self.api.path, self.target.nhg_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session not alive; nothing was sent upstream.
    SessionDown,
    /// Checkpoint already covers the window.
    EmptyWindow,
    Fetched {
        records: usize,
        file: PathBuf,
        checkpoint: Option<DateTime<Utc>>,
    },
    Unauthorized,
    Failed(String),
}

impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::SessionDown => "skipped_session_down",
            TickOutcome::EmptyWindow => "skipped_empty_window",
            TickOutcome::Fetched { .. } => "fetched",
            TickOutcome::Unauthorized => "unauthorized",
            TickOutcome::Failed(_) => "failed",
        }
    }
}

/// Per-task view exposed on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub email: String,
    pub api: String,
    pub kind: &'static str,
    pub type_label: String,
    pub nhg_id: String,
    pub checkpoint_key: String,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_outcome: Option<&'static str>,
    pub last_error: Option<String>,
    pub last_records: Option<usize>,
    pub checkpoint: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TaskRecord {
    last_tick: Option<DateTime<Utc>>,
    last_outcome: Option<TickOutcome>,
}

struct RegisteredTask {
    unit: Arc<PollUnit>,
    record: Arc<Mutex<TaskRecord>>,
    handle: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Shared task context
// ---------------------------------------------------------------------------

struct TaskContext {
    client: NdacClient,
    gate: Arc<RequestGate>,
    checkpoints: CheckpointStore,
    notifier: Option<Arc<AlarmNotifier>>,
    polling: PollingConfig,
}

impl TaskContext {
    fn skew(&self) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(self.polling.window_skew_secs).unwrap_or(0))
    }

    fn load_checkpoint(&self, key: &CheckpointKey) -> Option<DateTime<Utc>> {
        match self.checkpoints.load(key) {
            Ok(cp) => cp,
            Err(e @ CheckpointError::Corrupt { .. }) => {
                warn!(key = %key, error = %e, "ignoring corrupt checkpoint");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "checkpoint unreadable");
                None
            }
        }
    }

    /// One poll: window, fetch every page, write, advance checkpoint, then
    /// hand FM records to the notifier.
    async fn tick(&self, unit: &PollUnit, now: DateTime<Utc>) -> TickOutcome {
        let user = &unit.user;
        if !user.is_alive() {
            debug!(email = %user.email(), api = %unit.api.path, nhg_id = %unit.target.nhg_id, "session not alive; tick skipped");
            return TickOutcome::SessionDown;
        }
        let Some(token) = user.token().await else {
            return TickOutcome::SessionDown;
        };

        let key = unit.checkpoint_key();
        let checkpoint = self.load_checkpoint(&key);
        let w = window(
            now,
            unit.api.interval_minutes,
            unit.api.sync_duration_minutes,
            checkpoint,
            self.skew(),
        );
        if w.is_empty() {
            debug!(key = %key, start = %w.start, end = %w.end, "window already covered");
            return TickOutcome::EmptyWindow;
        }

        let Some(permit) = self.gate.acquire().await else {
            return TickOutcome::Failed("request gate closed".to_owned());
        };

        let records = match self.fetch_all(&token.access_token, unit, &w).await {
            Ok(records) => records,
            Err(e) if e.is_unauthorized() => {
                drop(permit);
                user.invalidate(&e.to_string());
                return TickOutcome::Unauthorized;
            }
            Err(e) => {
                drop(permit);
                warn!(key = %key, error = %e, "fetch failed; window will be retried");
                return TickOutcome::Failed(e.to_string());
            }
        };

        let txn_id = Uuid::new_v4();
        let fetched_at = Utc::now();
        let payload = ResponsePayload::new(
            user.email(),
            &unit.api,
            &unit.target,
            &w,
            txn_id,
            fetched_at,
            records,
        );
        let writer = ResponseWriter::new(&user.config().response_dest);
        let file = match writer.write(&unit.api, &unit.target.nhg_id, &payload, txn_id, fetched_at)
        {
            Ok(path) => path,
            Err(e) => {
                drop(permit);
                warn!(key = %key, error = %e, "response write failed; checkpoint not advanced");
                return TickOutcome::Failed(e.to_string());
            }
        };
        info!(key = %key, records = payload.record_count, file = %file.display(), "response written");

        let latest = latest_event_time(&payload.records, unit.api.kind.time_field());
        let mut advanced_to = None;
        match latest {
            Some(ts) => match self.checkpoints.advance(&key, ts) {
                Ok(true) => advanced_to = Some(ts),
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "checkpoint write failed"),
            },
            None => debug!(key = %key, "no event timestamps in payload; checkpoint unchanged"),
        }
        drop(permit);

        if unit.api.kind == ApiKind::Fm && !payload.records.is_empty() {
            if let Some(notifier) = &self.notifier {
                let source = format!("{}/{}", user.email(), unit.target.nhg_id);
                if let Err(e) = notifier.notify(&source, &payload.records, Utc::now()).await {
                    warn!(key = %key, error = %e, "alarm notification failed");
                }
            }
        }

        TickOutcome::Fetched {
            records: payload.record_count,
            file,
            checkpoint: advanced_to,
        }
    }

    /// Request pages with increasing offset until a short page arrives or
    /// `max_pages` is reached.
    async fn fetch_all(
        &self,
        access_token: &str,
        unit: &PollUnit,
        w: &TimeWindow,
    ) -> Result<Vec<Value>, NdacError> {
        let limit = self.polling.limit;
        let mut all = Vec::new();
        for page in 0..self.polling.max_pages {
            let query = PageQuery {
                api: &unit.api,
                target: &unit.target,
                window: w,
                limit,
                offset: u64::from(page) * u64::from(limit),
            };
            self.gate.pace().await;
            let batch = self.client.fetch_page(access_token, &query).await?;
            let short = batch.len() < usize::try_from(limit).unwrap_or(usize::MAX);
            all.extend(batch);
            if short {
                return Ok(all);
            }
        }
        warn!(
            email = %unit.user.email(),
            api = %unit.api.path,
            nhg_id = %unit.target.nhg_id,
            max_pages = self.polling.max_pages,
            "page cap reached; remaining records left for the next tick"
        );
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Idle,
    Running,
    Stopping,
}

/// Wall-clock source for the scheduled loop.
pub type Clock = fn() -> DateTime<Utc>;

pub struct Dispatcher {
    ctx: Arc<TaskContext>,
    sessions: Arc<SessionManager>,
    apis: Vec<ApiConf>,
    delay_minutes: u32,
    clock: Clock,
    state: watch::Sender<DispatcherState>,
    control: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<BTreeMap<String, RegisteredTask>>,
}

impl Dispatcher {
    pub fn new(
        cfg: &CollectorConfig,
        sessions: Arc<SessionManager>,
        notifier: Option<Arc<AlarmNotifier>>,
    ) -> Result<Self, CheckpointError> {
        let checkpoints = CheckpointStore::open(&cfg.polling.checkpoint_dir)?;
        let gate = Arc::new(RequestGate::new(
            cfg.polling.max_concurrency,
            Duration::from_millis(cfg.polling.pacing_ms),
        ));
        let ctx = TaskContext {
            client: sessions.client().clone(),
            gate,
            checkpoints,
            notifier,
            polling: cfg.polling.clone(),
        };
        let (state, _) = watch::channel(DispatcherState::Idle);
        Ok(Dispatcher {
            ctx: Arc::new(ctx),
            sessions,
            apis: cfg.apis.clone(),
            delay_minutes: cfg.polling.delay_minutes,
            clock: Utc::now,
            state,
            control: Mutex::new(None),
            tasks: Mutex::new(BTreeMap::new()),
        })
    }

    /// Replace the clock the scheduled loop reads. Affects tasks spawned by
    /// later calls to [`Dispatcher::start`].
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.ctx.gate
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Register one polling unit. Returns `false` if it already exists. When
    /// the dispatcher is running the task starts immediately.
    pub async fn schedule(&self, user: Arc<UserSession>, api: ApiConf, target: NhgTarget) -> bool {
        let unit = Arc::new(PollUnit { user, api, target });
        let id = unit.id();
        let control = self.control.lock().await;
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&id) {
            return false;
        }
        let record = Arc::new(Mutex::new(TaskRecord::default()));
        let handle = control
            .as_ref()
            .map(|tx| self.spawn_task(Arc::clone(&unit), Arc::clone(&record), tx.subscribe()));
        debug!(task = %id, "polling unit scheduled");
        tasks.insert(
            id,
            RegisteredTask {
                unit,
                record,
                handle,
            },
        );
        true
    }

    /// Schedule every (API, NHG) pair discovered for `user`.
    pub async fn schedule_user(&self, user: &Arc<UserSession>) -> usize {
        let mut added = 0;
        for details in user.org_acc().await {
            for target in details.targets() {
                for api in &self.apis {
                    if self.schedule(Arc::clone(user), api.clone(), target.clone()).await {
                        added += 1;
                    }
                }
            }
        }
        added
    }

    /// Schedule units for every user the session manager tracks.
    pub async fn schedule_all(&self) -> usize {
        let mut added = 0;
        for user in self.sessions.users() {
            added += self.schedule_user(user).await;
        }
        info!(tasks = added, "polling units scheduled");
        added
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn task_statuses(&self) -> Vec<TaskStatus> {
        let entries: Vec<(Arc<PollUnit>, Arc<Mutex<TaskRecord>>)> = self
            .tasks
            .lock()
            .await
            .values()
            .map(|t| (Arc::clone(&t.unit), Arc::clone(&t.record)))
            .collect();
        let mut out = Vec::with_capacity(entries.len());
        for (unit, record) in entries {
            let key = unit.checkpoint_key();
            let record = record.lock().await;
            out.push(TaskStatus {
                email: unit.user.email().to_owned(),
                api: unit.api.path.clone(),
                kind: unit.api.kind.as_str(),
                type_label: unit.api.type_label(),
                nhg_id: unit.target.nhg_id.clone(),
                checkpoint_key: key.to_string(),
                last_tick: record.last_tick,
                last_outcome: record.last_outcome.as_ref().map(TickOutcome::label),
                last_error: match &record.last_outcome {
                    Some(TickOutcome::Failed(e)) => Some(e.clone()),
                    _ => None,
                },
                last_records: match &record.last_outcome {
                    Some(TickOutcome::Fetched { records, .. }) => Some(*records),
                    _ => None,
                },
                checkpoint: self.ctx.checkpoints.load(&key).ok().flatten(),
            });
        }
        out
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn a task for every registered unit. No-op unless idle.
    pub async fn start(&self) -> bool {
        let mut control = self.control.lock().await;
        if self.state() != DispatcherState::Idle {
            debug!(state = ?self.state(), "start ignored; dispatcher not idle");
            return false;
        }
        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.values_mut() {
            task.handle = Some(self.spawn_task(
                Arc::clone(&task.unit),
                Arc::clone(&task.record),
                shutdown_tx.subscribe(),
            ));
        }
        *control = Some(shutdown_tx);
        self.state.send_replace(DispatcherState::Running);
        info!(tasks = tasks.len(), "dispatcher started");
        true
    }

    /// Broadcast shutdown and wait for every task to exit. No-op unless
    /// running.
    pub async fn stop(&self) -> bool {
        let mut control = self.control.lock().await;
        if self.state() != DispatcherState::Running {
            debug!(state = ?self.state(), "stop ignored; dispatcher not running");
            return false;
        }
        self.state.send_replace(DispatcherState::Stopping);
        if let Some(tx) = control.take() {
            let _ = tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .await
            .values_mut()
            .filter_map(|t| t.handle.take())
            .collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "polling task ended abnormally");
            }
        }
        self.state.send_replace(DispatcherState::Idle);
        info!(tasks = count, "dispatcher stopped");
        true
    }

    /// Run exactly one tick of every registered unit concurrently, under the
    /// same gate as the scheduled loop.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Vec<(String, TickOutcome)> {
        let entries: Vec<(String, Arc<PollUnit>, Arc<Mutex<TaskRecord>>)> = self
            .tasks
            .lock()
            .await
            .iter()
            .map(|(id, t)| (id.clone(), Arc::clone(&t.unit), Arc::clone(&t.record)))
            .collect();

        let mut set = JoinSet::new();
        for (id, unit, record) in entries {
            let ctx = Arc::clone(&self.ctx);
            set.spawn(async move {
                let outcome = ctx.tick(&unit, now).await;
                let mut r = record.lock().await;
                r.last_tick = Some(now);
                r.last_outcome = Some(outcome.clone());
                (id, outcome)
            });
        }

        let mut out = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(pair) => out.push(pair),
                Err(e) => warn!(error = %e, "single-pass tick panicked"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn spawn_task(
        &self,
        unit: Arc<PollUnit>,
        record: Arc<Mutex<TaskRecord>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let delay = self.delay_minutes;
        tokio::spawn(run_task(ctx, unit, record, delay, self.clock, shutdown_rx))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("capacity", &self.ctx.gate.capacity())
            .finish_non_exhaustive()
    }
}

/// Task loop: sleep to the next tick, tick, repeat. Ticks of one unit never
/// overlap. Shutdown is only observed between ticks, so a tick in flight
/// always finishes its write and checkpoint.
async fn run_task(
    ctx: Arc<TaskContext>,
    unit: Arc<PollUnit>,
    record: Arc<Mutex<TaskRecord>>,
    delay_minutes: u32,
    clock: Clock,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let id = unit.id();
    loop {
        if *shutdown_rx.borrow() {
            debug!(task = %id, "polling task stopping (shutdown)");
            return;
        }

        let now = clock();
        let at = next_tick(now, unit.api.interval_minutes, delay_minutes);
        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    debug!(task = %id, "polling task stopping (shutdown)");
                    return;
                }
                continue;
            }
        }

        let now = clock();
        let outcome = ctx.tick(&unit, now).await;
        let mut r = record.lock().await;
        r.last_tick = Some(now);
        r.last_outcome = Some(outcome);
    }
}
