// Central Service
// Owns the scheduling loop: heartbeat planning, slot-bounded dispatch of
// claimed runs, kill/resume/waiting handling, event forwarding, and
// housekeeping (waiting expiry, history pruning, memory sweeps).
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use steward_core::{
    CentralServiceConfig, ConfigStore, EventRecord, EventRing, Result, StewardError,
};
use steward_memory::{MemoryManager, MemoryManagerSettings, MemorySummaryWorker};
use steward_store::{
    DailyMemoryStore, DbQueue, MemoryIndexStore, SchedulerStore, SqlRequest, SqlResponse,
};
use steward_types::{RunRecord, RunStatus, ScheduleRecord, TaskProfile};

use crate::heartbeat::TaskHeartbeat;
use crate::runner::RunExecutor;

const EVENT_RING_CAP: usize = 500;
const WAITING_SCAN_LIMIT: usize = 500;

const HIGH_SIGNAL_EVENTS: [&str; 6] = [
    "run_queued",
    "run_finished",
    "run_failed",
    "run_blocked",
    "run_waiting",
    "run_resumed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Free,
    Allocating,
    Busy,
}

/// One logical execution seat.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSlot {
    pub slot_id: String,
    pub enabled: bool,
    pub state: SlotState,
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub task_name: Option<String>,
    pub started_at: Option<String>,
    pub updated_at: String,
    pub last_result: Option<Value>,
}

impl TaskSlot {
    fn free(slot_id: String) -> Self {
        Self {
            slot_id,
            enabled: true,
            state: SlotState::Free,
            run_id: None,
            task_id: None,
            task_name: None,
            started_at: None,
            updated_at: Utc::now().to_rfc3339(),
            last_result: None,
        }
    }
}

struct DbHandles {
    db_path: PathBuf,
    busy_timeout_ms: u64,
    queue: Arc<DbQueue>,
    store: Arc<SchedulerStore>,
}

struct Inner {
    config: ConfigStore,
    root: PathBuf,
    db: RwLock<DbHandles>,
    executor: Arc<dyn RunExecutor>,
    memory_manager: Arc<MemoryManager>,
    daily: Arc<DailyMemoryStore>,
    index: Arc<MemoryIndexStore>,
    summary_worker: Mutex<Option<Arc<MemorySummaryWorker>>>,
    slots: Mutex<BTreeMap<String, TaskSlot>>,
    run_to_slot: Mutex<HashMap<String, String>>,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    events: Mutex<EventRing>,
    loop_cancel: Mutex<Option<CancellationToken>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// The scheduling core. Cloneable handle around shared state.
#[derive(Clone)]
pub struct CentralService {
    inner: Arc<Inner>,
}

fn origin_of(payload: &Value) -> String {
    payload
        .get("origin")
        .and_then(Value::as_str)
        .or_else(|| payload.get("trigger").and_then(Value::as_str))
        .unwrap_or("manual")
        .to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push('…');
        out
    }
}

impl CentralService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigStore,
        root: PathBuf,
        queue: Arc<DbQueue>,
        store: Arc<SchedulerStore>,
        executor: Arc<dyn RunExecutor>,
        memory_manager: Arc<MemoryManager>,
        daily: Arc<DailyMemoryStore>,
        index: Arc<MemoryIndexStore>,
    ) -> Self {
        let db = DbHandles {
            db_path: queue.db_path().to_path_buf(),
            busy_timeout_ms: 0,
            queue,
            store,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                root,
                db: RwLock::new(db),
                executor,
                memory_manager,
                daily,
                index,
                summary_worker: Mutex::new(None),
                slots: Mutex::new(BTreeMap::new()),
                run_to_slot: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                events: Mutex::new(EventRing::new(EVENT_RING_CAP)),
                loop_cancel: Mutex::new(None),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    /// Attach the summary worker so high-signal events can kick it.
    pub async fn attach_summary_worker(&self, worker: Arc<MemorySummaryWorker>) {
        *self.inner.summary_worker.lock().await = Some(worker);
    }

    pub async fn store(&self) -> Arc<SchedulerStore> {
        self.inner.db.read().await.store.clone()
    }

    async fn queue(&self) -> Arc<DbQueue> {
        self.inner.db.read().await.queue.clone()
    }

    /// Tick step 1: if the configured DB path or busy timeout changed,
    /// rebuild the serialized queue and the stores layered on it. Busy
    /// slots keep their in-flight runs on the old handles.
    async fn refresh_db(&self, settings: &CentralServiceConfig) {
        let configured = {
            let raw = PathBuf::from(&settings.scheduler_db_path);
            if raw.is_absolute() {
                raw
            } else {
                self.inner.root.join(raw)
            }
        };
        let needs_rebuild = {
            let db = self.inner.db.read().await;
            let timeout_changed =
                db.busy_timeout_ms != 0 && db.busy_timeout_ms != settings.db_queue_busy_timeout_ms;
            db.db_path != configured || timeout_changed
        };
        if !needs_rebuild {
            let mut db = self.inner.db.write().await;
            if db.busy_timeout_ms == 0 {
                db.busy_timeout_ms = settings.db_queue_busy_timeout_ms;
            }
            return;
        }

        tracing::info!(
            "rebuilding db queue: path={} busy_timeout_ms={}",
            configured.display(),
            settings.db_queue_busy_timeout_ms
        );
        let queue = DbQueue::new(&configured, settings.db_queue_busy_timeout_ms);
        queue.start();
        if let Err(err) = steward_store::ensure_schema(&queue).await {
            tracing::warn!("schema migration on rebuilt db failed: {err}");
            return;
        }
        let store = Arc::new(SchedulerStore::new(queue.clone()));
        // The old queue stays alive for in-flight runs and stops when the
        // last store handle over it drops.
        let mut db = self.inner.db.write().await;
        *db = DbHandles {
            db_path: configured,
            busy_timeout_ms: settings.db_queue_busy_timeout_ms,
            queue,
            store,
        };
    }

    async fn settings(&self) -> CentralServiceConfig {
        self.inner.config.get().await.central_service.clone()
    }

    // ── Event plumbing ──────────────────────────────────────────────

    fn is_high_signal(event_type: &str) -> bool {
        HIGH_SIGNAL_EVENTS.contains(&event_type)
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_task_agent_event(
        &self,
        event_type: &str,
        profile_id: &str,
        run_id: &str,
        detail: String,
        run_status: Option<&str>,
        slot_id: Option<String>,
        origin: &str,
        percent: Option<u8>,
        extra: Option<Value>,
    ) {
        let mut payload = json!({
            "event_type": event_type,
            "task_id": profile_id,
            "task_name": profile_id,
            "run_id": run_id,
            "slot_id": slot_id,
            "status": run_status,
            "message": detail.clone(),
            "percent": percent,
            "origin": origin,
            "detail": detail.clone(),
        });
        if let Some(Value::Object(extra)) = extra {
            for (key, value) in extra {
                payload[key] = value;
            }
        }

        let forward = Self::is_high_signal(event_type);
        self.inner
            .events
            .lock()
            .await
            .push(EventRecord::new("task_agent_event", payload, forward));

        if forward {
            let text = format!("{event_type} task={profile_id} run={run_id} {detail}");
            if let Err(err) = self
                .inner
                .daily
                .append_event(&text, "task_agent_event", Some("central_service"), None, None)
                .await
            {
                tracing::warn!("daily memory append failed: {err}");
            }
            let day = self.inner.daily.local_day();
            if let Err(err) = self
                .inner
                .index
                .enqueue_summary_job(&day, &format!("task_agent:{event_type}"))
                .await
            {
                tracing::warn!("summary job enqueue failed: {err}");
            }
            if let Some(worker) = self.inner.summary_worker.lock().await.as_ref() {
                worker.kick();
            }
        }
    }

    /// Forwardable events accumulated since the last consuming read.
    pub async fn list_forward_events(&self, consume: bool) -> Vec<EventRecord> {
        self.inner.events.lock().await.list_forward_events(consume)
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        self.inner.events.lock().await.recent(limit)
    }

    // ── Slots ───────────────────────────────────────────────────────

    /// Grow or shrink the slot table to the configured concurrency.
    /// Shrinking disables busy slots instead of preempting them.
    async fn sync_slots(&self, concurrency: usize) {
        let mut slots = self.inner.slots.lock().await;
        for idx in 1..=concurrency {
            let slot_id = format!("slot_{idx}");
            slots
                .entry(slot_id.clone())
                .or_insert_with(|| TaskSlot::free(slot_id));
        }
        let excess: Vec<String> = slots
            .keys()
            .filter(|slot_id| {
                slot_id
                    .strip_prefix("slot_")
                    .and_then(|idx| idx.parse::<usize>().ok())
                    .map(|idx| idx > concurrency)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for slot_id in excess {
            let remove = {
                let slot = slots.get_mut(&slot_id).expect("slot exists");
                if slot.state == SlotState::Busy {
                    slot.enabled = false;
                    false
                } else {
                    true
                }
            };
            if remove {
                slots.remove(&slot_id);
            }
        }
    }

    async fn acquire_free_slot(&self) -> Option<String> {
        let mut slots = self.inner.slots.lock().await;
        let free = slots
            .values_mut()
            .find(|slot| slot.enabled && slot.state == SlotState::Free)?;
        free.state = SlotState::Allocating;
        free.updated_at = Utc::now().to_rfc3339();
        Some(free.slot_id.clone())
    }

    async fn unreserve_slot(&self, slot_id: &str) {
        let mut slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.get_mut(slot_id) {
            if slot.state == SlotState::Allocating {
                slot.state = SlotState::Free;
                slot.updated_at = Utc::now().to_rfc3339();
            }
        }
    }

    async fn assign_slot(&self, slot_id: &str, run_id: &str, task_id: &str, task_name: &str) {
        let mut slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.get_mut(slot_id) {
            slot.state = SlotState::Busy;
            slot.run_id = Some(run_id.to_string());
            slot.task_id = Some(task_id.to_string());
            slot.task_name = Some(task_name.to_string());
            slot.started_at = Some(Utc::now().to_rfc3339());
            slot.updated_at = Utc::now().to_rfc3339();
        }
        self.inner
            .run_to_slot
            .lock()
            .await
            .insert(run_id.to_string(), slot_id.to_string());
    }

    async fn release_slot(&self, run_id: &str, last_result: Value) {
        let slot_id = self.inner.run_to_slot.lock().await.remove(run_id);
        let Some(slot_id) = slot_id else { return };
        let mut slots = self.inner.slots.lock().await;
        let disabled = slots
            .get(&slot_id)
            .map(|slot| !slot.enabled)
            .unwrap_or(false);
        if disabled {
            // Concurrency was reduced while this slot was busy.
            slots.remove(&slot_id);
            return;
        }
        if let Some(slot) = slots.get_mut(&slot_id) {
            slot.state = SlotState::Free;
            slot.run_id = None;
            slot.task_id = None;
            slot.task_name = None;
            slot.started_at = None;
            slot.updated_at = Utc::now().to_rfc3339();
            slot.last_result = Some(last_result);
        }
    }

    pub async fn task_slots(&self) -> Vec<TaskSlot> {
        self.inner.slots.lock().await.values().cloned().collect()
    }

    pub async fn busy_slot_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.state == SlotState::Busy)
            .count()
    }

    // ── Config sync ─────────────────────────────────────────────────

    /// Upsert config-declared task profiles and schedules.
    async fn sync_from_config(&self) -> Result<()> {
        let config = self.inner.config.get().await;

        if let Some(profiles) = config.task_agents.get("profiles").and_then(Value::as_object) {
            for (profile_id, declared) in profiles {
                let mut profile: TaskProfile = match serde_json::from_value(declared.clone()) {
                    Ok(profile) => profile,
                    Err(_) => TaskProfile {
                        task_id: profile_id.clone(),
                        name: declared
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or(profile_id)
                            .to_string(),
                        kind: steward_types::TaskKind::Agentic,
                        entrypoint_path: None,
                        module: None,
                        resources_path: None,
                        queue_group: None,
                        timeout_sec: declared.get("timeout_sec").and_then(Value::as_u64),
                        retry_policy: None,
                        enabled: true,
                        source: "config".to_string(),
                    },
                };
                profile.task_id = profile_id.clone();
                profile.source = "config".to_string();
                if let Err(err) = self.store().await.upsert_task_profile(&profile).await {
                    tracing::warn!("profile sync skipped `{profile_id}`: {err}");
                }
            }
        }

        if let Some(declared) = config.defined_tasks.as_array() {
            let mut schedules = Vec::new();
            for entry in declared {
                match serde_json::from_value::<ScheduleRecord>(entry.clone()) {
                    Ok(schedule) => schedules.push(schedule),
                    Err(err) => tracing::warn!("schedule sync entry skipped: {err}"),
                }
            }
            if !schedules.is_empty() {
                self.store().await.sync_schedules(&schedules).await?;
            }
        }
        Ok(())
    }

    // ── Tick ────────────────────────────────────────────────────────

    /// One scheduling pass: plan due runs, dispatch into free slots,
    /// then housekeep.
    pub async fn tick(&self) -> Value {
        let settings = self.settings().await;
        self.refresh_db(&settings).await;
        self.sync_slots(settings.task_runner_concurrency).await;
        if let Err(err) = self.sync_from_config().await {
            tracing::warn!("config sync failed: {err}");
        }

        let heartbeat = TaskHeartbeat::new(self.store().await);
        let enqueued = match heartbeat.enqueue_due_runs(Utc::now()).await {
            Ok(runs) => {
                for run in &runs {
                    self.log_task_agent_event(
                        "run_queued",
                        &run.profile_id,
                        &run.run_id,
                        "trigger=scheduled".to_string(),
                        Some("queued"),
                        None,
                        "scheduled",
                        None,
                        None,
                    )
                    .await;
                }
                runs.len()
            }
            Err(err) => {
                tracing::warn!("heartbeat failed: {err}");
                0
            }
        };

        let dispatched = self.dispatch_available().await;
        let housekeeping = self.run_housekeeping(false).await;

        json!({
            "ok": true,
            "enqueued": enqueued,
            "dispatched": dispatched,
            "housekeeping": housekeeping,
        })
    }

    /// Dispatch loop: reserve slot → claim run → spawn execution.
    pub async fn dispatch_available(&self) -> usize {
        let settings = self.settings().await;
        self.sync_slots(settings.task_runner_concurrency).await;
        let mut started = 0usize;
        loop {
            {
                // Drop handles for runs that finished before their entry
                // landed in the map.
                let mut active = self.inner.active.lock().await;
                active.retain(|_, handle| !handle.is_finished());
                if active.len() >= settings.task_runner_concurrency {
                    break;
                }
            }
            let Some(slot_id) = self.acquire_free_slot().await else {
                break;
            };
            let claimed = match self.store().await.claim_next_run().await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    self.unreserve_slot(&slot_id).await;
                    break;
                }
                Err(err) => {
                    tracing::warn!("claim failed: {err}");
                    self.unreserve_slot(&slot_id).await;
                    break;
                }
            };

            let task_name = claimed
                .payload
                .get("task_name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| claimed.profile_id.clone());
            self.assign_slot(&slot_id, &claimed.run_id, &claimed.profile_id, &task_name)
                .await;

            let cancel = CancellationToken::new();
            self.inner
                .cancels
                .lock()
                .await
                .insert(claimed.run_id.clone(), cancel.clone());

            let service = self.clone();
            let run_id = claimed.run_id.clone();
            let handle = tokio::spawn(async move {
                service.execute_claimed_run(claimed, cancel).await;
            });
            self.inner.active.lock().await.insert(run_id, handle);
            started += 1;
        }
        started
    }

    async fn execute_claimed_run(&self, run: RunRecord, cancel: CancellationToken) {
        let settings = self.settings().await;
        let run_id = run.run_id.clone();
        let profile_id = run.profile_id.clone();
        let origin = origin_of(&run.payload);
        let slot_id = self.inner.run_to_slot.lock().await.get(&run_id).cloned();

        self.log_task_agent_event(
            "run_started",
            &profile_id,
            &run_id,
            "started".to_string(),
            Some("running"),
            slot_id.clone(),
            &origin,
            None,
            None,
        )
        .await;
        self.log_task_agent_event(
            "run_progress",
            &profile_id,
            &run_id,
            "progress=10 message=task execution started".to_string(),
            Some("running"),
            slot_id.clone(),
            &origin,
            Some(10),
            None,
        )
        .await;

        let outcome = self
            .inner
            .executor
            .run_profile(&profile_id, &run.payload, cancel)
            .await;

        let (final_status, final_summary, final_error) = if outcome.status
            == RunStatus::WaitingForUser
        {
            let wait_timeout = outcome
                .wait_timeout_sec
                .unwrap_or(settings.waiting_for_user_timeout_sec);
            let expires_at = if wait_timeout > 0 {
                Some((Utc::now() + ChronoDuration::seconds(wait_timeout as i64)).to_rfc3339())
            } else {
                None
            };
            let requested_by = run
                .payload
                .get("requested_by")
                .and_then(Value::as_str)
                .unwrap_or("main_agent")
                .to_string();
            match self
                .store()
                .await
                .mark_waiting_for_user(
                    &run_id,
                    outcome.waiting_question.as_deref(),
                    outcome.wait_context.clone(),
                    &requested_by,
                    expires_at.as_deref(),
                )
                .await
            {
                Ok(waiting) => {
                    self.log_task_agent_event(
                        "run_waiting",
                        &profile_id,
                        &run_id,
                        format!("status=waiting_for_user request_id={}", waiting.request_id),
                        Some("waiting_for_user"),
                        slot_id.clone(),
                        &origin,
                        None,
                        Some(json!({
                            "request_id": waiting.request_id,
                            "question": waiting.question,
                            "context": waiting.context,
                            "expires_at": waiting.expires_at,
                        })),
                    )
                    .await;
                    (
                        RunStatus::WaitingForUser,
                        outcome.waiting_question.clone(),
                        None,
                    )
                }
                Err(err) => {
                    let detail = err.to_string();
                    let _ = self
                        .store()
                        .await
                        .complete_run(&run_id, RunStatus::Failed, None, Some(&detail))
                        .await;
                    self.log_task_agent_event(
                        "run_failed",
                        &profile_id,
                        &run_id,
                        format!("status=failed error={}", truncate(&detail, 160)),
                        Some("failed"),
                        slot_id.clone(),
                        &origin,
                        None,
                        None,
                    )
                    .await;
                    (RunStatus::Failed, None, Some(detail))
                }
            }
        } else {
            let status = if outcome.status.is_terminal() {
                outcome.status
            } else {
                RunStatus::Failed
            };
            match self
                .store()
                .await
                .complete_run(
                    &run_id,
                    status,
                    outcome.summary.as_deref(),
                    outcome.error.as_deref(),
                )
                .await
            {
                Ok(_) => {}
                Err(err) => tracing::warn!("complete_run failed for {run_id}: {err}"),
            }

            let mut detail = format!("status={}", status.as_str());
            if let Some(summary) = &outcome.summary {
                detail.push_str(&format!(" summary={}", truncate(summary, 160)));
            }
            if let Some(error) = &outcome.error {
                detail.push_str(&format!(" error={}", truncate(error, 160)));
            }
            if matches!(status, RunStatus::Failed | RunStatus::Blocked) {
                detail.push_str(&format!(" retryable_error={}", outcome.retryable_error));
                if let Some(used) = outcome.attempts_used {
                    detail.push_str(&format!(" attempts_used={used}"));
                }
                if let Some(configured) = outcome.attempts_configured {
                    detail.push_str(&format!(" attempts_configured={configured}"));
                }
            }
            let event_type = match status {
                RunStatus::Done => "run_finished",
                RunStatus::Failed => "run_failed",
                _ => "run_blocked",
            };
            self.log_task_agent_event(
                event_type,
                &profile_id,
                &run_id,
                detail,
                Some(status.as_str()),
                slot_id.clone(),
                &origin,
                None,
                None,
            )
            .await;
            (status, outcome.summary.clone(), outcome.error.clone())
        };

        self.inner.active.lock().await.remove(&run_id);
        self.inner.cancels.lock().await.remove(&run_id);
        self.release_slot(
            &run_id,
            json!({
                "run_id": run_id,
                "status": final_status.as_str(),
                "summary": final_summary,
                "error": final_error,
            }),
        )
        .await;
        self.run_housekeeping(true).await;
    }

    // ── Housekeeping ────────────────────────────────────────────────

    async fn memory_settings(&self, settings: &CentralServiceConfig) -> MemoryManagerSettings {
        MemoryManagerSettings {
            sweep_interval: Duration::from_secs(settings.memory_manager_sweep_interval_sec.max(1)),
            completion_debounce: Duration::from_secs(
                settings.memory_manager_completion_debounce_sec.max(1),
            ),
        }
    }

    async fn run_housekeeping(&self, on_completion: bool) -> Value {
        let settings = self.settings().await;
        let expired = self.expire_waiting_runs(&settings).await;
        let pruned = self
            .store()
            .await
            .prune_runs(
                Some(settings.run_history_retention_days),
                Some(settings.run_history_max_rows),
                Utc::now(),
            )
            .await
            .unwrap_or(0);

        let memory_settings = self.memory_settings(&settings).await;
        let sweep = if on_completion {
            self.inner
                .memory_manager
                .maybe_completion_sweep(memory_settings)
                .await
        } else {
            self.inner
                .memory_manager
                .maybe_periodic_sweep(memory_settings)
                .await
        };
        let sweep = sweep.unwrap_or_else(|err| json!({"ok": false, "error": err.to_string()}));
        let finalized = sweep
            .get("finalized_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if finalized > 0 {
            self.inner.events.lock().await.record(
                "memory_manager_sweep",
                json!({
                    "finalized_count": finalized,
                    "finalized_days": sweep.get("finalized_days").cloned(),
                    "trigger": if on_completion { "completion" } else { "periodic" },
                }),
                false,
            );
        }

        json!({
            "ok": true,
            "expired_waiting": expired,
            "pruned_runs": pruned,
            "memory": sweep,
        })
    }

    /// Waiting runs past their deadline become blocked with
    /// `waiting_for_user_timeout`.
    async fn expire_waiting_runs(&self, settings: &CentralServiceConfig) -> usize {
        if settings.waiting_for_user_timeout_sec == 0 {
            return 0;
        }
        let Ok(waiting_runs) = self
            .store()
            .await
            .list_runs_by_status(RunStatus::WaitingForUser, WAITING_SCAN_LIMIT)
            .await
        else {
            return 0;
        };

        let now = Utc::now();
        let mut expired = 0usize;
        for run in waiting_runs {
            let Some(waiting) = run.waiting_info() else {
                continue;
            };
            let deadline: Option<DateTime<Utc>> = waiting
                .expires_at
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|parsed| parsed.with_timezone(&Utc))
                .or_else(|| {
                    DateTime::parse_from_rfc3339(&waiting.waiting_since)
                        .ok()
                        .map(|since| {
                            since.with_timezone(&Utc)
                                + ChronoDuration::seconds(
                                    settings.waiting_for_user_timeout_sec as i64,
                                )
                        })
                });
            let Some(deadline) = deadline else { continue };
            if now < deadline {
                continue;
            }

            if self
                .store()
                .await
                .complete_run(
                    &run.run_id,
                    RunStatus::Blocked,
                    None,
                    Some("waiting_for_user_timeout"),
                )
                .await
                .is_ok()
            {
                expired += 1;
                self.log_task_agent_event(
                    "run_blocked",
                    &run.profile_id,
                    &run.run_id,
                    format!(
                        "status=blocked reason=waiting_for_user_timeout request_id={}",
                        truncate(&waiting.request_id, 80)
                    ),
                    Some("blocked"),
                    None,
                    &origin_of(&run.payload),
                    None,
                    Some(json!({
                        "request_id": waiting.request_id,
                        "question": waiting.question,
                        "expires_at": deadline.to_rfc3339(),
                    })),
                )
                .await;
            }
        }
        expired
    }

    // ── Public operations ───────────────────────────────────────────

    /// Enqueue a manual run for a profile and trigger a dispatch pass.
    pub async fn trigger_profile(
        &self,
        profile_id: &str,
        description: Option<&str>,
    ) -> Result<RunRecord> {
        let run = self
            .store()
            .await
            .enqueue_manual_run(profile_id, description, None)
            .await?;
        self.log_task_agent_event(
            "run_queued",
            profile_id,
            &run.run_id,
            "trigger=manual".to_string(),
            Some("queued"),
            None,
            "manual",
            None,
            None,
        )
        .await;
        self.dispatch_available().await;
        Ok(run)
    }

    /// Queue a one-off agentic run under the reserved profile.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_agentic_task(
        &self,
        instructions: &str,
        model_tier: &str,
        tool_access: Vec<String>,
        skill_access: Vec<String>,
        timeout_sec: Option<u64>,
        requested_by: &str,
        description: Option<&str>,
    ) -> Result<RunRecord> {
        let run = self
            .store()
            .await
            .enqueue_agentic_run(
                instructions,
                model_tier,
                &tool_access,
                &skill_access,
                timeout_sec,
                requested_by,
                description,
            )
            .await?;
        self.log_task_agent_event(
            "run_queued",
            "agentic_task",
            &run.run_id,
            "trigger=agentic".to_string(),
            Some("queued"),
            None,
            "manual",
            None,
            None,
        )
        .await;
        self.dispatch_available().await;
        Ok(run)
    }

    /// Kill semantics: terminal runs report as such, queued/waiting runs
    /// block immediately, running runs get a cooperative cancel signal.
    pub async fn kill_run(&self, run_id: &str, requested_by: &str) -> Result<Value> {
        let run = self
            .store()
            .await
            .get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("run `{run_id}` not found")))?;
        let origin = origin_of(&run.payload);

        if run.status.is_terminal() {
            return Ok(json!({
                "ok": true,
                "run_id": run_id,
                "status": run.status.as_str(),
                "already_terminal": true,
            }));
        }

        if matches!(run.status, RunStatus::Queued | RunStatus::WaitingForUser) {
            let outcome = self
                .store()
                .await
                .cancel_run(run_id, &format!("killed_by_user:{requested_by}"))
                .await?;
            self.log_task_agent_event(
                "run_blocked",
                &run.profile_id,
                run_id,
                format!("killed_by={requested_by} state={}", run.status.as_str()),
                Some("blocked"),
                None,
                &origin,
                None,
                None,
            )
            .await;
            self.run_housekeeping(true).await;
            return Ok(json!({
                "ok": true,
                "run_id": run_id,
                "status": outcome.status.as_str(),
                "already_terminal": false,
            }));
        }

        // Running: signal; the executor observes the cancel at its poll
        // points and completes the run as blocked.
        let cancel = self.inner.cancels.lock().await.get(run_id).cloned();
        let Some(cancel) = cancel else {
            return Err(StewardError::InvalidOperation(
                "run is not currently managed by an active executor".to_string(),
            ));
        };
        cancel.cancel();
        let slot_id = self.inner.run_to_slot.lock().await.get(run_id).cloned();
        self.log_task_agent_event(
            "run_blocked",
            &run.profile_id,
            run_id,
            format!("killed_by={requested_by} state=running cancel_requested=true"),
            Some("running"),
            slot_id,
            &origin,
            None,
            None,
        )
        .await;
        Ok(json!({
            "ok": true,
            "run_id": run_id,
            "status": "running",
            "cancel_requested": true,
            "already_terminal": false,
        }))
    }

    /// Resume a waiting run with the user's response and dispatch.
    pub async fn resume_run(
        &self,
        run_id: &str,
        user_response: &str,
        requested_by: &str,
    ) -> Result<Value> {
        let run = self
            .store()
            .await
            .get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("run `{run_id}` not found")))?;
        if run.status != RunStatus::WaitingForUser {
            return Err(StewardError::InvalidOperation(
                "run is not waiting for user input".to_string(),
            ));
        }
        let waiting = self
            .store()
            .await
            .resume_waiting_run(run_id, user_response, requested_by)
            .await?;
        self.log_task_agent_event(
            "run_resumed",
            &run.profile_id,
            run_id,
            format!("resumed_by={requested_by}"),
            Some("queued"),
            None,
            &origin_of(&run.payload),
            None,
            Some(json!({
                "request_id": waiting.request_id,
                "question": waiting.question,
            })),
        )
        .await;
        self.dispatch_available().await;
        Ok(json!({
            "ok": true,
            "run_id": run_id,
            "status": "queued",
            "resumed": true,
        }))
    }

    pub async fn list_waiting_runs(&self, limit: usize) -> Result<Vec<Value>> {
        let runs = self
            .store()
            .await
            .list_runs_by_status(RunStatus::WaitingForUser, limit.clamp(1, WAITING_SCAN_LIMIT))
            .await?;
        Ok(runs
            .iter()
            .map(|run| {
                let waiting = run.waiting_info();
                json!({
                    "run_id": run.run_id,
                    "profile_id": run.profile_id,
                    "queued_at": run.queued_at.to_rfc3339(),
                    "request_id": waiting.as_ref().map(|info| info.request_id.clone()),
                    "question": waiting.as_ref().and_then(|info| info.question.clone()),
                    "expires_at": waiting.as_ref().and_then(|info| info.expires_at.clone()),
                })
            })
            .collect())
    }

    /// Read-only SQL surface routed through the serialized queue.
    pub async fn execute_sql(
        &self,
        sql: &str,
        params: Vec<Value>,
        max_rows: Option<usize>,
    ) -> SqlResponse {
        let settings = self.settings().await;
        let cap = max_rows
            .unwrap_or(settings.db_queue_default_max_rows)
            .min(settings.db_queue_default_max_rows.max(1));
        self.queue()
            .await
            .execute(SqlRequest::read(sql, params).with_max_rows(cap))
            .await
    }

    pub async fn status(&self) -> Value {
        let settings = self.settings().await;
        let slots = self.task_slots().await;
        let counts = self.store().await.runtime_counts().await.unwrap_or_default();
        let heartbeat = self.store().await.heartbeat_state().await.ok().flatten();
        let running = self
            .inner
            .loop_handle
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        json!({
            "ok": true,
            "running": running,
            "settings": serde_json::to_value(&settings).unwrap_or(Value::Null),
            "slots": serde_json::to_value(&slots).unwrap_or(Value::Null),
            "run_counts": counts,
            "heartbeat": heartbeat,
            "queue_health": self.queue().await.health(),
        })
    }

    /// Queue-depth and run-age warnings against the configured thresholds.
    pub async fn metrics(&self) -> Value {
        let settings = self.settings().await;
        let counts = self.store().await.runtime_counts().await.unwrap_or_default();
        let queued = counts.get("queued").copied().unwrap_or(0);
        let mut warnings = Vec::new();
        if queued > settings.queue_warning_threshold as u64 {
            warnings.push(format!(
                "queued_backlog: {queued} > {}",
                settings.queue_warning_threshold
            ));
        }
        if let Ok(running) = self
            .store()
            .await
            .list_runs_by_status(RunStatus::Running, WAITING_SCAN_LIMIT)
            .await
        {
            let now = Utc::now();
            for run in running {
                if let Some(started) = run.started_at {
                    let age = (now - started).num_seconds().max(0) as u64;
                    if age > settings.running_age_warning_sec {
                        warnings.push(format!("long_running: {} age={age}s", run.run_id));
                    }
                }
            }
        }
        json!({"ok": true, "run_counts": counts, "warnings": warnings})
    }

    /// Human-readable one-line-per-schedule check-in summary.
    pub async fn check_in_summary(&self) -> Result<String> {
        let schedules = self.store().await.list_schedules().await?;
        if schedules.is_empty() {
            return Ok("No task schedules are defined.".to_string());
        }
        let mut lines = Vec::new();
        for schedule in schedules {
            let status = schedule.last_status.as_deref().unwrap_or("never_ran");
            let when = schedule
                .last_run_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "{} [{}] last_status={status} last_run_at={when}",
                schedule.schedule_id,
                if schedule.enabled { "enabled" } else { "disabled" },
            );
            if let Some(error) = &schedule.last_error {
                line.push_str(&format!(" last_error={}", truncate(error, 120)));
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the periodic driver loop; idempotent.
    pub async fn start(&self) -> bool {
        self.queue().await.start();
        let mut handle_guard = self.inner.loop_handle.lock().await;
        if handle_guard
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
        {
            return false;
        }
        let cancel = CancellationToken::new();
        *self.inner.loop_cancel.lock().await = Some(cancel.clone());
        let service = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                service.tick().await;
                let interval = service
                    .settings()
                    .await
                    .heartbeat_poll_interval_sec
                    .max(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                }
            }
        });
        *handle_guard = Some(handle);
        true
    }

    /// Stop the driver loop. In-flight runs are not preempted.
    pub async fn stop(&self) {
        if let Some(cancel) = self.inner.loop_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.inner.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}
