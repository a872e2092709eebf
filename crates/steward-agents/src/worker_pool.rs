// Worker Manager
// Bounded pool of non-user-facing workers spawned by the chat loop.
// FIFO ready queue, per-worker scoped context, forwardable event stream.
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use steward_core::EventRecord;
use steward_types::{ModelTier, SubAgentStatus, TaskEnvelope, WorkerResult};

use crate::context_files::{
    load_context_files, WORKER_BASE_CONTEXT_FILES, WORKER_OPERATING_PROMPT,
};
use crate::sub_agent::{SubAgentOptions, SubAgentRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Queued => "queued",
            WorkerStatus::Running => "running",
            WorkerStatus::Done => "done",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Done | WorkerStatus::Failed | WorkerStatus::Cancelled
        )
    }
}

/// Scoped per-worker context memory, disposed on terminal transitions.
#[derive(Debug, Clone, Default)]
pub struct WorkerContextSession {
    pub base_context: BTreeMap<String, String>,
    pub supplemental_context: BTreeMap<String, String>,
    pub facts: BTreeMap<String, String>,
    pub session_summary: Option<String>,
}

#[derive(Debug)]
struct WorkerRecord {
    worker_id: String,
    title: String,
    status: WorkerStatus,
    current_task: Option<TaskEnvelope>,
    pending_tasks: VecDeque<TaskEnvelope>,
    context: WorkerContextSession,
    cancel_requested: bool,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
    result: Option<WorkerResult>,
    events: Vec<EventRecord>,
}

impl WorkerRecord {
    fn snapshot(&self) -> Value {
        json!({
            "worker_id": self.worker_id,
            "title": self.title,
            "status": self.status.as_str(),
            "current_task_id": self.current_task.as_ref().map(|task| task.task_id.clone()),
            "pending_task_count": self.pending_tasks.len(),
            "cancel_requested": self.cancel_requested,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "error": self.error,
            "event_count": self.events.len(),
            "session_summary_present": self.context.session_summary.is_some(),
            "fact_count": self.context.facts.len(),
        })
    }

    fn record_event(&mut self, event_type: &str, payload: Value) {
        let mut body = json!({
            "worker_id": self.worker_id,
            "worker_title": self.title,
        });
        if let (Some(target), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        // v1 policy: every worker event is forwardable.
        self.events.push(EventRecord::new(event_type, body, true));
    }

    fn dispose_context(&mut self) {
        self.context = WorkerContextSession::default();
    }
}

struct PoolState {
    workers: BTreeMap<String, WorkerRecord>,
    ready: VecDeque<String>,
    running: HashSet<String>,
}

/// Bounded worker pool. Dispatch runs whenever the pool changes; at all
/// times the number of running workers stays at or under the cap.
#[derive(Clone)]
pub struct WorkerManager {
    runner: Arc<SubAgentRunner>,
    root: PathBuf,
    max_concurrent: usize,
    state: Arc<Mutex<PoolState>>,
    idle: Arc<Notify>,
}

impl WorkerManager {
    pub fn new(runner: Arc<SubAgentRunner>, root: PathBuf, max_concurrent: usize) -> Self {
        Self {
            runner,
            root,
            max_concurrent: max_concurrent.max(1),
            state: Arc::new(Mutex::new(PoolState {
                workers: BTreeMap::new(),
                ready: VecDeque::new(),
                running: HashSet::new(),
            })),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn max_concurrent_workers(&self) -> usize {
        self.max_concurrent
    }

    /// Create a worker with one pending task and trigger dispatch.
    pub async fn spawn_worker(
        &self,
        title: &str,
        instructions: &str,
        model_tier: ModelTier,
        tool_access: Vec<String>,
        skill_access: Vec<String>,
        preload_files: Vec<String>,
        metadata: Option<Value>,
    ) -> Result<Value, String> {
        let title = title.trim();
        let instructions = instructions.trim();
        if title.is_empty() {
            return Err("title is required".to_string());
        }
        if instructions.is_empty() {
            return Err("instructions are required".to_string());
        }

        let mut task_metadata = metadata.unwrap_or_else(|| json!({}));
        if !task_metadata.is_object() {
            task_metadata = json!({});
        }
        task_metadata["preload_files"] = json!(preload_files);
        let task = TaskEnvelope::create(instructions, "main_agent")
            .with_tier(model_tier)
            .with_tool_access(tool_access)
            .with_skill_access(skill_access)
            .with_metadata(task_metadata);

        let worker_id = format!("worker_{}", &Uuid::new_v4().simple().to_string()[..10]);
        let base_context = load_context_files(&self.root, WORKER_BASE_CONTEXT_FILES);
        let supplemental = load_context_files(&self.root, preload_files.iter().map(String::as_str));

        let mut record = WorkerRecord {
            worker_id: worker_id.clone(),
            title: title.to_string(),
            status: WorkerStatus::Queued,
            current_task: None,
            pending_tasks: VecDeque::from([task.clone()]),
            context: WorkerContextSession {
                base_context,
                supplemental_context: supplemental,
                facts: BTreeMap::new(),
                session_summary: None,
            },
            cancel_requested: false,
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
            events: Vec::new(),
        };
        record.record_event(
            "worker_spawned",
            json!({"task_id": task.task_id, "title": title}),
        );

        let snapshot;
        let runtime;
        {
            let mut state = self.state.lock().await;
            state.workers.insert(worker_id.clone(), record);
            state.ready.push_back(worker_id.clone());
            self.dispatch_locked(&mut state);
            snapshot = state.workers[&worker_id].snapshot();
            runtime = self.runtime_snapshot_locked(&state);
        }
        Ok(json!({"ok": true, "worker": snapshot, "runtime": runtime}))
    }

    /// Append a follow-up task to a worker; terminal workers re-queue.
    pub async fn message_worker(
        &self,
        worker_id: &str,
        message: &str,
        model_tier: ModelTier,
    ) -> Result<Value, String> {
        let message = message.trim();
        if message.is_empty() {
            return Err("message is required".to_string());
        }
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| "worker not found".to_string())?;
        if worker.status == WorkerStatus::Cancelled {
            return Err("worker is cancelled".to_string());
        }
        let task = TaskEnvelope::create(message, "main_agent")
            .with_tier(model_tier)
            .with_metadata(json!({"worker_id": worker_id, "message": true}));
        worker.pending_tasks.push_back(task.clone());
        if matches!(worker.status, WorkerStatus::Done | WorkerStatus::Failed) {
            worker.status = WorkerStatus::Queued;
            worker.finished_at = None;
        }
        worker.record_event("worker_message_enqueued", json!({"task_id": task.task_id}));
        if !state.ready.contains(&worker_id.to_string()) {
            state.ready.push_back(worker_id.to_string());
        }
        self.dispatch_locked(&mut state);
        let snapshot = state.workers[worker_id].snapshot();
        Ok(json!({"ok": true, "worker": snapshot}))
    }

    /// Cooperative cancel: pending tasks clear immediately; an in-flight
    /// task finishes and its result is discarded.
    pub async fn cancel_worker(&self, worker_id: &str) -> Result<Value, String> {
        let mut state = self.state.lock().await;
        let is_running = state.running.contains(worker_id);
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| "worker not found".to_string())?;
        worker.cancel_requested = true;
        worker.pending_tasks.clear();
        if !is_running {
            worker.status = WorkerStatus::Cancelled;
            worker.finished_at = Some(Utc::now().to_rfc3339());
            worker.error = Some("cancel_requested".to_string());
            worker.dispose_context();
            worker.record_event("worker_cancelled", json!({}));
        } else {
            worker.record_event("worker_cancel_requested", json!({}));
        }
        state.ready.retain(|id| id != worker_id);
        self.dispatch_locked(&mut state);
        let snapshot = state.workers[worker_id].snapshot();
        Ok(json!({"ok": true, "worker": snapshot}))
    }

    /// Reload base files and clear supplemental/facts/summary. Not
    /// permitted while the worker is running.
    pub async fn reset_worker_context(&self, worker_id: &str) -> Result<Value, String> {
        let mut state = self.state.lock().await;
        if state.running.contains(worker_id) {
            return Err("cannot reset context while worker is running".to_string());
        }
        let base_context = load_context_files(&self.root, WORKER_BASE_CONTEXT_FILES);
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| "worker not found".to_string())?;
        worker.context = WorkerContextSession {
            base_context,
            supplemental_context: BTreeMap::new(),
            facts: BTreeMap::new(),
            session_summary: None,
        };
        worker.record_event("worker_context_reset", json!({}));
        let snapshot = worker.snapshot();
        Ok(json!({"ok": true, "worker": snapshot}))
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.workers.get(worker_id).map(WorkerRecord::snapshot)
    }

    pub async fn list_workers(&self) -> Value {
        let state = self.state.lock().await;
        let workers: Vec<Value> = state.workers.values().map(WorkerRecord::snapshot).collect();
        json!({
            "ok": true,
            "workers": workers,
            "runtime": self.runtime_snapshot_locked(&state),
        })
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Unforwarded forwardable events across all workers; with `consume`
    /// they are marked forwarded atomically.
    pub async fn list_forward_events(&self, consume: bool) -> Vec<EventRecord> {
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        for worker in state.workers.values_mut() {
            for event in worker.events.iter_mut() {
                if !event.forward_to_user || event.forwarded {
                    continue;
                }
                out.push(event.clone());
                if consume {
                    event.forwarded = true;
                }
            }
        }
        out
    }

    /// Block until no queued or running workers remain.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().await;
                if state.running.is_empty() && state.ready.is_empty() {
                    return true;
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.idle.notified()).await;
        }
    }

    fn runtime_snapshot_locked(&self, state: &PoolState) -> Value {
        json!({
            "max_concurrent_workers": self.max_concurrent,
            "running_count": state.running.len(),
            "queued_count": state.ready.len(),
            "total_workers": state.workers.len(),
        })
    }

    /// While capacity remains and the queue is non-empty, move the head
    /// worker to running and execute its next pending task.
    fn dispatch_locked(&self, state: &mut PoolState) {
        while state.running.len() < self.max_concurrent {
            let Some(worker_id) = state.ready.pop_front() else {
                break;
            };
            if state.running.contains(&worker_id) {
                continue;
            }
            let Some(worker) = state.workers.get_mut(&worker_id) else {
                continue;
            };
            if worker.cancel_requested && worker.pending_tasks.is_empty() {
                worker.status = WorkerStatus::Cancelled;
                worker.finished_at = Some(Utc::now().to_rfc3339());
                worker.dispose_context();
                continue;
            }
            let Some(task) = worker.pending_tasks.pop_front() else {
                if worker.status == WorkerStatus::Queued {
                    worker.status = WorkerStatus::Done;
                    worker.finished_at = Some(Utc::now().to_rfc3339());
                    worker.dispose_context();
                }
                continue;
            };

            worker.status = WorkerStatus::Running;
            worker.current_task = Some(task.clone());
            worker.error = None;
            if worker.started_at.is_none() {
                worker.started_at = Some(Utc::now().to_rfc3339());
            }
            worker.record_event("worker_started", json!({"task_id": task.task_id}));

            let mut base_context = worker.context.base_context.clone();
            base_context.insert(
                "runtime/WORKER_OPERATING.md".to_string(),
                WORKER_OPERATING_PROMPT.to_string(),
            );
            let options = SubAgentOptions {
                base_context,
                supplemental_context: worker.context.supplemental_context.clone(),
                facts: worker.context.facts.clone(),
                session_summary: worker.context.session_summary.clone(),
                model: None,
                budgets: None,
                allow_orchestration_tools: false,
                cancel: None,
            };

            state.running.insert(worker_id.clone());
            let manager = self.clone();
            let runner = self.runner.clone();
            tokio::spawn(async move {
                let run = runner.run_task(&task, options).await;
                manager.finish_task(&worker_id, run).await;
            });
        }

        if state.running.is_empty() && state.ready.is_empty() {
            self.idle.notify_waiters();
        }
    }

    async fn finish_task(&self, worker_id: &str, run: crate::sub_agent::SubAgentRun) {
        let mut state = self.state.lock().await;
        state.running.remove(worker_id);
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.current_task = None;
            if worker.cancel_requested {
                worker.status = WorkerStatus::Cancelled;
                worker.finished_at = Some(Utc::now().to_rfc3339());
                worker.error = Some("cancel_requested".to_string());
                worker.result = None;
                worker.pending_tasks.clear();
                worker.dispose_context();
                worker.record_event("worker_cancelled", json!({}));
            } else {
                worker.error = run.result.error.clone();
                worker.status = match run.result.status {
                    SubAgentStatus::Success | SubAgentStatus::NeedsUserInput => WorkerStatus::Done,
                    SubAgentStatus::Failed => WorkerStatus::Failed,
                };
                if let Some(summary) = run.session_summary {
                    worker.context.session_summary = Some(summary);
                }
                if !run.facts.is_empty() {
                    worker.context.facts = run.facts;
                }

                match run.result.status {
                    SubAgentStatus::NeedsUserInput => worker.record_event(
                        "worker_needs_user_input",
                        json!({"summary": run.result.summary}),
                    ),
                    SubAgentStatus::Failed => worker.record_event(
                        "worker_blocked",
                        json!({"error": worker.error.clone().unwrap_or_else(|| "worker_failed".to_string())}),
                    ),
                    SubAgentStatus::Success => worker
                        .record_event("worker_completed", json!({"summary": run.result.summary})),
                }
                worker.result = Some(run.result);

                if worker.pending_tasks.is_empty() {
                    worker.finished_at = Some(Utc::now().to_rfc3339());
                    worker.dispose_context();
                } else {
                    worker.status = WorkerStatus::Queued;
                    if !state.ready.contains(&worker_id.to_string()) {
                        state.ready.push_back(worker_id.to_string());
                    }
                }
            }
        }
        self.dispatch_locked(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use steward_core::ConfigStore;
    use steward_providers::LlmCaller;
    use steward_tools::ToolRegistry;
    use steward_types::{LlmRequest, LlmResponse};

    /// LLM stub that waits on a shared gate before replying, to hold
    /// workers in the running state.
    struct GatedLlm {
        gate: Arc<Notify>,
        hold: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmCaller for GatedLlm {
        async fn call(&self, _request: LlmRequest) -> LlmResponse {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            while self.hold.load(Ordering::SeqCst) == 1 {
                let _ = tokio::time::timeout(
                    Duration::from_millis(20),
                    self.gate.notified(),
                )
                .await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            LlmResponse {
                ok: true,
                provider: Some("gated".to_string()),
                model: None,
                text: Some("done".to_string()),
                tool_calls: None,
                finish_reason: Some("stop".to_string()),
                usage: None,
                error: None,
                attempts_used: 1,
                attempts_configured: 1,
                retryable_error: false,
                retry_backoff_schedule_sec: vec![],
            }
        }
    }

    fn config_store(dir: &tempfile::TempDir) -> ConfigStore {
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "default_model_alias": "medium",
                "models": {
                    "vendor/model": {
                        "provider": "echo",
                        "endpoint": "vendor/model",
                        "max_context_tokens": 40000,
                        "max_output_tokens": 2000,
                        "alias": "medium"
                    }
                }
            }"#,
        )
        .unwrap();
        ConfigStore::new(dir.path(), path)
    }

    fn manager_with_gate(
        dir: &tempfile::TempDir,
        max_concurrent: usize,
    ) -> (WorkerManager, Arc<Notify>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let gate = Arc::new(Notify::new());
        let hold = Arc::new(AtomicUsize::new(1));
        let peak = Arc::new(AtomicUsize::new(0));
        let llm = Arc::new(GatedLlm {
            gate: gate.clone(),
            hold: hold.clone(),
            concurrent: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        let runner = Arc::new(SubAgentRunner::new(
            llm,
            ToolRegistry::new(),
            config_store(dir),
        ));
        let manager = WorkerManager::new(runner, dir.path().to_path_buf(), max_concurrent);
        (manager, gate, hold, peak)
    }

    async fn spawn(manager: &WorkerManager, title: &str) -> Value {
        manager
            .spawn_worker(
                title,
                "do the side task",
                ModelTier::Medium,
                vec![],
                vec![],
                vec![],
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pool_bound_holds_at_steady_state() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, gate, hold, peak) = manager_with_gate(&dir, 3);

        for idx in 0..4 {
            spawn(&manager, &format!("worker {idx}")).await;
        }
        // Give the three dispatched workers time to enter the LLM call.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.running_count().await, 3);
        assert_eq!(manager.queued_count().await, 1);

        hold.store(0, Ordering::SeqCst);
        gate.notify_waiters();
        assert!(manager.wait_for_idle(Duration::from_secs(5)).await);
        assert!(peak.load(Ordering::SeqCst) <= 3);

        let listing = manager.list_workers().await;
        for worker in listing["workers"].as_array().unwrap() {
            assert_eq!(worker["status"], "done");
        }
    }

    #[tokio::test]
    async fn worker_events_forward_once() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, gate, hold, _) = manager_with_gate(&dir, 2);
        spawn(&manager, "emitter").await;
        hold.store(0, Ordering::SeqCst);
        gate.notify_waiters();
        assert!(manager.wait_for_idle(Duration::from_secs(5)).await);

        let events = manager.list_forward_events(true).await;
        let types: Vec<&str> = events.iter().map(|event| event.event_type.as_str()).collect();
        assert!(types.contains(&"worker_spawned"));
        assert!(types.contains(&"worker_started"));
        assert!(types.contains(&"worker_completed"));

        assert!(manager.list_forward_events(true).await.is_empty());
    }

    #[tokio::test]
    async fn cancel_queued_worker_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _gate, _hold, _) = manager_with_gate(&dir, 1);
        spawn(&manager, "busy").await;
        let second = spawn(&manager, "victim").await;
        let victim_id = second["worker"]["worker_id"].as_str().unwrap().to_string();

        let cancelled = manager.cancel_worker(&victim_id).await.unwrap();
        assert_eq!(cancelled["worker"]["status"], "cancelled");
        assert_eq!(cancelled["worker"]["pending_task_count"], 0);
    }

    #[tokio::test]
    async fn cancel_running_worker_discards_result() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, gate, hold, _) = manager_with_gate(&dir, 1);
        let spawned = spawn(&manager, "long task").await;
        let worker_id = spawned["worker"]["worker_id"].as_str().unwrap().to_string();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = manager.cancel_worker(&worker_id).await.unwrap();
        assert_eq!(response["worker"]["status"], "running");
        assert_eq!(response["worker"]["cancel_requested"], true);

        hold.store(0, Ordering::SeqCst);
        gate.notify_waiters();
        assert!(manager.wait_for_idle(Duration::from_secs(5)).await);

        let snapshot = manager.get_worker(&worker_id).await.unwrap();
        assert_eq!(snapshot["status"], "cancelled");
        assert_eq!(snapshot["error"], "cancel_requested");
    }

    #[tokio::test]
    async fn message_worker_requeues_terminal_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, gate, hold, _) = manager_with_gate(&dir, 1);
        let spawned = spawn(&manager, "chatty").await;
        let worker_id = spawned["worker"]["worker_id"].as_str().unwrap().to_string();
        hold.store(0, Ordering::SeqCst);
        gate.notify_waiters();
        assert!(manager.wait_for_idle(Duration::from_secs(5)).await);

        manager
            .message_worker(&worker_id, "one more thing", ModelTier::Medium)
            .await
            .unwrap();
        assert!(manager.wait_for_idle(Duration::from_secs(5)).await);
        let snapshot = manager.get_worker(&worker_id).await.unwrap();
        assert_eq!(snapshot["status"], "done");
    }

    #[tokio::test]
    async fn reset_context_refused_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, gate, hold, _) = manager_with_gate(&dir, 1);
        let spawned = spawn(&manager, "resettable").await;
        let worker_id = spawned["worker"]["worker_id"].as_str().unwrap().to_string();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.reset_worker_context(&worker_id).await.is_err());

        hold.store(0, Ordering::SeqCst);
        gate.notify_waiters();
        assert!(manager.wait_for_idle(Duration::from_secs(5)).await);
        let reset = manager.reset_worker_context(&worker_id).await.unwrap();
        assert_eq!(reset["worker"]["fact_count"], 0);
    }
}
