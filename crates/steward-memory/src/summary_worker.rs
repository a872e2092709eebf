// Memory Summary Worker
// Single background drainer for pending summary jobs. Waits on a kickable
// signal with a configured poll interval.
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use steward_core::ConfigStore;

use crate::pipeline::MemoryPipeline;

#[derive(Debug, Clone, Copy)]
pub struct SummaryWorkerSettings {
    pub poll_interval: Duration,
    pub max_jobs_per_tick: usize,
}

impl Default for SummaryWorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_jobs_per_tick: 1,
        }
    }
}

/// Owns one daemon task that drains summary jobs until stopped.
pub struct MemorySummaryWorker {
    pipeline: Arc<MemoryPipeline>,
    config: ConfigStore,
    wake: Arc<Notify>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_result: Arc<Mutex<Option<Value>>>,
}

impl MemorySummaryWorker {
    pub fn new(pipeline: Arc<MemoryPipeline>, config: ConfigStore) -> Self {
        Self {
            pipeline,
            config,
            wake: Arc::new(Notify::new()),
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    async fn settings(&self) -> SummaryWorkerSettings {
        let config = self.config.get().await;
        SummaryWorkerSettings {
            poll_interval: Duration::from_secs(config.memory.summary_worker_poll_sec.max(1)),
            max_jobs_per_tick: config.memory.summary_worker_max_jobs_per_tick.max(1),
        }
    }

    /// Start the drain loop; idempotent.
    pub async fn start(&self) -> bool {
        let mut handle_guard = self.handle.lock().await;
        if handle_guard
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
        {
            return false;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let pipeline = self.pipeline.clone();
        let config = self.config.clone();
        let wake = self.wake.clone();
        let last_result = self.last_result.clone();
        let handle = tokio::spawn(async move {
            loop {
                let poll = {
                    let snapshot = config.get().await;
                    Duration::from_secs(snapshot.memory.summary_worker_poll_sec.max(1))
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                let max_jobs = config
                    .get()
                    .await
                    .memory
                    .summary_worker_max_jobs_per_tick
                    .max(1);
                let processed = pipeline
                    .process_pending_jobs(max_jobs, "memory_summary_worker")
                    .await;
                if processed.processed > 0 {
                    tracing::debug!(
                        completed = processed.completed,
                        failed = processed.failed,
                        "summary worker drained jobs"
                    );
                }
                *last_result.lock().await =
                    Some(serde_json::to_value(&processed).unwrap_or(Value::Null));
            }
        });
        *handle_guard = Some(handle);
        true
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        self.wake.notify_waiters();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Wake the loop ahead of its poll interval.
    pub fn kick(&self) {
        self.wake.notify_waiters();
    }

    /// Inline drain for callers that cannot wait on the daemon.
    pub async fn drain_now(&self) -> Value {
        let settings = self.settings().await;
        let processed = self
            .pipeline
            .process_pending_jobs(settings.max_jobs_per_tick, "memory_summary_worker")
            .await;
        let value = serde_json::to_value(&processed).unwrap_or(Value::Null);
        *self.last_result.lock().await = Some(value.clone());
        value
    }

    pub async fn status(&self) -> Value {
        let running = self
            .handle
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        let settings = self.settings().await;
        json!({
            "ok": true,
            "running": running,
            "settings": {
                "poll_interval_sec": settings.poll_interval.as_secs(),
                "max_jobs_per_tick": settings.max_jobs_per_tick,
            },
            "last_result": self.last_result.lock().await.clone(),
        })
    }
}
