// Heartbeat
// Plans due runs; never executes them. Each tick records its outcome in
// the single-row runtime-state table, including failures.
use std::sync::Arc;

use chrono::{DateTime, Utc};

use steward_core::Result;
use steward_store::SchedulerStore;
use steward_types::QueuedRunRef;

pub struct TaskHeartbeat {
    store: Arc<SchedulerStore>,
}

impl TaskHeartbeat {
    pub fn new(store: Arc<SchedulerStore>) -> Self {
        Self { store }
    }

    /// One planning pass. The tick outcome is persisted even when the
    /// enqueue fails, and the failure is propagated to the caller.
    pub async fn enqueue_due_runs(&self, now: DateTime<Utc>) -> Result<Vec<QueuedRunRef>> {
        let started_at = now.to_rfc3339();
        match self.store.enqueue_due_runs(now).await {
            Ok(runs) => {
                self.store
                    .record_heartbeat_state(
                        &started_at,
                        &Utc::now().to_rfc3339(),
                        "ok",
                        runs.len(),
                        None,
                    )
                    .await?;
                Ok(runs)
            }
            Err(err) => {
                let detail = err.to_string();
                let _ = self
                    .store
                    .record_heartbeat_state(
                        &started_at,
                        &Utc::now().to_rfc3339(),
                        "error",
                        0,
                        Some(&detail),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steward_store::{ensure_schema, DbQueue};
    use steward_types::{MisfirePolicy, ScheduleMode, ScheduleRecord};

    #[tokio::test]
    async fn tick_records_heartbeat_state() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        ensure_schema(&queue).await.unwrap();
        let store = Arc::new(SchedulerStore::new(queue));
        store
            .upsert_schedule(&ScheduleRecord {
                schedule_id: "hb".to_string(),
                profile_id: "profile_hb".to_string(),
                enabled: true,
                mode: ScheduleMode::Frequency,
                execution_order: 100,
                misfire_policy: MisfirePolicy::QueueLatest,
                run_frequency_minutes: Some(5),
                run_times: vec![],
                days_of_week: vec![],
                next_run_at: None,
                last_planned_run_at: None,
                last_scheduled_fire_time: None,
                last_run_at: None,
                last_successful_run_at: None,
                last_status: None,
                last_summary: None,
                last_error: None,
            })
            .await
            .unwrap();

        let heartbeat = TaskHeartbeat::new(store.clone());
        let runs = heartbeat.enqueue_due_runs(Utc::now()).await.unwrap();
        // First pass anchors the cursor to now; an anchored frequency
        // schedule fires immediately.
        assert_eq!(runs.len(), 1);

        let state = store.heartbeat_state().await.unwrap().unwrap();
        assert_eq!(state["last_heartbeat_status"], "ok");
        assert_eq!(state["last_heartbeat_enqueued_count"], 1);
        assert_eq!(state["last_heartbeat_error"], json!(null));
    }
}
