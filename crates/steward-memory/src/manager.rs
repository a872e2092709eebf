// Memory Manager
// Periodic and completion-triggered sweeps that coerce past days with
// unsummarized events into a finalized state.
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use steward_core::Result;

use crate::pipeline::MemoryPipeline;

#[derive(Debug, Clone, Copy)]
pub struct MemoryManagerSettings {
    pub sweep_interval: Duration,
    pub completion_debounce: Duration,
}

impl Default for MemoryManagerSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(12 * 60 * 60),
            completion_debounce: Duration::from_secs(5 * 60),
        }
    }
}

pub struct MemoryManager {
    pipeline: Arc<MemoryPipeline>,
    last_sweep: Mutex<Option<Instant>>,
    last_completion_sweep: Mutex<Option<Instant>>,
}

impl MemoryManager {
    pub fn new(pipeline: Arc<MemoryPipeline>) -> Self {
        Self {
            pipeline,
            last_sweep: Mutex::new(None),
            last_completion_sweep: Mutex::new(None),
        }
    }

    /// Finalize every day strictly before today that still carries
    /// unsummarized events, writing a minimal auto-finalize snapshot.
    pub async fn sweep_pending_previous_days(&self, session_id: &str) -> Result<Value> {
        let today = self.pipeline.daily().local_day();
        let pending = self
            .pipeline
            .index()
            .get_days_pending_summary(Some(&today))
            .await?;

        let mut finalized_days = Vec::new();
        for day_status in pending {
            let day = day_status.day.trim().to_string();
            if day.is_empty() {
                continue;
            }
            let text = format!(
                "- Auto-finalized pending day.\n\
                 - Pending unsummarized turns at finalize time: {}.\n\
                 - Finalized by central memory manager sweep.",
                day_status.messages_since_last_summary
            );
            self.pipeline
                .daily()
                .write_summary_snapshot(&day, &text, Some(session_id))
                .await?;
            self.pipeline
                .index()
                .mark_day_summarized(&day, day_status.messages_since_last_summary, true)
                .await?;
            finalized_days.push(day);
        }

        Ok(json!({
            "ok": true,
            "source": "memory_manager",
            "finalized_count": finalized_days.len(),
            "finalized_days": finalized_days,
        }))
    }

    /// Interval-gated sweep, driven by the central service loop.
    pub async fn maybe_periodic_sweep(&self, settings: MemoryManagerSettings) -> Result<Value> {
        let mut last = self.last_sweep.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < settings.sweep_interval {
                return Ok(json!({"ok": true, "skipped": true, "reason": "interval_not_elapsed"}));
            }
        }
        let out = self.sweep_pending_previous_days("central_service").await?;
        *last = Some(Instant::now());
        Ok(out)
    }

    /// Debounced sweep after run completions.
    pub async fn maybe_completion_sweep(&self, settings: MemoryManagerSettings) -> Result<Value> {
        let mut last_completion = self.last_completion_sweep.lock().await;
        if let Some(at) = *last_completion {
            if at.elapsed() < settings.completion_debounce {
                return Ok(json!({"ok": true, "skipped": true, "reason": "completion_debounce"}));
            }
        }
        let out = self.sweep_pending_previous_days("central_service").await?;
        let now = Instant::now();
        *last_completion = Some(now);
        *self.last_sweep.lock().await = Some(now);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use steward_core::ConfigStore;
    use steward_providers::LlmCaller;
    use steward_store::{ensure_schema, DailyMemoryStore, DbQueue, MemoryIndexStore};
    use steward_types::{LlmRequest, LlmResponse};

    struct OfflineLlm;

    #[async_trait]
    impl LlmCaller for OfflineLlm {
        async fn call(&self, _request: LlmRequest) -> LlmResponse {
            LlmResponse::failure("offline")
        }
    }

    async fn manager(dir: &tempfile::TempDir) -> (MemoryManager, Arc<MemoryPipeline>) {
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"timezone": "UTC"}"#).unwrap();
        let config = ConfigStore::new(dir.path(), config_path);
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        ensure_schema(&queue).await.unwrap();
        let daily = Arc::new(DailyMemoryStore::new(queue.clone(), Some("UTC".to_string())));
        let index = Arc::new(MemoryIndexStore::new(queue));
        let pipeline = Arc::new(MemoryPipeline::new(
            daily,
            index,
            Arc::new(OfflineLlm),
            config,
        ));
        (MemoryManager::new(pipeline.clone()), pipeline)
    }

    #[tokio::test]
    async fn sweep_finalizes_previous_days_only() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pipeline) = manager(&dir).await;
        let today = pipeline.daily().local_day();
        let yesterday = pipeline
            .daily()
            .day_for(chrono::Utc::now() - chrono::Duration::days(1));

        pipeline
            .index()
            .increment_day_message_count(&yesterday, 5)
            .await
            .unwrap();
        pipeline
            .index()
            .increment_day_message_count(&today, 2)
            .await
            .unwrap();

        let out = manager
            .sweep_pending_previous_days("central_service")
            .await
            .unwrap();
        assert_eq!(out["finalized_count"], 1);
        assert_eq!(out["finalized_days"][0], yesterday);

        let status = pipeline
            .index()
            .get_day_status(&yesterday)
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_finalized);
        assert_eq!(status.messages_since_last_summary, 0);

        // Today stays pending for the realtime pipeline.
        let pending = pipeline
            .index()
            .get_days_pending_summary(None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].day, today);

        let snapshot = pipeline
            .daily()
            .get_summary_snapshot(&yesterday)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.contains("Auto-finalized pending day"));
        assert!(snapshot.contains("turns at finalize time: 5"));
    }

    #[tokio::test]
    async fn periodic_sweep_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pipeline) = manager(&dir).await;
        let yesterday = pipeline
            .daily()
            .day_for(chrono::Utc::now() - chrono::Duration::days(1));
        pipeline
            .index()
            .increment_day_message_count(&yesterday, 1)
            .await
            .unwrap();

        let settings = MemoryManagerSettings {
            sweep_interval: Duration::from_secs(3600),
            completion_debounce: Duration::from_secs(3600),
        };
        let first = manager.maybe_periodic_sweep(settings).await.unwrap();
        assert_eq!(first["finalized_count"], 1);

        let second = manager.maybe_periodic_sweep(settings).await.unwrap();
        assert_eq!(second["skipped"], true);

        let completion = manager.maybe_completion_sweep(settings).await.unwrap();
        assert_eq!(completion["finalized_count"], 0);
        let debounced = manager.maybe_completion_sweep(settings).await.unwrap();
        assert_eq!(debounced["skipped"], true);
    }
}
