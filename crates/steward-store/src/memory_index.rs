// Memory Index
// Durable per-day counters plus the pending summary job queue.
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use steward_core::{Result, StewardError};

use crate::queue::{DbQueue, SqlRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayMemoryStatus {
    pub day: String,
    pub messages_since_last_summary: u64,
    pub summaries_count: u64,
    pub is_finalized: bool,
    pub last_summary_at: Option<String>,
    pub last_event_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryJob {
    pub job_id: i64,
    pub day: String,
    pub reason: String,
    pub status: String,
    pub claimed_at: Option<String>,
    pub error: Option<String>,
}

pub struct MemoryIndexStore {
    queue: Arc<DbQueue>,
}

fn status_from_row(row: &Value) -> DayMemoryStatus {
    DayMemoryStatus {
        day: row["day"].as_str().unwrap_or_default().to_string(),
        messages_since_last_summary: row["messages_since_last_summary"].as_u64().unwrap_or(0),
        summaries_count: row["summaries_count"].as_u64().unwrap_or(0),
        is_finalized: row["is_finalized"].as_i64().unwrap_or(0) != 0,
        last_summary_at: row["last_summary_at"].as_str().map(str::to_string),
        last_event_at: row["last_event_at"].as_str().map(str::to_string),
    }
}

fn job_from_row(row: &Value) -> SummaryJob {
    SummaryJob {
        job_id: row["job_id"].as_i64().unwrap_or(0),
        day: row["day"].as_str().unwrap_or_default().to_string(),
        reason: row["reason"].as_str().unwrap_or_default().to_string(),
        status: row["status"].as_str().unwrap_or_default().to_string(),
        claimed_at: row["claimed_at"].as_str().map(str::to_string),
        error: row["error"].as_str().map(str::to_string),
    }
}

impl MemoryIndexStore {
    pub fn new(queue: Arc<DbQueue>) -> Self {
        Self { queue }
    }

    async fn write(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let response = self.queue.execute(SqlRequest::write(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Memory(response.error.unwrap_or_default()));
        }
        Ok(response.rows_affected)
    }

    async fn write_rows(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let response = self.queue.execute(SqlRequest::write(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Memory(response.error.unwrap_or_default()));
        }
        Ok(response.rows)
    }

    async fn read(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let response = self.queue.execute(SqlRequest::read(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Memory(response.error.unwrap_or_default()));
        }
        Ok(response.rows)
    }

    /// Bump the unsummarized-message counter for a day; new raw activity
    /// clears the finalized flag.
    pub async fn increment_day_message_count(
        &self,
        day: &str,
        amount: u64,
    ) -> Result<DayMemoryStatus> {
        if amount == 0 {
            return Err(StewardError::Validation("amount must be > 0".to_string()));
        }
        let now = Utc::now().to_rfc3339();
        self.write(
            "INSERT INTO day_memory_status (
                day, messages_since_last_summary, summaries_count, is_finalized,
                last_summary_at, last_event_at
            ) VALUES (?1, ?2, 0, 0, NULL, ?3)
            ON CONFLICT(day) DO UPDATE SET
                messages_since_last_summary =
                    day_memory_status.messages_since_last_summary + excluded.messages_since_last_summary,
                is_finalized = 0,
                last_event_at = excluded.last_event_at",
            vec![json!(day), json!(amount), json!(now)],
        )
        .await?;
        self.get_day_status(day)
            .await?
            .ok_or_else(|| StewardError::Memory("day status row vanished".to_string()))
    }

    /// Reset the counter, bump summaries_count, and optionally finalize.
    /// Finalization is monotonic.
    pub async fn mark_day_summarized(
        &self,
        day: &str,
        _summarized_messages: u64,
        finalize: bool,
    ) -> Result<DayMemoryStatus> {
        let now = Utc::now().to_rfc3339();
        self.write(
            "INSERT INTO day_memory_status (
                day, messages_since_last_summary, summaries_count, is_finalized,
                last_summary_at, last_event_at
            ) VALUES (?1, 0, 1, ?2, ?3, ?3)
            ON CONFLICT(day) DO UPDATE SET
                messages_since_last_summary = 0,
                summaries_count = day_memory_status.summaries_count + 1,
                is_finalized = CASE WHEN ?2 = 1 THEN 1 ELSE day_memory_status.is_finalized END,
                last_summary_at = excluded.last_summary_at",
            vec![json!(day), json!(finalize as i64), json!(now)],
        )
        .await?;
        self.get_day_status(day)
            .await?
            .ok_or_else(|| StewardError::Memory("day status row vanished".to_string()))
    }

    pub async fn get_day_status(&self, day: &str) -> Result<Option<DayMemoryStatus>> {
        let rows = self
            .read(
                "SELECT * FROM day_memory_status WHERE day = ?1",
                vec![json!(day)],
            )
            .await?;
        Ok(rows.first().map(status_from_row))
    }

    /// Days whose unsummarized counter is positive, oldest first.
    pub async fn get_days_pending_summary(
        &self,
        before_day: Option<&str>,
    ) -> Result<Vec<DayMemoryStatus>> {
        let rows = match before_day {
            Some(before) => {
                self.read(
                    "SELECT * FROM day_memory_status
                     WHERE messages_since_last_summary > 0 AND day < ?1
                     ORDER BY day ASC",
                    vec![json!(before)],
                )
                .await?
            }
            None => {
                self.read(
                    "SELECT * FROM day_memory_status
                     WHERE messages_since_last_summary > 0
                     ORDER BY day ASC",
                    vec![],
                )
                .await?
            }
        };
        Ok(rows.iter().map(status_from_row).collect())
    }

    // ── Pending summary jobs ────────────────────────────────────────

    /// Queue a summary job for a day unless one is already pending.
    pub async fn enqueue_summary_job(&self, day: &str, reason: &str) -> Result<Option<SummaryJob>> {
        let pending = self
            .read(
                "SELECT job_id FROM pending_summary_jobs
                 WHERE day = ?1 AND status IN ('queued', 'running')
                 LIMIT 1",
                vec![json!(day)],
            )
            .await?;
        if !pending.is_empty() {
            return Ok(None);
        }
        let rows = self
            .write_rows(
                "INSERT INTO pending_summary_jobs (day, reason, status, created_at)
                 VALUES (?1, ?2, 'queued', ?3)
                 RETURNING *",
                vec![json!(day), json!(reason), json!(Utc::now().to_rfc3339())],
            )
            .await?;
        Ok(rows.first().map(job_from_row))
    }

    /// Atomically claim the oldest queued job.
    pub async fn claim_next_summary_job(&self) -> Result<Option<SummaryJob>> {
        let rows = self
            .write_rows(
                "UPDATE pending_summary_jobs
                 SET status = 'running', claimed_at = ?1
                 WHERE job_id = (
                     SELECT job_id FROM pending_summary_jobs
                     WHERE status = 'queued'
                     ORDER BY job_id ASC
                     LIMIT 1
                 )
                 RETURNING *",
                vec![json!(Utc::now().to_rfc3339())],
            )
            .await?;
        Ok(rows.first().map(job_from_row))
    }

    pub async fn complete_summary_job(
        &self,
        job_id: i64,
        ok: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.write(
            "UPDATE pending_summary_jobs SET status = ?2, error = ?3 WHERE job_id = ?1",
            vec![
                json!(job_id),
                json!(if ok { "done" } else { "failed" }),
                json!(error),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn pending_job_count(&self) -> Result<u64> {
        let rows = self
            .read(
                "SELECT COUNT(*) AS count FROM pending_summary_jobs WHERE status = 'queued'",
                vec![],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row["count"].as_u64())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index(dir: &tempfile::TempDir) -> MemoryIndexStore {
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        crate::schema::ensure_schema(&queue).await.unwrap();
        MemoryIndexStore::new(queue)
    }

    #[tokio::test]
    async fn counter_accumulates_and_resets_on_summary() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(&dir).await;

        for _ in 0..3 {
            index.increment_day_message_count("2026-02-16", 2).await.unwrap();
        }
        let status = index.get_day_status("2026-02-16").await.unwrap().unwrap();
        assert_eq!(status.messages_since_last_summary, 6);

        let status = index
            .mark_day_summarized("2026-02-16", 6, false)
            .await
            .unwrap();
        assert_eq!(status.messages_since_last_summary, 0);
        assert_eq!(status.summaries_count, 1);
        assert!(!status.is_finalized);
    }

    #[tokio::test]
    async fn finalize_is_monotonic_until_new_events() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(&dir).await;
        index.increment_day_message_count("2026-02-15", 1).await.unwrap();

        let status = index
            .mark_day_summarized("2026-02-15", 1, true)
            .await
            .unwrap();
        assert!(status.is_finalized);

        // A non-finalizing summary pass must not clear the flag.
        let status = index
            .mark_day_summarized("2026-02-15", 0, false)
            .await
            .unwrap();
        assert!(status.is_finalized);

        // New raw activity reopens the day.
        let status = index.increment_day_message_count("2026-02-15", 1).await.unwrap();
        assert!(!status.is_finalized);
    }

    #[tokio::test]
    async fn pending_days_filter_by_before_day() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(&dir).await;
        index.increment_day_message_count("2026-02-14", 3).await.unwrap();
        index.increment_day_message_count("2026-02-15", 5).await.unwrap();
        index.increment_day_message_count("2026-02-16", 1).await.unwrap();

        let pending = index
            .get_days_pending_summary(Some("2026-02-16"))
            .await
            .unwrap();
        let days: Vec<&str> = pending.iter().map(|status| status.day.as_str()).collect();
        assert_eq!(days, vec!["2026-02-14", "2026-02-15"]);

        index.mark_day_summarized("2026-02-14", 3, true).await.unwrap();
        let pending = index
            .get_days_pending_summary(Some("2026-02-16"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].day, "2026-02-15");
    }

    #[tokio::test]
    async fn job_claim_is_exclusive_and_completable() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(&dir).await;

        let job = index
            .enqueue_summary_job("2026-02-16", "turn_threshold")
            .await
            .unwrap()
            .unwrap();
        // A second enqueue for the same pending day is a no-op.
        assert!(index
            .enqueue_summary_job("2026-02-16", "turn_threshold")
            .await
            .unwrap()
            .is_none());

        let claimed = index.claim_next_summary_job().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job.job_id);
        assert_eq!(claimed.status, "running");
        assert!(claimed.claimed_at.is_some());
        assert!(index.claim_next_summary_job().await.unwrap().is_none());

        index.complete_summary_job(claimed.job_id, true, None).await.unwrap();
        assert_eq!(index.pending_job_count().await.unwrap(), 0);
    }
}
