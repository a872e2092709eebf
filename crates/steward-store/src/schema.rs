// Core store schema. Migrations are idempotent: every statement is
// CREATE ... IF NOT EXISTS and safe to replay on startup.
use std::sync::Arc;

use steward_core::{Result, StewardError};

use crate::queue::{DbQueue, SqlRequest};

const SCHEMA_STATEMENTS: &[&str] = &[
    // Schedules
    "CREATE TABLE IF NOT EXISTS defined_tasks (
        schedule_id TEXT PRIMARY KEY,
        profile_id TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
        mode TEXT NOT NULL DEFAULT 'frequency' CHECK (mode IN ('frequency', 'calendar')),
        execution_order INTEGER NOT NULL DEFAULT 100 CHECK (execution_order >= 0),
        misfire_policy TEXT NOT NULL DEFAULT 'queue_latest'
            CHECK (misfire_policy IN ('queue_all', 'queue_latest', 'skip')),
        run_frequency_minutes INTEGER
            CHECK (run_frequency_minutes IS NULL OR run_frequency_minutes > 0),
        next_run_at TEXT,
        last_planned_run_at TEXT,
        last_scheduled_fire_time TEXT,
        last_run_at TEXT,
        last_successful_run_at TEXT,
        last_status TEXT,
        last_summary TEXT,
        last_error TEXT,
        source TEXT NOT NULL DEFAULT 'api',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS defined_tasks_run_times (
        run_time_id INTEGER PRIMARY KEY AUTOINCREMENT,
        schedule_id TEXT NOT NULL,
        time_of_day TEXT NOT NULL,
        timezone TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(schedule_id) REFERENCES defined_tasks(schedule_id) ON DELETE CASCADE,
        UNIQUE(schedule_id, time_of_day, timezone)
    )",
    "CREATE TABLE IF NOT EXISTS defined_tasks_days_of_week (
        schedule_id TEXT NOT NULL,
        day_of_week TEXT NOT NULL
            CHECK (day_of_week IN ('mon', 'tue', 'wed', 'thu', 'fri', 'sat', 'sun')),
        created_at TEXT NOT NULL,
        PRIMARY KEY(schedule_id, day_of_week),
        FOREIGN KEY(schedule_id) REFERENCES defined_tasks(schedule_id) ON DELETE CASCADE
    )",
    // Run queue + history
    "CREATE TABLE IF NOT EXISTS defined_task_runs (
        run_id TEXT PRIMARY KEY,
        schedule_id TEXT,
        profile_id TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('queued', 'running', 'waiting_for_user', 'done', 'failed', 'blocked')),
        planned_fire_at TEXT,
        queued_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        summary TEXT,
        error TEXT,
        payload_json TEXT NOT NULL,
        FOREIGN KEY(schedule_id) REFERENCES defined_tasks(schedule_id) ON DELETE SET NULL
    )",
    "CREATE TABLE IF NOT EXISTS defined_task_run_history (
        run_id TEXT PRIMARY KEY,
        schedule_id TEXT,
        profile_id TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('done', 'failed', 'blocked')),
        planned_fire_at TEXT,
        queued_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        summary TEXT,
        error TEXT,
        payload_json TEXT NOT NULL,
        archived_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_defined_tasks_enabled_order
        ON defined_tasks(enabled, execution_order, schedule_id)",
    "CREATE INDEX IF NOT EXISTS idx_defined_tasks_next_run_at
        ON defined_tasks(enabled, next_run_at)",
    "CREATE INDEX IF NOT EXISTS idx_defined_task_run_times_schedule_enabled
        ON defined_tasks_run_times(schedule_id, enabled, time_of_day)",
    "CREATE INDEX IF NOT EXISTS idx_defined_task_runs_status_queued_at
        ON defined_task_runs(status, queued_at)",
    "CREATE INDEX IF NOT EXISTS idx_defined_task_runs_profile_queued_at
        ON defined_task_runs(profile_id, queued_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_defined_task_runs_schedule_planned_fire
        ON defined_task_runs(schedule_id, planned_fire_at)
        WHERE schedule_id IS NOT NULL AND planned_fire_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_defined_task_run_history_status_finished_at
        ON defined_task_run_history(status, finished_at)",
    "CREATE INDEX IF NOT EXISTS idx_defined_task_run_history_profile_finished_at
        ON defined_task_run_history(profile_id, finished_at)",
    // Task profiles
    "CREATE TABLE IF NOT EXISTS task_profiles (
        task_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('script', 'agentic', 'interactive_wrapper')),
        entrypoint_path TEXT,
        module TEXT,
        resources_path TEXT,
        queue_group TEXT,
        timeout_sec INTEGER,
        retry_policy_json TEXT,
        enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
        source TEXT NOT NULL DEFAULT 'config',
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS task_profile_run_stats (
        task_id TEXT PRIMARY KEY,
        last_queued_at TEXT,
        last_started_at TEXT,
        last_finished_at TEXT,
        last_status TEXT,
        last_run_id TEXT,
        run_count_total INTEGER NOT NULL DEFAULT 0,
        run_count_done INTEGER NOT NULL DEFAULT 0,
        run_count_failed INTEGER NOT NULL DEFAULT 0,
        run_count_blocked INTEGER NOT NULL DEFAULT 0,
        run_count_waiting INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY(task_id) REFERENCES task_profiles(task_id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_profiles_kind_enabled
        ON task_profiles(kind, enabled)",
    // Runtime state (single heartbeat row)
    "CREATE TABLE IF NOT EXISTS scheduler_runtime_state (
        id TEXT PRIMARY KEY,
        last_heartbeat_started_at TEXT,
        last_heartbeat_finished_at TEXT,
        last_heartbeat_status TEXT,
        last_heartbeat_error TEXT,
        last_heartbeat_enqueued_count INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )",
    // Per-task durable state
    "CREATE TABLE IF NOT EXISTS task_state_kv (
        task_id TEXT NOT NULL,
        state_key TEXT NOT NULL,
        value_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        updated_by TEXT,
        PRIMARY KEY(task_id, state_key)
    )",
    "CREATE TABLE IF NOT EXISTS task_seen_items (
        task_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        item_key TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        seen_count INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY(task_id, provider, item_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_seen_items_task_provider_first_seen
        ON task_seen_items(task_id, provider, first_seen_at DESC)",
    // Daily memory
    "CREATE TABLE IF NOT EXISTS daily_memory_events (
        event_id INTEGER PRIMARY KEY AUTOINCREMENT,
        day TEXT NOT NULL,
        event_time TEXT NOT NULL,
        session_id TEXT,
        kind TEXT NOT NULL,
        text TEXT NOT NULL,
        layer TEXT NOT NULL DEFAULT 'raw' CHECK (layer IN ('raw', 'summary')),
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_daily_memory_events_day_time
        ON daily_memory_events(day, event_time, event_id)",
    "CREATE INDEX IF NOT EXISTS idx_daily_memory_events_kind_day
        ON daily_memory_events(kind, day)",
    "CREATE TABLE IF NOT EXISTS daily_memory_summaries (
        day TEXT PRIMARY KEY,
        updated_at TEXT NOT NULL,
        session_id TEXT,
        text TEXT NOT NULL
    )",
    // Memory index
    "CREATE TABLE IF NOT EXISTS day_memory_status (
        day TEXT PRIMARY KEY,
        messages_since_last_summary INTEGER NOT NULL DEFAULT 0,
        summaries_count INTEGER NOT NULL DEFAULT 0,
        is_finalized INTEGER NOT NULL DEFAULT 0,
        last_summary_at TEXT,
        last_event_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_day_memory_finalized
        ON day_memory_status(is_finalized)",
    "CREATE TABLE IF NOT EXISTS pending_summary_jobs (
        job_id INTEGER PRIMARY KEY AUTOINCREMENT,
        day TEXT NOT NULL,
        reason TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued'
            CHECK (status IN ('queued', 'running', 'done', 'failed')),
        claimed_at TEXT,
        error TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pending_summary_jobs_status
        ON pending_summary_jobs(status, job_id)",
];

/// Apply the full schema through the serialized queue.
pub async fn ensure_schema(queue: &Arc<DbQueue>) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        let response = queue.execute(SqlRequest::write(*statement, vec![])).await;
        if !response.ok {
            return Err(StewardError::Store(format!(
                "schema migration failed: {}",
                response.error.unwrap_or_default()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        ensure_schema(&queue).await.unwrap();
        ensure_schema(&queue).await.unwrap();

        let tables = queue
            .execute(SqlRequest::read(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                vec![],
            ))
            .await;
        let names: Vec<&str> = tables
            .rows
            .iter()
            .filter_map(|row| row["name"].as_str())
            .collect();
        for expected in [
            "defined_tasks",
            "defined_task_runs",
            "defined_task_run_history",
            "task_profiles",
            "task_state_kv",
            "task_seen_items",
            "daily_memory_events",
            "daily_memory_summaries",
            "day_memory_status",
            "pending_summary_jobs",
            "scheduler_runtime_state",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }
}
