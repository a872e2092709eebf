// Scheduler Store
// Schema-backed CRUD for task profiles, schedules, the run queue, run
// history, per-task state, and seen-item dedup. Every statement goes
// through the serialized DB queue.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use steward_core::{Result, StewardError};
use steward_types::{
    MisfirePolicy, QueuedRunRef, RunRecord, RunStatus, RunTimeSpec, ScheduleMode, ScheduleRecord,
    TaskKind, TaskProfile, WaitingInfo,
};

use crate::calendar::{
    most_recent_calendar_fire, next_calendar_fire_for_specs, next_fire_after_cursor,
    CALENDAR_CATCHUP_MINUTES,
};
use crate::queue::{DbQueue, SqlRequest};

/// Safety cap on cursor advances per schedule per planning pass.
const MAX_FIRES_PER_TICK: usize = 512;
const RESUME_HISTORY_CAP: usize = 20;

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub already_terminal: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleSyncOutcome {
    pub upserted: usize,
    pub disabled: usize,
}

pub struct SchedulerStore {
    queue: Arc<DbQueue>,
}

fn iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339()
}

fn parse_iso(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn row_str(row: &Value, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn run_from_row(row: &Value) -> Result<RunRecord> {
    let status = row_str(row, "status")
        .as_deref()
        .and_then(RunStatus::parse)
        .ok_or_else(|| StewardError::Store("run row missing status".to_string()))?;
    let payload = row_str(row, "payload_json")
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .unwrap_or_else(|| json!({}));
    Ok(RunRecord {
        run_id: row_str(row, "run_id")
            .ok_or_else(|| StewardError::Store("run row missing run_id".to_string()))?,
        schedule_id: row_str(row, "schedule_id"),
        profile_id: row_str(row, "profile_id").unwrap_or_default(),
        status,
        planned_fire_at: parse_iso(row.get("planned_fire_at")),
        queued_at: parse_iso(row.get("queued_at")).unwrap_or_else(Utc::now),
        started_at: parse_iso(row.get("started_at")),
        finished_at: parse_iso(row.get("finished_at")),
        summary: row_str(row, "summary"),
        error: row_str(row, "error"),
        payload,
    })
}

fn profile_from_row(row: &Value) -> Result<TaskProfile> {
    let kind = row_str(row, "kind")
        .as_deref()
        .and_then(TaskKind::parse)
        .ok_or_else(|| StewardError::Store("profile row missing kind".to_string()))?;
    Ok(TaskProfile {
        task_id: row_str(row, "task_id")
            .ok_or_else(|| StewardError::Store("profile row missing task_id".to_string()))?,
        name: row_str(row, "name").unwrap_or_default(),
        kind,
        entrypoint_path: row_str(row, "entrypoint_path"),
        module: row_str(row, "module"),
        resources_path: row_str(row, "resources_path"),
        queue_group: row_str(row, "queue_group"),
        timeout_sec: row.get("timeout_sec").and_then(Value::as_u64),
        retry_policy: row_str(row, "retry_policy_json")
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        enabled: row.get("enabled").and_then(Value::as_i64).unwrap_or(1) != 0,
        source: row_str(row, "source").unwrap_or_else(|| "config".to_string()),
    })
}

impl SchedulerStore {
    pub fn new(queue: Arc<DbQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<DbQueue> {
        &self.queue
    }

    async fn write(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let response = self.queue.execute(SqlRequest::write(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Store(response.error.unwrap_or_default()));
        }
        Ok(response.rows_affected)
    }

    async fn write_rows(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let response = self.queue.execute(SqlRequest::write(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Store(response.error.unwrap_or_default()));
        }
        Ok(response.rows)
    }

    async fn read(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let response = self.queue.execute(SqlRequest::read(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Store(response.error.unwrap_or_default()));
        }
        Ok(response.rows)
    }

    // ── Task profiles ───────────────────────────────────────────────

    pub async fn upsert_task_profile(&self, profile: &TaskProfile) -> Result<()> {
        profile.validate().map_err(StewardError::Validation)?;
        let now = iso(Utc::now());
        self.write(
            "INSERT INTO task_profiles (
                task_id, name, kind, entrypoint_path, module, resources_path,
                queue_group, timeout_sec, retry_policy_json, enabled, source,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
            ON CONFLICT(task_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                entrypoint_path = excluded.entrypoint_path,
                module = excluded.module,
                resources_path = excluded.resources_path,
                queue_group = excluded.queue_group,
                timeout_sec = excluded.timeout_sec,
                retry_policy_json = excluded.retry_policy_json,
                enabled = excluded.enabled,
                source = excluded.source,
                updated_at = excluded.updated_at",
            vec![
                json!(profile.task_id),
                json!(profile.name),
                json!(profile.kind.as_str()),
                json!(profile.entrypoint_path),
                json!(profile.module),
                json!(profile.resources_path),
                json!(profile.queue_group),
                json!(profile.timeout_sec),
                profile
                    .retry_policy
                    .as_ref()
                    .map(|policy| json!(policy.to_string()))
                    .unwrap_or(Value::Null),
                json!(profile.enabled as i64),
                json!(profile.source),
                json!(now),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_task_profile(&self, task_id: &str) -> Result<Option<TaskProfile>> {
        let rows = self
            .read(
                "SELECT * FROM task_profiles WHERE task_id = ?1",
                vec![json!(task_id)],
            )
            .await?;
        rows.first().map(profile_from_row).transpose()
    }

    pub async fn list_task_profiles(&self) -> Result<Vec<TaskProfile>> {
        let rows = self
            .read("SELECT * FROM task_profiles ORDER BY task_id", vec![])
            .await?;
        rows.iter().map(profile_from_row).collect()
    }

    /// Deletion is forbidden while any schedule references the profile.
    pub async fn delete_task_profile(&self, task_id: &str) -> Result<()> {
        let referencing = self
            .read(
                "SELECT schedule_id FROM defined_tasks WHERE profile_id = ?1 LIMIT 1",
                vec![json!(task_id)],
            )
            .await?;
        if let Some(row) = referencing.first() {
            return Err(StewardError::InvalidOperation(format!(
                "profile `{task_id}` is referenced by schedule `{}`",
                row_str(row, "schedule_id").unwrap_or_default()
            )));
        }
        self.write(
            "DELETE FROM task_profiles WHERE task_id = ?1",
            vec![json!(task_id)],
        )
        .await?;
        Ok(())
    }

    // ── Schedules ───────────────────────────────────────────────────

    /// Upsert a schedule; run-time specs and the weekday set are replaced
    /// as a unit. Cursor fields on an existing row are preserved.
    pub async fn upsert_schedule(&self, schedule: &ScheduleRecord) -> Result<()> {
        self.upsert_schedule_with_source(schedule, "api").await
    }

    async fn upsert_schedule_with_source(
        &self,
        schedule: &ScheduleRecord,
        source: &str,
    ) -> Result<()> {
        schedule.validate().map_err(StewardError::Validation)?;
        let now = iso(Utc::now());
        self.write(
            "INSERT INTO defined_tasks (
                schedule_id, profile_id, enabled, mode, execution_order,
                misfire_policy, run_frequency_minutes, source, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(schedule_id) DO UPDATE SET
                profile_id = excluded.profile_id,
                enabled = excluded.enabled,
                mode = excluded.mode,
                execution_order = excluded.execution_order,
                misfire_policy = excluded.misfire_policy,
                run_frequency_minutes = excluded.run_frequency_minutes,
                source = excluded.source,
                updated_at = excluded.updated_at",
            vec![
                json!(schedule.schedule_id),
                json!(schedule.profile_id),
                json!(schedule.enabled as i64),
                json!(schedule.mode.as_str()),
                json!(schedule.execution_order),
                json!(schedule.misfire_policy.as_str()),
                json!(schedule.run_frequency_minutes),
                json!(source),
                json!(now),
            ],
        )
        .await?;

        self.write(
            "DELETE FROM defined_tasks_run_times WHERE schedule_id = ?1",
            vec![json!(schedule.schedule_id)],
        )
        .await?;
        for spec in &schedule.run_times {
            self.write(
                "INSERT INTO defined_tasks_run_times (
                    schedule_id, time_of_day, timezone, enabled, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                vec![
                    json!(schedule.schedule_id),
                    json!(spec.time_of_day),
                    json!(spec.timezone),
                    json!(spec.enabled as i64),
                    json!(now),
                ],
            )
            .await?;
        }

        self.write(
            "DELETE FROM defined_tasks_days_of_week WHERE schedule_id = ?1",
            vec![json!(schedule.schedule_id)],
        )
        .await?;
        for day in &schedule.days_of_week {
            self.write(
                "INSERT INTO defined_tasks_days_of_week (schedule_id, day_of_week, created_at)
                 VALUES (?1, ?2, ?3)",
                vec![json!(schedule.schedule_id), json!(day), json!(now)],
            )
            .await?;
        }
        Ok(())
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<()> {
        self.write(
            "DELETE FROM defined_tasks WHERE schedule_id = ?1",
            vec![json!(schedule_id)],
        )
        .await?;
        Ok(())
    }

    async fn load_run_times(&self, schedule_id: &str) -> Result<Vec<RunTimeSpec>> {
        let rows = self
            .read(
                "SELECT time_of_day, timezone, enabled FROM defined_tasks_run_times
                 WHERE schedule_id = ?1 ORDER BY time_of_day, timezone",
                vec![json!(schedule_id)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| RunTimeSpec {
                time_of_day: row_str(row, "time_of_day").unwrap_or_default(),
                timezone: row_str(row, "timezone").unwrap_or_default(),
                enabled: row.get("enabled").and_then(Value::as_i64).unwrap_or(1) != 0,
            })
            .collect())
    }

    async fn load_schedule_days(&self, schedule_id: &str) -> Result<Vec<String>> {
        let rows = self
            .read(
                "SELECT day_of_week FROM defined_tasks_days_of_week WHERE schedule_id = ?1",
                vec![json!(schedule_id)],
            )
            .await?;
        Ok(steward_types::normalize_weekdays(
            rows.iter().filter_map(|row| row_str(row, "day_of_week")),
        ))
    }

    async fn schedule_from_row(&self, row: &Value) -> Result<ScheduleRecord> {
        let schedule_id = row_str(row, "schedule_id")
            .ok_or_else(|| StewardError::Store("schedule row missing schedule_id".to_string()))?;
        let mode = row_str(row, "mode")
            .as_deref()
            .and_then(ScheduleMode::parse)
            .unwrap_or(ScheduleMode::Frequency);
        let run_times = if mode == ScheduleMode::Calendar {
            self.load_run_times(&schedule_id).await?
        } else {
            Vec::new()
        };
        let days_of_week = if mode == ScheduleMode::Calendar {
            self.load_schedule_days(&schedule_id).await?
        } else {
            Vec::new()
        };
        Ok(ScheduleRecord {
            schedule_id,
            profile_id: row_str(row, "profile_id").unwrap_or_default(),
            enabled: row.get("enabled").and_then(Value::as_i64).unwrap_or(0) != 0,
            mode,
            execution_order: row.get("execution_order").and_then(Value::as_i64).unwrap_or(100),
            misfire_policy: MisfirePolicy::parse_lossy(
                row_str(row, "misfire_policy").unwrap_or_default().as_str(),
            ),
            run_frequency_minutes: row.get("run_frequency_minutes").and_then(Value::as_i64),
            run_times,
            days_of_week,
            next_run_at: parse_iso(row.get("next_run_at")),
            last_planned_run_at: parse_iso(row.get("last_planned_run_at")),
            last_scheduled_fire_time: parse_iso(row.get("last_scheduled_fire_time")),
            last_run_at: parse_iso(row.get("last_run_at")),
            last_successful_run_at: parse_iso(row.get("last_successful_run_at")),
            last_status: row_str(row, "last_status"),
            last_summary: row_str(row, "last_summary"),
            last_error: row_str(row, "last_error"),
        })
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>> {
        let rows = self
            .read(
                "SELECT * FROM defined_tasks WHERE schedule_id = ?1",
                vec![json!(schedule_id)],
            )
            .await?;
        match rows.first() {
            Some(row) => Ok(Some(self.schedule_from_row(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let rows = self
            .read(
                "SELECT * FROM defined_tasks ORDER BY execution_order ASC, schedule_id ASC",
                vec![],
            )
            .await?;
        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            schedules.push(self.schedule_from_row(row).await?);
        }
        Ok(schedules)
    }

    /// Upsert config-declared schedules; config-sourced schedules missing
    /// from the declaration are disabled, never deleted.
    pub async fn sync_schedules(&self, declared: &[ScheduleRecord]) -> Result<ScheduleSyncOutcome> {
        let mut outcome = ScheduleSyncOutcome::default();
        for schedule in declared {
            self.upsert_schedule_with_source(schedule, "config").await?;
            outcome.upserted += 1;
        }
        let declared_ids: Vec<&str> = declared
            .iter()
            .map(|schedule| schedule.schedule_id.as_str())
            .collect();
        let rows = self
            .read(
                "SELECT schedule_id FROM defined_tasks WHERE source = 'config' AND enabled = 1",
                vec![],
            )
            .await?;
        for row in &rows {
            let schedule_id = row_str(row, "schedule_id").unwrap_or_default();
            if declared_ids.contains(&schedule_id.as_str()) {
                continue;
            }
            self.write(
                "UPDATE defined_tasks SET enabled = 0, updated_at = ?2 WHERE schedule_id = ?1",
                vec![json!(schedule_id), json!(iso(Utc::now()))],
            )
            .await?;
            outcome.disabled += 1;
        }
        Ok(outcome)
    }

    // ── Run planning ────────────────────────────────────────────────

    async fn has_active_profile_run(&self, profile_id: &str) -> Result<bool> {
        let rows = self
            .read(
                "SELECT 1 AS present FROM defined_task_runs
                 WHERE profile_id = ?1 AND status IN ('queued', 'running', 'waiting_for_user')
                 LIMIT 1",
                vec![json!(profile_id)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Materialize queued runs for every enabled schedule whose cursor is
    /// due, honoring misfire policies and the unique
    /// (schedule_id, planned_fire_at) constraint.
    pub async fn enqueue_due_runs(&self, now: DateTime<Utc>) -> Result<Vec<QueuedRunRef>> {
        let now_iso = iso(now);
        let mut queued: Vec<QueuedRunRef> = Vec::new();

        let rows = self
            .read(
                "SELECT schedule_id, profile_id, mode, execution_order, misfire_policy,
                        run_frequency_minutes, next_run_at, last_planned_run_at,
                        last_scheduled_fire_time
                 FROM defined_tasks
                 WHERE enabled = 1
                 ORDER BY execution_order ASC, schedule_id ASC",
                vec![],
            )
            .await?;

        for row in &rows {
            let schedule_id = row_str(row, "schedule_id").unwrap_or_default();
            let profile_id = row_str(row, "profile_id").unwrap_or_default();
            let mode = row_str(row, "mode")
                .as_deref()
                .and_then(ScheduleMode::parse)
                .unwrap_or(ScheduleMode::Frequency);
            let policy = MisfirePolicy::parse_lossy(
                row_str(row, "misfire_policy").unwrap_or_default().as_str(),
            );
            let execution_order = row.get("execution_order").and_then(Value::as_i64).unwrap_or(100);
            let freq_minutes = row.get("run_frequency_minutes").and_then(Value::as_i64);
            let run_times: Vec<RunTimeSpec> = if mode == ScheduleMode::Calendar {
                self.load_run_times(&schedule_id)
                    .await?
                    .into_iter()
                    .filter(|spec| spec.enabled)
                    .collect()
            } else {
                Vec::new()
            };
            let schedule_days = if mode == ScheduleMode::Calendar {
                self.load_schedule_days(&schedule_id).await?
            } else {
                Vec::new()
            };

            let mut cursor = parse_iso(row.get("next_run_at"));
            if cursor.is_none() {
                let anchor = parse_iso(row.get("last_planned_run_at"))
                    .or_else(|| parse_iso(row.get("last_scheduled_fire_time")));
                cursor = match (anchor, mode) {
                    (Some(anchor), _) => next_fire_after_cursor(
                        mode,
                        anchor,
                        freq_minutes,
                        &run_times,
                        &schedule_days,
                    ),
                    (None, ScheduleMode::Frequency) => Some(now),
                    (None, ScheduleMode::Calendar) => {
                        // Without an anchor, catch up the nearest recent
                        // fire inside the window; otherwise wait for the
                        // next upcoming one.
                        let recent = run_times
                            .iter()
                            .filter_map(|spec| {
                                most_recent_calendar_fire(
                                    now,
                                    &spec.timezone,
                                    &spec.time_of_day,
                                    &schedule_days,
                                )
                            })
                            .max();
                        match recent {
                            Some(fire)
                                if now <= fire + Duration::minutes(CALENDAR_CATCHUP_MINUTES) =>
                            {
                                Some(fire)
                            }
                            _ => next_calendar_fire_for_specs(&run_times, &schedule_days, now),
                        }
                    }
                };
                if let Some(anchored) = cursor {
                    self.write(
                        "UPDATE defined_tasks SET next_run_at = ?2, updated_at = ?3
                         WHERE schedule_id = ?1",
                        vec![json!(schedule_id), json!(iso(anchored)), json!(now_iso)],
                    )
                    .await?;
                }
            }

            let Some(first_fire) = cursor else { continue };
            if mode == ScheduleMode::Frequency && freq_minutes.filter(|m| *m > 0).is_none() {
                continue;
            }
            if mode == ScheduleMode::Calendar && run_times.is_empty() {
                continue;
            }
            if first_fire > now {
                continue;
            }
            if self.has_active_profile_run(&profile_id).await? {
                continue;
            }

            // Collect every missed fire at or before now.
            let mut due_fires: Vec<DateTime<Utc>> = Vec::new();
            let mut walker = Some(first_fire);
            for _ in 0..MAX_FIRES_PER_TICK {
                let Some(fire) = walker else { break };
                if fire > now {
                    break;
                }
                due_fires.push(fire);
                walker = match next_fire_after_cursor(
                    mode,
                    fire,
                    freq_minutes,
                    &run_times,
                    &schedule_days,
                ) {
                    Some(next) if next > fire => Some(next),
                    _ => None,
                };
            }
            if due_fires.is_empty() {
                continue;
            }

            let selected: Vec<DateTime<Utc>> = match policy {
                MisfirePolicy::QueueAll => due_fires.clone(),
                MisfirePolicy::QueueLatest => vec![*due_fires.last().expect("non-empty")],
                MisfirePolicy::Skip => Vec::new(),
            };

            for fire in &selected {
                let fire_iso = iso(*fire);
                let run_id = format!("trun_{}", Uuid::new_v4().simple());
                let payload = json!({
                    "schedule_id": schedule_id,
                    "profile_id": profile_id,
                    "trigger": "scheduled",
                    "origin": "scheduled",
                    "enqueued_at": now_iso,
                    "mode": mode.as_str(),
                    "scheduled_fire_time": fire_iso,
                });
                let inserted = self
                    .write(
                        "INSERT OR IGNORE INTO defined_task_runs (
                            run_id, schedule_id, profile_id, status, planned_fire_at,
                            queued_at, payload_json
                        ) VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6)",
                        vec![
                            json!(run_id),
                            json!(schedule_id),
                            json!(profile_id),
                            json!(fire_iso),
                            json!(now_iso),
                            json!(payload.to_string()),
                        ],
                    )
                    .await?;
                if inserted > 0 {
                    queued.push(QueuedRunRef {
                        run_id,
                        schedule_id: schedule_id.clone(),
                        profile_id: profile_id.clone(),
                        execution_order,
                        planned_fire_at: *fire,
                    });
                }
            }

            let last_processed = *due_fires.last().expect("non-empty");
            let next_cursor = walker.unwrap_or(last_processed);
            self.write(
                "UPDATE defined_tasks SET
                    next_run_at = ?2,
                    last_planned_run_at = ?3,
                    last_scheduled_fire_time = ?3,
                    updated_at = ?4
                 WHERE schedule_id = ?1",
                vec![
                    json!(schedule_id),
                    json!(iso(next_cursor)),
                    json!(iso(last_processed)),
                    json!(now_iso),
                ],
            )
            .await?;
        }

        queued.sort_by(|a, b| {
            (a.execution_order, a.schedule_id.as_str())
                .cmp(&(b.execution_order, b.schedule_id.as_str()))
        });
        Ok(queued)
    }

    // ── Run queue ───────────────────────────────────────────────────

    /// Manual trigger for a profile; skipped while the profile has an
    /// active run.
    pub async fn enqueue_manual_run(
        &self,
        profile_id: &str,
        description: Option<&str>,
        payload_overrides: Option<Value>,
    ) -> Result<RunRecord> {
        let profile_id = profile_id.trim();
        if profile_id.is_empty() {
            return Err(StewardError::Validation("profile_id is required".to_string()));
        }
        if self.has_active_profile_run(profile_id).await? {
            return Err(StewardError::InvalidOperation(format!(
                "profile `{profile_id}` already has an active run"
            )));
        }
        let mut payload = json!({
            "profile_id": profile_id,
            "trigger": "manual",
            "origin": "manual",
            "enqueued_at": iso(Utc::now()),
        });
        if let Some(description) = description {
            payload["description"] = json!(description);
        }
        if let Some(Value::Object(overrides)) = payload_overrides {
            for (key, value) in overrides {
                payload[key] = value;
            }
        }
        self.insert_manual_run(profile_id, payload).await
    }

    /// Queue a one-off agentic run under the reserved `agentic_task`
    /// profile id.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_agentic_run(
        &self,
        instructions: &str,
        model_tier: &str,
        tool_access: &[String],
        skill_access: &[String],
        timeout_sec: Option<u64>,
        requested_by: &str,
        description: Option<&str>,
    ) -> Result<RunRecord> {
        if instructions.trim().is_empty() {
            return Err(StewardError::Validation("instructions are required".to_string()));
        }
        let payload = json!({
            "profile_id": "agentic_task",
            "trigger": "agentic",
            "origin": "manual",
            "enqueued_at": iso(Utc::now()),
            "instructions": instructions,
            "model_tier": model_tier,
            "tool_access": tool_access,
            "skill_access": skill_access,
            "timeout_sec": timeout_sec,
            "requested_by": requested_by,
            "description": description,
        });
        self.insert_manual_run("agentic_task", payload).await
    }

    async fn insert_manual_run(&self, profile_id: &str, payload: Value) -> Result<RunRecord> {
        let run_id = format!("trun_{}", Uuid::new_v4().simple());
        let now = iso(Utc::now());
        self.write(
            "INSERT INTO defined_task_runs (
                run_id, schedule_id, profile_id, status, planned_fire_at, queued_at, payload_json
            ) VALUES (?1, NULL, ?2, 'queued', NULL, ?3, ?4)",
            vec![
                json!(run_id),
                json!(profile_id),
                json!(now),
                json!(payload.to_string()),
            ],
        )
        .await?;
        self.get_run(&run_id)
            .await?
            .ok_or_else(|| StewardError::Store("manual run insert vanished".to_string()))
    }

    /// Atomically transition the oldest queued run to running and return
    /// its snapshot. FIFO by queued_at, ties broken by run_id.
    pub async fn claim_next_run(&self) -> Result<Option<RunRecord>> {
        let rows = self
            .write_rows(
                "UPDATE defined_task_runs
                 SET status = 'running', started_at = ?1
                 WHERE run_id = (
                     SELECT run_id FROM defined_task_runs
                     WHERE status = 'queued'
                     ORDER BY queued_at ASC, run_id ASC
                     LIMIT 1
                 )
                 RETURNING *",
                vec![json!(iso(Utc::now()))],
            )
            .await?;
        rows.first().map(run_from_row).transpose()
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let rows = self
            .read(
                "SELECT * FROM defined_task_runs WHERE run_id = ?1",
                vec![json!(run_id)],
            )
            .await?;
        rows.first().map(run_from_row).transpose()
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let safe_limit = limit.clamp(1, 500);
        let rows = self
            .read(
                "SELECT * FROM defined_task_runs ORDER BY queued_at DESC LIMIT ?1",
                vec![json!(safe_limit)],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn list_runs_by_status(&self, status: RunStatus, limit: usize) -> Result<Vec<RunRecord>> {
        let safe_limit = limit.clamp(1, 500);
        let rows = self
            .read(
                "SELECT * FROM defined_task_runs WHERE status = ?1
                 ORDER BY queued_at ASC LIMIT ?2",
                vec![json!(status.as_str()), json!(safe_limit)],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Write terminal state and archive into run history. Idempotent for
    /// runs that already reached a terminal status; the stored status is
    /// never regressed.
    pub async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<RunRecord> {
        if !status.is_terminal() {
            return Err(StewardError::Validation(format!(
                "`{}` is not a completion status",
                status.as_str()
            )));
        }
        let existing = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("run `{run_id}` not found")))?;
        if existing.status.is_terminal() {
            self.archive_run(run_id).await?;
            return Ok(existing);
        }

        let now = iso(Utc::now());
        self.write(
            "UPDATE defined_task_runs
             SET status = ?2, finished_at = ?3, summary = ?4, error = ?5
             WHERE run_id = ?1",
            vec![
                json!(run_id),
                json!(status.as_str()),
                json!(now),
                json!(summary),
                json!(error),
            ],
        )
        .await?;
        self.archive_run(run_id).await?;

        if let Some(schedule_id) = &existing.schedule_id {
            let successful_at = if status == RunStatus::Done {
                Some(now.clone())
            } else {
                None
            };
            self.write(
                "UPDATE defined_tasks SET
                    last_run_at = ?2,
                    last_successful_run_at = COALESCE(?3, last_successful_run_at),
                    last_status = ?4,
                    last_summary = ?5,
                    last_error = ?6,
                    updated_at = ?2
                 WHERE schedule_id = ?1",
                vec![
                    json!(schedule_id),
                    json!(now),
                    json!(successful_at),
                    json!(status.as_str()),
                    json!(summary),
                    json!(error),
                ],
            )
            .await?;
        }

        if self.get_task_profile(&existing.profile_id).await?.is_some() {
            self.write(
                "INSERT INTO task_profile_run_stats (
                    task_id, last_finished_at, last_status, last_run_id,
                    run_count_total, run_count_done, run_count_failed, run_count_blocked,
                    run_count_waiting
                ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, 0)
                ON CONFLICT(task_id) DO UPDATE SET
                    last_finished_at = excluded.last_finished_at,
                    last_status = excluded.last_status,
                    last_run_id = excluded.last_run_id,
                    run_count_total = task_profile_run_stats.run_count_total + 1,
                    run_count_done = task_profile_run_stats.run_count_done + excluded.run_count_done,
                    run_count_failed = task_profile_run_stats.run_count_failed + excluded.run_count_failed,
                    run_count_blocked = task_profile_run_stats.run_count_blocked + excluded.run_count_blocked",
                vec![
                    json!(existing.profile_id),
                    json!(now),
                    json!(status.as_str()),
                    json!(run_id),
                    json!((status == RunStatus::Done) as i64),
                    json!((status == RunStatus::Failed) as i64),
                    json!((status == RunStatus::Blocked) as i64),
                ],
            )
            .await?;
        }

        self.get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::Store("completed run vanished".to_string()))
    }

    async fn archive_run(&self, run_id: &str) -> Result<()> {
        self.write(
            "INSERT INTO defined_task_run_history (
                run_id, schedule_id, profile_id, status, planned_fire_at, queued_at,
                started_at, finished_at, summary, error, payload_json, archived_at
            )
            SELECT run_id, schedule_id, profile_id, status, planned_fire_at, queued_at,
                   started_at, finished_at, summary, error, payload_json, ?2
            FROM defined_task_runs
            WHERE run_id = ?1 AND status IN ('done', 'failed', 'blocked')
            ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                planned_fire_at = excluded.planned_fire_at,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                summary = excluded.summary,
                error = excluded.error,
                payload_json = excluded.payload_json,
                archived_at = excluded.archived_at",
            vec![json!(run_id), json!(iso(Utc::now()))],
        )
        .await?;
        Ok(())
    }

    pub async fn list_run_history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let safe_limit = limit.clamp(1, 500);
        let rows = self
            .read(
                "SELECT * FROM defined_task_run_history
                 ORDER BY COALESCE(finished_at, queued_at) DESC LIMIT ?1",
                vec![json!(safe_limit)],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    // ── Waiting-for-user ────────────────────────────────────────────

    pub async fn mark_waiting_for_user(
        &self,
        run_id: &str,
        question: Option<&str>,
        wait_context: Option<Value>,
        requested_by: &str,
        expires_at: Option<&str>,
    ) -> Result<WaitingInfo> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("run `{run_id}` not found")))?;
        let now = iso(Utc::now());
        let waiting = WaitingInfo {
            request_id: format!("wait_{}", &Uuid::new_v4().simple().to_string()[..10]),
            question: question.map(str::trim).filter(|q| !q.is_empty()).map(str::to_string),
            context: wait_context.unwrap_or_else(|| json!({})),
            requested_by: {
                let trimmed = requested_by.trim();
                if trimmed.is_empty() { "main_agent" } else { trimmed }.to_string()
            },
            waiting_since: now.clone(),
            expires_at: expires_at.map(str::trim).filter(|e| !e.is_empty()).map(str::to_string),
            state: "waiting_for_user".to_string(),
        };

        let mut payload = run.payload.clone();
        if !payload.is_object() {
            payload = json!({});
        }
        payload["waiting"] = serde_json::to_value(&waiting)?;
        self.write(
            "UPDATE defined_task_runs
             SET status = 'waiting_for_user', summary = ?2, error = NULL, payload_json = ?3
             WHERE run_id = ?1",
            vec![
                json!(run_id),
                json!(waiting.question),
                json!(payload.to_string()),
            ],
        )
        .await?;
        Ok(waiting)
    }

    /// Re-queue a waiting run with the user's response folded into its
    /// instructions. Resume history is bounded.
    pub async fn resume_waiting_run(
        &self,
        run_id: &str,
        user_response: &str,
        requested_by: &str,
    ) -> Result<WaitingInfo> {
        let response = user_response.trim();
        if response.is_empty() {
            return Err(StewardError::Validation("user_response is required".to_string()));
        }
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("run `{run_id}` not found")))?;
        if run.status != RunStatus::WaitingForUser {
            return Err(StewardError::InvalidOperation(
                "run is not waiting for user input".to_string(),
            ));
        }

        let now = iso(Utc::now());
        let requested_by = {
            let trimmed = requested_by.trim();
            if trimmed.is_empty() { "main_agent" } else { trimmed }.to_string()
        };
        let mut payload = run.payload.clone();
        if !payload.is_object() {
            payload = json!({});
        }
        let mut history = payload
            .get("resume_history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        history.push(json!({
            "response": response,
            "requested_by": requested_by,
            "at": now,
        }));
        let start = history.len().saturating_sub(RESUME_HISTORY_CAP);
        payload["resume_history"] = Value::Array(history.split_off(start));
        payload["resume_response"] = json!(response);
        if let Some(instructions) = payload.get("instructions").and_then(Value::as_str) {
            payload["instructions"] =
                json!(format!("{instructions}\n\n[User Response]\n{response}"));
        }

        let mut waiting: WaitingInfo = payload
            .get("waiting")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(WaitingInfo {
                request_id: String::new(),
                question: None,
                context: json!({}),
                requested_by: requested_by.clone(),
                waiting_since: now.clone(),
                expires_at: None,
                state: String::new(),
            });
        waiting.state = "resumed".to_string();
        payload["waiting"] = serde_json::to_value(&waiting)?;
        payload["waiting"]["resumed_at"] = json!(now);
        payload["waiting"]["resumed_by"] = json!(requested_by);

        self.write(
            "UPDATE defined_task_runs
             SET status = 'queued', queued_at = ?2, payload_json = ?3,
                 summary = NULL, error = NULL
             WHERE run_id = ?1",
            vec![json!(run_id), json!(now), json!(payload.to_string())],
        )
        .await?;
        Ok(waiting)
    }

    /// Cancel semantics: queued/waiting complete as blocked; running runs
    /// only signal — the actual stop belongs to the central service.
    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<CancelOutcome> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("run `{run_id}` not found")))?;
        match run.status {
            status if status.is_terminal() => Ok(CancelOutcome {
                run_id: run_id.to_string(),
                status,
                already_terminal: true,
                cancel_requested: false,
            }),
            RunStatus::Queued | RunStatus::WaitingForUser => {
                let completed = self
                    .complete_run(run_id, RunStatus::Blocked, None, Some(reason))
                    .await?;
                Ok(CancelOutcome {
                    run_id: run_id.to_string(),
                    status: completed.status,
                    already_terminal: false,
                    cancel_requested: false,
                })
            }
            RunStatus::Running => Ok(CancelOutcome {
                run_id: run_id.to_string(),
                status: RunStatus::Running,
                already_terminal: false,
                cancel_requested: true,
            }),
            other => Err(StewardError::InvalidOperation(format!(
                "unsupported run status `{}`",
                other.as_str()
            ))),
        }
    }

    /// Delete terminal rows past the age cutoff, then trim history to the
    /// row cap, newest first.
    pub async fn prune_runs(
        &self,
        max_age_days: Option<u32>,
        max_history_rows: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut deleted = 0u64;

        if let Some(age) = max_age_days {
            let cutoff = iso(now - Duration::days(age as i64));
            let rows = self
                .read(
                    "SELECT run_id FROM defined_task_run_history
                     WHERE COALESCE(finished_at, queued_at) < ?1",
                    vec![json!(cutoff)],
                )
                .await?;
            for row in &rows {
                let run_id = row_str(row, "run_id").unwrap_or_default();
                deleted += self
                    .write(
                        "DELETE FROM defined_task_run_history WHERE run_id = ?1",
                        vec![json!(run_id)],
                    )
                    .await?;
                deleted += self
                    .write(
                        "DELETE FROM defined_task_runs WHERE run_id = ?1",
                        vec![json!(run_id)],
                    )
                    .await?;
            }
        }

        if let Some(cap) = max_history_rows {
            let rows = self
                .read(
                    "SELECT run_id FROM defined_task_run_history
                     ORDER BY COALESCE(finished_at, queued_at) DESC",
                    vec![],
                )
                .await?;
            for row in rows.iter().skip(cap as usize) {
                let run_id = row_str(row, "run_id").unwrap_or_default();
                deleted += self
                    .write(
                        "DELETE FROM defined_task_run_history WHERE run_id = ?1",
                        vec![json!(run_id)],
                    )
                    .await?;
                deleted += self
                    .write(
                        "DELETE FROM defined_task_runs WHERE run_id = ?1",
                        vec![json!(run_id)],
                    )
                    .await?;
            }
        }

        Ok(deleted)
    }

    // ── Heartbeat state ─────────────────────────────────────────────

    pub async fn record_heartbeat_state(
        &self,
        started_at: &str,
        finished_at: &str,
        status: &str,
        enqueued_count: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.write(
            "INSERT INTO scheduler_runtime_state (
                id, last_heartbeat_started_at, last_heartbeat_finished_at,
                last_heartbeat_status, last_heartbeat_error,
                last_heartbeat_enqueued_count, updated_at
            ) VALUES ('central', ?1, ?2, ?3, ?4, ?5, ?2)
            ON CONFLICT(id) DO UPDATE SET
                last_heartbeat_started_at = excluded.last_heartbeat_started_at,
                last_heartbeat_finished_at = excluded.last_heartbeat_finished_at,
                last_heartbeat_status = excluded.last_heartbeat_status,
                last_heartbeat_error = excluded.last_heartbeat_error,
                last_heartbeat_enqueued_count = excluded.last_heartbeat_enqueued_count,
                updated_at = excluded.updated_at",
            vec![
                json!(started_at),
                json!(finished_at),
                json!(status),
                json!(error),
                json!(enqueued_count),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn heartbeat_state(&self) -> Result<Option<Value>> {
        let rows = self
            .read(
                "SELECT * FROM scheduler_runtime_state WHERE id = 'central'",
                vec![],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    // ── Runtime metrics ─────────────────────────────────────────────

    pub async fn runtime_counts(&self) -> Result<HashMap<String, u64>> {
        let rows = self
            .read(
                "SELECT status, COUNT(*) AS count FROM defined_task_runs GROUP BY status",
                vec![],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some((
                    row_str(row, "status")?,
                    row.get("count").and_then(Value::as_u64)?,
                ))
            })
            .collect())
    }

    // ── Task state KV ───────────────────────────────────────────────

    pub async fn upsert_task_state(
        &self,
        task_id: &str,
        state_key: &str,
        value: &Value,
        updated_by: Option<&str>,
    ) -> Result<()> {
        if task_id.trim().is_empty() || state_key.trim().is_empty() {
            return Err(StewardError::Validation(
                "task_id and state_key are required".to_string(),
            ));
        }
        self.write(
            "INSERT INTO task_state_kv (task_id, state_key, value_json, updated_at, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(task_id, state_key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by",
            vec![
                json!(task_id),
                json!(state_key),
                json!(value.to_string()),
                json!(iso(Utc::now())),
                json!(updated_by),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_task_state(&self, task_id: &str, state_key: &str) -> Result<Option<Value>> {
        let rows = self
            .read(
                "SELECT value_json FROM task_state_kv WHERE task_id = ?1 AND state_key = ?2",
                vec![json!(task_id), json!(state_key)],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row_str(row, "value_json"))
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    // ── Seen items ──────────────────────────────────────────────────

    /// Upsert one (task, provider, item) sighting; repeat sightings bump
    /// seen_count and last_seen_at.
    pub async fn mark_task_item_seen(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
        metadata: Option<&Value>,
    ) -> Result<()> {
        let now = iso(Utc::now());
        self.write(
            "INSERT INTO task_seen_items (
                task_id, provider, item_key, metadata_json, first_seen_at, last_seen_at, seen_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
            ON CONFLICT(task_id, provider, item_key) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                seen_count = task_seen_items.seen_count + 1,
                metadata_json = excluded.metadata_json",
            vec![
                json!(task_id),
                json!(provider),
                json!(item_key),
                json!(metadata.map(|m| m.to_string()).unwrap_or_else(|| "{}".to_string())),
                json!(now),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn has_task_item_seen(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
    ) -> Result<Option<Value>> {
        let rows = self
            .read(
                "SELECT * FROM task_seen_items
                 WHERE task_id = ?1 AND provider = ?2 AND item_key = ?3",
                vec![json!(task_id), json!(provider), json!(item_key)],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn store(dir: &tempfile::TempDir) -> SchedulerStore {
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        crate::schema::ensure_schema(&queue).await.unwrap();
        SchedulerStore::new(queue)
    }

    fn frequency_schedule(id: &str, minutes: i64, policy: MisfirePolicy) -> ScheduleRecord {
        ScheduleRecord {
            schedule_id: id.to_string(),
            profile_id: format!("profile_{id}"),
            enabled: true,
            mode: ScheduleMode::Frequency,
            execution_order: 100,
            misfire_policy: policy,
            run_frequency_minutes: Some(minutes),
            run_times: Vec::new(),
            days_of_week: Vec::new(),
            next_run_at: None,
            last_planned_run_at: None,
            last_scheduled_fire_time: None,
            last_run_at: None,
            last_successful_run_at: None,
            last_status: None,
            last_summary: None,
            last_error: None,
        }
    }

    fn calendar_schedule(id: &str, time_of_day: &str, days: Vec<&str>) -> ScheduleRecord {
        ScheduleRecord {
            schedule_id: id.to_string(),
            profile_id: format!("profile_{id}"),
            enabled: true,
            mode: ScheduleMode::Calendar,
            execution_order: 100,
            misfire_policy: MisfirePolicy::QueueLatest,
            run_frequency_minutes: None,
            run_times: vec![RunTimeSpec {
                time_of_day: time_of_day.to_string(),
                timezone: "UTC".to_string(),
                enabled: true,
            }],
            days_of_week: days.into_iter().map(str::to_string).collect(),
            next_run_at: None,
            last_planned_run_at: None,
            last_scheduled_fire_time: None,
            last_run_at: None,
            last_successful_run_at: None,
            last_status: None,
            last_summary: None,
            last_error: None,
        }
    }

    async fn set_cursor(store: &SchedulerStore, schedule_id: &str, cursor: DateTime<Utc>) {
        store
            .write(
                "UPDATE defined_tasks SET next_run_at = ?2 WHERE schedule_id = ?1",
                vec![json!(schedule_id), json!(iso(cursor))],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn frequency_queue_latest_enqueues_single_latest_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let schedule = frequency_schedule("sched_f", 10, MisfirePolicy::QueueLatest);
        store.upsert_schedule(&schedule).await.unwrap();
        set_cursor(
            &store,
            "sched_f",
            Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap(),
        )
        .await;

        let now = Utc.with_ymd_and_hms(2026, 2, 16, 0, 35, 0).unwrap();
        let queued = store.enqueue_due_runs(now).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].planned_fire_at,
            Utc.with_ymd_and_hms(2026, 2, 16, 0, 30, 0).unwrap()
        );

        let updated = store.get_schedule("sched_f").await.unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 16, 0, 40, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn frequency_queue_all_enqueues_every_missed_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let schedule = frequency_schedule("sched_all", 10, MisfirePolicy::QueueAll);
        store.upsert_schedule(&schedule).await.unwrap();
        set_cursor(
            &store,
            "sched_all",
            Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap(),
        )
        .await;

        let now = Utc.with_ymd_and_hms(2026, 2, 16, 0, 35, 0).unwrap();
        let queued = store.enqueue_due_runs(now).await.unwrap();
        // Fires at :00, :10, :20, :30.
        assert_eq!(queued.len(), 4);

        // Re-planning the same window produces nothing new: the unique
        // (schedule_id, planned_fire_at) index holds and the cursor moved.
        let queued_again = store.enqueue_due_runs(now).await.unwrap();
        assert!(queued_again.is_empty());
    }

    #[tokio::test]
    async fn skip_policy_advances_cursor_without_enqueueing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let schedule = frequency_schedule("sched_skip", 10, MisfirePolicy::Skip);
        store.upsert_schedule(&schedule).await.unwrap();
        set_cursor(
            &store,
            "sched_skip",
            Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap(),
        )
        .await;

        let now = Utc.with_ymd_and_hms(2026, 2, 16, 0, 35, 0).unwrap();
        let queued = store.enqueue_due_runs(now).await.unwrap();
        assert!(queued.is_empty());

        let updated = store.get_schedule("sched_skip").await.unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 16, 0, 40, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn calendar_weekday_filter_gates_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let schedule = calendar_schedule("sched_cal", "02:00", vec!["mon"]);
        store.upsert_schedule(&schedule).await.unwrap();

        // Friday 2026-02-20 02:05Z: nothing due.
        let friday = Utc.with_ymd_and_hms(2026, 2, 20, 2, 5, 0).unwrap();
        let queued = store.enqueue_due_runs(friday).await.unwrap();
        assert!(queued.is_empty());

        // Monday 2026-02-23 02:05Z: exactly one run.
        let monday = Utc.with_ymd_and_hms(2026, 2, 23, 2, 5, 0).unwrap();
        let queued = store.enqueue_due_runs(monday).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].planned_fire_at,
            Utc.with_ymd_and_hms(2026, 2, 23, 2, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn calendar_outside_catchup_window_waits_for_next_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let schedule = calendar_schedule("sched_late", "02:00", vec![]);
        store.upsert_schedule(&schedule).await.unwrap();

        // 02:00 fired more than 180 minutes ago; no catch-up.
        let late = Utc.with_ymd_and_hms(2026, 2, 16, 9, 0, 0).unwrap();
        let queued = store.enqueue_due_runs(late).await.unwrap();
        assert!(queued.is_empty());

        let updated = store.get_schedule("sched_late").await.unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 17, 2, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn active_run_skips_new_enqueue_for_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let schedule = frequency_schedule("sched_busy", 10, MisfirePolicy::QueueLatest);
        store.upsert_schedule(&schedule).await.unwrap();
        set_cursor(
            &store,
            "sched_busy",
            Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap(),
        )
        .await;

        let now = Utc.with_ymd_and_hms(2026, 2, 16, 0, 15, 0).unwrap();
        let first = store.enqueue_due_runs(now).await.unwrap();
        assert_eq!(first.len(), 1);

        let later = Utc.with_ymd_and_hms(2026, 2, 16, 0, 45, 0).unwrap();
        let second = store.enqueue_due_runs(later).await.unwrap();
        assert!(second.is_empty(), "queued run should block re-enqueue");
    }

    #[tokio::test]
    async fn claim_complete_round_trip_archives_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let run = store
            .enqueue_manual_run("profile_x", Some("manual test"), None)
            .await
            .unwrap();

        let claimed = store.claim_next_run().await.unwrap().unwrap();
        assert_eq!(claimed.run_id, run.run_id);
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(store.claim_next_run().await.unwrap().is_none());

        let completed = store
            .complete_run(&run.run_id, RunStatus::Done, Some("all good"), None)
            .await
            .unwrap();
        assert_eq!(completed.status, RunStatus::Done);

        let history = store.list_run_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, run.run_id);
        assert_eq!(history[0].status, RunStatus::Done);
        assert_eq!(history[0].summary.as_deref(), Some("all good"));
    }

    #[tokio::test]
    async fn claim_order_is_fifo_by_queued_at_then_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let first = store.enqueue_manual_run("profile_a", None, None).await.unwrap();
        let second = store.enqueue_manual_run("profile_b", None, None).await.unwrap();

        let claimed = store.claim_next_run().await.unwrap().unwrap();
        // Same queued_at second resolution is possible; ties break by run_id.
        if claimed.run_id != first.run_id {
            assert!(second.run_id < first.run_id);
        }
    }

    #[tokio::test]
    async fn complete_run_is_idempotent_and_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let run = store.enqueue_manual_run("profile_x", None, None).await.unwrap();
        store.claim_next_run().await.unwrap();
        store
            .complete_run(&run.run_id, RunStatus::Done, Some("first"), None)
            .await
            .unwrap();

        let replay = store
            .complete_run(&run.run_id, RunStatus::Failed, None, Some("late error"))
            .await
            .unwrap();
        assert_eq!(replay.status, RunStatus::Done);
        assert_eq!(replay.summary.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn waiting_then_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let run = store
            .enqueue_agentic_run(
                "pick an option",
                "medium",
                &[],
                &[],
                None,
                "main_agent",
                None,
            )
            .await
            .unwrap();
        store.claim_next_run().await.unwrap();

        let waiting = store
            .mark_waiting_for_user(&run.run_id, Some("Which option?"), None, "main_agent", None)
            .await
            .unwrap();
        assert!(waiting.request_id.starts_with("wait_"));

        let marked = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(marked.status, RunStatus::WaitingForUser);
        assert_eq!(
            marked.waiting_info().unwrap().question.as_deref(),
            Some("Which option?")
        );

        let resumed = store
            .resume_waiting_run(&run.run_id, "choose a", "main_agent")
            .await
            .unwrap();
        assert_eq!(resumed.state, "resumed");

        let requeued = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, RunStatus::Queued);
        assert_eq!(requeued.payload["resume_response"], "choose a");
        assert!(requeued.payload["instructions"]
            .as_str()
            .unwrap()
            .contains("[User Response]\nchoose a"));
    }

    #[tokio::test]
    async fn resume_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let run = store
            .enqueue_agentic_run("loop", "medium", &[], &[], None, "main_agent", None)
            .await
            .unwrap();

        for idx in 0..25 {
            store.claim_next_run().await.unwrap();
            store
                .mark_waiting_for_user(&run.run_id, Some("more?"), None, "main_agent", None)
                .await
                .unwrap();
            store
                .resume_waiting_run(&run.run_id, &format!("answer {idx}"), "main_agent")
                .await
                .unwrap();
        }

        let current = store.get_run(&run.run_id).await.unwrap().unwrap();
        let history = current.payload["resume_history"].as_array().unwrap();
        assert_eq!(history.len(), RESUME_HISTORY_CAP);
        assert_eq!(history.last().unwrap()["response"], "answer 24");
    }

    #[tokio::test]
    async fn cancel_semantics_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        let queued = store.enqueue_manual_run("profile_q", None, None).await.unwrap();
        let outcome = store.cancel_run(&queued.run_id, "killed_by_user").await.unwrap();
        assert_eq!(outcome.status, RunStatus::Blocked);
        assert!(!outcome.cancel_requested);

        let running = store.enqueue_manual_run("profile_r", None, None).await.unwrap();
        store.claim_next_run().await.unwrap();
        let outcome = store.cancel_run(&running.run_id, "killed_by_user").await.unwrap();
        assert!(outcome.cancel_requested);
        assert_eq!(outcome.status, RunStatus::Running);

        let outcome = store.cancel_run(&queued.run_id, "again").await.unwrap();
        assert!(outcome.already_terminal);
    }

    #[tokio::test]
    async fn prune_respects_age_and_row_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        for idx in 0..5 {
            let run = store
                .enqueue_manual_run(&format!("profile_{idx}"), None, None)
                .await
                .unwrap();
            store.claim_next_run().await.unwrap();
            store
                .complete_run(&run.run_id, RunStatus::Done, None, None)
                .await
                .unwrap();
        }

        let now = Utc::now();
        store.prune_runs(Some(30), Some(2), now).await.unwrap();
        let history = store.list_run_history(10).await.unwrap();
        assert_eq!(history.len(), 2);

        // Age-based prune with a cutoff in the future clears everything.
        store
            .prune_runs(Some(0), None, now + Duration::days(1))
            .await
            .unwrap();
        assert!(store.list_run_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seen_items_upsert_increments_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store
            .mark_task_item_seen("job_search", "indeed", "job-123", Some(&json!({"title": "x"})))
            .await
            .unwrap();
        store
            .mark_task_item_seen("job_search", "indeed", "job-123", None)
            .await
            .unwrap();

        let row = store
            .has_task_item_seen("job_search", "indeed", "job-123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["seen_count"], 2);
        assert!(store
            .has_task_item_seen("job_search", "indeed", "job-999")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn task_state_kv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store
            .upsert_task_state("job_search", "cursor", &json!({"page": 3}), Some("runner"))
            .await
            .unwrap();
        store
            .upsert_task_state("job_search", "cursor", &json!({"page": 4}), Some("runner"))
            .await
            .unwrap();

        let value = store.get_task_state("job_search", "cursor").await.unwrap().unwrap();
        assert_eq!(value["page"], 4);
        assert!(store.get_task_state("job_search", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn profile_delete_guard_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let profile = TaskProfile {
            task_id: "profile_sched_g".to_string(),
            name: "Guarded".to_string(),
            kind: TaskKind::Agentic,
            entrypoint_path: None,
            module: None,
            resources_path: None,
            queue_group: None,
            timeout_sec: None,
            retry_policy: None,
            enabled: true,
            source: "config".to_string(),
        };
        store.upsert_task_profile(&profile).await.unwrap();
        let schedule = frequency_schedule("sched_g", 10, MisfirePolicy::QueueLatest);
        store.upsert_schedule(&schedule).await.unwrap();

        assert!(store.delete_task_profile("profile_sched_g").await.is_err());
        store.delete_schedule("sched_g").await.unwrap();
        store.delete_task_profile("profile_sched_g").await.unwrap();
    }
}
