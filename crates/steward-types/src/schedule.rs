use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Script,
    Agentic,
    InteractiveWrapper,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Script => "script",
            TaskKind::Agentic => "agentic",
            TaskKind::InteractiveWrapper => "interactive_wrapper",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "script" => Some(TaskKind::Script),
            "agentic" => Some(TaskKind::Agentic),
            "interactive_wrapper" => Some(TaskKind::InteractiveWrapper),
            _ => None,
        }
    }
}

/// Definition of what a task is and how to execute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub task_id: String,
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub entrypoint_path: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub resources_path: Option<String>,
    #[serde(default)]
    pub queue_group: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_profile_source")]
    pub source: String,
}

fn default_true() -> bool {
    true
}

fn default_profile_source() -> String {
    "config".to_string()
}

impl TaskProfile {
    /// Script profiles must carry an entrypoint.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_id.trim().is_empty() {
            return Err("task_id must be non-empty".to_string());
        }
        if self.kind == TaskKind::Script
            && self
                .entrypoint_path
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(format!(
                "script profile `{}` requires entrypoint_path",
                self.task_id
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Frequency,
    Calendar,
}

impl ScheduleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleMode::Frequency => "frequency",
            ScheduleMode::Calendar => "calendar",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "frequency" | "interval" => Some(ScheduleMode::Frequency),
            "calendar" => Some(ScheduleMode::Calendar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    QueueAll,
    #[default]
    QueueLatest,
    Skip,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::QueueAll => "queue_all",
            MisfirePolicy::QueueLatest => "queue_latest",
            MisfirePolicy::Skip => "skip",
        }
    }

    pub fn parse_lossy(raw: &str) -> Self {
        match raw {
            "queue_all" => MisfirePolicy::QueueAll,
            "skip" => MisfirePolicy::Skip,
            _ => MisfirePolicy::QueueLatest,
        }
    }
}

pub const WEEKDAY_ORDER: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Normalize weekday tokens into canonical mon..sun order, dropping unknowns.
pub fn normalize_weekdays<I, S>(tokens: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    for token in tokens {
        let token = token.as_ref().trim().to_ascii_lowercase();
        if token.len() >= 3 {
            seen.insert(token[..3].to_string());
        }
    }
    WEEKDAY_ORDER
        .iter()
        .filter(|day| seen.contains(**day))
        .map(|day| day.to_string())
        .collect()
}

/// One (time-of-day, timezone) firing spec for a calendar schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunTimeSpec {
    pub time_of_day: String,
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A recurring intent to create runs for a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub profile_id: String,
    pub enabled: bool,
    pub mode: ScheduleMode,
    pub execution_order: i64,
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub run_frequency_minutes: Option<i64>,
    #[serde(default)]
    pub run_times: Vec<RunTimeSpec>,
    #[serde(default)]
    pub days_of_week: Vec<String>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_planned_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_scheduled_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_successful_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_summary: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ScheduleRecord {
    /// Mode-specific fields must be present iff the mode matches.
    pub fn validate(&self) -> Result<(), String> {
        if self.schedule_id.trim().is_empty() {
            return Err("schedule_id must be non-empty".to_string());
        }
        if self.profile_id.trim().is_empty() {
            return Err("profile_id must be non-empty".to_string());
        }
        match self.mode {
            ScheduleMode::Frequency => {
                match self.run_frequency_minutes {
                    Some(minutes) if minutes > 0 => {}
                    _ => {
                        return Err(format!(
                            "frequency schedule `{}` requires run_frequency_minutes > 0",
                            self.schedule_id
                        ))
                    }
                }
                if !self.run_times.is_empty() {
                    return Err(format!(
                        "frequency schedule `{}` must not carry run-time specs",
                        self.schedule_id
                    ));
                }
            }
            ScheduleMode::Calendar => {
                if self.run_frequency_minutes.is_some() {
                    return Err(format!(
                        "calendar schedule `{}` must not carry run_frequency_minutes",
                        self.schedule_id
                    ));
                }
                if self.run_times.is_empty() {
                    return Err(format!(
                        "calendar schedule `{}` requires at least one run-time spec",
                        self.schedule_id
                    ));
                }
            }
        }
        Ok(())
    }
}
