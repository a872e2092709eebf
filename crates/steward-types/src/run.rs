use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingForUser,
    Done,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::WaitingForUser => "waiting_for_user",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "waiting_for_user" => Some(RunStatus::WaitingForUser),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            "blocked" => Some(RunStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Blocked)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::Running | RunStatus::WaitingForUser
        )
    }
}

/// One attempt to execute a task profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub schedule_id: Option<String>,
    pub profile_id: String,
    pub status: RunStatus,
    pub planned_fire_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl RunRecord {
    pub fn waiting_info(&self) -> Option<WaitingInfo> {
        let waiting = self.payload.get("waiting")?;
        serde_json::from_value(waiting.clone()).ok()
    }
}

/// Reference to a run freshly materialized by the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRunRef {
    pub run_id: String,
    pub schedule_id: String,
    pub profile_id: String,
    pub execution_order: i64,
    pub planned_fire_at: DateTime<Utc>,
}

/// Waiting-for-user state embedded in a run payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingInfo {
    pub request_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub context: Value,
    pub requested_by: String,
    pub waiting_since: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    pub state: String,
}

/// Structured outcome returned by the task runner for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable_error: bool,
    #[serde(default)]
    pub attempts_used: Option<u32>,
    #[serde(default)]
    pub attempts_configured: Option<u32>,
    #[serde(default)]
    pub waiting_question: Option<String>,
    #[serde(default)]
    pub wait_context: Option<Value>,
    #[serde(default)]
    pub wait_timeout_sec: Option<u64>,
}

impl RunOutcome {
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Done,
            summary: Some(summary.into()),
            error: None,
            retryable_error: false,
            attempts_used: None,
            attempts_configured: None,
            waiting_question: None,
            wait_context: None,
            wait_timeout_sec: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            summary: None,
            error: Some(error.into()),
            retryable_error: false,
            attempts_used: None,
            attempts_configured: None,
            waiting_question: None,
            wait_context: None,
            wait_timeout_sec: None,
        }
    }

    pub fn blocked(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Blocked,
            summary: None,
            error: Some(error.into()),
            retryable_error: false,
            attempts_used: None,
            attempts_configured: None,
            waiting_question: None,
            wait_context: None,
            wait_timeout_sec: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::WaitingForUser,
            RunStatus::Done,
            RunStatus::Failed,
            RunStatus::Blocked,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(RunStatus::parse("paused").is_none());
    }

    #[test]
    fn terminal_statuses_are_not_active() {
        assert!(RunStatus::Done.is_terminal());
        assert!(!RunStatus::Done.is_active());
        assert!(RunStatus::WaitingForUser.is_active());
    }
}
