use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Low,
    #[default]
    Medium,
    High,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Low => "low",
            ModelTier::Medium => "medium",
            ModelTier::High => "high",
        }
    }

    /// Parse a tier string, falling back to `Medium` for anything unknown.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => ModelTier::Low,
            "high" => ModelTier::High,
            _ => ModelTier::Medium,
        }
    }
}

/// Immutable unit of work handed to a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub requested_by: String,
    pub instructions: String,
    #[serde(default)]
    pub model_tier: ModelTier,
    #[serde(default)]
    pub tool_access: Vec<String>,
    #[serde(default)]
    pub skill_access: Vec<String>,
    #[serde(default)]
    pub deadline_iso: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn create(instructions: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            task_id: format!("task_{}", Uuid::new_v4().simple()),
            requested_by: requested_by.into(),
            instructions: instructions.into(),
            model_tier: ModelTier::Medium,
            tool_access: Vec::new(),
            skill_access: Vec::new(),
            deadline_iso: None,
            metadata: Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.model_tier = tier;
        self
    }

    pub fn with_tool_access(mut self, tools: Vec<String>) -> Self {
        self.tool_access = tools;
        self
    }

    pub fn with_skill_access(mut self, skills: Vec<String>) -> Self {
        self.skill_access = skills;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Envelope invariants: ids and instructions must be non-empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_id.trim().is_empty() {
            return Err("task_id must be non-empty".to_string());
        }
        if self.requested_by.trim().is_empty() {
            return Err("requested_by must be non-empty".to_string());
        }
        if self.instructions.trim().is_empty() {
            return Err("instructions must be non-empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Success,
    Failed,
    NeedsUserInput,
}

impl SubAgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentStatus::Success => "success",
            SubAgentStatus::Failed => "failed",
            SubAgentStatus::NeedsUserInput => "needs_user_input",
        }
    }
}

/// Outcome of one sub-agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: String,
    pub status: SubAgentStatus,
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace: Vec<String>,
    pub produced_at: DateTime<Utc>,
}

impl WorkerResult {
    pub fn success(task_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: SubAgentStatus::Success,
            summary: summary.into(),
            artifacts: Vec::new(),
            error: None,
            trace: Vec::new(),
            produced_at: Utc::now(),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        summary: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: SubAgentStatus::Failed,
            summary: summary.into(),
            artifacts: Vec::new(),
            error: Some(error.into()),
            trace: Vec::new(),
            produced_at: Utc::now(),
        }
    }

    pub fn needs_user_input(task_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: SubAgentStatus::NeedsUserInput,
            summary: summary.into(),
            artifacts: Vec::new(),
            error: None,
            trace: Vec::new(),
            produced_at: Utc::now(),
        }
    }
}
