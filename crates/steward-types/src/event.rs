use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventType {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    WorkerSpawn,
    WorkerComplete,
    System,
}

/// Persistable event in a session timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_id: String,
    pub session_id: String,
    pub event_type: SessionEventType,
    pub payload: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, event_type: SessionEventType, payload: Value) -> Self {
        Self {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            session_id: session_id.into(),
            event_type,
            payload,
            source: "main_agent".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// High-signal event produced by a worker or the scheduler, consumed at most
/// once by a chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Payload shape for `task_agent_event` forwarded events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAgentEventPayload {
    pub event_type: String,
    pub task_id: String,
    pub task_name: String,
    pub run_id: String,
    #[serde(default)]
    pub slot_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub message: String,
    #[serde(default)]
    pub percent: Option<u8>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub origin: String,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_event_serializes_snake_case_type() {
        let event = SessionEvent::new("s1", SessionEventType::UserMessage, json!({"text": "hi"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "user_message");
        assert!(value["event_id"].as_str().unwrap().starts_with("evt_"));
    }
}
