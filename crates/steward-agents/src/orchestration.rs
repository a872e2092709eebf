// Orchestration tools: the chat loop (and task-agent runs, when
// explicitly allowed) drive the worker pool through the registry.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use steward_tools::{ParamKind, Tool, ToolParam, ToolRegistry, ToolSpec};
use steward_types::ModelTier;

use crate::worker_pool::WorkerManager;

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

struct SpawnWorkerTool {
    manager: WorkerManager,
    name: &'static str,
}

#[async_trait]
impl Tool for SpawnWorkerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            self.name,
            "orchestration",
            "Spawn a background worker for a side task.",
        )
        .param(ToolParam::new("title", ParamKind::String).required())
        .param(ToolParam::new("instructions", ParamKind::String).required())
        .param(ToolParam::new("model_tier", ParamKind::String))
        .param(ToolParam::new("tool_access", ParamKind::Array).items(ParamKind::String))
        .param(ToolParam::new("skill_access", ParamKind::Array).items(ParamKind::String))
        .param(ToolParam::new("preload_files", ParamKind::Array).items(ParamKind::String))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let title = args.get("title").and_then(Value::as_str).unwrap_or("");
        let instructions = args.get("instructions").and_then(Value::as_str).unwrap_or("");
        let tier = args
            .get("model_tier")
            .and_then(Value::as_str)
            .map(ModelTier::parse_lossy)
            .unwrap_or_default();
        self.manager
            .spawn_worker(
                title,
                instructions,
                tier,
                string_list(args.get("tool_access")),
                string_list(args.get("skill_access")),
                string_list(args.get("preload_files")),
                args.get("metadata").cloned(),
            )
            .await
    }
}

struct MessageWorkerTool {
    manager: WorkerManager,
}

#[async_trait]
impl Tool for MessageWorkerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "message_worker",
            "orchestration",
            "Queue a follow-up task on an existing worker.",
        )
        .param(ToolParam::new("worker_id", ParamKind::String).required())
        .param(ToolParam::new("message", ParamKind::String).required())
        .param(ToolParam::new("model_tier", ParamKind::String))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let worker_id = args.get("worker_id").and_then(Value::as_str).unwrap_or("");
        let message = args.get("message").and_then(Value::as_str).unwrap_or("");
        let tier = args
            .get("model_tier")
            .and_then(Value::as_str)
            .map(ModelTier::parse_lossy)
            .unwrap_or_default();
        self.manager.message_worker(worker_id, message, tier).await
    }
}

struct CancelWorkerTool {
    manager: WorkerManager,
}

#[async_trait]
impl Tool for CancelWorkerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("cancel_worker", "orchestration", "Cancel a worker.")
            .param(ToolParam::new("worker_id", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let worker_id = args.get("worker_id").and_then(Value::as_str).unwrap_or("");
        self.manager.cancel_worker(worker_id).await
    }
}

struct ListWorkersTool {
    manager: WorkerManager,
}

#[async_trait]
impl Tool for ListWorkersTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("list_workers", "orchestration", "List workers and pool state.")
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        Ok(self.manager.list_workers().await)
    }
}

struct WorkerStatusTool {
    manager: WorkerManager,
}

#[async_trait]
impl Tool for WorkerStatusTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("worker_status", "orchestration", "Inspect one worker.")
            .param(ToolParam::new("worker_id", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let worker_id = args.get("worker_id").and_then(Value::as_str).unwrap_or("");
        match self.manager.get_worker(worker_id).await {
            Some(snapshot) => Ok(json!({"ok": true, "worker": snapshot})),
            None => Ok(json!({"ok": false, "error": "worker not found", "worker_id": worker_id})),
        }
    }
}

struct ResetWorkerContextTool {
    manager: WorkerManager,
}

#[async_trait]
impl Tool for ResetWorkerContextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "reset_worker_context",
            "orchestration",
            "Reload a worker's base context and clear scoped memory.",
        )
        .param(ToolParam::new("worker_id", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let worker_id = args.get("worker_id").and_then(Value::as_str).unwrap_or("");
        self.manager.reset_worker_context(worker_id).await
    }
}

/// Register the worker-pool tools. `spawn_task_agent_worker` is the
/// escalation alias task-agent runs must use instead of `spawn_worker`.
pub async fn register_worker_tools(
    registry: &ToolRegistry,
    manager: &WorkerManager,
) -> Result<(), String> {
    registry
        .register(Arc::new(SpawnWorkerTool {
            manager: manager.clone(),
            name: "spawn_worker",
        }))
        .await?;
    registry
        .register(Arc::new(SpawnWorkerTool {
            manager: manager.clone(),
            name: "spawn_task_agent_worker",
        }))
        .await?;
    registry
        .register(Arc::new(MessageWorkerTool {
            manager: manager.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(CancelWorkerTool {
            manager: manager.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(ListWorkersTool {
            manager: manager.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(WorkerStatusTool {
            manager: manager.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(ResetWorkerContextTool {
            manager: manager.clone(),
        }))
        .await?;
    Ok(())
}

/// Rewrite task-agent tool access so runs escalate through the reserved
/// worker-spawn alias.
pub fn normalize_task_agent_tool_access(tools: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in tools {
        let mapped = if name == "spawn_worker" {
            "spawn_task_agent_worker"
        } else {
            name.as_str()
        };
        if !out.iter().any(|existing| existing == mapped) {
            out.push(mapped.to_string());
        }
    }
    out
}
