// Scheduler-facing orchestration tools: the chat loop and task-agent runs
// reach the central service through the registry.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use steward_tools::{ParamKind, Tool, ToolParam, ToolRegistry, ToolSpec};

use crate::service::CentralService;

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

struct EnqueueAgenticTaskTool {
    service: CentralService,
}

#[async_trait]
impl Tool for EnqueueAgenticTaskTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "enqueue_agentic_task",
            "orchestration",
            "Queue a one-off agentic task run on the central scheduler.",
        )
        .param(ToolParam::new("instructions", ParamKind::String).required())
        .param(ToolParam::new("model_tier", ParamKind::String))
        .param(ToolParam::new("tool_access", ParamKind::Array).items(ParamKind::String))
        .param(ToolParam::new("skill_access", ParamKind::Array).items(ParamKind::String))
        .param(ToolParam::new("timeout_sec", ParamKind::Integer))
        .param(ToolParam::new("description", ParamKind::String))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let instructions = args
            .get("instructions")
            .and_then(Value::as_str)
            .unwrap_or("");
        let run = self
            .service
            .enqueue_agentic_task(
                instructions,
                args.get("model_tier").and_then(Value::as_str).unwrap_or("medium"),
                string_list(args.get("tool_access")),
                string_list(args.get("skill_access")),
                args.get("timeout_sec").and_then(Value::as_u64),
                "main_agent",
                args.get("description").and_then(Value::as_str),
            )
            .await
            .map_err(|err| err.to_string())?;
        Ok(json!({
            "ok": true,
            "run_id": run.run_id,
            "status": run.status.as_str(),
            "source": "central_service",
        }))
    }
}

struct TriggerTaskProfileTool {
    service: CentralService,
}

#[async_trait]
impl Tool for TriggerTaskProfileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "trigger_task_profile",
            "orchestration",
            "Manually queue a run for a defined task profile.",
        )
        .param(ToolParam::new("profile_id", ParamKind::String).required())
        .param(ToolParam::new("description", ParamKind::String))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let profile_id = args.get("profile_id").and_then(Value::as_str).unwrap_or("");
        let run = self
            .service
            .trigger_profile(profile_id, args.get("description").and_then(Value::as_str))
            .await
            .map_err(|err| err.to_string())?;
        Ok(json!({
            "ok": true,
            "run_id": run.run_id,
            "status": run.status.as_str(),
            "source": "central_service",
        }))
    }
}

struct KillTaskRunTool {
    service: CentralService,
}

#[async_trait]
impl Tool for KillTaskRunTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("kill_task_run", "orchestration", "Kill a queued, waiting, or running task run.")
            .param(ToolParam::new("run_id", ParamKind::String).required())
            .param(ToolParam::new("requested_by", ParamKind::String))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let run_id = args.get("run_id").and_then(Value::as_str).unwrap_or("");
        let requested_by = args
            .get("requested_by")
            .and_then(Value::as_str)
            .unwrap_or("main_agent");
        self.service
            .kill_run(run_id, requested_by)
            .await
            .map_err(|err| err.to_string())
    }
}

struct ResumeTaskRunTool {
    service: CentralService,
}

#[async_trait]
impl Tool for ResumeTaskRunTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "resume_task_run",
            "orchestration",
            "Resume a waiting-for-user task run with a response.",
        )
        .param(ToolParam::new("run_id", ParamKind::String).required())
        .param(ToolParam::new("user_response", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let run_id = args.get("run_id").and_then(Value::as_str).unwrap_or("");
        let response = args
            .get("user_response")
            .and_then(Value::as_str)
            .unwrap_or("");
        self.service
            .resume_run(run_id, response, "main_agent")
            .await
            .map_err(|err| err.to_string())
    }
}

struct TaskAgentCheckInTool {
    service: CentralService,
}

#[async_trait]
impl Tool for TaskAgentCheckInTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "task_agent_check_in",
            "orchestration",
            "Summarize schedule health and recent run outcomes.",
        )
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        let summary = self
            .service
            .check_in_summary()
            .await
            .map_err(|err| err.to_string())?;
        Ok(json!({"ok": true, "summary": summary, "source": "central_service"}))
    }
}

struct ListWaitingRunsTool {
    service: CentralService,
}

#[async_trait]
impl Tool for ListWaitingRunsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "list_waiting_task_runs",
            "orchestration",
            "List task runs paused on user input.",
        )
        .param(ToolParam::new("limit", ParamKind::Integer))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
        let runs = self
            .service
            .list_waiting_runs(limit)
            .await
            .map_err(|err| err.to_string())?;
        let count = runs.len();
        Ok(json!({"ok": true, "runs": runs, "count": count, "source": "central_service"}))
    }
}

struct TaskStateTool {
    service: CentralService,
    write: bool,
}

#[async_trait]
impl Tool for TaskStateTool {
    fn spec(&self) -> ToolSpec {
        if self.write {
            ToolSpec::new(
                "set_task_state",
                "orchestration",
                "Upsert one durable key/value for a task profile.",
            )
            .param(ToolParam::new("task_id", ParamKind::String).required())
            .param(ToolParam::new("state_key", ParamKind::String).required())
            .param(ToolParam::new("value", ParamKind::Object).required())
        } else {
            ToolSpec::new(
                "get_task_state",
                "orchestration",
                "Read one durable key/value for a task profile.",
            )
            .param(ToolParam::new("task_id", ParamKind::String).required())
            .param(ToolParam::new("state_key", ParamKind::String).required())
        }
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let task_id = args.get("task_id").and_then(Value::as_str).unwrap_or("");
        let state_key = args.get("state_key").and_then(Value::as_str).unwrap_or("");
        if self.write {
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            self.service
                .store()
                .await
                .upsert_task_state(task_id, state_key, &value, Some("tool"))
                .await
                .map_err(|err| err.to_string())?;
            Ok(json!({"ok": true, "task_id": task_id, "state_key": state_key}))
        } else {
            let value = self
                .service
                .store()
                .await
                .get_task_state(task_id, state_key)
                .await
                .map_err(|err| err.to_string())?;
            Ok(json!({
                "ok": true,
                "task_id": task_id,
                "state_key": state_key,
                "value": value,
            }))
        }
    }
}

struct SeenItemTool {
    service: CentralService,
    mark: bool,
}

#[async_trait]
impl Tool for SeenItemTool {
    fn spec(&self) -> ToolSpec {
        if self.mark {
            ToolSpec::new(
                "mark_task_item_seen",
                "orchestration",
                "Record one deduplicated item sighting for a task.",
            )
            .param(ToolParam::new("task_id", ParamKind::String).required())
            .param(ToolParam::new("provider", ParamKind::String).required())
            .param(ToolParam::new("item_key", ParamKind::String).required())
            .param(ToolParam::new("metadata", ParamKind::Object))
        } else {
            ToolSpec::new(
                "has_task_item_seen",
                "orchestration",
                "Check whether a task has already seen an item.",
            )
            .param(ToolParam::new("task_id", ParamKind::String).required())
            .param(ToolParam::new("provider", ParamKind::String).required())
            .param(ToolParam::new("item_key", ParamKind::String).required())
        }
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let task_id = args.get("task_id").and_then(Value::as_str).unwrap_or("");
        let provider = args.get("provider").and_then(Value::as_str).unwrap_or("");
        let item_key = args.get("item_key").and_then(Value::as_str).unwrap_or("");
        if self.mark {
            self.service
                .store()
                .await
                .mark_task_item_seen(task_id, provider, item_key, args.get("metadata"))
                .await
                .map_err(|err| err.to_string())?;
            Ok(json!({"ok": true, "task_id": task_id, "item_key": item_key}))
        } else {
            let row = self
                .service
                .store()
                .await
                .has_task_item_seen(task_id, provider, item_key)
                .await
                .map_err(|err| err.to_string())?;
            Ok(json!({
                "ok": true,
                "seen": row.is_some(),
                "item": row,
            }))
        }
    }
}

/// Register the central-service tool surface.
pub async fn register_service_tools(
    registry: &ToolRegistry,
    service: &CentralService,
) -> Result<(), String> {
    registry
        .register(Arc::new(EnqueueAgenticTaskTool {
            service: service.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(TriggerTaskProfileTool {
            service: service.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(KillTaskRunTool {
            service: service.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(ResumeTaskRunTool {
            service: service.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(TaskAgentCheckInTool {
            service: service.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(ListWaitingRunsTool {
            service: service.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(TaskStateTool {
            service: service.clone(),
            write: true,
        }))
        .await?;
    registry
        .register(Arc::new(TaskStateTool {
            service: service.clone(),
            write: false,
        }))
        .await?;
    registry
        .register(Arc::new(SeenItemTool {
            service: service.clone(),
            mark: true,
        }))
        .await?;
    registry
        .register(Arc::new(SeenItemTool {
            service: service.clone(),
            mark: false,
        }))
        .await?;
    Ok(())
}
