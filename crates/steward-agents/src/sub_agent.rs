// Sub-Agent Runner
// Runs one task envelope through the LLM + tool loop with scoped context
// and deterministic budget stops. A planner can be injected to drive the
// loop instead of the model.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use steward_core::{assemble_messages, ConfigStore, ContextState, TokenLimits, TurnEvent};
use steward_providers::{canonicalize_tool_arguments, LlmCaller};
use steward_tools::ToolRegistry;
use steward_types::{ChatMessage, LlmRequest, TaskEnvelope, WorkerResult};

pub const ERR_TIMEOUT_BUDGET: &str = "timeout_budget_exhausted";
pub const ERR_STEP_BUDGET: &str = "step_budget_exhausted";
pub const ERR_TOOL_CALL_BUDGET: &str = "tool_call_budget_exhausted";
pub const ERR_CONTEXT_BUDGET: &str = "context_budget_exhausted";
pub const ERR_CANCELLED: &str = "cancel_requested";
pub const ERR_UNSUPPORTED_ACTION: &str = "unsupported_action_kind";

const FALLBACK_MAX_CONTEXT_TOKENS: u64 = 400_000;
const FALLBACK_MAX_OUTPUT_TOKENS: u64 = 128_000;

/// Step/tool/wall-clock budgets for one loop.
#[derive(Debug, Clone, Copy)]
pub struct SubAgentBudgets {
    pub max_steps: u32,
    pub max_tool_calls: u32,
    pub timeout: Duration,
}

impl SubAgentBudgets {
    /// Sub-agent defaults.
    pub fn worker() -> Self {
        Self {
            max_steps: 4,
            max_tool_calls: 3,
            timeout: Duration::from_secs(20),
        }
    }

    /// Chat-turn defaults.
    pub fn chat() -> Self {
        Self {
            max_steps: 8,
            max_tool_calls: 6,
            timeout: Duration::from_secs(120),
        }
    }
}

impl Default for SubAgentBudgets {
    fn default() -> Self {
        Self::worker()
    }
}

/// External planner input for one step.
#[derive(Debug, Clone)]
pub struct PlannerInput {
    pub task: TaskEnvelope,
    pub step: u32,
    pub messages: Vec<ChatMessage>,
}

/// Planner-driven mode: the action payload carries a `kind` of
/// `respond`, `tool`, `llm`, or `continue`.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: PlannerInput) -> Value;
}

/// Executor for planner `tool` actions.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Value) -> Value;
}

#[derive(Debug, Clone, Default)]
pub struct SubAgentOptions {
    pub base_context: BTreeMap<String, String>,
    pub supplemental_context: BTreeMap<String, String>,
    pub facts: BTreeMap<String, String>,
    pub session_summary: Option<String>,
    pub model: Option<String>,
    pub budgets: Option<SubAgentBudgets>,
    pub allow_orchestration_tools: bool,
    pub cancel: Option<CancellationToken>,
}

/// One finished loop: the worker result plus the updated scoped context.
#[derive(Debug, Clone)]
pub struct SubAgentRun {
    pub ok: bool,
    pub result: WorkerResult,
    pub session_summary: Option<String>,
    pub facts: BTreeMap<String, String>,
    pub executed_tools: Vec<Value>,
}

pub struct SubAgentRunner {
    llm: Arc<dyn LlmCaller>,
    tools: ToolRegistry,
    config: ConfigStore,
    planner: Option<Arc<dyn Planner>>,
    executor: Option<Arc<dyn ActionExecutor>>,
}

impl SubAgentRunner {
    pub fn new(llm: Arc<dyn LlmCaller>, tools: ToolRegistry, config: ConfigStore) -> Self {
        Self {
            llm,
            tools,
            config,
            planner: None,
            executor: None,
        }
    }

    pub fn with_planner(
        mut self,
        planner: Arc<dyn Planner>,
        executor: Option<Arc<dyn ActionExecutor>>,
    ) -> Self {
        self.planner = Some(planner);
        self.executor = executor;
        self
    }

    async fn token_limits(&self, model_ref: Option<&str>) -> TokenLimits {
        let config = self.config.get().await;
        match config.model_token_limits(model_ref) {
            Ok((max_context, max_output)) => TokenLimits {
                max_context_tokens: max_context,
                reserved_output_tokens: max_output,
            },
            Err(_) => TokenLimits {
                max_context_tokens: FALLBACK_MAX_CONTEXT_TOKENS,
                reserved_output_tokens: FALLBACK_MAX_OUTPUT_TOKENS,
            },
        }
    }

    /// Run one task envelope to completion or budget exhaustion.
    pub async fn run_task(&self, task: &TaskEnvelope, options: SubAgentOptions) -> SubAgentRun {
        let budgets = options.budgets.unwrap_or_default();
        let started = Instant::now();

        if let Err(reason) = task.validate() {
            return failed_run(task, "Task envelope failed validation.", &reason, Vec::new());
        }

        let mut context = ContextState::new();
        for (path, text) in &options.base_context {
            context.upsert_base(path, text.clone());
        }
        for (path, text) in &options.supplemental_context {
            context.upsert_supplemental(path, text.clone());
        }
        for (key, text) in &options.facts {
            context.upsert_fact(key, text.clone());
        }

        let model_ref = options
            .model
            .clone()
            .unwrap_or_else(|| task.model_tier.as_str().to_string());
        let limits = self.token_limits(Some(&model_ref)).await;

        let mut session_summary = options.session_summary.clone();
        let mut events: Vec<TurnEvent> = vec![TurnEvent::user(task.instructions.clone())];
        let mut transcript: Vec<ChatMessage> = Vec::new();
        let mut executed_tools: Vec<Value> = Vec::new();
        let mut tool_calls_used: u32 = 0;
        let mut trace: Vec<String> = Vec::new();

        for step in 1..=budgets.max_steps {
            if started.elapsed() > budgets.timeout {
                return failed_run(
                    task,
                    "Worker timed out before completing task.",
                    ERR_TIMEOUT_BUDGET,
                    trace,
                );
            }
            if options
                .cancel
                .as_ref()
                .map(|token| token.is_cancelled())
                .unwrap_or(false)
            {
                return failed_run(task, "Worker task was cancelled.", ERR_CANCELLED, trace);
            }

            let assembled =
                assemble_messages(&context, &events, session_summary.as_deref(), Some(limits));
            if !assembled.within_budget() {
                return failed_run(
                    task,
                    "Context budget exhausted after dropping optional items.",
                    ERR_CONTEXT_BUDGET,
                    trace,
                );
            }
            session_summary = assembled.updated_session_summary.clone();
            let mut messages = assembled.messages;
            messages.extend(transcript.iter().cloned());

            if let Some(planner) = &self.planner {
                let action = planner
                    .plan(PlannerInput {
                        task: task.clone(),
                        step,
                        messages: messages.clone(),
                    })
                    .await;
                let kind = action.get("kind").and_then(Value::as_str).unwrap_or("");
                trace.push(format!("step={step} action={kind}"));
                match kind {
                    "respond" => {
                        let text = action
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .trim()
                            .to_string();
                        let needs_input = action
                            .get("needs_user_input")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        let summary = if text.is_empty() {
                            "(No response text provided.)".to_string()
                        } else {
                            text
                        };
                        let mut result = if needs_input {
                            WorkerResult::needs_user_input(&task.task_id, summary)
                        } else {
                            WorkerResult::success(&task.task_id, summary)
                        };
                        result.artifacts.push(json!({
                            "type": "worker_response",
                            "data": action,
                        }));
                        result.trace = trace;
                        return SubAgentRun {
                            ok: true,
                            result,
                            session_summary,
                            facts: collect_facts(&context),
                            executed_tools,
                        };
                    }
                    "tool" => {
                        if tool_calls_used >= budgets.max_tool_calls {
                            return failed_run(
                                task,
                                "Worker tool call budget exhausted.",
                                ERR_TOOL_CALL_BUDGET,
                                trace,
                            );
                        }
                        tool_calls_used += 1;
                        let Some(executor) = &self.executor else {
                            return failed_run(
                                task,
                                "No tool executor configured for worker.",
                                "missing_action_executor",
                                trace,
                            );
                        };
                        let tool_result = executor.execute(&action).await;
                        executed_tools.push(json!({
                            "name": action.get("name").cloned().unwrap_or(Value::Null),
                            "args": action.get("args").cloned().unwrap_or(Value::Null),
                            "result_ok": tool_result.get("ok").and_then(Value::as_bool).unwrap_or(true),
                            "error": tool_result.get("error").cloned().unwrap_or(Value::Null),
                        }));
                        events.push(TurnEvent {
                            event_type: steward_types::SessionEventType::ToolResult,
                            payload: tool_result,
                        });
                        continue;
                    }
                    "llm" => {
                        let response = self
                            .llm
                            .call(
                                LlmRequest::new(messages.clone()).with_model(model_ref.clone()),
                            )
                            .await;
                        if response.ok {
                            let text = response.text.clone().unwrap_or_default();
                            let mut result = WorkerResult::success(
                                &task.task_id,
                                if text.trim().is_empty() {
                                    "(No summary returned.)".to_string()
                                } else {
                                    text.trim().to_string()
                                },
                            );
                            result.artifacts.push(json!({
                                "type": "llm_output",
                                "data": serde_json::to_value(&response).unwrap_or(Value::Null),
                            }));
                            result.trace = trace;
                            return SubAgentRun {
                                ok: true,
                                result,
                                session_summary,
                                facts: collect_facts(&context),
                                executed_tools,
                            };
                        }
                        return llm_failed_run(task, &response, trace);
                    }
                    "continue" => {
                        events.push(TurnEvent::system(json!({"note": "continue"})));
                        continue;
                    }
                    other => {
                        return failed_run(
                            task,
                            &format!("Unsupported action kind: {other}"),
                            ERR_UNSUPPORTED_ACTION,
                            trace,
                        );
                    }
                }
            }

            // Model-driven path: one provider call per step, filtered to
            // the envelope's tool access.
            let (tool_schemas, registered) = self
                .tools
                .schemas_for(&task.tool_access, options.allow_orchestration_tools)
                .await;

            let remaining = budgets.timeout.saturating_sub(started.elapsed());
            let request = LlmRequest::new(messages)
                .with_model(model_ref.clone())
                .with_tools(tool_schemas);
            let response = match tokio::time::timeout(remaining, self.llm.call(request)).await {
                Ok(response) => response,
                Err(_) => {
                    return failed_run(
                        task,
                        "Worker timed out inside the model call.",
                        ERR_TIMEOUT_BUDGET,
                        trace,
                    );
                }
            };
            if !response.ok {
                return llm_failed_run(task, &response, trace);
            }

            let tool_calls = response.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                let text = response.text.clone().unwrap_or_default().trim().to_string();
                let mut result = WorkerResult::success(
                    &task.task_id,
                    if text.is_empty() {
                        "(No summary returned.)".to_string()
                    } else {
                        text
                    },
                );
                result.artifacts.push(json!({
                    "type": "llm_output",
                    "data": serde_json::to_value(&response).unwrap_or(Value::Null),
                }));
                result.artifacts.push(json!({
                    "type": "tool_execution",
                    "data": executed_tools,
                }));
                result.trace = trace;
                return SubAgentRun {
                    ok: true,
                    result,
                    session_summary,
                    facts: collect_facts(&context),
                    executed_tools,
                };
            }

            trace.push(format!("step={step} tool_calls={}", tool_calls.len()));
            transcript.push(ChatMessage {
                role: "assistant".to_string(),
                content: response.text.clone().unwrap_or_default(),
                tool_calls: Some(tool_calls.clone()),
                tool_call_id: None,
                name: None,
            });

            for (idx, call) in tool_calls.iter().enumerate() {
                if tool_calls_used >= budgets.max_tool_calls {
                    return failed_run(
                        task,
                        "Worker tool call budget exhausted.",
                        ERR_TOOL_CALL_BUDGET,
                        trace,
                    );
                }
                tool_calls_used += 1;

                let call_id = if call.id.is_empty() {
                    format!("tool_call_{idx}")
                } else {
                    call.id.clone()
                };
                let tool_name = call.function.name.clone();
                let payload = if tool_name.is_empty() {
                    json!({
                        "ok": false,
                        "error": "Malformed tool call: missing function name.",
                        "source": "worker_tool_loop",
                    })
                } else if !registered.contains(&tool_name) {
                    json!({
                        "ok": false,
                        "error": format!("Tool `{tool_name}` is not available to this worker."),
                        "source": "worker_tool_loop",
                    })
                } else {
                    match canonicalize_tool_arguments(&call.function) {
                        Ok(args) => self.tools.invoke(&tool_name, args).await,
                        Err(reason) => json!({
                            "ok": false,
                            "error": reason,
                            "source": "worker_tool_loop",
                        }),
                    }
                };

                executed_tools.push(json!({
                    "name": if tool_name.is_empty() { "unknown_tool" } else { tool_name.as_str() },
                    "args": call.function.arguments.clone(),
                    "result_ok": payload.get("ok").and_then(Value::as_bool).unwrap_or(true),
                    "error": payload.get("error").cloned().unwrap_or(Value::Null),
                }));
                transcript.push(ChatMessage::tool_result(
                    call_id,
                    if tool_name.is_empty() {
                        "unknown_tool".to_string()
                    } else {
                        tool_name
                    },
                    payload.to_string(),
                ));
            }
        }

        failed_run(
            task,
            "Worker step budget exhausted before completion.",
            ERR_STEP_BUDGET,
            trace,
        )
    }
}

fn collect_facts(context: &ContextState) -> BTreeMap<String, String> {
    context
        .facts()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn failed_run(task: &TaskEnvelope, summary: &str, error: &str, trace: Vec<String>) -> SubAgentRun {
    let mut result = WorkerResult::failed(&task.task_id, summary, error);
    result.trace = trace;
    SubAgentRun {
        ok: false,
        result,
        session_summary: None,
        facts: BTreeMap::new(),
        executed_tools: Vec::new(),
    }
}

fn llm_failed_run(
    task: &TaskEnvelope,
    response: &steward_types::LlmResponse,
    trace: Vec<String>,
) -> SubAgentRun {
    let error = response
        .error
        .clone()
        .unwrap_or_else(|| "llm_error".to_string());
    let mut result = WorkerResult::failed(&task.task_id, "Worker LLM call failed.", error);
    result.artifacts.push(json!({
        "type": "llm_failure",
        "data": {
            "attempts_used": response.attempts_used,
            "attempts_configured": response.attempts_configured,
            "retryable_error": response.retryable_error,
            "provider": response.provider,
            "model": response.model,
        },
    }));
    result.trace = trace;
    SubAgentRun {
        ok: false,
        result,
        session_summary: None,
        facts: BTreeMap::new(),
        executed_tools: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use steward_tools::{ParamKind, Tool, ToolParam, ToolSpec};
    use steward_types::{FunctionCall, LlmResponse, SubAgentStatus, ToolCallPayload};
    use tokio::sync::Mutex;

    fn config_store(dir: &tempfile::TempDir) -> ConfigStore {
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "default_model_alias": "medium",
                "models": {
                    "vendor/model": {
                        "provider": "echo",
                        "endpoint": "vendor/model",
                        "max_context_tokens": 40000,
                        "max_output_tokens": 2000,
                        "alias": "medium"
                    }
                }
            }"#,
        )
        .unwrap();
        ConfigStore::new(dir.path(), path)
    }

    /// Replays a scripted list of LLM responses.
    struct ScriptedLlm {
        calls: AtomicU32,
        script: Mutex<Vec<LlmResponse>>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl LlmCaller for ScriptedLlm {
        async fn call(&self, _request: LlmRequest) -> LlmResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().await;
            if script.is_empty() {
                return text_response("fallback");
            }
            script.remove(0)
        }
    }

    fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            ok: true,
            provider: Some("scripted".to_string()),
            model: Some("vendor/model".to_string()),
            text: Some(text.to_string()),
            tool_calls: None,
            finish_reason: Some("stop".to_string()),
            usage: None,
            error: None,
            attempts_used: 1,
            attempts_configured: 1,
            retryable_error: false,
            retry_backoff_schedule_sec: vec![],
        }
    }

    fn tool_call_response(name: &str, args: Value) -> LlmResponse {
        let mut response = text_response("");
        response.text = None;
        response.tool_calls = Some(vec![ToolCallPayload {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: args,
            },
        }]);
        response
    }

    struct TimeTool;

    #[async_trait]
    impl Tool for TimeTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("get_current_time", "kernel", "time")
                .param(ToolParam::new("location", ParamKind::Object))
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            Ok(json!({"ok": true, "human_local": "10:00 AM"}))
        }
    }

    async fn registry_with_time_tool() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(TimeTool)).await.unwrap();
        registry
    }

    fn envelope(tools: Vec<&str>) -> TaskEnvelope {
        TaskEnvelope::create("what time is it?", "main_agent")
            .with_tool_access(tools.into_iter().map(str::to_string).collect())
    }

    #[tokio::test]
    async fn tool_loop_round_trip_reaches_text_reply() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_call_response("get_current_time", json!({})),
            text_response("Current local time: 10:00 AM"),
        ]);
        let runner = SubAgentRunner::new(
            llm.clone(),
            registry_with_time_tool().await,
            config_store(&dir),
        );

        let run = runner
            .run_task(&envelope(vec!["get_current_time"]), SubAgentOptions::default())
            .await;
        assert!(run.ok);
        assert_eq!(run.result.status, SubAgentStatus::Success);
        assert!(run.result.summary.contains("10:00 AM"));
        assert_eq!(run.executed_tools.len(), 1);
        assert_eq!(run.executed_tools[0]["name"], "get_current_time");
        assert_eq!(run.executed_tools[0]["result_ok"], true);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_tool_yields_synthetic_error_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_call_response("not_a_tool", json!({})),
            text_response("recovered"),
        ]);
        let runner = SubAgentRunner::new(
            llm,
            registry_with_time_tool().await,
            config_store(&dir),
        );

        let run = runner
            .run_task(&envelope(vec!["get_current_time"]), SubAgentOptions::default())
            .await;
        assert!(run.ok);
        assert_eq!(run.executed_tools[0]["result_ok"], false);
        assert!(run.executed_tools[0]["error"]
            .as_str()
            .unwrap()
            .contains("not available"));
    }

    #[tokio::test]
    async fn malformed_arguments_yield_synthetic_error() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_call_response("get_current_time", Value::String("{broken".to_string())),
            text_response("recovered"),
        ]);
        let runner = SubAgentRunner::new(
            llm,
            registry_with_time_tool().await,
            config_store(&dir),
        );

        let run = runner
            .run_task(&envelope(vec!["get_current_time"]), SubAgentOptions::default())
            .await;
        assert!(run.ok);
        assert_eq!(run.executed_tools[0]["result_ok"], false);
        assert!(run.executed_tools[0]["error"]
            .as_str()
            .unwrap()
            .contains("invalid JSON"));
    }

    #[tokio::test]
    async fn step_budget_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(
            (0..10)
                .map(|_| tool_call_response("get_current_time", json!({})))
                .collect(),
        );
        let runner = SubAgentRunner::new(
            llm,
            registry_with_time_tool().await,
            config_store(&dir),
        );
        let options = SubAgentOptions {
            budgets: Some(SubAgentBudgets {
                max_steps: 2,
                max_tool_calls: 10,
                timeout: Duration::from_secs(20),
            }),
            ..Default::default()
        };

        let run = runner.run_task(&envelope(vec!["get_current_time"]), options).await;
        assert!(!run.ok);
        assert_eq!(run.result.error.as_deref(), Some(ERR_STEP_BUDGET));
    }

    #[tokio::test]
    async fn tool_call_budget_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(
            (0..10)
                .map(|_| tool_call_response("get_current_time", json!({})))
                .collect(),
        );
        let runner = SubAgentRunner::new(
            llm,
            registry_with_time_tool().await,
            config_store(&dir),
        );
        let options = SubAgentOptions {
            budgets: Some(SubAgentBudgets {
                max_steps: 10,
                max_tool_calls: 2,
                timeout: Duration::from_secs(20),
            }),
            ..Default::default()
        };

        let run = runner.run_task(&envelope(vec!["get_current_time"]), options).await;
        assert!(!run.ok);
        assert_eq!(run.result.error.as_deref(), Some(ERR_TOOL_CALL_BUDGET));
    }

    #[tokio::test]
    async fn context_budget_exhaustion_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.json");
        std::fs::write(
            &path,
            r#"{
                "default_model_alias": "medium",
                "models": {
                    "vendor/tiny": {
                        "provider": "echo",
                        "endpoint": "vendor/tiny",
                        "max_context_tokens": 30,
                        "max_output_tokens": 25,
                        "alias": "medium"
                    }
                }
            }"#,
        )
        .unwrap();
        let config = ConfigStore::new(dir.path(), path);
        let llm = ScriptedLlm::new(vec![text_response("hi")]);
        let runner = SubAgentRunner::new(llm, ToolRegistry::new(), config);

        let task = TaskEnvelope::create(
            "a long instruction that cannot fit in such a tiny context window at all",
            "main_agent",
        );
        let run = runner.run_task(&task, SubAgentOptions::default()).await;
        assert!(!run.ok);
        assert_eq!(run.result.error.as_deref(), Some(ERR_CONTEXT_BUDGET));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_step() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![text_response("never seen")]);
        let runner = SubAgentRunner::new(
            llm,
            ToolRegistry::new(),
            config_store(&dir),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = SubAgentOptions {
            cancel: Some(cancel),
            ..Default::default()
        };

        let run = runner
            .run_task(&TaskEnvelope::create("task", "main_agent"), options)
            .await;
        assert!(!run.ok);
        assert_eq!(run.result.error.as_deref(), Some(ERR_CANCELLED));
    }

    struct FixedPlanner {
        actions: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn plan(&self, _input: PlannerInput) -> Value {
            let mut actions = self.actions.lock().await;
            if actions.is_empty() {
                json!({"kind": "continue"})
            } else {
                actions.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn planner_respond_terminates_with_needs_user_input() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![]);
        let planner = Arc::new(FixedPlanner {
            actions: Mutex::new(vec![json!({
                "kind": "respond",
                "text": "Which option?",
                "needs_user_input": true,
            })]),
        });
        let runner = SubAgentRunner::new(llm, ToolRegistry::new(), config_store(&dir))
            .with_planner(planner, None);

        let run = runner
            .run_task(
                &TaskEnvelope::create("ask the user", "main_agent"),
                SubAgentOptions::default(),
            )
            .await;
        assert!(run.ok);
        assert_eq!(run.result.status, SubAgentStatus::NeedsUserInput);
        assert_eq!(run.result.summary, "Which option?");
    }

    #[tokio::test]
    async fn planner_unknown_kind_fails() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![]);
        let planner = Arc::new(FixedPlanner {
            actions: Mutex::new(vec![json!({"kind": "teleport"})]),
        });
        let runner = SubAgentRunner::new(llm, ToolRegistry::new(), config_store(&dir))
            .with_planner(planner, None);

        let run = runner
            .run_task(
                &TaskEnvelope::create("task", "main_agent"),
                SubAgentOptions::default(),
            )
            .await;
        assert!(!run.ok);
        assert_eq!(run.result.error.as_deref(), Some(ERR_UNSUPPORTED_ACTION));
    }

    #[tokio::test]
    async fn llm_failure_carries_retry_metadata_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut failure = text_response("");
        failure.ok = false;
        failure.text = None;
        failure.error = Some("HTTP 503: upstream unavailable".to_string());
        failure.retryable_error = true;
        failure.attempts_used = 4;
        failure.attempts_configured = 4;
        let llm = ScriptedLlm::new(vec![failure]);
        let runner = SubAgentRunner::new(
            llm,
            ToolRegistry::new(),
            config_store(&dir),
        );

        let run = runner
            .run_task(
                &TaskEnvelope::create("task", "main_agent"),
                SubAgentOptions::default(),
            )
            .await;
        assert!(!run.ok);
        let artifact = run
            .result
            .artifacts
            .iter()
            .find(|artifact| artifact["type"] == "llm_failure")
            .unwrap();
        assert_eq!(artifact["data"]["attempts_used"], 4);
        assert_eq!(artifact["data"]["retryable_error"], true);
    }
}
