// Chat Session Runtime
// Handles one user message: session state, context assembly, forwarded
// worker/scheduler events, the LLM tool loop, and daily-memory logging.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use steward_agents::{
    select_supplemental_files, load_context_files, WorkerManager, CHAT_BASE_CONTEXT_FILES,
};
use steward_core::{
    assemble_messages, ChatConfig, ConfigStore, ContextState, EventRecord, TokenLimits, TurnEvent,
};
use steward_memory::{MemoryManager, MemorySummaryWorker};
use steward_providers::{canonicalize_tool_arguments, LlmCaller};
use steward_scheduler::CentralService;
use steward_store::{DailyMemoryStore, MemoryIndexStore};
use steward_tools::ToolRegistry;
use steward_types::{ChatMessage, LlmRequest, SessionEvent, SessionEventType};

use crate::session::{append_session_events, SessionMap};

const SAFE_PROVIDER_ERROR_REPLY: &str =
    "I could not reach the LLM provider. Please retry in a moment.";
const SAFE_BUDGET_REPLY: &str =
    "I had to stop before finishing that request; please try a smaller ask.";

/// Structured chat turn result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatReply {
    pub ok: bool,
    pub reply: String,
    pub route: String,
    pub data: Value,
    pub error: Option<String>,
}

pub struct ChatRuntime {
    config: ConfigStore,
    root: PathBuf,
    llm: Arc<dyn LlmCaller>,
    tools: ToolRegistry,
    workers: WorkerManager,
    service: Option<CentralService>,
    daily: Arc<DailyMemoryStore>,
    index: Arc<MemoryIndexStore>,
    memory_manager: Arc<MemoryManager>,
    summary_worker: Option<Arc<MemorySummaryWorker>>,
    sessions: Mutex<SessionMap>,
}

impl ChatRuntime {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: ConfigStore,
        root: PathBuf,
        llm: Arc<dyn LlmCaller>,
        tools: ToolRegistry,
        workers: WorkerManager,
        service: Option<CentralService>,
        daily: Arc<DailyMemoryStore>,
        index: Arc<MemoryIndexStore>,
        memory_manager: Arc<MemoryManager>,
        summary_worker: Option<Arc<MemorySummaryWorker>>,
    ) -> Self {
        let chat = config.get().await.chat.clone();
        Self {
            config,
            root,
            llm,
            tools,
            workers,
            service,
            daily,
            index,
            memory_manager,
            summary_worker,
            sessions: Mutex::new(SessionMap::new(
                Duration::from_secs(chat.session_ttl_sec.max(1)),
                chat.session_cap,
                chat.recent_event_cap,
            )),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn is_high_signal_worker_event(event: &EventRecord) -> bool {
        matches!(
            event.event_type.as_str(),
            "worker_completed" | "worker_blocked" | "worker_needs_user_input" | "worker_cancelled"
        )
    }

    async fn worker_runtime_snapshot(&self) -> String {
        let listing = self.workers.list_workers().await;
        let runtime = &listing["runtime"];
        let mut text = format!(
            "workers running={} queued={} total={}",
            runtime["running_count"], runtime["queued_count"], runtime["total_workers"]
        );
        if let Some(workers) = listing["workers"].as_array() {
            for worker in workers.iter().rev().take(5) {
                text.push_str(&format!(
                    "; {}={}",
                    worker["worker_id"].as_str().unwrap_or("?"),
                    worker["status"].as_str().unwrap_or("?")
                ));
            }
        }
        text
    }

    /// Run the chat tool loop over assembled messages. Returns the final
    /// reply text, executed-tool records, and the raw model envelope.
    async fn run_tool_loop(
        &self,
        mut messages: Vec<ChatMessage>,
        chat: &ChatConfig,
    ) -> (Option<String>, Vec<Value>, Value, Option<String>) {
        let mut executed_tools: Vec<Value> = Vec::new();
        let mut tool_calls_used: u32 = 0;
        let mut last_envelope = Value::Null;

        for _step in 0..chat.max_steps {
            let (schemas, registered) = self.tools.schemas_for(&[], true).await;
            let response = self
                .llm
                .call(LlmRequest::new(messages.clone()).with_tools(schemas))
                .await;
            last_envelope = serde_json::to_value(&response).unwrap_or(Value::Null);

            if !response.ok {
                return (
                    None,
                    executed_tools,
                    last_envelope,
                    Some(response.error.unwrap_or_else(|| "llm_error".to_string())),
                );
            }

            let tool_calls = response.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                let text = response.text.clone().unwrap_or_default().trim().to_string();
                return (Some(text), executed_tools, last_envelope, None);
            }

            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: response.text.clone().unwrap_or_default(),
                tool_calls: Some(tool_calls.clone()),
                tool_call_id: None,
                name: None,
            });

            for (idx, call) in tool_calls.iter().enumerate() {
                if tool_calls_used >= chat.max_tool_calls {
                    return (
                        None,
                        executed_tools,
                        last_envelope,
                        Some("tool_call_budget_exhausted".to_string()),
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
                        "source": "chat_tool_loop",
                    })
                } else if !registered.contains(&tool_name) {
                    json!({
                        "ok": false,
                        "error": format!("Tool `{tool_name}` is not available."),
                        "source": "chat_tool_loop",
                    })
                } else {
                    match canonicalize_tool_arguments(&call.function) {
                        Ok(args) => self.tools.invoke(&tool_name, args).await,
                        Err(reason) => json!({
                            "ok": false,
                            "error": reason,
                            "source": "chat_tool_loop",
                        }),
                    }
                };

                executed_tools.push(json!({
                    "name": if tool_name.is_empty() { "unknown_tool" } else { tool_name.as_str() },
                    "args": call.function.arguments.clone(),
                    "result_ok": payload.get("ok").and_then(Value::as_bool).unwrap_or(true),
                    "error": payload.get("error").cloned().unwrap_or(Value::Null),
                }));
                messages.push(ChatMessage::tool_result(
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

        (
            None,
            executed_tools,
            last_envelope,
            Some("step_budget_exhausted".to_string()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_daily_turn(
        &self,
        session_id: &str,
        user_text: &str,
        reply: &str,
        worker_events: &[EventRecord],
    ) -> u64 {
        let mut logged = 0u64;
        if self
            .daily
            .append_event(user_text, "user", Some(session_id), None, None)
            .await
            .is_ok()
        {
            logged += 1;
        }
        if self
            .daily
            .append_event(reply, "main_agent", Some(session_id), None, None)
            .await
            .is_ok()
        {
            logged += 1;
        }
        for event in worker_events {
            if !Self::is_high_signal_worker_event(event) {
                continue;
            }
            let text = format!(
                "{} worker={} {}",
                event.event_type,
                event.payload["worker_id"].as_str().unwrap_or("?"),
                event.payload.get("summary").and_then(Value::as_str).unwrap_or("")
            );
            if self
                .daily
                .append_event(&text, "worker_event", Some(session_id), None, None)
                .await
                .is_ok()
            {
                logged += 1;
            }
        }
        logged
    }

    async fn bump_memory_counter(&self, logged: u64) {
        if logged == 0 {
            return;
        }
        let day = self.daily.local_day();
        let threshold = self
            .config
            .get()
            .await
            .memory
            .realtime_summary_turn_threshold as u64;
        match self.index.increment_day_message_count(&day, logged).await {
            Ok(status) => {
                if status.messages_since_last_summary >= threshold {
                    if let Err(err) = self
                        .index
                        .enqueue_summary_job(&day, "turn_threshold")
                        .await
                    {
                        tracing::warn!("summary job enqueue failed: {err}");
                    }
                    if let Some(worker) = &self.summary_worker {
                        worker.kick();
                    }
                }
            }
            Err(err) => tracing::warn!("day counter increment failed: {err}"),
        }
    }

    async fn persist_session_turn(
        &self,
        session_id: &str,
        user_text: &str,
        reply: &str,
        route: &str,
    ) {
        if !self.config.get().await.chat.persist_session_events {
            return;
        }
        let events = vec![
            SessionEvent::new(
                session_id,
                SessionEventType::UserMessage,
                json!({"text": user_text, "route": route}),
            ),
            SessionEvent::new(
                session_id,
                SessionEventType::AssistantMessage,
                json!({"text": reply, "route": route}),
            ),
        ];
        if let Err(err) = append_session_events(&self.root, session_id, &events) {
            tracing::warn!("session log append failed: {err}");
        }
    }

    /// Handle one user message end to end.
    pub async fn handle_message(&self, session_id: &str, message: &str) -> ChatReply {
        let text = message.trim();
        if text.is_empty() {
            return ChatReply {
                ok: false,
                reply: "Please enter a message.".to_string(),
                route: "validation".to_string(),
                data: Value::Null,
                error: Some("empty_message".to_string()),
            };
        }

        let config = self.config.get().await;
        let chat = config.chat.clone();

        // Coerce past days into a finalized state before assembling.
        if let Err(err) = self.memory_manager.sweep_pending_previous_days("chat").await {
            tracing::warn!("pre-turn memory sweep failed: {err}");
        }

        // Session state + preloaded daily context.
        let autoload_days = config.memory.autoload_summary_days;
        let preloaded = self
            .daily
            .load_recent_daily_memory(autoload_days)
            .await
            .unwrap_or_default();
        let (recent_events, session_summary, facts) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.touch(session_id);
            session.preloaded_daily_context = preloaded.clone();
            (
                session.recent_events.iter().cloned().collect::<Vec<_>>(),
                session.session_summary.clone(),
                session.facts.clone(),
            )
        };

        // Context bundle: base files, query-scored supplemental, recent
        // daily memory, and advisory session facts.
        let mut context = ContextState::new();
        for (path, content) in load_context_files(&self.root, CHAT_BASE_CONTEXT_FILES) {
            context.upsert_base(&path, content);
        }
        for (path, content) in select_supplemental_files(&self.root, text, 2) {
            context.upsert_supplemental(&path, content);
        }
        for (path, content) in &preloaded {
            context.upsert_supplemental(path, content.clone());
        }
        for (key, value) in &facts {
            context.upsert_fact(key, value.clone());
        }

        // Forwarded events are consumed exactly once across sessions.
        let worker_events = self.workers.list_forward_events(true).await;
        let task_events = match &self.service {
            Some(service) => service.list_forward_events(true).await,
            None => Vec::new(),
        };
        let worker_runtime_text = self.worker_runtime_snapshot().await;

        let mut turn_events: Vec<TurnEvent> = recent_events;
        turn_events.push(TurnEvent::system(json!({
            "worker_runtime": worker_runtime_text,
        })));
        for event in &worker_events {
            turn_events.push(TurnEvent::system(json!({"worker_event": {
                "type": event.event_type,
                "payload": event.payload,
            }})));
        }
        for event in &task_events {
            turn_events.push(TurnEvent::system(json!({"task_agent_event": {
                "type": event.event_type,
                "payload": event.payload,
            }})));
        }
        turn_events.push(TurnEvent::user(text.to_string()));

        let limits = match config.model_token_limits(None) {
            Ok((max_context, max_output)) => Some(TokenLimits {
                max_context_tokens: max_context,
                reserved_output_tokens: max_output,
            }),
            Err(_) => None,
        };
        let assembled =
            assemble_messages(&context, &turn_events, session_summary.as_deref(), limits);
        if !assembled.within_budget() {
            return ChatReply {
                ok: false,
                reply: SAFE_BUDGET_REPLY.to_string(),
                route: "llm.budget_exhausted".to_string(),
                data: json!({"error": "context_budget_exhausted"}),
                error: Some("context_budget_exhausted".to_string()),
            };
        }
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.touch(session_id);
            session.session_summary = assembled.updated_session_summary.clone();
        }

        let (reply, executed_tools, llm_envelope, loop_error) =
            self.run_tool_loop(assembled.messages.clone(), &chat).await;

        match reply {
            Some(reply) => {
                {
                    let mut sessions = self.sessions.lock().await;
                    let session = sessions.touch(session_id);
                    session.append_event(TurnEvent::user(text.to_string()));
                    session.append_event(TurnEvent::assistant(reply.clone()));
                }
                let logged = self
                    .log_daily_turn(session_id, text, &reply, &worker_events)
                    .await;
                self.bump_memory_counter(logged).await;
                self.persist_session_turn(session_id, text, &reply, "llm.main_agent")
                    .await;

                ChatReply {
                    ok: true,
                    reply,
                    route: "llm.main_agent".to_string(),
                    data: json!({
                        "llm": llm_envelope,
                        "tool_execution": executed_tools,
                        "context_debug": {
                            "session_id": session_id,
                            "assembled_message_count": assembled.messages.len(),
                            "assembled_token_estimate": assembled.token_estimate,
                            "kept_context_source_ids": assembled.kept_context_source_ids,
                            "dropped_recent_events": assembled.dropped_recent_events,
                            "forwarded_worker_events_injected": worker_events.len(),
                            "forwarded_task_agent_events_injected": task_events.len(),
                        },
                    }),
                    error: None,
                }
            }
            None => {
                let error = loop_error.unwrap_or_else(|| "llm_error".to_string());
                let is_budget = error.ends_with("budget_exhausted");
                {
                    let mut sessions = self.sessions.lock().await;
                    let session = sessions.touch(session_id);
                    session.append_event(TurnEvent::user(text.to_string()));
                }
                let logged = self
                    .log_daily_turn(session_id, text, "provider_unavailable", &worker_events)
                    .await;
                self.bump_memory_counter(logged).await;
                let reply = if is_budget {
                    SAFE_BUDGET_REPLY.to_string()
                } else {
                    SAFE_PROVIDER_ERROR_REPLY.to_string()
                };
                self.persist_session_turn(session_id, text, &reply, "llm.error_fallback")
                    .await;
                ChatReply {
                    ok: true,
                    reply,
                    route: if is_budget {
                        "llm.budget_exhausted".to_string()
                    } else {
                        "llm.error_fallback".to_string()
                    },
                    data: json!({
                        "llm": llm_envelope,
                        "tool_execution": executed_tools,
                    }),
                    error: Some(error),
                }
            }
        }
    }
}
