// Task Runner
// Executes one claimed run: resolves the profile, then either forks a
// script subprocess under the task contract or drives an agentic
// sub-agent loop. Cancellation is cooperative at poll points.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use steward_agents::{
    load_context_files, normalize_task_agent_tool_access, SubAgentBudgets, SubAgentOptions,
    SubAgentRunner, TASK_AGENT_BASE_CONTEXT_FILES,
};
use steward_core::ConfigStore;
use steward_store::{DailyMemoryStore, SchedulerStore};
use steward_types::{ModelTier, RunOutcome, RunStatus, SubAgentStatus, TaskEnvelope, TaskKind, TaskProfile};
use uuid::Uuid;

/// Script stdout sentinels recognized by the runner.
const SENTINEL_WAITING: &str = "WAITING_FOR_USER:";
const SENTINEL_BLOCKED: &str = "BLOCKED:";

const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_AGENTIC_TIMEOUT: Duration = Duration::from_secs(120);
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
const SUMMARY_MAX_CHARS: usize = 2000;

/// Execution seam for the central service; tests substitute stubs.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn describe_run(&self, profile_id: &str, payload: &Value) -> String;
    async fn run_profile(
        &self,
        profile_id: &str,
        payload: &Value,
        cancel: CancellationToken,
    ) -> RunOutcome;
}

pub struct TaskRunner {
    store: Arc<SchedulerStore>,
    daily: Arc<DailyMemoryStore>,
    sub_agent: Arc<SubAgentRunner>,
    config: ConfigStore,
    root: PathBuf,
}

impl TaskRunner {
    pub fn new(
        store: Arc<SchedulerStore>,
        daily: Arc<DailyMemoryStore>,
        sub_agent: Arc<SubAgentRunner>,
        config: ConfigStore,
        root: PathBuf,
    ) -> Self {
        Self {
            store,
            daily,
            sub_agent,
            config,
            root,
        }
    }

    /// Resolve a profile from the registered table first, falling back to
    /// the config-declared profile map.
    async fn resolve_profile(&self, profile_id: &str) -> Option<TaskProfile> {
        if let Ok(Some(profile)) = self.store.get_task_profile(profile_id).await {
            return Some(profile);
        }
        let config = self.config.get().await;
        let declared = config
            .task_agents
            .get("profiles")
            .and_then(|profiles| profiles.get(profile_id))?;
        let kind = declared
            .get("kind")
            .and_then(Value::as_str)
            .and_then(TaskKind::parse)
            .unwrap_or(TaskKind::Agentic);
        Some(TaskProfile {
            task_id: profile_id.to_string(),
            name: declared
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(profile_id)
                .to_string(),
            kind,
            entrypoint_path: declared
                .get("entrypoint_path")
                .and_then(Value::as_str)
                .map(str::to_string),
            module: None,
            resources_path: declared
                .get("resources_path")
                .and_then(Value::as_str)
                .map(str::to_string),
            queue_group: None,
            timeout_sec: declared.get("timeout_sec").and_then(Value::as_u64),
            retry_policy: None,
            enabled: declared.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            source: "config".to_string(),
        })
    }

    async fn config_profile_field(&self, profile_id: &str, field: &str) -> Option<Value> {
        let config = self.config.get().await;
        config
            .task_agents
            .get("profiles")
            .and_then(|profiles| profiles.get(profile_id))
            .and_then(|profile| profile.get(field))
            .cloned()
    }

    fn instructions_for_run(profile_name: &str, template: Option<&str>, payload: &Value) -> String {
        let trigger = payload
            .get("trigger")
            .and_then(Value::as_str)
            .unwrap_or("scheduled");
        let mut run_context = format!("Run context:\n- trigger: {trigger}");
        if let Some(description) = payload.get("description").and_then(Value::as_str) {
            if !description.trim().is_empty() {
                run_context.push_str(&format!("\n- description: {}", description.trim()));
            }
        }
        let policy_hint = "Worker escalation policy:\n\
            - If you need to spawn a worker from this task-agent run, use `spawn_task_agent_worker`.\n\
            - Do not call `spawn_worker` directly from task-agent runs.";

        match template.map(str::trim).filter(|text| !text.is_empty()) {
            Some(template) => format!("{template}\n\n{run_context}\n\n{policy_hint}"),
            None => format!(
                "Execute task-agent profile `{profile_name}`.\n\n{run_context}\n\n{policy_hint}"
            ),
        }
    }

    async fn agentic_context(
        &self,
        profile_id: &str,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let base = load_context_files(&self.root, TASK_AGENT_BASE_CONTEXT_FILES);
        let mut supplemental = BTreeMap::new();
        if let Some(Value::Array(preload)) =
            self.config_profile_field(profile_id, "preload_files").await
        {
            let files: Vec<&str> = preload.iter().filter_map(Value::as_str).collect();
            supplemental.extend(load_context_files(&self.root, files));
        }
        let autoload_days = self.config.get().await.memory.autoload_summary_days;
        if let Ok(recent) = self.daily.load_recent_daily_memory(autoload_days).await {
            supplemental.extend(recent);
        }
        (base, supplemental)
    }

    async fn run_agentic(
        &self,
        profile_id: &str,
        profile: Option<&TaskProfile>,
        payload: &Value,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let profile_name = profile
            .map(|profile| profile.name.clone())
            .unwrap_or_else(|| profile_id.to_string());

        // `agentic_task` runs carry their own instructions in the payload;
        // profile runs build them from the instructions template.
        let (instructions, model_ref) = if profile_id == "agentic_task" {
            let instructions = payload
                .get("instructions")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if instructions.trim().is_empty() {
                return RunOutcome::failed("agentic run payload missing instructions");
            }
            let tier = payload
                .get("model_tier")
                .and_then(Value::as_str)
                .unwrap_or("medium")
                .to_string();
            (instructions, tier)
        } else {
            let template = self
                .config_profile_field(profile_id, "instructions_template")
                .await
                .and_then(|value| value.as_str().map(str::to_string));
            let model_alias = self
                .config_profile_field(profile_id, "model_alias")
                .await
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_else(|| "medium".to_string());
            (
                Self::instructions_for_run(&profile_name, template.as_deref(), payload),
                model_alias,
            )
        };

        // The model reference must resolve before any work starts.
        if let Err(err) = self.config.get().await.resolve_model(Some(&model_ref)) {
            return RunOutcome::failed(format!(
                "task profile `{profile_id}` has unresolved model `{model_ref}`: {err}"
            ));
        }

        let tool_access: Vec<String> = payload
            .get("tool_access")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let tool_access = if tool_access.is_empty() {
            match self.config_profile_field(profile_id, "tool_access").await {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            }
        } else {
            tool_access
        };
        let tool_access = normalize_task_agent_tool_access(&tool_access);
        let skill_access: Vec<String> = payload
            .get("skill_access")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let timeout = payload
            .get("timeout_sec")
            .and_then(Value::as_u64)
            .or(profile.and_then(|profile| profile.timeout_sec))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_AGENTIC_TIMEOUT);

        let task = TaskEnvelope::create(
            instructions,
            payload
                .get("requested_by")
                .and_then(Value::as_str)
                .unwrap_or(&format!("task_agent:{profile_id}"))
                .to_string(),
        )
        .with_tier(ModelTier::parse_lossy(&model_ref))
        .with_tool_access(tool_access)
        .with_skill_access(skill_access)
        .with_metadata(json!({
            "profile_id": profile_id,
            "profile_name": profile_name,
            "trigger": payload.get("trigger").cloned().unwrap_or(json!("scheduled")),
        }));

        let (base_context, supplemental_context) = self.agentic_context(profile_id).await;
        let options = SubAgentOptions {
            base_context,
            supplemental_context,
            facts: BTreeMap::new(),
            session_summary: None,
            model: Some(model_ref),
            budgets: Some(SubAgentBudgets {
                timeout,
                ..SubAgentBudgets::worker()
            }),
            allow_orchestration_tools: true,
            cancel: Some(cancel),
        };
        let run = self.sub_agent.run_task(&task, options).await;

        let llm_failure = run
            .result
            .artifacts
            .iter()
            .find(|artifact| artifact["type"] == "llm_failure")
            .map(|artifact| artifact["data"].clone());
        let attempts_used = llm_failure
            .as_ref()
            .and_then(|data| data["attempts_used"].as_u64())
            .map(|value| value as u32);
        let attempts_configured = llm_failure
            .as_ref()
            .and_then(|data| data["attempts_configured"].as_u64())
            .map(|value| value as u32);
        let retryable_error = llm_failure
            .as_ref()
            .and_then(|data| data["retryable_error"].as_bool())
            .unwrap_or(false);

        if run.result.error.as_deref() == Some(steward_agents::ERR_CANCELLED) {
            return RunOutcome {
                status: RunStatus::Blocked,
                summary: None,
                error: Some(steward_agents::ERR_CANCELLED.to_string()),
                retryable_error: false,
                attempts_used,
                attempts_configured,
                waiting_question: None,
                wait_context: None,
                wait_timeout_sec: None,
            };
        }

        match run.result.status {
            SubAgentStatus::Success => RunOutcome {
                status: RunStatus::Done,
                summary: Some(if run.result.summary.trim().is_empty() {
                    format!("{profile_name} run completed.")
                } else {
                    run.result.summary.clone()
                }),
                error: None,
                retryable_error: false,
                attempts_used,
                attempts_configured,
                waiting_question: None,
                wait_context: None,
                wait_timeout_sec: None,
            },
            SubAgentStatus::NeedsUserInput => RunOutcome {
                status: RunStatus::WaitingForUser,
                summary: Some(run.result.summary.clone()),
                error: None,
                retryable_error: false,
                attempts_used,
                attempts_configured,
                waiting_question: Some(run.result.summary.clone()),
                wait_context: Some(json!({"profile_id": profile_id})),
                wait_timeout_sec: payload.get("wait_timeout_sec").and_then(Value::as_u64),
            },
            SubAgentStatus::Failed => RunOutcome {
                status: RunStatus::Failed,
                summary: None,
                error: run.result.error.clone(),
                retryable_error,
                attempts_used,
                attempts_configured,
                waiting_question: None,
                wait_context: None,
                wait_timeout_sec: None,
            },
        }
    }

    async fn run_script(
        &self,
        profile: &TaskProfile,
        payload: &Value,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let Some(entrypoint) = profile
            .entrypoint_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
        else {
            return RunOutcome::failed(format!(
                "script profile `{}` missing entrypoint",
                profile.task_id
            ));
        };
        let entrypoint_abs = self.root.join(entrypoint);
        let resources_dir = profile
            .resources_path
            .as_deref()
            .map(|path| self.root.join(path))
            .unwrap_or_else(|| self.root.join("resources").join(&profile.task_id));
        let timeout = profile
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SCRIPT_TIMEOUT);

        let task_run_id = format!("srun_{}", Uuid::new_v4().simple());
        let mut command = Command::new(&entrypoint_abs);
        command
            .current_dir(&self.root)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", std::env::var("HOME").unwrap_or_default())
            .env("TASK_ID", &profile.task_id)
            .env("TASK_RUN_ID", &task_run_id)
            .env("TASK_PAYLOAD_JSON", payload.to_string())
            .env(
                "TASK_PROFILE_JSON",
                serde_json::to_string(profile).unwrap_or_else(|_| "{}".to_string()),
            )
            .env("TASK_RESOURCES_DIR", resources_dir.display().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            // Own process group so cooperative cancel reaches the whole tree.
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return RunOutcome::failed(format!("failed to spawn `{entrypoint}`: {err}"));
            }
        };
        let pid = child.id();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buffer).await;
            }
            buffer
        });
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buffer).await;
            }
            buffer
        });

        enum WaitOutcome {
            Exited(Option<std::process::ExitStatus>),
            Cancelled,
            TimedOut,
        }
        let waited = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status.ok()),
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
        };
        let (exit, cancelled, timed_out) = match waited {
            WaitOutcome::Exited(status) => (status, false, false),
            WaitOutcome::Cancelled => {
                terminate_process_tree(&mut child, pid).await;
                (None, true, false)
            }
            WaitOutcome::TimedOut => {
                terminate_process_tree(&mut child, pid).await;
                (None, false, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if cancelled {
            return RunOutcome {
                status: RunStatus::Blocked,
                summary: None,
                error: Some(steward_agents::ERR_CANCELLED.to_string()),
                retryable_error: false,
                attempts_used: None,
                attempts_configured: None,
                waiting_question: None,
                wait_context: None,
                wait_timeout_sec: None,
            };
        }
        if timed_out {
            return RunOutcome::failed(format!(
                "script `{entrypoint}` exceeded timeout of {}s",
                timeout.as_secs()
            ));
        }

        // Sentinels override the exit-code mapping.
        for line in stdout.lines().rev() {
            let line = line.trim();
            if let Some(question) = line.strip_prefix(SENTINEL_WAITING) {
                return RunOutcome {
                    status: RunStatus::WaitingForUser,
                    summary: None,
                    error: None,
                    retryable_error: false,
                    attempts_used: None,
                    attempts_configured: None,
                    waiting_question: Some(question.trim().to_string()),
                    wait_context: Some(json!({"profile_id": profile.task_id})),
                    wait_timeout_sec: None,
                };
            }
            if let Some(reason) = line.strip_prefix(SENTINEL_BLOCKED) {
                return RunOutcome::blocked(reason.trim().to_string());
            }
        }

        let summary = {
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                None
            } else {
                let mut text = trimmed.to_string();
                if text.len() > SUMMARY_MAX_CHARS {
                    text = text
                        .chars()
                        .skip(text.chars().count().saturating_sub(SUMMARY_MAX_CHARS))
                        .collect();
                }
                Some(text)
            }
        };

        match exit {
            Some(status) if status.success() => RunOutcome {
                status: RunStatus::Done,
                summary,
                error: None,
                retryable_error: false,
                attempts_used: None,
                attempts_configured: None,
                waiting_question: None,
                wait_context: None,
                wait_timeout_sec: None,
            },
            Some(status) => {
                let code = status.code().map(|code| code.to_string()).unwrap_or_else(|| "signal".to_string());
                let mut error = format!("script exited with status {code}");
                let stderr_tail = stderr.trim();
                if !stderr_tail.is_empty() {
                    let tail: String = stderr_tail
                        .chars()
                        .skip(stderr_tail.chars().count().saturating_sub(400))
                        .collect();
                    error.push_str(&format!(": {tail}"));
                }
                RunOutcome::failed(error)
            }
            None => RunOutcome::failed("script terminated without exit status"),
        }
    }
}

/// Graceful-then-forceful stop of the subprocess tree.
async fn terminate_process_tree(child: &mut tokio::process::Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
        let _ = child.wait().await;
        return;
    }
    let _ = pid;
    let _ = child.kill().await;
}

#[async_trait]
impl RunExecutor for TaskRunner {
    async fn describe_run(&self, profile_id: &str, _payload: &Value) -> String {
        let profile_name = self
            .resolve_profile(profile_id)
            .await
            .map(|profile| profile.name)
            .unwrap_or_else(|| profile_id.to_string());
        match self
            .config_profile_field(profile_id, "instructions_template")
            .await
            .and_then(|value| value.as_str().map(str::to_string))
        {
            Some(template) => {
                let mut text = template.replace('\n', " ").trim().to_string();
                if text.len() > 160 {
                    text.truncate(157);
                    text.push_str("...");
                }
                format!("{profile_name}: {text}")
            }
            None => format!("{profile_name}: processing scheduled task run."),
        }
    }

    async fn run_profile(
        &self,
        profile_id: &str,
        payload: &Value,
        cancel: CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome {
                status: RunStatus::Blocked,
                summary: None,
                error: Some(steward_agents::ERR_CANCELLED.to_string()),
                retryable_error: false,
                attempts_used: None,
                attempts_configured: None,
                waiting_question: None,
                wait_context: None,
                wait_timeout_sec: None,
            };
        }

        let profile = self.resolve_profile(profile_id).await;
        if profile_id == "agentic_task" {
            return self
                .run_agentic(profile_id, profile.as_ref(), payload, cancel)
                .await;
        }
        let Some(profile) = profile else {
            return RunOutcome::failed(format!("task profile `{profile_id}` not found"));
        };
        if !profile.enabled {
            return RunOutcome::blocked(format!("task profile `{profile_id}` is disabled"));
        }
        match profile.kind {
            TaskKind::Script => self.run_script(&profile, payload, cancel).await,
            TaskKind::Agentic | TaskKind::InteractiveWrapper => {
                self.run_agentic(profile_id, Some(&profile), payload, cancel)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use steward_providers::LlmCaller;
    use steward_store::{ensure_schema, DbQueue};
    use steward_tools::ToolRegistry;
    use steward_types::{LlmRequest, LlmResponse};

    struct TextLlm(String);

    #[async_trait]
    impl LlmCaller for TextLlm {
        async fn call(&self, _request: LlmRequest) -> LlmResponse {
            LlmResponse {
                ok: true,
                provider: Some("scripted".to_string()),
                model: None,
                text: Some(self.0.clone()),
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
    }

    async fn runner(dir: &tempfile::TempDir, reply: &str) -> TaskRunner {
        let config_path = dir.path().join("config").join("config.json");
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(
            &config_path,
            r#"{
                "timezone": "UTC",
                "default_model_alias": "medium",
                "models": {
                    "vendor/model": {
                        "provider": "echo",
                        "endpoint": "vendor/model",
                        "max_context_tokens": 40000,
                        "max_output_tokens": 2000,
                        "alias": "medium"
                    }
                },
                "task_agents": {
                    "profiles": {
                        "daily_digest": {
                            "name": "Daily Digest",
                            "instructions_template": "Prepare the daily digest.",
                            "model_alias": "medium",
                            "tool_access": ["spawn_worker"]
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        let config = ConfigStore::for_root(dir.path());
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        ensure_schema(&queue).await.unwrap();
        let store = Arc::new(SchedulerStore::new(queue.clone()));
        let daily = Arc::new(DailyMemoryStore::new(queue, Some("UTC".to_string())));
        let sub_agent = Arc::new(SubAgentRunner::new(
            Arc::new(TextLlm(reply.to_string())),
            ToolRegistry::new(),
            config.clone(),
        ));
        TaskRunner::new(store, daily, sub_agent, config, dir.path().to_path_buf())
    }

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        let path = scripts.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        format!("scripts/{name}")
    }

    fn script_profile(dir: &tempfile::TempDir, name: &str, body: &str) -> TaskProfile {
        TaskProfile {
            task_id: format!("script_{name}"),
            name: name.to_string(),
            kind: TaskKind::Script,
            entrypoint_path: Some(write_script(dir, name, body)),
            module: None,
            resources_path: None,
            queue_group: None,
            timeout_sec: Some(5),
            retry_policy: None,
            enabled: true,
            source: "config".to_string(),
        }
    }

    #[tokio::test]
    async fn script_exit_zero_maps_to_done_with_stdout_summary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let profile = script_profile(&dir, "ok.sh", "echo processed 7 items");
        runner.store.upsert_task_profile(&profile).await.unwrap();

        let outcome = runner
            .run_profile(&profile.task_id, &json!({}), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.summary.as_deref(), Some("processed 7 items"));
    }

    #[tokio::test]
    async fn script_nonzero_exit_maps_to_failed_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let profile = script_profile(&dir, "fail.sh", "echo boom >&2\nexit 3");
        runner.store.upsert_task_profile(&profile).await.unwrap();

        let outcome = runner
            .run_profile(&profile.task_id, &json!({}), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        let error = outcome.error.unwrap();
        assert!(error.contains("status 3"));
        assert!(error.contains("boom"));
    }

    #[tokio::test]
    async fn script_waiting_sentinel_requests_user_input() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let profile = script_profile(
            &dir,
            "wait.sh",
            "echo 'WAITING_FOR_USER: Which account should I use?'",
        );
        runner.store.upsert_task_profile(&profile).await.unwrap();

        let outcome = runner
            .run_profile(&profile.task_id, &json!({}), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::WaitingForUser);
        assert_eq!(
            outcome.waiting_question.as_deref(),
            Some("Which account should I use?")
        );
    }

    #[tokio::test]
    async fn script_env_carries_task_contract() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let profile = script_profile(&dir, "env.sh", "echo \"$TASK_ID|$TASK_PAYLOAD_JSON\"");
        runner.store.upsert_task_profile(&profile).await.unwrap();

        let outcome = runner
            .run_profile(
                &profile.task_id,
                &json!({"trigger": "manual"}),
                CancellationToken::new(),
            )
            .await;
        let summary = outcome.summary.unwrap();
        assert!(summary.starts_with(&format!("{}|", profile.task_id)));
        assert!(summary.contains("\"trigger\":\"manual\""));
    }

    #[tokio::test]
    async fn script_cancel_terminates_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let profile = script_profile(&dir, "sleep.sh", "sleep 30");
        runner.store.upsert_task_profile(&profile).await.unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel_clone.cancel();
        });
        let started = tokio::time::Instant::now();
        let outcome = runner
            .run_profile(&profile.task_id, &json!({}), cancel)
            .await;
        assert_eq!(outcome.status, RunStatus::Blocked);
        assert_eq!(outcome.error.as_deref(), Some("cancel_requested"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn agentic_profile_runs_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "digest prepared and filed").await;
        let outcome = runner
            .run_profile(
                "daily_digest",
                &json!({"trigger": "scheduled"}),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.summary.as_deref(), Some("digest prepared and filed"));
    }

    #[tokio::test]
    async fn agentic_task_payload_drives_manual_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "manual task finished").await;
        let outcome = runner
            .run_profile(
                "agentic_task",
                &json!({
                    "instructions": "do a one-off chore",
                    "model_tier": "medium",
                    "requested_by": "main_agent",
                }),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.summary.as_deref(), Some("manual task finished"));
    }

    #[tokio::test]
    async fn unknown_profile_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let outcome = runner
            .run_profile("missing_profile", &json!({}), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn describe_run_truncates_template() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "unused").await;
        let description = runner.describe_run("daily_digest", &json!({})).await;
        assert_eq!(description, "Daily Digest: Prepare the daily digest.");
    }
}
