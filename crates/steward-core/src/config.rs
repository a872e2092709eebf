use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Result, StewardError};

/// Per-model entry in the `models` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub max_context_tokens: u64,
    #[serde(default)]
    pub max_output_tokens: u64,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Provider credentials and transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub apikey: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_backoff_schedule_sec: Option<Vec<f64>>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub app_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemPolicyConfig {
    #[serde(default = "default_access")]
    pub default_access: String,
    #[serde(default = "default_allow_read")]
    pub allow_read: Vec<String>,
    #[serde(default = "default_allow_write")]
    pub allow_write: Vec<String>,
    #[serde(default = "default_deny")]
    pub deny: Vec<String>,
}

fn default_access() -> String {
    "deny".to_string()
}

fn default_allow_read() -> Vec<String> {
    vec!["**".to_string()]
}

fn default_allow_write() -> Vec<String> {
    vec!["memory/**".to_string(), "outputs/**".to_string()]
}

fn default_deny() -> Vec<String> {
    vec![
        "config/config.json".to_string(),
        ".git/**".to_string(),
        ".venv/**".to_string(),
        "target/**".to_string(),
    ]
}

impl Default for FilesystemPolicyConfig {
    fn default() -> Self {
        Self {
            default_access: default_access(),
            allow_read: default_allow_read(),
            allow_write: default_allow_write(),
            deny: default_deny(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralServiceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_poll_interval_sec: u64,
    #[serde(default = "default_task_concurrency")]
    pub task_runner_concurrency: usize,
    #[serde(default = "default_scheduler_db_path")]
    pub scheduler_db_path: String,
    #[serde(default = "default_retention_days")]
    pub run_history_retention_days: u32,
    #[serde(default = "default_history_rows")]
    pub run_history_max_rows: u32,
    #[serde(default = "default_sweep_interval")]
    pub memory_manager_sweep_interval_sec: u64,
    #[serde(default = "default_completion_debounce")]
    pub memory_manager_completion_debounce_sec: u64,
    #[serde(default = "default_queue_warning")]
    pub queue_warning_threshold: u32,
    #[serde(default = "default_running_age_warning")]
    pub running_age_warning_sec: u64,
    #[serde(default = "default_busy_timeout")]
    pub db_queue_busy_timeout_ms: u64,
    #[serde(default = "default_max_rows")]
    pub db_queue_default_max_rows: usize,
    #[serde(default = "default_waiting_timeout")]
    pub waiting_for_user_timeout_sec: u64,
}

fn default_heartbeat_interval() -> u64 {
    3600
}
fn default_task_concurrency() -> usize {
    2
}
fn default_scheduler_db_path() -> String {
    "memory/central/steward_core.db".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_history_rows() -> u32 {
    5000
}
fn default_sweep_interval() -> u64 {
    12 * 60 * 60
}
fn default_completion_debounce() -> u64 {
    5 * 60
}
fn default_queue_warning() -> u32 {
    25
}
fn default_running_age_warning() -> u64 {
    1800
}
fn default_busy_timeout() -> u64 {
    5000
}
fn default_max_rows() -> usize {
    500
}
fn default_waiting_timeout() -> u64 {
    24 * 60 * 60
}

impl Default for CentralServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_poll_interval_sec: default_heartbeat_interval(),
            task_runner_concurrency: default_task_concurrency(),
            scheduler_db_path: default_scheduler_db_path(),
            run_history_retention_days: default_retention_days(),
            run_history_max_rows: default_history_rows(),
            memory_manager_sweep_interval_sec: default_sweep_interval(),
            memory_manager_completion_debounce_sec: default_completion_debounce(),
            queue_warning_threshold: default_queue_warning(),
            running_age_warning_sec: default_running_age_warning(),
            db_queue_busy_timeout_ms: default_busy_timeout(),
            db_queue_default_max_rows: default_max_rows(),
            waiting_for_user_timeout_sec: default_waiting_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_autoload_days")]
    pub autoload_summary_days: u32,
    #[serde(default = "default_summary_poll")]
    pub summary_worker_poll_sec: u64,
    #[serde(default = "default_jobs_per_tick")]
    pub summary_worker_max_jobs_per_tick: usize,
    #[serde(default)]
    pub daily_summary_use_model: bool,
    #[serde(default = "default_turn_threshold")]
    pub realtime_summary_turn_threshold: u32,
}

fn default_autoload_days() -> u32 {
    2
}
fn default_summary_poll() -> u64 {
    15
}
fn default_jobs_per_tick() -> usize {
    1
}
fn default_turn_threshold() -> u32 {
    6
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            autoload_summary_days: default_autoload_days(),
            summary_worker_poll_sec: default_summary_poll(),
            summary_worker_max_jobs_per_tick: default_jobs_per_tick(),
            daily_summary_use_model: false,
            realtime_summary_turn_threshold: default_turn_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_workers")]
    pub max_concurrent_workers: usize,
}

fn default_max_workers() -> usize {
    3
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_steps")]
    pub max_steps: u32,
    #[serde(default = "default_chat_tool_calls")]
    pub max_tool_calls: u32,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_sec: u64,
    #[serde(default = "default_session_cap")]
    pub session_cap: usize,
    #[serde(default = "default_recent_events")]
    pub recent_event_cap: usize,
    #[serde(default)]
    pub persist_session_events: bool,
}

fn default_chat_steps() -> u32 {
    8
}
fn default_chat_tool_calls() -> u32 {
    6
}
fn default_session_ttl() -> u64 {
    12 * 60 * 60
}
fn default_session_cap() -> usize {
    24
}
fn default_recent_events() -> usize {
    60
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_steps: default_chat_steps(),
            max_tool_calls: default_chat_tool_calls(),
            session_ttl_sec: default_session_ttl(),
            session_cap: default_session_cap(),
            recent_event_cap: default_recent_events(),
            persist_session_events: false,
        }
    }
}

/// Full parsed configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigData {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub home_location: Option<Value>,
    #[serde(default)]
    pub default_model_alias: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub model_providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub filesystem: FilesystemPolicyConfig,
    #[serde(default)]
    pub central_service: CentralServiceConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
    #[serde(default)]
    pub task_agents: Value,
    #[serde(default)]
    pub defined_tasks: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub apikey: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ConfigData {
    /// Resolve a model by id, alias, or the default alias when `model_ref`
    /// is absent. Aliases must be unique across models.
    pub fn resolve_model(&self, model_ref: Option<&str>) -> Result<(String, ModelConfig)> {
        match model_ref {
            Some(reference) => {
                if let Some(model) = self.models.get(reference) {
                    return Ok((reference.to_string(), model.clone()));
                }
                self.model_by_alias(reference)
            }
            None => {
                let alias = self
                    .default_model_alias
                    .as_deref()
                    .filter(|alias| !alias.is_empty())
                    .ok_or_else(|| {
                        StewardError::InvalidConfig(
                            "config requires non-empty `default_model_alias`".to_string(),
                        )
                    })?;
                self.model_by_alias(alias)
            }
        }
    }

    fn model_by_alias(&self, alias: &str) -> Result<(String, ModelConfig)> {
        let mut matches: Vec<(String, ModelConfig)> = self
            .models
            .iter()
            .filter(|(_, model)| model.alias.as_deref() == Some(alias))
            .map(|(id, model)| (id.clone(), model.clone()))
            .collect();
        match matches.len() {
            0 => Err(StewardError::NotFound(format!(
                "no model found for alias `{alias}`"
            ))),
            1 => Ok(matches.remove(0)),
            _ => Err(StewardError::InvalidConfig(format!(
                "alias `{alias}` is not unique across models"
            ))),
        }
    }

    pub fn provider(&self, name: &str) -> Result<ProviderConfig> {
        self.model_providers
            .get(name)
            .cloned()
            .ok_or_else(|| StewardError::NotFound(format!("model provider `{name}` is not defined")))
    }

    /// Token limits for a resolved model; both limits must be positive.
    pub fn model_token_limits(&self, model_ref: Option<&str>) -> Result<(u64, u64)> {
        let (model_id, model) = self.resolve_model(model_ref)?;
        if model.max_context_tokens == 0 {
            return Err(StewardError::InvalidConfig(format!(
                "model `{model_id}` requires positive max_context_tokens"
            )));
        }
        if model.max_output_tokens == 0 {
            return Err(StewardError::InvalidConfig(format!(
                "model `{model_id}` requires positive max_output_tokens"
            )));
        }
        Ok((model.max_context_tokens, model.max_output_tokens))
    }
}

/// Cached JSON config loader. Reload happens when the file mtime changes;
/// `clear_cache` forces the next read to hit disk.
#[derive(Clone)]
pub struct ConfigStore {
    root: PathBuf,
    path: PathBuf,
    cache: Arc<RwLock<Option<(SystemTime, Arc<ConfigData>)>>>,
}

impl ConfigStore {
    pub fn new(root: impl AsRef<Path>, config_path: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let raw = config_path.as_ref();
        let path = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            root.join(raw)
        };
        Self {
            root,
            path,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Conventional layout: `<root>/config/config.json`.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let path = root.join("config").join("config.json");
        Self::new(root, path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }

    /// Load the config, reusing the cache while the file mtime is unchanged.
    /// A missing file yields defaults so daemons keep running.
    pub async fn get(&self) -> Arc<ConfigData> {
        match self.load().await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("config load failed, using defaults: {err}");
                Arc::new(ConfigData::default())
            }
        }
    }

    pub async fn load(&self) -> Result<Arc<ConfigData>> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|_| {
            StewardError::NotFound(format!("config file not found: {}", self.path.display()))
        })?;
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if let Some((cached_mtime, cached)) = self.cache.read().await.as_ref() {
            if *cached_mtime == mtime {
                return Ok(cached.clone());
            }
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let data: ConfigData = serde_json::from_str(&raw).map_err(|err| {
            StewardError::InvalidConfig(format!(
                "invalid JSON in config file {}: {err}",
                self.path.display()
            ))
        })?;
        let data = Arc::new(data);
        *self.cache.write().await = Some((mtime, data.clone()));
        Ok(data)
    }
}
