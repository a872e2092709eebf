use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::sleep;

use steward_core::{ConfigStore, ProviderConfig};
use steward_types::{ChatMessage, FunctionCall, LlmRequest, LlmResponse, TokenUsage, ToolCallPayload};

pub const DEFAULT_RETRY_BACKOFF_SCHEDULE_SEC: [f64; 3] = [1.0, 3.0, 5.0];
const DEFAULT_PROVIDER_TIMEOUT_SEC: u64 = 30;

const RETRYABLE_HTTP_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Wire-level request handed to one provider implementation.
#[derive(Debug, Clone)]
pub struct ProviderChatRequest {
    pub endpoint: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<Value>>,
    pub max_output_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub timeout: Duration,
}

/// Successful provider reply, pre-normalization.
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub text: Option<String>,
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Provider failure with transient-error classification baked in.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Upstream returned an HTTP error status.
    Http { status: u16, detail: String },
    /// DNS failures, socket timeouts, connect errors, OS-level networking.
    Network(String),
    /// Malformed or contentless provider payloads.
    Protocol(String),
    /// Missing or rejected credentials; never retried.
    Auth(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => RETRYABLE_HTTP_STATUSES.contains(status),
            ProviderError::Network(_) => true,
            ProviderError::Protocol(detail) => http_code_from_text(detail)
                .map(|code| RETRYABLE_HTTP_STATUSES.contains(&code))
                .unwrap_or(false),
            ProviderError::Auth(_) => false,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ProviderError::Http { status, detail } => format!("HTTP {status}: {detail}"),
            ProviderError::Network(detail) => detail.clone(),
            ProviderError::Protocol(detail) => detail.clone(),
            ProviderError::Auth(detail) => detail.clone(),
        }
    }
}

/// Scan wrapper error text for an embedded `HTTP <code>` marker.
fn http_code_from_text(text: &str) -> Option<u16> {
    let idx = text.find("HTTP ")?;
    let digits: String = text[idx + 5..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    if digits.len() == 3 {
        digits.parse().ok()
    } else {
        None
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, request: ProviderChatRequest) -> Result<ProviderReply, ProviderError>;
}

// ============================================================================
// OpenAI-compatible provider
// ============================================================================

/// Chat-completions provider for OpenAI-compatible endpoints (OpenRouter and
/// friends). Non-streaming; tool definitions pass through as-is.
pub struct OpenAiCompatibleProvider {
    name: String,
    base_url: String,
    api_key: String,
    referer: Option<String>,
    app_title: Option<String>,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: normalize_base(&base_url.into()),
            api_key: api_key.into(),
            referer: None,
            app_title: None,
            client: Client::new(),
        }
    }

    pub fn with_attribution(mut self, referer: Option<String>, app_title: Option<String>) -> Self {
        self.referer = referer;
        self.app_title = app_title;
        self
    }
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

fn extract_error_detail(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|err| err.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_string))
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ProviderChatRequest) -> Result<ProviderReply, ProviderError> {
        let mut body = json!({
            "model": request.endpoint,
            "messages": request.messages,
            "stream": false,
        });
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.clone());
                body["tool_choice"] = json!("auto");
            }
        }
        if let Some(max_tokens) = request.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let mut req = self
            .client
            .post(&self.base_url)
            .timeout(request.timeout)
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(referer) = &self.referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.app_title {
            req = req.header("X-Title", title);
        }

        let response = req.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                ProviderError::Network(err.to_string())
            } else {
                ProviderError::Protocol(err.to_string())
            }
        })?;

        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Protocol(format!("invalid provider JSON: {err}")))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            let detail = extract_error_detail(&value)
                .unwrap_or_else(|| format!("provider authentication failed with status {status}"));
            return Err(ProviderError::Auth(detail));
        }
        if !status.is_success() {
            let detail = extract_error_detail(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            return Err(ProviderError::Http {
                status: status.as_u16(),
                detail,
            });
        }
        if let Some(detail) = extract_error_detail(&value) {
            return Err(ProviderError::Protocol(detail));
        }

        let message = value
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .cloned()
            .ok_or_else(|| {
                ProviderError::Protocol("provider returned no completion choices".to_string())
            })?;

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|content| !content.is_empty());
        let tool_calls: Option<Vec<ToolCallPayload>> = message
            .get("tool_calls")
            .and_then(|calls| serde_json::from_value(calls.clone()).ok())
            .filter(|calls: &Vec<ToolCallPayload>| !calls.is_empty());
        let finish_reason = value
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage: Option<TokenUsage> = value
            .get("usage")
            .and_then(|usage| serde_json::from_value(usage.clone()).ok());

        Ok(ProviderReply {
            text,
            tool_calls,
            finish_reason,
            usage,
        })
    }
}

// ============================================================================
// Test/offline provider
// ============================================================================

/// Echo provider for wiring tests and offline runs.
pub struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, request: ProviderChatRequest) -> Result<ProviderReply, ProviderError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(ProviderReply {
            text: Some(format!("Echo: {last_user}")),
            tool_calls: None,
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }
}

// ============================================================================
// LLM client
// ============================================================================

/// Resolves model + provider from config and executes one provider call
/// with retries on classified transient errors.
#[derive(Clone)]
pub struct LlmClient {
    config: ConfigStore,
    provider_override: Option<Arc<dyn ChatProvider>>,
}

impl LlmClient {
    pub fn new(config: ConfigStore) -> Self {
        Self {
            config,
            provider_override: None,
        }
    }

    /// Replace provider construction with a fixed implementation. Used by
    /// tests and offline wiring.
    pub fn with_provider(config: ConfigStore, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            config,
            provider_override: Some(provider),
        }
    }

    fn build_provider(
        &self,
        provider_name: &str,
        provider_cfg: &ProviderConfig,
    ) -> Result<Arc<dyn ChatProvider>, String> {
        if let Some(provider) = &self.provider_override {
            return Ok(provider.clone());
        }
        match provider_name {
            "openrouter" | "openai" | "openai_compatible" => {
                let api_key = provider_cfg
                    .apikey
                    .as_deref()
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .ok_or_else(|| format!("provider `{provider_name}` API key missing"))?;
                let base_url = provider_cfg
                    .base_url
                    .as_deref()
                    .unwrap_or("https://openrouter.ai/api/v1");
                Ok(Arc::new(
                    OpenAiCompatibleProvider::new(provider_name, base_url, api_key)
                        .with_attribution(
                            provider_cfg.referer.clone(),
                            provider_cfg.app_title.clone(),
                        ),
                ))
            }
            "echo" => Ok(Arc::new(EchoProvider)),
            other => Err(format!("unsupported provider `{other}`")),
        }
    }

    /// One model call. Always returns a structured envelope; errors never
    /// cross this boundary as panics or exceptions.
    pub async fn call(&self, request: LlmRequest) -> LlmResponse {
        let config = self.config.get().await;

        let (model_id, model_cfg) = match config.resolve_model(request.model.as_deref()) {
            Ok(resolved) => resolved,
            Err(err) => return LlmResponse::failure(err.to_string()),
        };
        let provider_name = match model_cfg.provider.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let mut failure =
                    LlmResponse::failure(format!("model `{model_id}` missing provider"));
                failure.model = Some(model_id);
                return failure;
            }
        };
        let endpoint = match model_cfg.endpoint.as_deref().filter(|ep| !ep.is_empty()) {
            Some(endpoint) => endpoint.to_string(),
            None => {
                let mut failure =
                    LlmResponse::failure(format!("model `{model_id}` missing endpoint"));
                failure.provider = Some(provider_name);
                failure.model = Some(model_id);
                return failure;
            }
        };

        let provider_cfg = config
            .model_providers
            .get(&provider_name)
            .cloned()
            .unwrap_or_default();
        let schedule = retry_schedule(&provider_cfg);
        let attempts_configured = provider_cfg
            .retry_attempts
            .filter(|attempts| *attempts > 0)
            .map(|attempts| attempts.max(schedule.len() as u32 + 1))
            .unwrap_or(schedule.len() as u32 + 1);

        let provider = match self.build_provider(&provider_name, &provider_cfg) {
            Ok(provider) => provider,
            Err(err) => {
                let mut failure = LlmResponse::failure(err);
                failure.provider = Some(provider_name);
                failure.model = Some(model_id);
                failure.attempts_configured = attempts_configured;
                failure.retry_backoff_schedule_sec = schedule;
                return failure;
            }
        };

        let timeout = Duration::from_secs(
            request
                .timeout_sec
                .or(provider_cfg.timeout_sec)
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SEC),
        );
        let max_output_tokens = request.max_output_tokens.or(Some(model_cfg.max_output_tokens));
        let wire_request = ProviderChatRequest {
            endpoint,
            messages: request.messages,
            tools: request.tools,
            max_output_tokens,
            temperature: request.temperature,
            timeout,
        };

        let mut last_error: Option<ProviderError> = None;
        for attempt in 1..=attempts_configured {
            match provider.chat(wire_request.clone()).await {
                Ok(reply) => {
                    return LlmResponse {
                        ok: true,
                        provider: Some(provider_name.clone()),
                        model: Some(model_id.clone()),
                        text: reply.text,
                        tool_calls: reply.tool_calls,
                        finish_reason: reply.finish_reason,
                        usage: reply.usage,
                        error: None,
                        attempts_used: attempt,
                        attempts_configured,
                        retryable_error: false,
                        retry_backoff_schedule_sec: schedule.clone(),
                    };
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    tracing::debug!(
                        provider = %provider_name,
                        attempt,
                        retryable,
                        "provider call failed: {}",
                        err.detail()
                    );
                    if !retryable || attempt >= attempts_configured {
                        return LlmResponse {
                            ok: false,
                            provider: Some(provider_name.clone()),
                            model: Some(model_id.clone()),
                            text: None,
                            tool_calls: None,
                            finish_reason: None,
                            usage: None,
                            error: Some(err.detail()),
                            attempts_used: attempt,
                            attempts_configured,
                            retryable_error: retryable,
                            retry_backoff_schedule_sec: schedule.clone(),
                        };
                    }
                    let delay_idx = (attempt as usize - 1).min(schedule.len().saturating_sub(1));
                    let delay = schedule.get(delay_idx).copied().unwrap_or(0.0);
                    if delay > 0.0 {
                        sleep(Duration::from_secs_f64(delay)).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        // Unreachable with attempts >= 1, kept as a structured fallback.
        LlmResponse {
            ok: false,
            provider: Some(provider_name),
            model: Some(model_id),
            text: None,
            tool_calls: None,
            finish_reason: None,
            usage: None,
            error: last_error.map(|err| err.detail()),
            attempts_used: attempts_configured,
            attempts_configured,
            retryable_error: true,
            retry_backoff_schedule_sec: schedule,
        }
    }
}

/// Call-shaped seam for injecting fake models into agent loops.
#[async_trait]
pub trait LlmCaller: Send + Sync {
    async fn call(&self, request: LlmRequest) -> LlmResponse;
}

#[async_trait]
impl LlmCaller for LlmClient {
    async fn call(&self, request: LlmRequest) -> LlmResponse {
        LlmClient::call(self, request).await
    }
}

fn retry_schedule(provider_cfg: &ProviderConfig) -> Vec<f64> {
    let raw = provider_cfg
        .retry_backoff_schedule_sec
        .clone()
        .unwrap_or_else(|| DEFAULT_RETRY_BACKOFF_SCHEDULE_SEC.to_vec());
    let cleaned: Vec<f64> = raw.into_iter().filter(|delay| *delay >= 0.0).collect();
    if cleaned.is_empty() {
        DEFAULT_RETRY_BACKOFF_SCHEDULE_SEC.to_vec()
    } else {
        cleaned
    }
}

/// Canonicalize tool-call arguments to a structured object. Malformed JSON
/// strings are reported back to the loop instead of aborting it.
pub fn canonicalize_tool_arguments(call: &FunctionCall) -> Result<Value, String> {
    match &call.arguments {
        Value::Object(_) => Ok(call.arguments.clone()),
        Value::Null => Ok(Value::Object(Default::default())),
        Value::String(raw) => {
            if raw.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(Value::Object(map)),
                Ok(_) => Err(format!("arguments for `{}` are not a JSON object", call.name)),
                Err(_) => Err(format!("invalid JSON arguments for `{}`", call.name)),
            }
        }
        _ => Err(format!("arguments for `{}` are not a JSON object", call.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Provider that replays a fixed error/reply script.
    pub struct ScriptedProvider {
        calls: AtomicU32,
        script: Mutex<Vec<Result<ProviderReply, ProviderError>>>,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<Result<ProviderReply, ProviderError>>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            _request: ProviderChatRequest,
        ) -> Result<ProviderReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().await;
            if script.is_empty() {
                return Ok(ProviderReply {
                    text: Some("done".to_string()),
                    ..Default::default()
                });
            }
            script.remove(0)
        }
    }

    fn config_store(dir: &tempfile::TempDir, backoff: &str) -> ConfigStore {
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            format!(
                r#"{{
                    "default_model_alias": "medium",
                    "models": {{
                        "vendor/model": {{
                            "provider": "openrouter",
                            "endpoint": "vendor/model",
                            "max_context_tokens": 400000,
                            "max_output_tokens": 16000,
                            "alias": "medium"
                        }}
                    }},
                    "model_providers": {{
                        "openrouter": {{
                            "apikey": "sk-test",
                            "retry_backoff_schedule_sec": {backoff}
                        }}
                    }}
                }}"#
            ),
        )
        .unwrap();
        ConfigStore::new(dir.path(), path)
    }

    fn transient() -> ProviderError {
        ProviderError::Http {
            status: 503,
            detail: "upstream unavailable".to_string(),
        }
    }

    #[test]
    fn classification_matches_transient_set() {
        for status in [408u16, 425, 429, 500, 502, 503, 504] {
            assert!(ProviderError::Http {
                status,
                detail: String::new()
            }
            .is_retryable());
        }
        assert!(!ProviderError::Http {
            status: 400,
            detail: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Network("dns failure".to_string()).is_retryable());
        assert!(!ProviderError::Auth("bad key".to_string()).is_retryable());
        assert!(
            ProviderError::Protocol("wrapped: HTTP 429 from upstream".to_string()).is_retryable()
        );
        assert!(!ProviderError::Protocol("no content".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn retries_until_success_with_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_store(&dir, "[0.0, 0.0]");
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(transient()),
            Err(transient()),
            Ok(ProviderReply {
                text: Some("recovered".to_string()),
                ..Default::default()
            }),
        ]));
        let client = LlmClient::with_provider(config, provider.clone());

        let response = client
            .call(LlmRequest::new(vec![ChatMessage::user("hi")]))
            .await;
        assert!(response.ok);
        assert_eq!(response.text.as_deref(), Some("recovered"));
        assert_eq!(response.attempts_used, 3);
        assert_eq!(response.attempts_configured, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_retryable_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_store(&dir, "[0.0]");
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(transient()),
            Err(transient()),
        ]));
        let client = LlmClient::with_provider(config, provider.clone());

        let response = client
            .call(LlmRequest::new(vec![ChatMessage::user("hi")]))
            .await;
        assert!(!response.ok);
        assert!(response.retryable_error);
        assert_eq!(response.attempts_used, 2);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_store(&dir, "[0.0, 0.0, 0.0]");
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Auth(
            "invalid key".to_string(),
        ))]));
        let client = LlmClient::with_provider(config, provider.clone());

        let response = client
            .call(LlmRequest::new(vec![ChatMessage::user("hi")]))
            .await;
        assert!(!response.ok);
        assert!(!response.retryable_error);
        assert_eq!(response.attempts_used, 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_model_fails_without_provider_call() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_store(&dir, "[0.0]");
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let client = LlmClient::with_provider(config, provider.clone());

        let response = client
            .call(LlmRequest::new(vec![ChatMessage::user("hi")]).with_model("missing-model"))
            .await;
        assert!(!response.ok);
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn tool_arguments_canonicalize_from_string_and_object() {
        let from_object = FunctionCall {
            name: "get_current_time".to_string(),
            arguments: serde_json::json!({"location": {"city": "Lisbon"}}),
        };
        assert!(canonicalize_tool_arguments(&from_object).unwrap().is_object());

        let from_string = FunctionCall {
            name: "get_current_time".to_string(),
            arguments: Value::String("{\"location\": null}".to_string()),
        };
        assert!(canonicalize_tool_arguments(&from_string).unwrap().is_object());

        let malformed = FunctionCall {
            name: "get_current_time".to_string(),
            arguments: Value::String("{not json".to_string()),
        };
        assert!(canonicalize_tool_arguments(&malformed).is_err());
    }
}
