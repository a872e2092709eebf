// Kernel tool handlers: filesystem (policy-guarded), data helpers, location,
// time, weather shape, and web access.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};

use steward_core::{parse_zone, AccessMode, ConfigStore, PathPolicy};

use crate::registry::{LocationSource, ParamKind, Tool, ToolParam, ToolRegistry, ToolSpec};

/// Fixed default location payload, used when config carries none.
pub struct StaticLocationSource {
    value: Value,
}

impl StaticLocationSource {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl LocationSource for StaticLocationSource {
    fn resolve(&self) -> Value {
        self.value.clone()
    }
}

fn policy_denied(tool: &str, reason: String) -> Value {
    json!({"ok": false, "error": reason, "source": tool})
}

// ── Location & time ─────────────────────────────────────────────────

pub struct GetLocationTool {
    config: ConfigStore,
}

#[async_trait]
impl Tool for GetLocationTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "get_location",
            "kernel",
            "Return normalized user location and timezone context.",
        )
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        let config = self.config.get().await;
        let mut location = config
            .home_location
            .clone()
            .unwrap_or_else(|| json!({"label": "unknown"}));
        if location.get("timezone").is_none() {
            if let Some(timezone) = &config.timezone {
                location["timezone"] = json!(timezone);
            }
        }
        Ok(json!({"ok": true, "location": location, "source": "get_location"}))
    }
}

pub struct GetCurrentTimeTool {
    config: ConfigStore,
}

#[async_trait]
impl Tool for GetCurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "get_current_time",
            "kernel",
            "Return current UTC/local time for a location timezone.",
        )
        .param(ToolParam::new("location", ParamKind::Object))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let config = self.config.get().await;
        let timezone_name = args
            .get("location")
            .and_then(|location| location.get("timezone"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| config.timezone.clone());
        let zone = parse_zone(timezone_name.as_deref());
        let now_utc = Utc::now();
        let local = now_utc.with_timezone(&zone);
        let human_local = local.format("%l:%M %p").to_string().trim_start().to_string();
        Ok(json!({
            "ok": true,
            "timezone": zone.name(),
            "utc_iso": now_utc.to_rfc3339(),
            "local_iso": local.to_rfc3339(),
            "human_local": human_local,
            "source": "get_current_time",
        }))
    }
}

// ── Weather shape ───────────────────────────────────────────────────

/// Weather contract placeholder: presents the registry shape and the
/// default-location injection path without a configured upstream.
pub struct WeatherTool {
    name: &'static str,
    description: &'static str,
}

impl WeatherTool {
    pub fn current() -> Self {
        Self {
            name: "get_weather",
            description: "Return current weather conditions for a location.",
        }
    }

    pub fn week_outlook() -> Self {
        Self {
            name: "get_week_outlook",
            description: "Return the 7-day weather outlook for a location.",
        }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(self.name, "kernel", self.description)
            .param(ToolParam::new("location", ParamKind::Object))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        Ok(json!({
            "ok": false,
            "error": "weather provider not configured",
            "location": args.get("location").cloned().unwrap_or(Value::Null),
            "source": self.name,
        }))
    }
}

// ── Filesystem ──────────────────────────────────────────────────────

pub struct ReadFileTool {
    policy: Arc<PathPolicy>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("read_file", "kernel", "Read a repo-relative text file.")
            .param(ToolParam::new("path", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "path is required".to_string())?;
        match self.policy.check_access(path, AccessMode::Read) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied("read_file", reason)),
            Err(err) => return Ok(policy_denied("read_file", err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|err| format!("read failed: {err}"))?;
        Ok(json!({"ok": true, "path": path, "content": content, "source": "read_file"}))
    }
}

pub struct WriteFileTool {
    policy: Arc<PathPolicy>,
    append: bool,
}

impl WriteFileTool {
    fn name(&self) -> &'static str {
        if self.append {
            "append_file"
        } else {
            "write_file"
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        let description = if self.append {
            "Append text to a repo-relative file."
        } else {
            "Write text to a repo-relative file."
        };
        ToolSpec::new(self.name(), "kernel", description)
            .param(ToolParam::new("path", ParamKind::String).required())
            .param(ToolParam::new("content", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "path is required".to_string())?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| "content is required".to_string())?;
        match self.policy.check_access(path, AccessMode::Write) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied(self.name(), reason)),
            Err(err) => return Ok(policy_denied(self.name(), err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("create dir failed: {err}"))?;
        }
        if self.append {
            let mut existing = tokio::fs::read_to_string(&resolved).await.unwrap_or_default();
            existing.push_str(content);
            tokio::fs::write(&resolved, existing)
                .await
                .map_err(|err| format!("append failed: {err}"))?;
        } else {
            tokio::fs::write(&resolved, content)
                .await
                .map_err(|err| format!("write failed: {err}"))?;
        }
        Ok(json!({"ok": true, "path": path, "bytes": content.len(), "source": self.name()}))
    }
}

pub struct ListDirTool {
    policy: Arc<PathPolicy>,
}

#[async_trait]
impl Tool for ListDirTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("list_dir", "kernel", "List entries of a repo-relative directory.")
            .param(ToolParam::new("path", ParamKind::String))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        match self.policy.check_access(path, AccessMode::Read) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied("list_dir", reason)),
            Err(err) => return Ok(policy_denied("list_dir", err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|err| format!("list failed: {err}"))?;
        while let Ok(Some(entry)) = reader.next_entry().await.map_err(|err| err.to_string()) {
            let file_type = entry.file_type().await.ok();
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": file_type.map(|ft| ft.is_dir()).unwrap_or(false),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({"ok": true, "path": path, "entries": entries, "source": "list_dir"}))
    }
}

pub struct StatPathTool {
    policy: Arc<PathPolicy>,
    exists_only: bool,
}

impl StatPathTool {
    fn name(&self) -> &'static str {
        if self.exists_only {
            "path_exists"
        } else {
            "stat_path"
        }
    }
}

#[async_trait]
impl Tool for StatPathTool {
    fn spec(&self) -> ToolSpec {
        let description = if self.exists_only {
            "Check whether a repo-relative path exists."
        } else {
            "Stat a repo-relative path."
        };
        ToolSpec::new(self.name(), "kernel", description)
            .param(ToolParam::new("path", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "path is required".to_string())?;
        match self.policy.check_access(path, AccessMode::Read) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied(self.name(), reason)),
            Err(err) => return Ok(policy_denied(self.name(), err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        let metadata = tokio::fs::metadata(&resolved).await.ok();
        if self.exists_only {
            return Ok(json!({
                "ok": true,
                "path": path,
                "exists": metadata.is_some(),
                "source": self.name(),
            }));
        }
        match metadata {
            Some(metadata) => Ok(json!({
                "ok": true,
                "path": path,
                "is_dir": metadata.is_dir(),
                "size_bytes": metadata.len(),
                "source": self.name(),
            })),
            None => Ok(json!({
                "ok": false,
                "path": path,
                "error": "path not found",
                "source": self.name(),
            })),
        }
    }
}

// ── Data helpers ────────────────────────────────────────────────────

pub struct ReadJsonTool {
    policy: Arc<PathPolicy>,
}

#[async_trait]
impl Tool for ReadJsonTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("read_json", "data", "Read and parse a repo-relative JSON file.")
            .param(ToolParam::new("path", ParamKind::String).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "path is required".to_string())?;
        match self.policy.check_access(path, AccessMode::Read) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied("read_json", reason)),
            Err(err) => return Ok(policy_denied("read_json", err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        let raw = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|err| format!("read failed: {err}"))?;
        let data: Value =
            serde_json::from_str(&raw).map_err(|err| format!("invalid JSON: {err}"))?;
        Ok(json!({"ok": true, "path": path, "data": data, "source": "read_json"}))
    }
}

pub struct WriteJsonTool {
    policy: Arc<PathPolicy>,
}

#[async_trait]
impl Tool for WriteJsonTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("write_json", "data", "Serialize data to a repo-relative JSON file.")
            .param(ToolParam::new("path", ParamKind::String).required())
            .param(ToolParam::new("data", ParamKind::Object).required())
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "path is required".to_string())?;
        let data = args.get("data").cloned().unwrap_or(Value::Null);
        match self.policy.check_access(path, AccessMode::Write) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied("write_json", reason)),
            Err(err) => return Ok(policy_denied("write_json", err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("create dir failed: {err}"))?;
        }
        let rendered = serde_json::to_string_pretty(&data)
            .map_err(|err| format!("serialize failed: {err}"))?;
        tokio::fs::write(&resolved, rendered)
            .await
            .map_err(|err| format!("write failed: {err}"))?;
        Ok(json!({"ok": true, "path": path, "source": "write_json"}))
    }
}

pub struct SearchTextTool {
    policy: Arc<PathPolicy>,
}

#[async_trait]
impl Tool for SearchTextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("search_text", "data", "Case-insensitive substring search in a file.")
            .param(ToolParam::new("path", ParamKind::String).required())
            .param(ToolParam::new("query", ParamKind::String).required())
            .param(ToolParam::new("max_results", ParamKind::Integer))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "path is required".to_string())?;
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| "query is required".to_string())?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(20)
            .clamp(1, 200) as usize;
        match self.policy.check_access(path, AccessMode::Read) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Ok(policy_denied("search_text", reason)),
            Err(err) => return Ok(policy_denied("search_text", err.to_string())),
        }
        let resolved = self.policy.resolve(path).map_err(|err| err.to_string())?;
        let raw = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|err| format!("read failed: {err}"))?;
        let needle = query.to_lowercase();
        let matches: Vec<Value> = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| line.to_lowercase().contains(&needle))
            .take(max_results)
            .map(|(idx, line)| json!({"line": idx + 1, "text": line}))
            .collect();
        Ok(json!({
            "ok": true,
            "path": path,
            "query": query,
            "match_count": matches.len(),
            "matches": matches,
            "source": "search_text",
        }))
    }
}

// ── Web ─────────────────────────────────────────────────────────────

pub struct FetchUrlTool {
    client: Client,
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("fetch_url", "kernel", "Fetch a URL and return trimmed text content.")
            .param(ToolParam::new("url", ParamKind::String).required())
            .param(ToolParam::new("max_chars", ParamKind::Integer))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| "url is required".to_string())?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(json!({
                "ok": false,
                "error": "only http(s) URLs are supported",
                "source": "fetch_url",
            }));
        }
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .unwrap_or(4000)
            .clamp(200, 40_000) as usize;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| format!("fetch failed: {err}"))?;
        let status = response.status().as_u16();
        let mut body = response
            .text()
            .await
            .map_err(|err| format!("read body failed: {err}"))?;
        if body.len() > max_chars {
            body = body.chars().take(max_chars).collect();
        }
        Ok(json!({
            "ok": status < 400,
            "url": url,
            "status": status,
            "content": body,
            "source": "fetch_url",
        }))
    }
}

pub struct WebSearchTool {
    config: ConfigStore,
    client: Client,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("web_search", "kernel", "Search the web for a query.")
            .param(ToolParam::new("query", ParamKind::String).required())
            .param(ToolParam::new("max_results", ParamKind::Integer))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| "query is required".to_string())?;
        let config = self.config.get().await;
        let Some(search) = &config.web_search else {
            return Ok(json!({
                "ok": false,
                "error": "web search provider not configured",
                "source": "web_search",
            }));
        };
        let (Some(apikey), Some(base_url)) = (search.apikey.as_deref(), search.base_url.as_deref())
        else {
            return Ok(json!({
                "ok": false,
                "error": "web search provider not configured",
                "source": "web_search",
            }));
        };
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .clamp(1, 20);
        let response = self
            .client
            .post(base_url)
            .header("X-API-KEY", apikey)
            .json(&json!({"q": query, "num": max_results}))
            .send()
            .await
            .map_err(|err| format!("search failed: {err}"))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|err| format!("search response invalid: {err}"))?;
        Ok(json!({
            "ok": true,
            "query": query,
            "results": payload.get("organic").cloned().unwrap_or(payload),
            "source": "web_search",
        }))
    }
}

/// Register the kernel tool set and seed the default location from config.
pub async fn register_kernel_tools(
    registry: &ToolRegistry,
    config: &ConfigStore,
    policy: Arc<PathPolicy>,
) -> Result<(), String> {
    let snapshot = config.get().await;
    let mut location = snapshot
        .home_location
        .clone()
        .unwrap_or_else(|| json!({"label": "unknown"}));
    if location.get("timezone").is_none() {
        if let Some(timezone) = &snapshot.timezone {
            location["timezone"] = json!(timezone);
        }
    }
    registry
        .set_location_source(Arc::new(StaticLocationSource::new(location)))
        .await;

    let client = Client::new();
    registry
        .register(Arc::new(GetLocationTool {
            config: config.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(GetCurrentTimeTool {
            config: config.clone(),
        }))
        .await?;
    registry.register(Arc::new(WeatherTool::current())).await?;
    registry
        .register(Arc::new(WeatherTool::week_outlook()))
        .await?;
    registry
        .register(Arc::new(ReadFileTool {
            policy: policy.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(WriteFileTool {
            policy: policy.clone(),
            append: false,
        }))
        .await?;
    registry
        .register(Arc::new(WriteFileTool {
            policy: policy.clone(),
            append: true,
        }))
        .await?;
    registry
        .register(Arc::new(ListDirTool {
            policy: policy.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(StatPathTool {
            policy: policy.clone(),
            exists_only: false,
        }))
        .await?;
    registry
        .register(Arc::new(StatPathTool {
            policy: policy.clone(),
            exists_only: true,
        }))
        .await?;
    registry
        .register(Arc::new(ReadJsonTool {
            policy: policy.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(WriteJsonTool {
            policy: policy.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(SearchTextTool { policy }))
        .await?;
    registry
        .register(Arc::new(FetchUrlTool {
            client: client.clone(),
        }))
        .await?;
    registry
        .register(Arc::new(WebSearchTool {
            config: config.clone(),
            client,
        }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::FilesystemPolicyConfig;

    async fn registry_for(dir: &tempfile::TempDir) -> ToolRegistry {
        let config_path = dir.path().join("config").join("config.json");
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(
            &config_path,
            r#"{"timezone": "UTC", "home_location": {"city": "Lisbon", "timezone": "Europe/Lisbon"}}"#,
        )
        .unwrap();
        let config = ConfigStore::for_root(dir.path());
        let policy = Arc::new(PathPolicy::new(
            dir.path(),
            &FilesystemPolicyConfig::default(),
        ));
        let registry = ToolRegistry::new();
        register_kernel_tools(&registry, &config, policy)
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn current_time_uses_injected_location_timezone() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_for(&dir).await;

        let result = registry.invoke("get_current_time", json!({})).await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["timezone"], "Europe/Lisbon");
        assert!(result["human_local"].as_str().unwrap().contains(' '));
    }

    #[tokio::test]
    async fn file_tools_respect_write_policy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_for(&dir).await;

        let denied = registry
            .invoke("write_file", json!({"path": "src/forbidden.txt", "content": "x"}))
            .await;
        assert_eq!(denied["ok"], false);

        let allowed = registry
            .invoke(
                "write_file",
                json!({"path": "outputs/report.md", "content": "hello"}),
            )
            .await;
        assert_eq!(allowed["ok"], true);

        let read_back = registry
            .invoke("read_file", json!({"path": "outputs/report.md"}))
            .await;
        assert_eq!(read_back["content"], "hello");
    }

    #[tokio::test]
    async fn search_text_counts_matches() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_for(&dir).await;
        registry
            .invoke(
                "write_file",
                json!({"path": "outputs/notes.txt", "content": "Alpha\nbeta\nALPHA beta\n"}),
            )
            .await;

        let found = registry
            .invoke(
                "search_text",
                json!({"path": "outputs/notes.txt", "query": "alpha"}),
            )
            .await;
        assert_eq!(found["match_count"], 2);
    }

    #[tokio::test]
    async fn unconfigured_web_search_reports_policy_shape() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_for(&dir).await;
        let result = registry.invoke("web_search", json!({"query": "rust"})).await;
        assert_eq!(result["ok"], false);
        assert!(result["error"].as_str().unwrap().contains("not configured"));
    }
}
