use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

/// Tools that receive the process's resolved location when the caller
/// omits one.
pub const DEFAULT_LOCATION_TOOLS: [&str; 3] =
    ["get_current_time", "get_weather", "get_week_outlook"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl ParamKind {
    fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
            ParamKind::Null => "null",
        }
    }
}

/// Declarative parameter metadata projected into a JSON-schema property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub items_kind: Option<ParamKind>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ToolParam {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            items_kind: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn items(mut self, kind: ParamKind) -> Self {
        self.items_kind = Some(kind);
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    fn schema(&self) -> Value {
        let mut node = match self.kind {
            ParamKind::Array => json!({
                "type": "array",
                "items": {"type": self.items_kind.unwrap_or(ParamKind::String).as_str()}
            }),
            ParamKind::Object => json!({"type": "object", "additionalProperties": true}),
            other => json!({"type": other.as_str()}),
        };
        if let Some(description) = &self.description {
            node["description"] = json!(description);
        }
        node
    }
}

/// Metadata for one registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParam>,
}

impl ToolSpec {
    pub fn new(name: &str, category: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, param: ToolParam) -> Self {
        self.parameters.push(param);
        self
    }

    /// JSON-schema `object` for this tool's parameters.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.clone(), param.schema());
            if param.required {
                required.push(json!(param.name));
            }
        }
        let mut schema = json!({
            "type": "object",
            "properties": Value::Object(properties),
            "additionalProperties": false,
        });
        if !required.is_empty() {
            schema["required"] = Value::Array(required);
        }
        schema
    }

    /// OpenAI-style function definition for the provider wire.
    pub fn function_definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters_schema(),
            }
        })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Execute with structured args. `Err` is trapped by the registry and
    /// mapped into the failure envelope.
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// Source for the process's resolved default location.
pub trait LocationSource: Send + Sync {
    fn resolve(&self) -> Value;
}

/// Declarative catalog of callable tools with uniform invocation.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<BTreeMap<String, Arc<dyn Tool>>>>,
    location: Arc<RwLock<Option<Arc<dyn LocationSource>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), String> {
        let spec = tool.spec();
        if spec.name.trim().is_empty() {
            return Err("tool name must be a non-empty string".to_string());
        }
        let mut tools = self.tools.write().await;
        if tools.contains_key(&spec.name) {
            return Err(format!("tool `{}` is already registered", spec.name));
        }
        tools.insert(spec.name, tool);
        Ok(())
    }

    pub async fn set_location_source(&self, source: Arc<dyn LocationSource>) {
        *self.location.write().await = Some(source);
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// All specs, sorted by name.
    pub async fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| tool.spec())
            .collect()
    }

    /// Function definitions filtered for one caller. An empty `allowed`
    /// set admits every non-orchestration tool; orchestration-category
    /// tools require `allow_orchestration`. Returns the schema list plus
    /// the set of admitted names.
    pub async fn schemas_for(
        &self,
        allowed: &[String],
        allow_orchestration: bool,
    ) -> (Vec<Value>, HashSet<String>) {
        let allowed_set: HashSet<&str> = allowed
            .iter()
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
            .collect();
        let mut schemas = Vec::new();
        let mut names = HashSet::new();
        for tool in self.tools.read().await.values() {
            let spec = tool.spec();
            if spec.category == "orchestration" && !allow_orchestration {
                continue;
            }
            if !allowed_set.is_empty() && !allowed_set.contains(spec.name.as_str()) {
                continue;
            }
            names.insert(spec.name.clone());
            schemas.push(spec.function_definition());
        }
        (schemas, names)
    }

    /// Invoke a tool by name. Always returns the structured envelope.
    pub async fn invoke(&self, name: &str, args: Value) -> Value {
        let tool = match self.tools.read().await.get(name) {
            Some(tool) => tool.clone(),
            None => {
                return json!({
                    "ok": false,
                    "tool_name": name,
                    "error": format!("Unknown tool `{name}`."),
                    "source": "tool_registry",
                })
            }
        };

        let mut args = match args {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Default::default()),
            other => {
                return json!({
                    "ok": false,
                    "tool_name": name,
                    "error": format!("Invalid arguments for `{name}`: expected object, got {other}"),
                    "source": "tool_registry",
                })
            }
        };

        if DEFAULT_LOCATION_TOOLS.contains(&name)
            && args.get("location").map(Value::is_null).unwrap_or(true)
        {
            if let Some(source) = self.location.read().await.as_ref() {
                args["location"] = source.resolve();
            }
        }

        match tool.execute(args).await {
            Ok(Value::Object(result)) => Value::Object(result),
            Ok(other) => json!({
                "ok": false,
                "tool_name": name,
                "error": format!("Tool `{name}` returned non-object output: {other}"),
                "source": "tool_registry",
            }),
            Err(err) => json!({
                "ok": false,
                "tool_name": name,
                "error": format!("Tool `{name}` failed: {err}"),
                "source": "tool_registry",
            }),
        }
    }
}
