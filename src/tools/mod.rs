pub mod map;
pub mod weather;

use async_trait::async_trait;
use log::info;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::geo::MapView;

pub use map::CreateLocationMapTool;
pub use weather::WeatherTool;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool name: '{0}'")]
    UnknownTool(String),
    #[error("Invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// Function definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

/// Session state a tool may touch while it runs.
#[derive(Debug, Default, Clone)]
pub struct ToolContext {
    pub map: Option<MapView>,
    pub notices: Vec<String>,
}

impl ToolContext {
    pub fn new(map: Option<MapView>) -> Self {
        Self { map, notices: Vec::new() }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> JsonValue;
    async fn execute(&self, args: JsonValue, ctx: &mut ToolContext) -> Result<String, ToolError>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Reads a required string field out of a tool's JSON arguments.
pub fn string_arg(tool: &str, args: &JsonValue, field: &str) -> Result<String, ToolError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("missing string field '{}'", field),
        })
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a tool with the same name is already registered.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return false;
        }
        info!("Registered tool '{}'", name);
        self.tools.insert(name, tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| t.spec())
            .collect()
    }

    pub async fn call(
        &self,
        name: &str,
        args: JsonValue,
        ctx: &mut ToolContext
    ) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        if !args.is_object() {
            return Err(ToolError::InvalidArguments {
                tool: name.to_string(),
                reason: "arguments must be a JSON object".to_string(),
            });
        }
        info!("Calling tool '{}' with {}", name, args);
        tool.execute(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(WeatherTool)));
        assert!(!registry.register(Arc::new(WeatherTool)));
        assert_eq!(registry.names(), vec!["get_weather".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let mut ctx = ToolContext::default();
        let err = registry.call("teleport", json!({}), &mut ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "teleport"));
    }

    #[tokio::test]
    async fn non_object_arguments_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WeatherTool));
        let mut ctx = ToolContext::default();
        let err = registry.call("get_weather", json!("Taipei"), &mut ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn specs_expose_schemas() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WeatherTool));
        let specs = registry.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].parameters["required"], json!(["location"]));
    }
}
