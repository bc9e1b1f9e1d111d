use async_trait::async_trait;
use log::info;
use serde_json::{ json, Value as JsonValue };
use std::sync::Arc;

use super::{ string_arg, Tool, ToolContext, ToolError };
use crate::geo::MapResolver;

pub const CREATE_LOCATION_MAP: &str = "create_location_map";
pub const LOCATION_NOT_FOUND: &str = "Location not found. Please try another one.";

/// Resolves a place and replaces the session's displayed map.
pub struct CreateLocationMapTool {
    resolver: Arc<MapResolver>,
}

impl CreateLocationMapTool {
    pub fn new(resolver: Arc<MapResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Tool for CreateLocationMapTool {
    fn name(&self) -> &str {
        CREATE_LOCATION_MAP
    }

    fn description(&self) -> &str {
        "Create a map of the location."
    }

    fn parameters(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The location to create a map for, including the country name"
                }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, args: JsonValue, ctx: &mut ToolContext) -> Result<String, ToolError> {
        let location = string_arg(self.name(), &args, "location")?;
        let (view, resolution) = self.resolver.map_for(&location).await;
        if !resolution.found {
            ctx.notices.push(LOCATION_NOT_FOUND.to_string());
        }
        info!("create_location_map: {}", location);
        ctx.map = Some(view);
        Ok(format!("finished creating map for {}", location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::tests::resolver;
    use crate::geo::DEFAULT_FALLBACK;

    #[tokio::test]
    async fn sets_map_for_known_place() {
        let (resolver, _) = resolver();
        let tool = CreateLocationMapTool::new(Arc::new(resolver));
        let mut ctx = ToolContext::default();

        let out = tool.execute(json!({"location": "Kaohsiung"}), &mut ctx).await.unwrap();

        assert_eq!(out, "finished creating map for Kaohsiung");
        let view = ctx.map.expect("map should be set");
        assert_eq!(view.marker.popup, "Kaohsiung");
        assert!(ctx.notices.is_empty());
    }

    #[tokio::test]
    async fn unknown_place_shows_fallback_and_notice() {
        let (resolver, _) = resolver();
        let tool = CreateLocationMapTool::new(Arc::new(resolver));
        let mut ctx = ToolContext::default();

        tool.execute(json!({"location": "Nowhere-xyz"}), &mut ctx).await.unwrap();

        assert_eq!(ctx.map.unwrap().center, DEFAULT_FALLBACK);
        assert_eq!(ctx.notices, vec![LOCATION_NOT_FOUND.to_string()]);
    }
}
