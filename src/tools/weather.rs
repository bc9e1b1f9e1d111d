use async_trait::async_trait;
use serde_json::{ json, Value as JsonValue };

use super::{ string_arg, Tool, ToolContext, ToolError };

pub struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the weather for a given location."
    }

    fn parameters(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string", "description": "Place to report the weather for" }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, args: JsonValue, _ctx: &mut ToolContext) -> Result<String, ToolError> {
        let location = string_arg(self.name(), &args, "location")?;
        Ok(format!("The weather in {} is sunny.", location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_sunny_weather() {
        let mut ctx = ToolContext::default();
        let out = WeatherTool.execute(json!({"location": "Tainan"}), &mut ctx).await.unwrap();
        assert_eq!(out, "The weather in Tainan is sunny.");
        assert!(ctx.map.is_none());
    }

    #[tokio::test]
    async fn location_is_required() {
        let mut ctx = ToolContext::default();
        let err = WeatherTool.execute(json!({"city": "Tainan"}), &mut ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
