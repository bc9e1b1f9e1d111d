use async_trait::async_trait;
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Deserializer, Serialize };
use std::collections::BTreeMap;

use super::{
    check_status,
    http_stream_events,
    parse_arguments,
    ChatClient,
    ChatRequest,
    ChatResponse,
    ChatStream,
    LlmError,
    StreamEvent,
    StreamParser,
};
use crate::llm::LlmConfig;
use crate::models::chat::{ Message, ToolCall };
use crate::tools::ToolSpec;

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    endpoint: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OpenAIMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAIToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAIMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAIFunctionCall,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Some compatible servers send `"tool_calls": null` instead of omitting it.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where D: Deserializer<'de>, T: Deserialize<'de>
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolSpec,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIErrorBody>,
}

#[derive(Deserialize)]
struct OpenAIErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAIDelta {
    content: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    tool_calls: Vec<OpenAIDeltaToolCall>,
}

#[derive(Deserialize)]
struct OpenAIDeltaToolCall {
    index: usize,
    id: Option<String>,
    function: Option<OpenAIDeltaFunction>,
}

#[derive(Deserialize)]
struct OpenAIDeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn to_openai_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|message| {
            match message {
                Message::System { content, .. } => OpenAIMessage::text("system", content),
                Message::User { content, .. } => OpenAIMessage::text("user", content),
                Message::ModelText { content, .. } => OpenAIMessage::text("assistant", content),
                Message::ModelStructured { content, .. } =>
                    OpenAIMessage {
                        role: "assistant".to_string(),
                        content: None,
                        tool_calls: content
                            .iter()
                            .enumerate()
                            .map(|(i, call)| OpenAIToolCall {
                                id: call.tool_id.clone().unwrap_or_else(|| format!("call_{}", i)),
                                kind: function_kind(),
                                function: OpenAIFunctionCall {
                                    name: call.tool_name.clone(),
                                    arguments: call.args.to_string(),
                                },
                            })
                            .collect(),
                        tool_call_id: None,
                    },
                Message::ToolReturn { content, tool_id, .. } =>
                    OpenAIMessage {
                        tool_call_id: tool_id.clone(),
                        ..OpenAIMessage::text("tool", content)
                    },
                Message::Retry { content, tool_id: Some(id), .. } =>
                    OpenAIMessage {
                        tool_call_id: Some(id.clone()),
                        ..OpenAIMessage::text("tool", content)
                    },
                Message::Retry { content, tool_id: None, .. } =>
                    OpenAIMessage::text("user", content),
            }
        })
        .collect()
}

fn from_openai_calls(calls: Vec<OpenAIToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|call| ToolCall {
            tool_name: call.function.name,
            args: parse_arguments(&call.function.arguments),
            tool_id: Some(call.id),
        })
        .collect()
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, LlmError> {
        let chat_model = model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
        let api_url = base_url.unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let endpoint = if api_url.trim_end_matches('/').ends_with("/chat/completions") {
            api_url.trim_end_matches('/').to_string()
        } else {
            format!("{}/chat/completions", api_url.trim_end_matches('/'))
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                LlmError::Config(format!("Invalid API key format: {}", e))
            )?
        );

        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            model: chat_model,
            endpoint,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| LlmError::Config("OpenAI API key is required".to_string()))?;

        Self::new(api_key, config.completion_model.clone(), config.base_url.clone())
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OpenAIChatRequest {
        let tools: Vec<OpenAITool> = request.tools
            .iter()
            .map(|spec| OpenAITool { kind: "function", function: spec.clone() })
            .collect();
        let tool_choice = if request.require_tool && !tools.is_empty() {
            Some("required")
        } else {
            None
        };
        OpenAIChatRequest {
            model: self.model.clone(),
            messages: to_openai_messages(&request.messages),
            tools,
            tool_choice,
            stream: if stream { Some(true) } else { None },
        }
    }
}

/// Accumulates `tool_calls` fragments until the choice finishes.
#[derive(Default)]
struct OpenAIStreamParser {
    pending: BTreeMap<usize, PendingCall>,
}

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl OpenAIStreamParser {
    fn flush(&mut self, out: &mut Vec<StreamEvent>) {
        for (_, call) in std::mem::take(&mut self.pending) {
            out.push(
                StreamEvent::ToolCall(ToolCall {
                    tool_name: call.name,
                    args: parse_arguments(&call.arguments),
                    tool_id: call.id,
                })
            );
        }
    }
}

impl StreamParser for OpenAIStreamParser {
    fn parse_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) -> Result<bool, LlmError> {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return Ok(false);
        };
        if data == "[DONE]" {
            self.flush(out);
            return Ok(true);
        }

        let chunk = match serde_json::from_str::<OpenAIStreamResponse>(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("JSON parse error: {} for data: {}", e, data);
                return Ok(false);
            }
        };
        if let Some(err) = chunk.error {
            return Err(LlmError::Api(err.message));
        }

        let mut finished = false;
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(StreamEvent::Delta(content));
            }
            for fragment in choice.delta.tool_calls {
                let entry = self.pending.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    entry.id = Some(id);
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                debug!("OpenAI stream finished: {}", reason);
                finished = true;
            }
        }
        if finished {
            self.flush(out);
        }
        Ok(finished)
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        self.flush(out);
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = self.build_request(request, false);
        let resp = self.http.post(&self.endpoint).json(&body).send().await?;
        let resp = check_status(resp).await?.json::<OpenAIResponse>().await?;

        let message = resp.choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Decode("No response from OpenAI API".to_string()))?
            .message;

        Ok(ChatResponse {
            text: message.content.unwrap_or_default(),
            tool_calls: from_openai_calls(message.tool_calls),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let body = self.build_request(request, true);
        let req = self.http.post(&self.endpoint).json(&body);
        Ok(http_stream_events(req, OpenAIStreamParser::default()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
