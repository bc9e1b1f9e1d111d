use async_trait::async_trait;
use log::warn;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;

use super::{
    check_status,
    http_stream_events,
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

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: JsonValue,
}

#[derive(Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolSpec,
}

#[derive(Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: Vec::new(),
        }
    }
}

fn to_ollama_messages(messages: &[Message]) -> Vec<OllamaMessage> {
    messages
        .iter()
        .map(|message| {
            match message {
                Message::System { content, .. } => OllamaMessage::text("system", content),
                Message::User { content, .. } => OllamaMessage::text("user", content),
                Message::ModelText { content, .. } => OllamaMessage::text("assistant", content),
                Message::ModelStructured { content, .. } =>
                    OllamaMessage {
                        role: "assistant".to_string(),
                        content: String::new(),
                        tool_calls: content
                            .iter()
                            .map(|call| OllamaToolCall {
                                function: OllamaFunctionCall {
                                    name: call.tool_name.clone(),
                                    arguments: call.args.clone(),
                                },
                            })
                            .collect(),
                    },
                Message::ToolReturn { content, .. } => OllamaMessage::text("tool", content),
                Message::Retry { content, tool_name: Some(_), .. } =>
                    OllamaMessage::text("tool", content),
                Message::Retry { content, tool_name: None, .. } =>
                    OllamaMessage::text("user", content),
            }
        })
        .collect()
}

fn from_ollama_calls(calls: Vec<OllamaToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|call| ToolCall {
            tool_name: call.function.name,
            args: call.function.arguments,
            tool_id: None,
        })
        .collect()
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Self {
        let model = completion_model.unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());
        let url = base_url.unwrap_or_else(|| DEFAULT_OLLAMA_URL.into());

        Self {
            http: HttpClient::new(),
            base_url: url,
            completion_model: model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.llm_type != crate::llm::LlmType::Ollama {
            return Err(LlmError::Config("Invalid config type for OllamaClient".into()));
        }

        Ok(Self::new(config.base_url.clone(), config.completion_model.clone()))
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.completion_model.clone(),
            messages: to_ollama_messages(&request.messages),
            tools: request.tools
                .iter()
                .map(|spec| OllamaTool { kind: "function", function: spec.clone() })
                .collect(),
            stream,
        }
    }
}

struct OllamaStreamParser;

impl StreamParser for OllamaStreamParser {
    fn parse_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) -> Result<bool, LlmError> {
        if line.trim().is_empty() {
            return Ok(false);
        }
        let chunk = match serde_json::from_str::<OllamaChatChunk>(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("JSON parse error: {} for line: {}", e, line);
                return Ok(false);
            }
        };
        if let Some(err) = chunk.error {
            return Err(LlmError::Api(err));
        }
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                out.push(StreamEvent::Delta(message.content));
            }
            out.extend(from_ollama_calls(message.tool_calls).into_iter().map(StreamEvent::ToolCall));
        }
        Ok(chunk.done)
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = self.build_request(request, false);
        let resp = self.http.post(self.endpoint()).json(&body).send().await?;
        let chunk = check_status(resp).await?.json::<OllamaChatChunk>().await?;
        if let Some(err) = chunk.error {
            return Err(LlmError::Api(err));
        }
        let message = chunk.message.ok_or_else(||
            LlmError::Decode("Ollama response has no message".to_string())
        )?;
        Ok(ChatResponse {
            text: message.content,
            tool_calls: from_ollama_calls(message.tool_calls),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let body = self.build_request(request, true);
        let req = self.http.post(self.endpoint()).json(&body);
        Ok(http_stream_events(req, OllamaStreamParser))
    }

    fn model(&self) -> &str {
        &self.completion_model
    }
}
