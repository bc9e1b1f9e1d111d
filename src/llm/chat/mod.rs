pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use serde_json::Value as JsonValue;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ LlmConfig, LlmType };
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use crate::models::chat::{ Message, ToolCall };
use crate::tools::ToolSpec;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM provider returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("LLM provider error: {0}")]
    Api(String),
    #[error("LLM client configuration error: {0}")]
    Config(String),
    #[error("Unreadable LLM response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// Ask the provider to answer with a tool call instead of free text.
    pub require_tool: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    ToolCall(ToolCall),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Providers without native streaming hand back the full response as one delta.
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.complete(request).await?;
        Ok(response_as_stream(response))
    }

    fn model(&self) -> &str;
}

pub fn response_as_stream(response: ChatResponse) -> ChatStream {
    let mut events = Vec::new();
    if !response.text.is_empty() {
        events.push(Ok(StreamEvent::Delta(response.text)));
    }
    events.extend(response.tool_calls.into_iter().map(|c| Ok(StreamEvent::ToolCall(c))));
    Box::pin(futures::stream::iter(events))
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> ChatStream
    where
        F: FnOnce(mpsc::Sender<Result<StreamEvent, LlmError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Ollama => {
            let specific_client = OllamaClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// Splits a byte stream into lines, keeping partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line_bytes(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line_bytes(&raw))
    }
}

fn decode_line_bytes(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Provider-specific decoding of one streamed line.
pub trait StreamParser: Send + 'static {
    /// Pushes the events found in `line`; returns true once the provider signals the end.
    fn parse_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) -> Result<bool, LlmError>;

    fn finish(&mut self, _out: &mut Vec<StreamEvent>) {}
}

pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::Status { status: status.as_u16(), body })
}

/// Sends `request` and relays parsed events through a channel-backed stream.
pub fn http_stream_events<P: StreamParser>(
    request: reqwest::RequestBuilder,
    mut parser: P
) -> ChatStream {
    create_streaming_response(move |tx| async move {
        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        let resp = match check_status(resp).await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let mut bytes = resp.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut events = Vec::new();
        let mut done = false;

        while !done {
            let chunk = match bytes.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
                None => break,
            };
            for line in lines.push(&chunk) {
                match parser.parse_line(&line, &mut events) {
                    Ok(finished) => {
                        done = finished;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
                for event in events.drain(..) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                if done {
                    break;
                }
            }
        }

        if !done {
            if let Some(rest) = lines.finish() {
                if let Err(e) = parser.parse_line(&rest, &mut events) {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        parser.finish(&mut events);
        for event in events.drain(..) {
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
    })
}

/// Tool arguments arrive as a JSON string; keep the raw text if it does not parse.
pub fn parse_arguments(raw: &str) -> JsonValue {
    if raw.trim().is_empty() {
        return JsonValue::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        assert_eq!(buf.push(b":1}\r\ndata: [DO"), vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(buf.push(b"NE]\n\n"), vec!["data: [DONE]".to_string(), String::new()]);
        assert!(buf.finish().is_none());
    }

    #[test]
    fn line_buffer_keeps_multibyte_chars_whole() {
        let mut buf = LineBuffer::default();
        let text = "高雄\n".as_bytes();
        assert!(buf.push(&text[..2]).is_empty());
        assert_eq!(buf.push(&text[2..]), vec!["高雄".to_string()]);
    }

    #[test]
    fn line_buffer_flushes_trailing_line() {
        let mut buf = LineBuffer::default();
        buf.push(b"{\"done\":true}");
        assert_eq!(buf.finish(), Some("{\"done\":true}".to_string()));
    }

    #[test]
    fn arguments_fall_back_to_raw_text() {
        assert_eq!(parse_arguments(r#"{"location":"Tainan"}"#), json!({"location": "Tainan"}));
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{oops"), json!("{oops"));
    }

    #[tokio::test]
    async fn complete_response_becomes_stream() {
        let response = ChatResponse {
            text: "Hello".into(),
            tool_calls: vec![ToolCall {
                tool_name: "get_weather".into(),
                args: json!({"location": "Tainan"}),
                tool_id: None,
            }],
        };
        let events: Vec<_> = response_as_stream(response)
            .map(|e| e.unwrap())
            .collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Delta("Hello".into()));
        assert!(matches!(&events[1], StreamEvent::ToolCall(c) if c.tool_name == "get_weather"));
    }
}
