use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Discriminator stored in the `role` field of every persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    ModelText,
    ModelStructured,
    ToolReturn,
    Retry,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::ModelText => "model-text-response",
            Role::ModelStructured => "model-structured-response",
            Role::ToolReturn => "tool-return",
            Role::Retry => "retry-prompt",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "model-text-response" => Ok(Role::ModelText),
            "model-structured-response" => Ok(Role::ModelStructured),
            "tool-return" => Ok(Role::ToolReturn),
            "retry-prompt" | "retry" => Ok(Role::Retry),
            other => Err(DecodeError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown message kind '{0}'")]
    UnknownRole(String),
    #[error("message has no role field")]
    MissingRole,
    #[error("malformed {role} message: {source}")]
    Invalid {
        role: Role,
        #[source]
        source: serde_json::Error,
    },
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is neither a JSON array nor an object")]
    NotAMessageList,
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
}

/// One conversation entry. The wire form is an object tagged by `role`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")] System {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "user")] User {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "model-text-response")] ModelText {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "model-structured-response")] ModelStructured {
        content: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "tool-return")] ToolReturn {
        tool_name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "retry-prompt", alias = "retry")] Retry {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System { content: content.into(), timestamp: Some(Utc::now()) }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User { content: content.into(), timestamp: Some(Utc::now()) }
    }

    pub fn model_text(content: impl Into<String>) -> Self {
        Message::ModelText { content: content.into(), timestamp: Some(Utc::now()) }
    }

    pub fn model_structured(calls: Vec<ToolCall>) -> Self {
        Message::ModelStructured { content: calls, timestamp: Some(Utc::now()) }
    }

    pub fn tool_return(call: &ToolCall, content: impl Into<String>) -> Self {
        Message::ToolReturn {
            tool_name: call.tool_name.clone(),
            content: content.into(),
            tool_id: call.tool_id.clone(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn retry(call: Option<&ToolCall>, content: impl Into<String>) -> Self {
        Message::Retry {
            content: content.into(),
            tool_name: call.map(|c| c.tool_name.clone()),
            tool_id: call.and_then(|c| c.tool_id.clone()),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::ModelText { .. } => Role::ModelText,
            Message::ModelStructured { .. } => Role::ModelStructured,
            Message::ToolReturn { .. } => Role::ToolReturn,
            Message::Retry { .. } => Role::Retry,
        }
    }

    /// Text payload, or the JSON rendering of the calls for structured responses.
    pub fn content_text(&self) -> String {
        match self {
            | Message::System { content, .. }
            | Message::User { content, .. }
            | Message::ModelText { content, .. }
            | Message::ToolReturn { content, .. }
            | Message::Retry { content, .. } => content.clone(),
            Message::ModelStructured { content, .. } =>
                serde_json::to_string(content).unwrap_or_default(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            | Message::System { timestamp, .. }
            | Message::User { timestamp, .. }
            | Message::ModelText { timestamp, .. }
            | Message::ModelStructured { timestamp, .. }
            | Message::ToolReturn { timestamp, .. }
            | Message::Retry { timestamp, .. } => *timestamp,
        }
    }

    /// Builds a message from one JSON element, dispatching on its `role`.
    pub fn from_json(value: JsonValue) -> Result<Self, DecodeError> {
        let role: Role = value
            .get("role")
            .and_then(|r| r.as_str())
            .ok_or(DecodeError::MissingRole)?
            .parse()?;
        serde_json::from_value(value).map_err(|source| DecodeError::Invalid { role, source })
    }
}

/// Decodes one persisted line. The outer error means the whole line is
/// unusable; inner errors belong to individual elements.
pub fn decode_line(line: &str) -> Result<Vec<Result<Message, DecodeError>>, DecodeError> {
    match serde_json::from_str::<JsonValue>(line)? {
        JsonValue::Array(items) => Ok(items.into_iter().map(Message::from_json).collect()),
        obj @ JsonValue::Object(_) => Ok(vec![Message::from_json(obj)]),
        _ => Err(DecodeError::NotAMessageList),
    }
}

pub fn encode_turn(turn: &[Message]) -> Result<String, serde_json::Error> {
    serde_json::to_string(turn)
}
