use crate::cli::Args;
use crate::geo::{ Coordinates, GeoError, MapResolver, NominatimGeocoder };
use crate::history::{ initialize_history_store, HistoryStore, StoreError };
use crate::llm::chat::{ new_client as new_chat_client, ChatClient, ChatRequest, LlmError };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ Message, ToolCall };
use crate::relay::{ relay, DisplaySink, RelayError, SinkError };
use crate::session::Session;
use crate::tools::map::CREATE_LOCATION_MAP;
use crate::tools::{ CreateLocationMapTool, ToolContext, ToolRegistry, ToolSpec, WeatherTool };

use log::{ info, warn };
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Pseudo-tool the model calls to deliver a structured answer.
pub const FINAL_RESULT_TOOL: &str = "final_result";
const FINAL_RESULT_ACK: &str = "Final result processed.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Geo(#[from] GeoError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Model still calling tools after {0} rounds")]
    ToolRounds(usize),
    #[error("Gave up after too many retries: {0}")]
    RetriesExhausted(String),
}

impl From<RelayError> for AgentError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Llm(e) => AgentError::Llm(e),
            RelayError::Sink(e) => AgentError::Sink(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Streamed free text, tools called along the way.
    Text,
    /// One `final_result` call carrying a `LocationMapResponse`.
    Structured,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMode::Text => f.write_str("text"),
            ResponseMode::Structured => f.write_str("structured"),
        }
    }
}

impl FromStr for ResponseMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ResponseMode::Text),
            "structured" => Ok(ResponseMode::Structured),
            other => Err(AgentError::Config(format!("Unsupported response mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationMapResponse {
    #[serde(default)]
    pub location: Option<String>,
    pub response: String,
}

fn final_result_spec() -> ToolSpec {
    ToolSpec {
        name: FINAL_RESULT_TOOL.to_string(),
        description: "The final response which ends this conversation turn".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": ["string", "null"],
                    "description": "The location you need to create a map for (also provide the country name)"
                },
                "response": {
                    "type": "string",
                    "description": "What you will say to the user"
                }
            },
            "required": ["response"]
        }),
    }
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub system_prompt: Option<String>,
    pub mode: ResponseMode,
    pub max_tool_rounds: usize,
    pub max_retries: usize,
    pub debounce: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            mode: ResponseMode::Text,
            max_tool_rounds: 5,
            max_retries: 1,
            debounce: Duration::from_millis(10),
        }
    }
}

impl AgentOptions {
    pub fn from_args(args: &Args) -> Result<Self, AgentError> {
        Ok(Self {
            system_prompt: Some(args.system_prompt.clone()).filter(|p| !p.trim().is_empty()),
            mode: args.response_mode.parse()?,
            max_tool_rounds: args.max_tool_rounds.max(1),
            max_retries: args.max_retries,
            debounce: Duration::from_millis(args.stream_debounce_ms),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    /// Everything this turn added to the conversation, in order.
    pub messages: Vec<Message>,
    pub persisted: bool,
}

pub struct ChatAgent {
    chat_client: Arc<dyn ChatClient>,
    tools: ToolRegistry,
    history_store: Arc<dyn HistoryStore>,
    options: AgentOptions,
}

impl ChatAgent {
    fn initialize_chat_client(args: &Args) -> Result<Arc<dyn ChatClient>, AgentError> {
        let chat_llm_type: LlmType = args.chat_llm_type
            .parse()
            .map_err(|e| AgentError::Config(format!("{}", e)))?;
        let chat_api_key = if !args.chat_api_key.is_empty() {
            Some(args.chat_api_key.clone())
        } else {
            None
        };
        let chat_config = LlmConfig {
            llm_type: chat_llm_type,
            base_url: args.chat_base_url.clone(),
            api_key: chat_api_key,
            completion_model: args.chat_model.clone(),
        };
        let chat_client = new_chat_client(&chat_config)?;
        info!(
            "Chat client configured: Type={}, Model={}, BaseURL={:?}",
            args.chat_llm_type,
            chat_client.model(),
            chat_config.base_url.as_deref().unwrap_or("adapter default")
        );
        Ok(chat_client)
    }

    fn initialize_tools(args: &Args) -> Result<ToolRegistry, AgentError> {
        let geocoder = NominatimGeocoder::new(&args.geocoder_url, &args.geocoder_user_agent)?;
        let fallback = Coordinates {
            latitude: args.fallback_lat,
            longitude: args.fallback_lon,
        };
        let resolver = Arc::new(MapResolver::new(Arc::new(geocoder), fallback, args.map_zoom));
        info!("Geocoder configured: {} (fallback {}, {})", args.geocoder_url, fallback.latitude, fallback.longitude);

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WeatherTool));
        tools.register(Arc::new(CreateLocationMapTool::new(resolver)));
        Ok(tools)
    }

    pub fn new(args: &Args) -> Result<Self, AgentError> {
        let chat_client = Self::initialize_chat_client(args)?;
        let history_store = initialize_history_store(args)?;
        let tools = Self::initialize_tools(args)?;
        let options = AgentOptions::from_args(args)?;
        info!("Response mode: {}", options.mode);

        Ok(Self::with_parts(chat_client, tools, history_store, options))
    }

    pub fn with_parts(
        chat_client: Arc<dyn ChatClient>,
        tools: ToolRegistry,
        history_store: Arc<dyn HistoryStore>,
        options: AgentOptions
    ) -> Self {
        Self {
            chat_client,
            tools,
            history_store,
            options,
        }
    }

    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history_store
    }

    /// Starts a session hydrated from the history store.
    pub async fn new_session(&self) -> Result<Session, AgentError> {
        Ok(Session::hydrate(self.history_store.as_ref()).await?)
    }

    /// Runs one user turn to completion. On error the session is left as it
    /// was and nothing is persisted.
    pub async fn process_message(
        &self,
        session: &mut Session,
        message: &str,
        sink: &mut dyn DisplaySink
    ) -> Result<TurnOutcome, AgentError> {
        let mut turn = Vec::new();
        if session.is_empty() {
            if let Some(prompt) = &self.options.system_prompt {
                turn.push(Message::system(prompt.as_str()));
            }
        }
        turn.push(Message::user(message));

        let mut ctx = ToolContext::new(session.map().cloned());
        let response = match self.options.mode {
            ResponseMode::Text => {
                self.run_text(session.messages(), &mut turn, &mut ctx, sink).await?
            }
            ResponseMode::Structured => {
                self.run_structured(session.messages(), &mut turn, &mut ctx, sink).await?
            }
        };

        session.set_map(ctx.map);
        session.extend(turn.iter().cloned());

        let persisted = if response.trim().is_empty() {
            warn!("Empty response for session {}, turn not saved", session.id());
            false
        } else {
            self.history_store.append(&turn).await?;
            true
        };

        sink.finish(&response).await?;
        Ok(TurnOutcome {
            response,
            messages: turn,
            persisted,
        })
    }

    fn request(
        &self,
        history: &[Message],
        turn: &[Message],
        tools: Vec<ToolSpec>,
        require_tool: bool
    ) -> ChatRequest {
        ChatRequest {
            messages: history.iter().chain(turn.iter()).cloned().collect(),
            tools,
            require_tool,
        }
    }

    async fn run_text(
        &self,
        history: &[Message],
        turn: &mut Vec<Message>,
        ctx: &mut ToolContext,
        sink: &mut dyn DisplaySink
    ) -> Result<String, AgentError> {
        let mut retries = 0;
        for _ in 0..self.options.max_tool_rounds {
            let request = self.request(history, turn, self.tools.specs(), false);
            let stream = self.chat_client.stream(&request).await?;
            let outcome = relay(stream, sink, self.options.debounce).await?;

            if outcome.tool_calls.is_empty() {
                turn.push(Message::model_text(outcome.text.as_str()));
                return Ok(outcome.text);
            }

            if !outcome.text.is_empty() {
                turn.push(Message::model_text(outcome.text.as_str()));
            }
            let calls = assign_tool_ids(outcome.tool_calls);
            turn.push(Message::model_structured(calls.clone()));
            for call in &calls {
                self.run_tool(call, turn, ctx, sink, &mut retries).await?;
            }
        }
        Err(AgentError::ToolRounds(self.options.max_tool_rounds))
    }

    async fn run_structured(
        &self,
        history: &[Message],
        turn: &mut Vec<Message>,
        ctx: &mut ToolContext,
        sink: &mut dyn DisplaySink
    ) -> Result<String, AgentError> {
        let mut tools = self.tools.specs();
        tools.push(final_result_spec());
        let mut retries = 0;

        for _ in 0..self.options.max_tool_rounds {
            let request = self.request(history, turn, tools.clone(), true);
            let response = self.chat_client.complete(&request).await?;

            if response.tool_calls.is_empty() {
                if !response.text.is_empty() {
                    turn.push(Message::model_text(response.text.as_str()));
                }
                self.retry(
                    &mut retries,
                    turn,
                    None,
                    format!("Please answer by calling the {} tool.", FINAL_RESULT_TOOL)
                )?;
                continue;
            }

            let calls = assign_tool_ids(response.tool_calls);
            turn.push(Message::model_structured(calls.clone()));
            let mut final_response = None;
            for call in &calls {
                if call.tool_name != FINAL_RESULT_TOOL {
                    self.run_tool(call, turn, ctx, sink, &mut retries).await?;
                    continue;
                }
                match serde_json::from_value::<LocationMapResponse>(call.args.clone()) {
                    Ok(result) => {
                        turn.push(Message::tool_return(call, FINAL_RESULT_ACK));
                        self.show_location(result.location.as_deref(), ctx, sink).await?;
                        final_response = Some(result.response);
                    }
                    Err(e) => {
                        self.retry(
                            &mut retries,
                            turn,
                            Some(call),
                            format!("Invalid {} arguments: {}", FINAL_RESULT_TOOL, e)
                        )?;
                    }
                }
            }
            if let Some(text) = final_response {
                // After every tool return so the call/return pairs stay adjacent.
                turn.push(Message::model_text(text.as_str()));
                return Ok(text);
            }
        }
        Err(AgentError::ToolRounds(self.options.max_tool_rounds))
    }

    /// Maps the location picked in a structured answer, like a result validator.
    async fn show_location(
        &self,
        location: Option<&str>,
        ctx: &mut ToolContext,
        sink: &mut dyn DisplaySink
    ) -> Result<(), AgentError> {
        let Some(location) = location.map(str::trim).filter(|l| !l.is_empty()) else {
            return Ok(());
        };
        let before = ctx.map.clone();
        if let Err(e) = self.tools.call(CREATE_LOCATION_MAP, json!({ "location": location }), ctx).await {
            warn!("Could not map '{}': {}", location, e);
        }
        flush_context(before, ctx, sink).await
    }

    async fn run_tool(
        &self,
        call: &ToolCall,
        turn: &mut Vec<Message>,
        ctx: &mut ToolContext,
        sink: &mut dyn DisplaySink,
        retries: &mut usize
    ) -> Result<(), AgentError> {
        let before = ctx.map.clone();
        match self.tools.call(&call.tool_name, call.args.clone(), ctx).await {
            Ok(content) => turn.push(Message::tool_return(call, content)),
            Err(e) => self.retry(retries, turn, Some(call), e.to_string())?,
        }
        flush_context(before, ctx, sink).await
    }

    fn retry(
        &self,
        retries: &mut usize,
        turn: &mut Vec<Message>,
        call: Option<&ToolCall>,
        reason: String
    ) -> Result<(), AgentError> {
        *retries += 1;
        if *retries > self.options.max_retries {
            return Err(AgentError::RetriesExhausted(reason));
        }
        warn!("Asking the model to retry: {}", reason);
        turn.push(Message::retry(call, reason));
        Ok(())
    }
}

/// Forwards notices and a changed map from a tool run to the display.
async fn flush_context(
    before: Option<crate::geo::MapView>,
    ctx: &mut ToolContext,
    sink: &mut dyn DisplaySink
) -> Result<(), AgentError> {
    for notice in ctx.notices.drain(..) {
        sink.notice(&notice).await?;
    }
    if ctx.map != before {
        if let Some(view) = &ctx.map {
            sink.map(view).await?;
        }
    }
    Ok(())
}

fn assign_tool_ids(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.tool_id.is_none() {
                call.tool_id = Some(format!("call_{}", Uuid::new_v4().simple()));
            }
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::tests::resolver;
    use crate::history::MemoryHistoryStore;
    use crate::llm::chat::ChatResponse;
    use crate::models::chat::Role;
    use crate::relay::tests::RecordingSink;
    use crate::tools::map::LOCATION_NOT_FOUND;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every request it receives.
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Api("script exhausted".into()))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn text(t: &str) -> ChatResponse {
        ChatResponse { text: t.into(), tool_calls: Vec::new() }
    }

    fn calls(name: &str, args: serde_json::Value) -> ChatResponse {
        ChatResponse {
            text: String::new(),
            tool_calls: vec![ToolCall { tool_name: name.into(), args, tool_id: None }],
        }
    }

    fn agent_with(
        client: Arc<ScriptedClient>,
        options: AgentOptions
    ) -> (ChatAgent, Arc<MemoryHistoryStore>) {
        let store = Arc::new(MemoryHistoryStore::default());
        let (resolver, _) = resolver();
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WeatherTool));
        tools.register(Arc::new(CreateLocationMapTool::new(Arc::new(resolver))));
        let agent = ChatAgent::with_parts(client, tools, store.clone(), AgentOptions {
            debounce: Duration::ZERO,
            ..options
        });
        (agent, store)
    }

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages
            .iter()
            .map(|m| m.role())
            .collect()
    }

    #[tokio::test]
    async fn plain_turn_is_streamed_and_saved() {
        let client = ScriptedClient::new(vec![text("Hello!")]);
        let (agent, store) = agent_with(client.clone(), AgentOptions {
            system_prompt: Some("Be brief.".into()),
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent.process_message(&mut session, "Hi", &mut sink).await.unwrap();

        assert_eq!(outcome.response, "Hello!");
        assert!(outcome.persisted);
        assert_eq!(roles(&outcome.messages), vec![Role::System, Role::User, Role::ModelText]);
        assert_eq!(session.messages().len(), 3);
        assert_eq!(sink.partials.last().unwrap(), "Hello!");
        assert_eq!(sink.finished, vec!["Hello!".to_string()]);
        assert_eq!(store.turn_count().await, 1);
        assert_eq!(client.requests()[0].tools.len(), 2);
    }

    #[tokio::test]
    async fn system_prompt_only_opens_a_conversation() {
        let client = ScriptedClient::new(vec![text("one"), text("two")]);
        let (agent, _) = agent_with(client.clone(), AgentOptions {
            system_prompt: Some("Be brief.".into()),
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        agent.process_message(&mut session, "first", &mut sink).await.unwrap();
        let second = agent.process_message(&mut session, "second", &mut sink).await.unwrap();

        assert_eq!(roles(&second.messages), vec![Role::User, Role::ModelText]);
        assert_eq!(client.requests()[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn map_tool_updates_session_and_display() {
        let client = ScriptedClient::new(
            vec![calls(CREATE_LOCATION_MAP, json!({"location": "Kaohsiung"})), text("Here it is.")]
        );
        let (agent, store) = agent_with(client.clone(), AgentOptions::default());
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent
            .process_message(&mut session, "Show me Kaohsiung", &mut sink).await
            .unwrap();

        assert_eq!(
            roles(&outcome.messages),
            vec![Role::User, Role::ModelStructured, Role::ToolReturn, Role::ModelText]
        );
        assert_eq!(session.map().unwrap().marker.popup, "Kaohsiung");
        assert_eq!(sink.maps.len(), 1);
        assert!(sink.notices.is_empty());

        let second_request = &client.requests()[1];
        match second_request.messages.last().unwrap() {
            Message::ToolReturn { content, tool_id, .. } => {
                assert_eq!(content, "finished creating map for Kaohsiung");
                assert!(tool_id.is_some());
            }
            other => panic!("expected tool return, got {:?}", other),
        }
        assert_eq!(store.load_all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn geocoding_miss_shows_notice() {
        let client = ScriptedClient::new(
            vec![calls(CREATE_LOCATION_MAP, json!({"location": "Nowhere-xyz"})), text("Sorry.")]
        );
        let (agent, _) = agent_with(client, AgentOptions::default());
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        agent.process_message(&mut session, "map Nowhere", &mut sink).await.unwrap();

        assert_eq!(sink.notices, vec![LOCATION_NOT_FOUND.to_string()]);
        assert_eq!(session.map().unwrap().center, crate::geo::DEFAULT_FALLBACK);
    }

    #[tokio::test]
    async fn unknown_tool_gets_a_retry_prompt() {
        let client = ScriptedClient::new(
            vec![calls("teleport", json!({"to": "Mars"})), text("I can't do that.")]
        );
        let (agent, _) = agent_with(client, AgentOptions::default());
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent.process_message(&mut session, "beam me", &mut sink).await.unwrap();

        assert_eq!(
            roles(&outcome.messages),
            vec![Role::User, Role::ModelStructured, Role::Retry, Role::ModelText]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_abort_without_saving() {
        let client = ScriptedClient::new(vec![calls("teleport", json!({}))]);
        let (agent, store) = agent_with(client, AgentOptions {
            max_retries: 0,
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let err = agent.process_message(&mut session, "beam me", &mut sink).await.unwrap_err();

        assert!(matches!(err, AgentError::RetriesExhausted(_)));
        assert!(session.is_empty());
        assert_eq!(store.turn_count().await, 0);
    }

    #[tokio::test]
    async fn tool_loop_is_bounded() {
        let client = ScriptedClient::new(
            vec![
                calls("get_weather", json!({"location": "Hualien"})),
                calls("get_weather", json!({"location": "Hualien"}))
            ]
        );
        let (agent, _) = agent_with(client, AgentOptions {
            max_tool_rounds: 2,
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let err = agent.process_message(&mut session, "weather?", &mut sink).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolRounds(2)));
    }

    #[tokio::test]
    async fn llm_failure_aborts_the_turn() {
        let client = ScriptedClient::new(Vec::new());
        let (agent, store) = agent_with(client, AgentOptions::default());
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let err = agent.process_message(&mut session, "Hi", &mut sink).await.unwrap_err();

        assert!(matches!(err, AgentError::Llm(_)));
        assert!(session.is_empty());
        assert_eq!(store.turn_count().await, 0);
        assert!(sink.finished.is_empty());
    }

    #[tokio::test]
    async fn empty_answer_is_not_saved() {
        let client = ScriptedClient::new(vec![text("")]);
        let (agent, store) = agent_with(client, AgentOptions::default());
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent.process_message(&mut session, "Hi", &mut sink).await.unwrap();

        assert!(!outcome.persisted);
        assert_eq!(store.turn_count().await, 0);
    }

    #[tokio::test]
    async fn structured_answer_maps_the_location() {
        let client = ScriptedClient::new(
            vec![
                calls(
                    FINAL_RESULT_TOOL,
                    json!({"location": "Kaohsiung", "response": "Kaohsiung is a harbour city."})
                )
            ]
        );
        let (agent, store) = agent_with(client.clone(), AgentOptions {
            mode: ResponseMode::Structured,
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent
            .process_message(&mut session, "Tell me about Kaohsiung", &mut sink).await
            .unwrap();

        assert_eq!(outcome.response, "Kaohsiung is a harbour city.");
        assert_eq!(
            roles(&outcome.messages),
            vec![Role::User, Role::ModelStructured, Role::ToolReturn, Role::ModelText]
        );
        assert_eq!(session.map().unwrap().marker.popup, "Kaohsiung");
        assert_eq!(sink.maps.len(), 1);
        assert!(client.requests()[0].require_tool);
        assert!(client.requests()[0].tools.iter().any(|t| t.name == FINAL_RESULT_TOOL));
        assert_eq!(store.turn_count().await, 1);
    }

    #[tokio::test]
    async fn structured_answer_without_location_skips_the_map() {
        let client = ScriptedClient::new(
            vec![calls(FINAL_RESULT_TOOL, json!({"location": null, "response": "Hello there."}))]
        );
        let (agent, _) = agent_with(client, AgentOptions {
            mode: ResponseMode::Structured,
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent.process_message(&mut session, "hello", &mut sink).await.unwrap();

        assert_eq!(outcome.response, "Hello there.");
        assert!(session.map().is_none());
        assert!(sink.maps.is_empty());
    }

    #[tokio::test]
    async fn structured_answer_is_in_the_reloaded_transcript() {
        let client = ScriptedClient::new(
            vec![calls(FINAL_RESULT_TOOL, json!({"location": null, "response": "Hello there."}))]
        );
        let (agent, store) = agent_with(client, AgentOptions {
            mode: ResponseMode::Structured,
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        agent.process_message(&mut session, "hello", &mut sink).await.unwrap();

        let reloaded = Session::hydrate(store.as_ref()).await.unwrap();
        let transcript = reloaded.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].speaker, "user");
        assert_eq!(transcript[0].content, "hello");
        assert_eq!(transcript[1].speaker, "assistant");
        assert_eq!(transcript[1].content, "Hello there.");
        assert_eq!(session.transcript(), transcript);
    }

    #[tokio::test]
    async fn malformed_structured_answer_is_retried() {
        let client = ScriptedClient::new(
            vec![
                calls(FINAL_RESULT_TOOL, json!({"location": "Kaohsiung"})),
                calls(FINAL_RESULT_TOOL, json!({"location": "Kaohsiung", "response": "Found it."}))
            ]
        );
        let (agent, _) = agent_with(client, AgentOptions {
            mode: ResponseMode::Structured,
            ..AgentOptions::default()
        });
        let mut session = Session::new();
        let mut sink = RecordingSink::default();

        let outcome = agent.process_message(&mut session, "where?", &mut sink).await.unwrap();

        assert_eq!(outcome.response, "Found it.");
        assert_eq!(
            roles(&outcome.messages),
            vec![
                Role::User,
                Role::ModelStructured,
                Role::Retry,
                Role::ModelStructured,
                Role::ToolReturn,
                Role::ModelText
            ]
        );
    }

    #[test]
    fn response_mode_parses() {
        assert_eq!("Structured".parse::<ResponseMode>().unwrap(), ResponseMode::Structured);
        assert!("poetry".parse::<ResponseMode>().is_err());
    }
}
