use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::geo::MapView;
use crate::llm::chat::{ ChatStream, LlmError, StreamEvent };
use crate::models::chat::ToolCall;

#[derive(Debug, Error)]
#[error("display closed: {0}")]
pub struct SinkError(pub String);

/// Where a turn's output is rendered.
#[async_trait]
pub trait DisplaySink: Send {
    /// Called with the whole text received so far, not just the newest delta.
    async fn partial(&mut self, text: &str) -> Result<(), SinkError>;
    async fn notice(&mut self, message: &str) -> Result<(), SinkError>;
    async fn map(&mut self, view: &MapView) -> Result<(), SinkError>;
    async fn finish(&mut self, text: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RelayOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Drains one model stream into `sink`, at most one `partial` per `debounce`.
pub async fn relay(
    mut stream: ChatStream,
    sink: &mut dyn DisplaySink,
    debounce: Duration
) -> Result<RelayOutcome, RelayError> {
    let mut outcome = RelayOutcome::default();
    let mut last_push: Option<Instant> = None;
    let mut unsent = false;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Delta(delta) => {
                outcome.text.push_str(&delta);
                let due = last_push.map_or(true, |at| at.elapsed() >= debounce);
                if due {
                    sink.partial(&outcome.text).await?;
                    last_push = Some(Instant::now());
                    unsent = false;
                } else {
                    unsent = true;
                }
            }
            StreamEvent::ToolCall(call) => {
                debug!("Model requested tool '{}'", call.tool_name);
                outcome.tool_calls.push(call);
            }
        }
    }

    if unsent {
        sink.partial(&outcome.text).await?;
    }
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::chat::LlmError;
    use serde_json::json;

    /// Records everything it is shown.
    #[derive(Default, Debug)]
    pub struct RecordingSink {
        pub partials: Vec<String>,
        pub notices: Vec<String>,
        pub maps: Vec<MapView>,
        pub finished: Vec<String>,
    }

    #[async_trait]
    impl DisplaySink for RecordingSink {
        async fn partial(&mut self, text: &str) -> Result<(), SinkError> {
            self.partials.push(text.to_string());
            Ok(())
        }

        async fn notice(&mut self, message: &str) -> Result<(), SinkError> {
            self.notices.push(message.to_string());
            Ok(())
        }

        async fn map(&mut self, view: &MapView) -> Result<(), SinkError> {
            self.maps.push(view.clone());
            Ok(())
        }

        async fn finish(&mut self, text: &str) -> Result<(), SinkError> {
            self.finished.push(text.to_string());
            Ok(())
        }
    }

    fn stream_of(events: Vec<Result<StreamEvent, LlmError>>) -> ChatStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn accumulates_text_and_calls() {
        let mut sink = RecordingSink::default();
        let call = ToolCall {
            tool_name: "get_weather".into(),
            args: json!({"location": "Tainan"}),
            tool_id: Some("c1".into()),
        };
        let stream = stream_of(
            vec![
                Ok(StreamEvent::Delta("Hel".into())),
                Ok(StreamEvent::Delta("lo".into())),
                Ok(StreamEvent::ToolCall(call.clone()))
            ]
        );

        let outcome = relay(stream, &mut sink, Duration::ZERO).await.unwrap();

        assert_eq!(outcome.text, "Hello");
        assert_eq!(outcome.tool_calls, vec![call]);
        assert_eq!(sink.partials, vec!["Hel".to_string(), "Hello".to_string()]);
    }

    #[tokio::test]
    async fn debounce_coalesces_but_never_drops_the_tail() {
        let mut sink = RecordingSink::default();
        let stream = stream_of(
            vec![
                Ok(StreamEvent::Delta("a".into())),
                Ok(StreamEvent::Delta("b".into())),
                Ok(StreamEvent::Delta("c".into()))
            ]
        );

        let outcome = relay(stream, &mut sink, Duration::from_secs(3600)).await.unwrap();

        assert_eq!(outcome.text, "abc");
        assert_eq!(sink.partials, vec!["a".to_string(), "abc".to_string()]);
    }

    #[tokio::test]
    async fn stream_error_aborts() {
        let mut sink = RecordingSink::default();
        let stream = stream_of(
            vec![Ok(StreamEvent::Delta("x".into())), Err(LlmError::Api("boom".into()))]
        );
        let err = relay(stream, &mut sink, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, RelayError::Llm(LlmError::Api(_))));
    }
}
