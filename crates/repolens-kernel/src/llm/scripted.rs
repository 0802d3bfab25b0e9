//! Scripted provider that replays canned turns.
//!
//! Used by tests and the offline demo. Each call to `stream` pops the next
//! [`ScriptedTurn`] and records the request it was given.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::stream::{EventStream, StreamEvent, StreamRequest};
use super::{LlmError, LlmProvider, LlmResult, ToolCall};

/// One canned model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Events streamed in order.
    Events(Vec<StreamEvent>),
    /// The request fails before streaming.
    Fail(String),
}

impl ScriptedTurn {
    /// A turn that streams `text` then completes.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![StreamEvent::TextDelta(text.to_string()), StreamEvent::done()])
    }

    /// A turn that emits one tool-call batch then completes.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::Events(vec![StreamEvent::ToolCalls(calls), StreamEvent::done()])
    }
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Turns not yet consumed.
    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn stream(&self, request: StreamRequest) -> LlmResult<EventStream> {
        self.requests.lock().push(request);
        let turn = self.turns.lock().pop_front();
        match turn {
            Some(ScriptedTurn::Events(events)) => Ok(Box::pin(futures::stream::iter(events))),
            Some(ScriptedTurn::Fail(message)) => Err(LlmError::NetworkError(message)),
            None => Err(LlmError::Unavailable("script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_replays_in_order_and_records_requests() {
        let provider = ScriptedProvider::new([ScriptedTurn::text("one"), ScriptedTurn::Fail("down".into())]);

        let events: Vec<_> = provider
            .stream(StreamRequest::new("m", vec![]))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events[0], StreamEvent::TextDelta("one".into()));
        assert!(events[1].is_terminal());

        let err = provider.stream(StreamRequest::new("m", vec![])).await.err().unwrap();
        assert!(matches!(err, LlmError::NetworkError(m) if m == "down"));

        let err = provider.stream(StreamRequest::new("m", vec![])).await.err().unwrap();
        assert!(matches!(err, LlmError::Unavailable(_)));
        assert_eq!(provider.request_count(), 3);
        assert_eq!(provider.remaining(), 0);
    }
}
