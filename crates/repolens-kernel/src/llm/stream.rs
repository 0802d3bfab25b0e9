//! Provider-agnostic streaming events for model responses.
//!
//! Each provider converts its native wire events into [`StreamEvent`]; the
//! conversation engine's driver loop is the single consumer.
//!
//! ```text
//! ┌─────────────────┐   ┌─────────────────┐
//! │ GeminiProvider  │   │ ScriptedProvider│
//! │  (SSE chunks)   │   │  (fixed turns)  │
//! └────────┬────────┘   └────────┬────────┘
//!          ▼                     ▼
//!  ┌───────────────────────────────────────┐
//!  │ StreamEvent: TextDelta | ToolCalls    │
//!  │              | Done | Error           │
//!  └───────────────────────────────────────┘
//! ```

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use super::{Content, ToolCall, ToolDefinition};

/// Provider-agnostic streaming events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Incremental text.
    TextDelta(String),

    /// One or more tool invocations, in the order the model emitted them.
    ToolCalls(Vec<ToolCall>),

    /// Generation completed successfully.
    Done {
        /// Reason generation stopped (e.g., "STOP", "MAX_TOKENS").
        stop_reason: Option<String>,
        /// Input tokens consumed.
        input_tokens: Option<u32>,
        /// Output tokens generated.
        output_tokens: Option<u32>,
    },

    /// Error during generation.
    Error(String),
}

impl StreamEvent {
    /// A `Done` event with no metadata.
    pub fn done() -> Self {
        Self::Done {
            stop_reason: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// Check if this is a terminal event (Done or Error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }

    /// Extract delta text if this is a text event.
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::TextDelta(s) => Some(s),
            _ => None,
        }
    }
}

/// Boxed stream of events for one model turn.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A streaming request for one model turn.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// The model to use (empty = provider default).
    pub model: String,
    /// Role-tagged history, ending with the turn being sent.
    pub contents: Vec<Content>,
    /// System instruction.
    pub system: Option<String>,
    /// Maximum tokens to generate.
    pub max_output_tokens: Option<u32>,
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: Option<f32>,
    /// Tools available for the model to use.
    pub tools: Vec<ToolDefinition>,
}

impl StreamRequest {
    /// Create a new streaming request.
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            system: None,
            max_output_tokens: None,
            temperature: None,
            tools: Vec::new(),
        }
    }

    /// Set the system instruction.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max output tokens.
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    /// Set temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set tools available for the model.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// The last history entry (the turn being sent).
    pub fn last_turn(&self) -> Option<&Content> {
        self.contents.last()
    }
}
