//! Model provider abstraction.
//!
//! A provider accepts role-tagged history, a set of declared tools and a
//! system instruction, and streams back [`StreamEvent`]s. Follow-up turns carry
//! only [`Part::FunctionResponse`] parts correlated by call id.

mod gemini;
mod scripted;
pub mod stream;

pub use gemini::GeminiProvider;
pub use scripted::{ScriptedProvider, ScriptedTurn};
pub use stream::{EventStream, StreamEvent, StreamRequest};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human/user message (also carries tool results).
    User,
    /// Model message.
    Model,
}

/// One part of a content entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// Inline binary data (images), base64-encoded.
    InlineData { mime_type: String, data: String },
    /// A tool invocation emitted by the model.
    FunctionCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// The host's answer to a tool invocation.
    FunctionResponse {
        id: String,
        name: String,
        response: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A role-tagged entry of the model-facing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    /// Create a user entry.
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    /// Create a model entry.
    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    /// Whether every part is a function response.
    pub fn is_tool_results(&self) -> bool {
        !self.parts.is_empty()
            && self
                .parts
                .iter()
                .all(|p| matches!(p, Part::FunctionResponse { .. }))
    }
}

/// A tool invocation as received from the model (untyped arguments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id.
    pub id: String,
    /// Tool name as emitted by the model.
    pub name: String,
    /// Argument bag.
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// History part recording this call.
    pub fn to_part(&self) -> Part {
        Part::FunctionCall {
            id: self.id.clone(),
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }
}

/// Tool declaration sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object.
    pub parameters: serde_json::Value,
}

/// Error type for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Provider not configured or unavailable.
    #[error("provider not available: {0}")]
    Unavailable(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// Rate limited.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// API error.
    #[error("api error: {0}")]
    ApiError(String),

    /// Network error.
    #[error("network error: {0}")]
    NetworkError(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkError(e.to_string())
    }
}

/// Result type for LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Trait for streaming model providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., "gemini").
    fn name(&self) -> &str;

    /// Model used when a request leaves it empty.
    fn default_model(&self) -> &str;

    /// Start one streamed model turn.
    ///
    /// Errors returned here happen before any event; failures mid-stream
    /// arrive as [`StreamEvent::Error`].
    async fn stream(&self, request: StreamRequest) -> LlmResult<EventStream>;
}
