//! # repolens-kernel
//!
//! Core of repolens: an agentic conversation engine that lets a model read and
//! rewrite files of a hosted repository through declared tools, backed by a
//! layered file overlay and an insertion-only path tree.
//!
//! ```text
//!   host (CLI / UI)
//!        │ chat(text)                       ▲ text fragments, FileUpdate
//!        ▼                                  │
//!   ┌──────────┐  turn   ┌────────────┐     │
//!   │ Session  │────────▶│ Conversation│────┘
//!   └────┬─────┘         │   Engine    │◀──── StreamEvent ──── LlmProvider
//!        │               └─────┬──────┘
//!        │                     │ ToolCall
//!        ▼                     ▼
//!   ┌──────────┐        ┌────────────┐
//!   │ Overlay  │◀───────│ Dispatcher │──────▶ SharedTree (insert)
//!   └────┬─────┘        └────────────┘
//!        │ fetch on miss
//!        ▼
//!   RepoSource (GitHub REST / memory)
//! ```
//!
//! Everything is in-memory for one browsing session.

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod llm;
pub mod overlay;
pub mod prompt;
pub mod repo;
pub mod session;
pub mod tools;
pub mod tree;

pub use config::{Config, ConfigError, GitHubConfig, LlmConfig, ToolsConfig};
pub use conversation::{
    Conversation, ConversationEngine, EngineConfig, EngineError, ImageAttachment, Message,
    SharedConversation, TurnStream,
};
pub use dispatch::ToolDispatcher;
pub use llm::{
    Content, GeminiProvider, LlmError, LlmProvider, LlmResult, Part, Role, ScriptedProvider,
    ScriptedTurn, StreamEvent, StreamRequest, ToolCall, ToolDefinition,
};
pub use overlay::{FileRecord, Overlay, SharedOverlay};
pub use repo::{
    CommitOutcome, CommitRequest, GitHubRepo, MemoryRepo, RepoError, RepoRef, RepoResult,
    RepoSource, ValidationError,
};
pub use session::{Session, SessionError};
pub use tools::{FileUpdate, ToolError, ToolInvocation, ToolName, ToolOutcome, ToolResult};
pub use tree::{FileNode, NodeKind, PathConflict, SharedTree, TreeEntry};
