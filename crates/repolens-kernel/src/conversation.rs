//! Conversation state and the agentic engine that drives it.
//!
//! A run sends the history to the model, yields text fragments as they
//! stream in, dispatches tool calls through the [`ToolDispatcher`] in arrival
//! order, and sends the correlated results back as the next turn. The run
//! ends on the first turn with no tool calls.
//!
//! ```text
//!   history ──▶ provider.stream ──▶ TextDelta ──────────────▶ Ok(fragment)
//!                                   ToolCalls ─▶ marker ────▶ Ok(marker)
//!                                              └▶ dispatch ─▶ ToolResult
//!   history ◀── model(text + calls), user(results) ◀─────────┘
//! ```
//!
//! The driver runs in its own task and writes into a bounded channel, but it
//! only does work the consumer asked for. Each time the [`TurnStream`] finds
//! the channel empty it publishes how many fragments it has taken; the driver
//! waits for that count to catch up with what it sent before issuing a model
//! turn or running a tool. A consumer that stops polling therefore stops the
//! run, and dropping the stream cancels it.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{DEFAULT_MAX_TURNS, DEFAULT_MODEL, LlmConfig};
use crate::dispatch::ToolDispatcher;
use crate::llm::{
    Content, LlmError, LlmProvider, Part, Role, StreamEvent, StreamRequest, ToolCall,
};
use crate::tools::{ToolResult, tool_definitions};

/// Image attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

impl ImageAttachment {
    pub fn to_part(&self) -> Part {
        Part::InlineData {
            mime_type: self.mime_type.clone(),
            data: self.data.clone(),
        }
    }
}

/// One entry of the chat transcript shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    /// Still receiving fragments.
    #[serde(default)]
    pub streaming: bool,
}

impl Message {
    pub fn user(text: impl Into<String>, image: Option<ImageAttachment>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            image,
            streaming: false,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            image: None,
            streaming: false,
        }
    }
}

/// Transcript plus model-facing history.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    history: Vec<Content>,
    pending_calls: Vec<ToolCall>,
    pending_results: Vec<ToolResult>,
}

/// Conversation shared between the session and a running engine task.
pub type SharedConversation = Arc<Mutex<Conversation>>;

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedConversation {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Calls of the in-flight turn.
    pub fn pending_calls(&self) -> &[ToolCall] {
        &self.pending_calls
    }

    /// Results collected so far for the in-flight turn.
    pub fn pending_results(&self) -> &[ToolResult] {
        &self.pending_results
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Whether the history ends with a turn the model has not answered.
    pub fn awaits_model(&self) -> bool {
        self.history.last().is_some_and(|c| c.role == Role::User)
    }

    /// The streaming model message, if a run is in progress.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.streaming)
    }

    fn push_user_turn(&mut self, parts: Vec<Part>) {
        let text: String = parts.iter().filter_map(Part::as_text).collect();
        let image = parts.iter().find_map(|p| match p {
            Part::InlineData { mime_type, data } => Some(ImageAttachment {
                mime_type: mime_type.clone(),
                data: data.clone(),
            }),
            _ => None,
        });
        self.messages.push(Message::user(text, image));
        self.history.push(Content::user(parts));
    }

    fn begin_model_message(&mut self) {
        self.messages.push(Message {
            streaming: true,
            ..Message::model("")
        });
    }

    fn append_fragment(&mut self, fragment: &str) {
        if let Some(message) = self.messages.last_mut().filter(|m| m.streaming) {
            message.text.push_str(fragment);
        }
    }

    /// Move the completed turn into history.
    fn complete_turn(&mut self, text: String) {
        let calls = std::mem::take(&mut self.pending_calls);
        let results = std::mem::take(&mut self.pending_results);

        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        parts.extend(calls.iter().map(ToolCall::to_part));
        if !parts.is_empty() {
            self.history.push(Content::model(parts));
        }
        if !results.is_empty() {
            self.history
                .push(Content::user(results.into_iter().map(ToolResult::into_part).collect()));
        }
    }

    /// End the streaming message. An empty one is dropped.
    fn finalize(&mut self) {
        self.pending_calls.clear();
        self.pending_results.clear();
        if let Some(last) = self.messages.last_mut().filter(|m| m.streaming) {
            last.streaming = false;
            if last.text.is_empty() {
                self.messages.pop();
            }
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Terminal failure of a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model request failed.
    #[error("model transport failed: {0}")]
    Transport(#[from] LlmError),

    /// The provider reported an error mid-stream.
    #[error("model stream failed: {0}")]
    Stream(String),

    #[error("stopped after {0} model turns")]
    TurnLimit(u32),

    /// The consumer went away.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the same history can be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Stream(_))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model identifier (empty = provider default).
    pub model: String,
    pub max_turns: u32,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Buffered fragments before the driver waits on the consumer.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            temperature: None,
            max_output_tokens: None,
            channel_capacity: 32,
        }
    }
}

impl EngineConfig {
    pub fn from_llm(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_turns: config.max_turns,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            ..Self::default()
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }
}

/// The agentic conversation engine.
pub struct ConversationEngine {
    provider: Arc<dyn LlmProvider>,
    dispatcher: Arc<ToolDispatcher>,
    config: EngineConfig,
}

impl std::fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish()
    }
}

impl ConversationEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        dispatcher: Arc<ToolDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run.
    ///
    /// `parts` is appended to the history as a new user turn; pass an empty
    /// vector to resend the existing history (retry). Must be called within a
    /// tokio runtime.
    pub fn run(
        &self,
        conversation: SharedConversation,
        parts: Vec<Part>,
        system: Option<String>,
    ) -> TurnStream {
        {
            let mut conv = conversation.lock();
            if !parts.is_empty() {
                conv.push_user_turn(parts);
            }
            conv.begin_model_message();
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (demand_tx, demand_rx) = watch::channel(None);
        let driver = Driver {
            provider: self.provider.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            conversation,
            system,
            tx,
            sent: AtomicU64::new(0),
            demand: demand_rx,
        };
        let handle = tokio::spawn(driver.run());
        TurnStream {
            rx,
            handle,
            received: 0,
            demand: demand_tx,
        }
    }
}

/// State owned by the spawned driver task.
struct Driver {
    provider: Arc<dyn LlmProvider>,
    dispatcher: Arc<ToolDispatcher>,
    config: EngineConfig,
    conversation: SharedConversation,
    system: Option<String>,
    tx: mpsc::Sender<Result<String, EngineError>>,
    /// Fragments handed to the channel.
    sent: AtomicU64,
    /// Fragments the consumer had taken when it last asked for more.
    demand: watch::Receiver<Option<u64>>,
}

impl Driver {
    async fn run(self) {
        let outcome = self.turns().await;
        // Finalize before the consumer can observe the end of the run.
        self.conversation.lock().finalize();
        match outcome {
            Ok(()) => {}
            Err(EngineError::Cancelled) => debug!("consumer dropped the stream, stopping"),
            Err(e) => {
                error!("conversation run failed: {}", e);
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    /// Record a fragment in the transcript and hand it to the consumer.
    async fn emit(&self, fragment: String) -> Result<(), EngineError> {
        self.conversation.lock().append_fragment(&fragment);
        self.tx
            .send(Ok(fragment))
            .await
            .map_err(|_| EngineError::Cancelled)?;
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Wait until the consumer has taken every fragment and polls for more.
    async fn wait_for_demand(&self) -> Result<(), EngineError> {
        let sent = self.sent.load(Ordering::Acquire);
        let mut demand = self.demand.clone();
        let ready = demand
            .wait_for(|received| received.is_some_and(|n| n >= sent))
            .await
            .is_ok();
        if ready && !self.tx.is_closed() {
            Ok(())
        } else {
            Err(EngineError::Cancelled)
        }
    }

    fn request(&self) -> StreamRequest {
        let contents = self.conversation.lock().history.clone();
        let mut request =
            StreamRequest::new(&self.config.model, contents).with_tools(tool_definitions());
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max) = self.config.max_output_tokens {
            request = request.with_max_output_tokens(max);
        }
        request
    }

    async fn turns(&self) -> Result<(), EngineError> {
        for turn in 1..=self.config.max_turns {
            self.wait_for_demand().await?;

            let request = self.request();
            info!(turn, contents = request.contents.len(), "starting model turn");
            let mut stream = self.provider.stream(request).await?;

            let mut text = String::new();
            let mut dispatched = 0usize;
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::TextDelta(delta) => {
                        text.push_str(&delta);
                        self.emit(delta).await?;
                    }
                    StreamEvent::ToolCalls(calls) => {
                        for call in calls {
                            self.execute(call).await?;
                            dispatched += 1;
                        }
                    }
                    StreamEvent::Done {
                        stop_reason,
                        input_tokens,
                        output_tokens,
                    } => {
                        debug!(?stop_reason, ?input_tokens, ?output_tokens, "model turn done");
                        break;
                    }
                    StreamEvent::Error(message) => return Err(EngineError::Stream(message)),
                }
            }

            self.conversation.lock().complete_turn(text);
            if dispatched == 0 {
                info!(turn, "run complete");
                return Ok(());
            }
            info!(turn, tool_calls = dispatched, "sending tool results");
        }

        Err(EngineError::TurnLimit(self.config.max_turns))
    }

    /// Yield the marker, run the call, record the result.
    async fn execute(&self, call: ToolCall) -> Result<(), EngineError> {
        self.emit(self.dispatcher.progress_marker(&call)).await?;
        self.conversation.lock().pending_calls.push(call.clone());
        self.wait_for_demand().await?;

        let result = self.dispatcher.dispatch(&call).await;
        if self.tx.is_closed() {
            return Err(EngineError::Cancelled);
        }
        self.conversation.lock().pending_results.push(result);
        Ok(())
    }
}

/// Lazy, single-consumption sequence of text fragments for one run.
#[derive(Debug)]
pub struct TurnStream {
    rx: mpsc::Receiver<Result<String, EngineError>>,
    handle: JoinHandle<()>,
    received: u64,
    demand: watch::Sender<Option<u64>>,
}

impl TurnStream {
    /// Stop consuming. The returned handle resolves once the driver exits.
    pub fn cancel(self) -> JoinHandle<()> {
        let Self {
            rx, handle, demand, ..
        } = self;
        drop(rx);
        drop(demand);
        handle
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, EngineError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

impl Stream for TurnStream {
    type Item = Result<String, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                this.received += 1;
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                this.demand.send_replace(Some(this.received));
                Poll::Pending
            }
        }
    }
}
