//! One browsing session over one repository.
//!
//! The session owns the overlay, the tree and the conversation, and hands the
//! same overlay and tree to the tool dispatcher. Hosts talk to the session
//! only; everything it holds lives for the session and no longer.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::conversation::{
    Conversation, ConversationEngine, EngineConfig, ImageAttachment, Message, SharedConversation,
    TurnStream,
};
use crate::dispatch::ToolDispatcher;
use crate::llm::{LlmProvider, Part};
use crate::overlay::{Overlay, SharedOverlay};
use crate::prompt::system_instruction;
use crate::repo::{CommitOutcome, CommitRequest, RepoError, RepoRef, RepoSource, ValidationError};
use crate::tools::FileUpdate;
use crate::tree::{FileNode, SharedTree, build_from_flat_list, normalize_path};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    /// A reply is still streaming.
    #[error("a reply is still in progress")]
    Busy,
}

pub struct Session {
    repo: RepoRef,
    source: Arc<dyn RepoSource>,
    overlay: SharedOverlay,
    tree: SharedTree,
    engine: ConversationEngine,
    conversation: SharedConversation,
    read_cap: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("repo", &self.repo)
            .field("source", &self.source.name())
            .field("active_path", &self.active_path())
            .finish()
    }
}

impl Session {
    /// Fetch the repository listing and set up a fresh session.
    pub async fn load(
        config: &Config,
        source: Arc<dyn RepoSource>,
        provider: Arc<dyn LlmProvider>,
        repo: RepoRef,
    ) -> Result<Self, SessionError> {
        let entries = source.fetch_tree(&repo).await?;
        let tree = SharedTree::new(build_from_flat_list(&entries));
        info!(repo = %repo, entries = entries.len(), source = source.name(), "session loaded");

        let overlay = Overlay::shared(source.clone(), repo.clone());
        let dispatcher = ToolDispatcher::new(overlay.clone(), tree.clone())
            .with_read_cap(config.tools.read_cap);
        let engine = ConversationEngine::new(
            provider,
            Arc::new(dispatcher),
            EngineConfig::from_llm(&config.llm),
        );

        Ok(Self {
            repo,
            source,
            overlay,
            tree,
            engine,
            conversation: Conversation::shared(),
            read_cap: config.tools.read_cap,
        })
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    /// Snapshot of the file tree.
    pub fn tree(&self) -> Vec<FileNode> {
        self.tree.snapshot()
    }

    pub fn overlay(&self) -> &SharedOverlay {
        &self.overlay
    }

    fn dispatcher(&self) -> &ToolDispatcher {
        self.engine.dispatcher()
    }

    /// Make `path` the active file and return its current content.
    pub async fn open(&self, path: &str) -> Result<String, SessionError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(ValidationError::EmptyInput("path").into());
        }
        let content = self.overlay.get(&path).await?;
        self.dispatcher().set_active_path(Some(&path));
        Ok(content)
    }

    pub fn close(&self) {
        self.dispatcher().set_active_path(None);
    }

    pub fn active_path(&self) -> Option<String> {
        self.dispatcher().active_path()
    }

    /// Drop the local edit for `path`. Returns the discarded content.
    pub fn discard(&self, path: &str) -> Option<String> {
        let discarded = self.overlay.discard(path);
        if discarded.is_some() {
            info!(path, "discarded local edit");
        }
        discarded
    }

    /// Paths with uncommitted edits.
    pub fn dirty_paths(&self) -> Vec<String> {
        self.overlay.dirty_paths()
    }

    /// Write the local edit of `path` to the remote.
    pub async fn commit(&self, path: &str, message: &str) -> Result<CommitOutcome, SessionError> {
        let path = normalize_path(path);
        if message.trim().is_empty() {
            return Err(ValidationError::EmptyInput("commit message").into());
        }
        let content = self
            .overlay
            .local_edit(&path)
            .ok_or_else(|| ValidationError::NothingToCommit(path.clone()))?;

        let outcome = self
            .source
            .commit(
                &self.repo,
                CommitRequest {
                    path: path.clone(),
                    content: content.clone(),
                    message: message.trim().to_string(),
                },
            )
            .await?;
        self.overlay.mark_committed(&path, content);
        if let Err(e) = self.tree.insert(&path) {
            warn!(path = %path, "committed path does not fit the tree: {}", e);
        }
        Ok(outcome)
    }

    /// Send a user message and stream the reply.
    pub async fn chat(
        &self,
        text: &str,
        image: Option<ImageAttachment>,
    ) -> Result<TurnStream, SessionError> {
        if text.trim().is_empty() && image.is_none() {
            return Err(ValidationError::EmptyInput("message").into());
        }
        self.ensure_idle()?;

        let mut parts = Vec::with_capacity(2);
        if !text.trim().is_empty() {
            parts.push(Part::text(text));
        }
        if let Some(image) = &image {
            parts.push(image.to_part());
        }
        let system = self.system_context().await;
        Ok(self.engine.run(self.conversation.clone(), parts, Some(system)))
    }

    /// Resend the history after a failed run.
    pub async fn retry(&self) -> Result<TurnStream, SessionError> {
        self.ensure_idle()?;
        if !self.conversation.lock().awaits_model() {
            return Err(ValidationError::NothingToRetry.into());
        }
        let system = self.system_context().await;
        Ok(self.engine.run(self.conversation.clone(), Vec::new(), Some(system)))
    }

    /// Receive a notification for each file the model updates.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<FileUpdate> {
        self.dispatcher().subscribe()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.conversation.lock().messages().to_vec()
    }

    pub fn conversation(&self) -> &SharedConversation {
        &self.conversation
    }

    /// Start over with an empty conversation.
    pub fn reset_conversation(&self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.conversation.lock().clear();
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.conversation.lock().streaming_message().is_some() {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    async fn system_context(&self) -> String {
        let active = match self.active_path() {
            Some(path) => match self.overlay.get(&path).await {
                Ok(content) => Some((path, content)),
                Err(e) => {
                    warn!(path = %path, "active file unavailable for context: {}", e);
                    None
                }
            },
            None => None,
        };
        system_instruction(
            &self.repo,
            active.as_ref().map(|(p, c)| (p.as_str(), c.as_str())),
            self.read_cap,
        )
    }
}
