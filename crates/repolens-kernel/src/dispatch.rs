//! Tool dispatcher: executes parsed invocations against the overlay and tree.

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::llm::ToolCall;
use crate::overlay::SharedOverlay;
use crate::tools::{
    self, DEFAULT_READ_CAP, FileUpdate, ToolError, ToolInvocation, ToolResult, truncate_chars,
};
use crate::tree::{SharedTree, normalize_path};

/// Capacity of the file-update side channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

pub struct ToolDispatcher {
    overlay: SharedOverlay,
    tree: SharedTree,
    active_path: RwLock<Option<String>>,
    updates: broadcast::Sender<FileUpdate>,
    read_cap: usize,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("active_path", &*self.active_path.read())
            .field("read_cap", &self.read_cap)
            .finish()
    }
}

impl ToolDispatcher {
    pub fn new(overlay: SharedOverlay, tree: SharedTree) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            overlay,
            tree,
            active_path: RwLock::new(None),
            updates,
            read_cap: DEFAULT_READ_CAP,
        }
    }

    /// Set the `read_file` character cap.
    pub fn with_read_cap(mut self, read_cap: usize) -> Self {
        self.read_cap = read_cap;
        self
    }

    pub fn overlay(&self) -> &SharedOverlay {
        &self.overlay
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    /// Set the file `update_file` writes to when no path is given.
    pub fn set_active_path(&self, path: Option<&str>) {
        *self.active_path.write() = path.map(normalize_path).filter(|p| !p.is_empty());
    }

    pub fn active_path(&self) -> Option<String> {
        self.active_path.read().clone()
    }

    /// Subscribe to `update_file` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<FileUpdate> {
        self.updates.subscribe()
    }

    /// Marker yielded when `call` is dispatched.
    pub fn progress_marker(&self, call: &ToolCall) -> String {
        tools::progress_marker(call, self.active_path().as_deref())
    }

    /// Execute one call. Failures become error results.
    #[tracing::instrument(skip(self, call), fields(id = %call.id, tool = %call.name))]
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        match self.execute(call).await {
            Ok(result) => result,
            Err(e) => {
                warn!("tool call failed: {}", e);
                ToolResult::error(call, e.to_string())
            }
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        match ToolInvocation::parse(call)? {
            ToolInvocation::Read { path } => {
                let content = self
                    .overlay
                    .get(&path)
                    .await
                    .map_err(|source| ToolError::Unresolvable {
                        path: path.clone(),
                        source,
                    })?;
                let truncated = truncate_chars(&content, self.read_cap);
                debug!(
                    path = %path,
                    chars = truncated.chars().count(),
                    truncated = truncated.len() < content.len(),
                    "read_file"
                );
                Ok(ToolResult::ok(call, json!({ "content": truncated })))
            }
            ToolInvocation::Update {
                path,
                code,
                description,
            } => {
                let path = path
                    .or_else(|| self.active_path())
                    .ok_or(ToolError::NoActiveFile)?;
                let grew = self
                    .tree
                    .insert(&path)
                    .map_err(|source| ToolError::PathConflict {
                        path: path.clone(),
                        source,
                    })?;
                self.overlay.set(&path, code.clone());
                debug!(path = %path, grew, "update_file");
                // No subscribers is fine.
                let _ = self.updates.send(FileUpdate {
                    path,
                    new_content: code,
                    description,
                });
                Ok(ToolResult::ok(call, json!({ "result": "ok" })))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::overlay::Overlay;
    use crate::repo::{MemoryRepo, RepoRef};
    use crate::tools::ToolOutcome;

    fn dispatcher(repo: MemoryRepo) -> ToolDispatcher {
        let overlay = Overlay::shared(Arc::new(repo), RepoRef::new("o", "r"));
        ToolDispatcher::new(overlay, SharedTree::default())
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new("id-1", name, args)
    }

    #[tokio::test]
    async fn test_read_returns_content() {
        let d = dispatcher(MemoryRepo::new().with_file("src/lib.rs", "pub fn x() {}"));
        let result = d.dispatch(&call("read_file", json!({"path": "src/lib.rs"}))).await;
        assert_eq!(result.id, "id-1");
        assert_eq!(result.outcome, ToolOutcome::Content(json!({"content": "pub fn x() {}"})));
    }

    #[tokio::test]
    async fn test_read_truncates_at_cap() {
        let big = "a".repeat(30_001);
        let d = dispatcher(MemoryRepo::new().with_file("big.txt", &big));
        let result = d.dispatch(&call("read_file", json!({"path": "big.txt"}))).await;
        let content = result.response()["content"].as_str().unwrap().to_string();
        assert_eq!(content.len(), 30_000);
    }

    #[tokio::test]
    async fn test_read_missing_is_error_result() {
        let d = dispatcher(MemoryRepo::new());
        let result = d.dispatch(&call("read_file", json!({"path": "nope.rs"}))).await;
        assert!(result.is_error());
        assert!(result.response()["error"].as_str().unwrap().contains("nope.rs"));
    }

    #[tokio::test]
    async fn test_update_writes_overlay_tree_and_notifies() {
        let d = dispatcher(MemoryRepo::new());
        let mut rx = d.subscribe();
        let result = d
            .dispatch(&call(
                "update_file",
                json!({"path": "src/a.ts", "code": "X", "description": "add X"}),
            ))
            .await;
        assert_eq!(result.response(), json!({"result": "ok"}));
        assert_eq!(d.overlay().get("src/a.ts").await.unwrap(), "X");
        assert!(d.tree().contains_blob("src/a.ts"));
        assert_eq!(
            rx.try_recv().unwrap(),
            FileUpdate {
                path: "src/a.ts".into(),
                new_content: "X".into(),
                description: "add X".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_update_defaults_to_active_file() {
        let d = dispatcher(MemoryRepo::new());
        let args = json!({"code": "new", "description": "d"});

        let result = d.dispatch(&call("update_file", args.clone())).await;
        assert_eq!(result.response(), json!({"error": "no path was given and no file is open"}));

        d.set_active_path(Some("/README.md"));
        let result = d.dispatch(&call("update_file", args)).await;
        assert!(!result.is_error());
        assert_eq!(d.overlay().local_edit("README.md").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_update_with_empty_code_clears_file() {
        let d = dispatcher(MemoryRepo::new().with_file("a.rs", "A"));
        let result = d
            .dispatch(&call(
                "update_file",
                json!({"path": "a.rs", "code": "", "description": "empty it"}),
            ))
            .await;
        assert_eq!(result.response(), json!({"result": "ok"}));
        assert_eq!(d.overlay().get("a.rs").await.unwrap(), "");
        assert_eq!(d.overlay().dirty_paths(), vec!["a.rs"]);
    }

    #[tokio::test]
    async fn test_update_under_file_or_onto_directory_is_refused() {
        let d = dispatcher(MemoryRepo::new());
        let mut rx = d.subscribe();
        let write = |path: &str| {
            call(
                "update_file",
                json!({"path": path, "code": "x", "description": "d"}),
            )
        };

        assert!(!d.dispatch(&write("README.md")).await.is_error());
        assert!(!d.dispatch(&write("docs/guide.md")).await.is_error());
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        let nested = d.dispatch(&write("README.md/notes.txt")).await;
        assert_eq!(
            nested.response(),
            json!({"error": "cannot write README.md/notes.txt: README.md is a file, not a directory"})
        );
        let onto_dir = d.dispatch(&write("docs")).await;
        assert_eq!(
            onto_dir.response(),
            json!({"error": "cannot write docs: docs is a directory"})
        );

        assert_eq!(d.overlay().dirty_paths(), vec!["README.md", "docs/guide.md"]);
        assert!(!d.tree().contains_blob("README.md/notes.txt"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let d = dispatcher(MemoryRepo::new());
        let result = d.dispatch(&call("delete_file", json!({"path": "a"}))).await;
        assert_eq!(result.name, "delete_file");
        assert_eq!(result.response(), json!({"error": "unknown tool: delete_file"}));
    }
}
