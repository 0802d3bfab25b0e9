//! Layered file-state overlay.
//!
//! Each path has up to three tiers of content:
//!
//! ```text
//!   local_edit   written by update_file / the user, never by background work
//!        │ else
//!   cached       filled on first fetch
//!        │ else
//!   remote       last known committed content
//!        │ else
//!   RepoSource::fetch_content  → stored into `cached`
//! ```
//!
//! Records are created lazily on first read or first write. A local edit is
//! cleared only by an explicit user action (discard, or a successful commit).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::repo::{RepoRef, RepoResult, RepoSource};
use crate::tree::normalize_path;

/// Content tiers for one path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRecord {
    pub remote: Option<String>,
    pub cached: Option<String>,
    pub local_edit: Option<String>,
}

impl FileRecord {
    /// Content by read precedence, without fetching.
    pub fn current(&self) -> Option<&str> {
        self.local_edit
            .as_deref()
            .or(self.cached.as_deref())
            .or(self.remote.as_deref())
    }

    fn is_empty(&self) -> bool {
        self.remote.is_none() && self.cached.is_none() && self.local_edit.is_none()
    }
}

/// The overlay store for one session.
pub struct Overlay {
    records: RwLock<HashMap<String, FileRecord>>,
    source: Arc<dyn RepoSource>,
    repo: RepoRef,
}

/// Overlay shared between the session, the dispatcher and the host.
pub type SharedOverlay = Arc<Overlay>;

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("repo", &self.repo)
            .field("source", &self.source.name())
            .field("records", &self.records.read().len())
            .finish()
    }
}

impl Overlay {
    /// Create an empty overlay over a repository.
    pub fn new(source: Arc<dyn RepoSource>, repo: RepoRef) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            source,
            repo,
        }
    }

    /// Create a shared overlay.
    pub fn shared(source: Arc<dyn RepoSource>, repo: RepoRef) -> SharedOverlay {
        Arc::new(Self::new(source, repo))
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    /// Read a file: local edit, else cache, else remote, else fetch.
    pub async fn get(&self, path: &str) -> RepoResult<String> {
        let path = normalize_path(path);

        // Fast path: any tier present
        let hit = self
            .records
            .read()
            .get(&path)
            .and_then(|r| r.current().map(str::to_string));
        if let Some(content) = hit {
            return Ok(content);
        }

        // Miss: fetch without holding the lock
        let content = self.source.fetch_content(&self.repo, &path).await?;

        let mut records = self.records.write();
        let record = records.entry(path).or_default();
        // A write may have landed while the fetch was in flight.
        if let Some(edit) = &record.local_edit {
            return Ok(edit.clone());
        }
        record.cached = Some(content.clone());
        Ok(content)
    }

    /// Write the local-edit tier. Returns `true` if the content changed.
    pub fn set(&self, path: &str, content: impl Into<String>) -> bool {
        let content = content.into();
        let mut records = self.records.write();
        let record = records.entry(normalize_path(path)).or_default();
        if record.local_edit.as_deref() == Some(content.as_str()) {
            return false;
        }
        record.local_edit = Some(content);
        true
    }

    /// Drop the local-edit tier. Returns the discarded edit, if any.
    pub fn discard(&self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        let mut records = self.records.write();
        let record = records.get_mut(&path)?;
        let edit = record.local_edit.take();
        if record.is_empty() {
            records.remove(&path);
        }
        edit
    }

    /// Record content as known-committed; clears the local edit.
    pub fn mark_committed(&self, path: &str, content: impl Into<String>) {
        let content = content.into();
        let mut records = self.records.write();
        let record = records.entry(normalize_path(path)).or_default();
        record.local_edit = None;
        record.cached = Some(content.clone());
        record.remote = Some(content);
    }

    /// The pending local edit for a path.
    pub fn local_edit(&self, path: &str) -> Option<String> {
        self.records
            .read()
            .get(&normalize_path(path))
            .and_then(|r| r.local_edit.clone())
    }

    /// Whether a path has a pending local edit.
    pub fn is_dirty(&self, path: &str) -> bool {
        self.records
            .read()
            .get(&normalize_path(path))
            .is_some_and(|r| r.local_edit.is_some())
    }

    /// All paths with pending local edits, sorted.
    pub fn dirty_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.local_edit.is_some())
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Snapshot of a path's tiers.
    pub fn record(&self, path: &str) -> Option<FileRecord> {
        self.records.read().get(&normalize_path(path)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepo;

    fn overlay_with(repo: MemoryRepo) -> (Overlay, Arc<MemoryRepo>) {
        let repo = Arc::new(repo);
        let overlay = Overlay::new(repo.clone(), RepoRef::new("o", "r"));
        (overlay, repo)
    }

    #[tokio::test]
    async fn test_get_fetches_once_then_caches() {
        let (overlay, repo) = overlay_with(MemoryRepo::new().with_file("a.rs", "remote"));
        assert_eq!(overlay.get("a.rs").await.unwrap(), "remote");
        assert_eq!(overlay.get("/a.rs").await.unwrap(), "remote");
        assert_eq!(repo.fetch_count(), 1);
        assert_eq!(overlay.record("a.rs").unwrap().cached.as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn test_set_overrides_cache() {
        let (overlay, _) = overlay_with(MemoryRepo::new().with_file("a.rs", "remote"));
        overlay.get("a.rs").await.unwrap();
        assert!(overlay.set("a.rs", "edited"));
        assert_eq!(overlay.get("a.rs").await.unwrap(), "edited");
        let record = overlay.record("a.rs").unwrap();
        assert_eq!(record.cached.as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn test_set_without_remote_needs_no_fetch() {
        let (overlay, repo) = overlay_with(MemoryRepo::new());
        overlay.set("new.rs", "fresh");
        assert_eq!(overlay.get("new.rs").await.unwrap(), "fresh");
        assert_eq!(repo.fetch_count(), 0);
    }

    #[test]
    fn test_set_identical_is_noop() {
        let (overlay, _) = overlay_with(MemoryRepo::new());
        assert!(overlay.set("a", "x"));
        assert!(!overlay.set("a", "x"));
        assert!(overlay.set("a", "y"));
    }

    #[tokio::test]
    async fn test_discard_reverts_to_cache() {
        let (overlay, repo) = overlay_with(MemoryRepo::new().with_file("a.rs", "remote"));
        overlay.get("a.rs").await.unwrap();
        overlay.set("a.rs", "edited");
        assert_eq!(overlay.discard("a.rs").as_deref(), Some("edited"));
        assert_eq!(overlay.get("a.rs").await.unwrap(), "remote");
        assert_eq!(repo.fetch_count(), 1);
        assert!(!overlay.is_dirty("a.rs"));
    }

    #[tokio::test]
    async fn test_discard_before_any_read_falls_back_to_fetch() {
        let (overlay, repo) = overlay_with(MemoryRepo::new().with_file("a.rs", "remote"));
        overlay.set("a.rs", "edited");
        overlay.discard("a.rs");
        assert!(overlay.record("a.rs").is_none());
        assert_eq!(overlay.get("a.rs").await.unwrap(), "remote");
        assert_eq!(repo.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_error() {
        let (overlay, _) = overlay_with(MemoryRepo::new());
        assert!(overlay.get("ghost.rs").await.unwrap_err().is_not_found());
        assert!(overlay.record("ghost.rs").is_none());
    }

    #[test]
    fn test_dirty_paths_sorted() {
        let (overlay, _) = overlay_with(MemoryRepo::new());
        overlay.set("b.rs", "1");
        overlay.set("a.rs", "2");
        overlay.mark_committed("c.rs", "3");
        assert_eq!(overlay.dirty_paths(), vec!["a.rs", "b.rs"]);
    }

    #[tokio::test]
    async fn test_mark_committed_clears_edit() {
        let (overlay, _) = overlay_with(MemoryRepo::new());
        overlay.set("a.rs", "v2");
        overlay.mark_committed("a.rs", "v2");
        assert!(!overlay.is_dirty("a.rs"));
        assert_eq!(overlay.get("a.rs").await.unwrap(), "v2");
        assert_eq!(overlay.record("a.rs").unwrap().remote.as_deref(), Some("v2"));
    }
}
