//! In-memory repository backend.
//!
//! Used for tests and offline sessions. All data is ephemeral.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::decode::bytes_to_text;
use super::{CommitOutcome, CommitRequest, RepoError, RepoRef, RepoResult, RepoSource};
use crate::tree::{TreeEntry, normalize_path};

/// In-memory repository source.
///
/// Files are stored as raw bytes so binary content can be exercised.
#[derive(Debug, Default)]
pub struct MemoryRepo {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    commits: Mutex<Vec<CommitRequest>>,
    fetches: AtomicUsize,
}

impl MemoryRepo {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a text file.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.insert(path, content.as_bytes().to_vec());
        self
    }

    /// Add or replace a file.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files.write().insert(normalize_path(path), bytes);
    }

    /// Commits received so far, in order.
    pub fn commits(&self) -> Vec<CommitRequest> {
        self.commits.lock().clone()
    }

    /// Number of `fetch_content` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoSource for MemoryRepo {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_tree(&self, _repo: &RepoRef) -> RepoResult<Vec<TreeEntry>> {
        let files = self.files.read();
        let mut dirs = BTreeSet::new();
        for path in files.keys() {
            let mut prefix = path.as_str();
            while let Some(idx) = prefix.rfind('/') {
                prefix = &prefix[..idx];
                dirs.insert(prefix.to_string());
            }
        }
        let mut entries: Vec<TreeEntry> = dirs.into_iter().map(TreeEntry::tree).collect();
        entries.extend(files.keys().map(|p| TreeEntry::blob(p.clone())));
        Ok(entries)
    }

    async fn fetch_content(&self, _repo: &RepoRef, path: &str) -> RepoResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let path = normalize_path(path);
        let bytes = self
            .files
            .read()
            .get(&path)
            .cloned()
            .ok_or_else(|| RepoError::not_found(path.clone()))?;
        Ok(bytes_to_text(&path, bytes))
    }

    async fn commit(&self, _repo: &RepoRef, request: CommitRequest) -> RepoResult<CommitOutcome> {
        let path = normalize_path(&request.path);
        let created = self
            .files
            .write()
            .insert(path.clone(), request.content.as_bytes().to_vec())
            .is_none();
        self.commits.lock().push(request);
        Ok(CommitOutcome {
            path,
            locator: None,
            created,
        })
    }
}
