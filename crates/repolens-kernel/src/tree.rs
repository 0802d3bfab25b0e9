//! Hierarchical path tree for a repository listing.
//!
//! The tree is built once per repository load from the flat listing the
//! repository returns, and afterwards only grows: files the model creates are
//! inserted, nothing is ever pruned. Both operations are pure and return a new
//! value; [`SharedTree`] swaps the new value in so readers never observe a
//! half-built level.
//!
//! Sibling order at every level: directories first, then case-sensitive
//! lexicographic by name.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a node in the tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    /// A file.
    Blob,
    /// A directory.
    Tree,
}

/// One entry of a flat repository listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Full '/'-separated path from the repository root.
    pub path: String,
    /// Blob or tree.
    pub kind: NodeKind,
    /// Remote locator (object sha) if the repository provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Blob,
            locator: None,
        }
    }

    pub fn tree(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Tree,
            locator: None,
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }
}

/// A node of the path tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Full path, unique within the tree.
    pub path: String,
    /// Last path segment.
    pub name: String,
    /// Blob or tree.
    pub kind: NodeKind,
    /// Children; `Some` iff `kind` is [`NodeKind::Tree`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
    /// Remote locator, absent for files that only exist locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

impl FileNode {
    /// Create a file node.
    pub fn blob(path: impl Into<String>, locator: Option<String>) -> Self {
        let path = path.into();
        Self {
            name: last_segment(&path).to_string(),
            path,
            kind: NodeKind::Blob,
            children: None,
            locator,
        }
    }

    /// Create an empty directory node.
    pub fn tree(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: last_segment(&path).to_string(),
            path,
            kind: NodeKind::Tree,
            children: Some(Vec::new()),
            locator: None,
        }
    }

    fn from_entry(entry: &TreeEntry, path: String) -> Self {
        match entry.kind {
            NodeKind::Blob => Self::blob(path, entry.locator.clone()),
            NodeKind::Tree => Self {
                locator: entry.locator.clone(),
                ..Self::tree(path)
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Tree
    }

    /// Children slice (empty for blobs).
    pub fn children(&self) -> &[FileNode] {
        self.children.as_deref().unwrap_or(&[])
    }
}

/// Normalize a repository path: strip leading `/` and `./`, drop empty and `.`
/// segments.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn sibling_order(a: &FileNode, b: &FileNode) -> Ordering {
    match (a.is_dir(), b.is_dir()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.cmp(&b.name),
    }
}

fn sort_level(level: &mut [FileNode]) {
    level.sort_by(sibling_order);
}

/// Insert a file path into the tree, creating intermediate directories.
///
/// Returns the input unchanged when a node already occupies the final name,
/// or when an intermediate segment is an existing file.
pub fn insert(tree: &[FileNode], path: &str) -> Vec<FileNode> {
    let path = normalize_path(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    insert_into(tree, "", &segments).unwrap_or_else(|| tree.to_vec())
}

/// `None` means "no change at this level or below".
fn insert_into(level: &[FileNode], prefix: &str, segments: &[&str]) -> Option<Vec<FileNode>> {
    let (name, rest) = segments.split_first()?;
    let path = join(prefix, name);
    let existing = level.iter().position(|n| n.name == *name);

    if rest.is_empty() {
        if existing.is_some() {
            return None;
        }
        let mut next = level.to_vec();
        next.push(FileNode::blob(path, None));
        sort_level(&mut next);
        return Some(next);
    }

    match existing {
        Some(idx) => {
            let dir = &level[idx];
            if !dir.is_dir() {
                return None;
            }
            let children = insert_into(dir.children(), &path, rest)?;
            let mut next = level.to_vec();
            next[idx] = FileNode {
                children: Some(children),
                ..dir.clone()
            };
            Some(next)
        }
        None => {
            let children = insert_into(&[], &path, rest)?;
            let mut dir = FileNode::tree(path);
            dir.children = Some(children);
            let mut next = level.to_vec();
            next.push(dir);
            sort_level(&mut next);
            Some(next)
        }
    }
}

/// Build a tree from a flat listing.
///
/// Entries whose parent directory is missing from the listing are dropped, as
/// are entries nested under a file.
pub fn build_from_flat_list(entries: &[TreeEntry]) -> Vec<FileNode> {
    // Pass 1: path -> node lookup, first occurrence wins.
    let mut lookup: HashMap<String, FileNode> = HashMap::with_capacity(entries.len());
    let mut order: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = normalize_path(&entry.path);
        if path.is_empty() || lookup.contains_key(&path) {
            continue;
        }
        lookup.insert(path.clone(), FileNode::from_entry(entry, path.clone()));
        order.push(path);
    }

    // Pass 2: parent -> children index.
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut roots = Vec::new();
    for path in order {
        let parent = parent_path(&path);
        if parent.is_empty() {
            roots.push(path);
            continue;
        }
        match lookup.get(parent) {
            Some(node) if node.is_dir() => {
                children.entry(parent.to_string()).or_default().push(path);
            }
            Some(_) => tracing::debug!(path = %path, "dropping entry nested under a file"),
            None => tracing::debug!(path = %path, "dropping entry with missing parent"),
        }
    }

    let mut tree: Vec<FileNode> = roots
        .iter()
        .filter_map(|path| assemble(path, &mut lookup, &children))
        .collect();
    sort_level(&mut tree);
    tree
}

fn assemble(
    path: &str,
    lookup: &mut HashMap<String, FileNode>,
    children: &HashMap<String, Vec<String>>,
) -> Option<FileNode> {
    let mut node = lookup.remove(path)?;
    if node.is_dir() {
        let mut level: Vec<FileNode> = children
            .get(path)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|child| assemble(child, lookup, children))
                    .collect()
            })
            .unwrap_or_default();
        sort_level(&mut level);
        node.children = Some(level);
    }
    Some(node)
}

/// Find the node at `path`.
pub fn find<'a>(tree: &'a [FileNode], path: &str) -> Option<&'a FileNode> {
    let path = normalize_path(path);
    let mut level = tree;
    let mut found = None;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let node = level.iter().find(|n| n.name == segment)?;
        level = node.children();
        found = Some(node);
    }
    found
}

/// Whether `path` is a file in the tree.
pub fn contains_blob(tree: &[FileNode], path: &str) -> bool {
    find(tree, path).is_some_and(|n| n.kind == NodeKind::Blob)
}

/// Why a path cannot hold a file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathConflict {
    #[error("{0} is a file, not a directory")]
    FileAncestor(String),

    #[error("{0} is a directory")]
    IsDirectory(String),
}

/// Check that `path` can be a file: no segment before the last is a file and
/// the last is not a directory. Absent segments are fine.
pub fn check_file_path(tree: &[FileNode], path: &str) -> Result<(), PathConflict> {
    let path = normalize_path(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut level = tree;
    for (idx, segment) in segments.iter().enumerate() {
        let Some(node) = level.iter().find(|n| n.name == *segment) else {
            return Ok(());
        };
        let last = idx + 1 == segments.len();
        match (last, node.is_dir()) {
            (true, true) => return Err(PathConflict::IsDirectory(node.path.clone())),
            (false, false) => return Err(PathConflict::FileAncestor(node.path.clone())),
            _ => level = node.children(),
        }
    }
    Ok(())
}

/// All file paths, depth-first in display order.
pub fn blob_paths(tree: &[FileNode]) -> Vec<String> {
    fn walk(level: &[FileNode], out: &mut Vec<String>) {
        for node in level {
            match node.kind {
                NodeKind::Blob => out.push(node.path.clone()),
                NodeKind::Tree => walk(node.children(), out),
            }
        }
    }
    let mut out = Vec::new();
    walk(tree, &mut out);
    out
}

/// Session-wide holder for the current tree value.
///
/// Each insertion computes a new tree from the current one and swaps it in.
#[derive(Debug, Clone, Default)]
pub struct SharedTree {
    inner: Arc<RwLock<Vec<FileNode>>>,
}

impl SharedTree {
    pub fn new(tree: Vec<FileNode>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tree)),
        }
    }

    /// Clone of the current tree.
    pub fn snapshot(&self) -> Vec<FileNode> {
        self.inner.read().clone()
    }

    /// Replace the whole tree (repository load).
    pub fn replace(&self, tree: Vec<FileNode>) {
        *self.inner.write() = tree;
    }

    /// Insert a file path. Returns `true` if the tree changed.
    pub fn insert(&self, path: &str) -> Result<bool, PathConflict> {
        let mut guard = self.inner.write();
        check_file_path(&guard, path)?;
        let next = insert(&guard, path);
        if next == *guard {
            return Ok(false);
        }
        *guard = next;
        Ok(true)
    }

    pub fn contains_blob(&self, path: &str) -> bool {
        contains_blob(&self.inner.read(), path)
    }
}
