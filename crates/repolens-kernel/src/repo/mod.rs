//! Repository collaborator: where file listings and content come from, and
//! where commits go.
//!
//! Two backends implement [`RepoSource`]:
//! - [`GitHubRepo`] talks to the GitHub REST API
//! - [`MemoryRepo`] keeps everything in memory (tests, offline sessions)

pub mod decode;
mod error;
pub mod github;
pub mod memory;

pub use error::{RepoError, RepoResult, ValidationError};
pub use github::GitHubRepo;
pub use memory::MemoryRepo;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tree::TreeEntry;

/// A hosted repository, optionally pinned to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    /// Branch name; `None` means the repository's default branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl RepoRef {
    /// Create a reference to the default branch.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: None,
        }
    }

    /// Pin a branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Parse `owner/repo`, `owner/repo@branch`, or a GitHub URL
    /// (`https://github.com/owner/repo[/tree/branch]`).
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let malformed = || ValidationError::MalformedRepoRef(input.to_string());

        let trimmed = input.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyInput("repository reference"));
        }

        let rest = ["https://github.com/", "http://github.com/", "github.com/"]
            .iter()
            .find_map(|prefix| trimmed.strip_prefix(prefix));
        let is_url = rest.is_some();
        let rest = rest.unwrap_or(trimmed);

        let (owner, repo, branch) = if is_url {
            let mut segments = rest.split('/');
            let owner = segments.next().unwrap_or_default();
            let repo = segments.next().unwrap_or_default();
            let branch = match segments.next() {
                None => None,
                Some("tree") => {
                    let branch = segments.collect::<Vec<_>>().join("/");
                    if branch.is_empty() {
                        return Err(malformed());
                    }
                    Some(branch)
                }
                Some(_) => return Err(malformed()),
            };
            (owner, repo, branch)
        } else {
            let (path, branch) = match rest.split_once('@') {
                Some((path, branch)) if !branch.is_empty() => (path, Some(branch.to_string())),
                Some(_) => return Err(malformed()),
                None => (rest, None),
            };
            let (owner, repo) = path.split_once('/').ok_or_else(malformed)?;
            (owner, repo, branch)
        };

        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        if !valid_name(owner) || !valid_name(repo) {
            return Err(malformed());
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch,
        })
    }

    /// `owner/repo` without the branch.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}/{}@{}", self.owner, self.repo, branch),
            None => write!(f, "{}/{}", self.owner, self.repo),
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A request to write one file to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub path: String,
    pub content: String,
    pub message: String,
}

/// What the remote reported after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub path: String,
    /// New blob locator, if reported.
    pub locator: Option<String>,
    /// Whether the file did not exist before.
    pub created: bool,
}

/// Source of repository listings and file content.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Backend name (e.g., "github", "memory").
    fn name(&self) -> &str;

    /// Flat listing of every path in the repository.
    async fn fetch_tree(&self, repo: &RepoRef) -> RepoResult<Vec<TreeEntry>>;

    /// Fetch and decode a file's content.
    async fn fetch_content(&self, repo: &RepoRef, path: &str) -> RepoResult<String>;

    /// Write a single file, creating it if needed.
    async fn commit(&self, repo: &RepoRef, request: CommitRequest) -> RepoResult<CommitOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_forms() {
        assert_eq!(RepoRef::parse("rust-lang/rust").unwrap(), RepoRef::new("rust-lang", "rust"));
        assert_eq!(
            RepoRef::parse("  octo/hello.world@dev  ").unwrap(),
            RepoRef::new("octo", "hello.world").with_branch("dev")
        );
    }

    #[test]
    fn test_parse_urls() {
        assert_eq!(
            RepoRef::parse("https://github.com/tokio-rs/tokio").unwrap(),
            RepoRef::new("tokio-rs", "tokio")
        );
        assert_eq!(
            RepoRef::parse("https://github.com/tokio-rs/tokio.git/").unwrap(),
            RepoRef::new("tokio-rs", "tokio")
        );
        assert_eq!(
            RepoRef::parse("github.com/a/b/tree/feature/nested").unwrap(),
            RepoRef::new("a", "b").with_branch("feature/nested")
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["noslash", "a/", "/b", "a/b@", "-a/b", "a b/c", "https://github.com/a/b/blob/x"] {
            assert!(
                matches!(RepoRef::parse(input), Err(ValidationError::MalformedRepoRef(_))),
                "{input} should be rejected"
            );
        }
        assert_eq!(
            RepoRef::parse("   "),
            Err(ValidationError::EmptyInput("repository reference"))
        );
    }

    #[test]
    fn test_display_round_trip() {
        let r = RepoRef::new("o", "r").with_branch("main");
        assert_eq!(r.to_string(), "o/r@main");
        assert_eq!(RepoRef::parse(&r.to_string()).unwrap(), r);
        assert_eq!(r.slug(), "o/r");
    }
}
