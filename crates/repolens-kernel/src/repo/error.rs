//! Repository and input validation error types.

use thiserror::Error;

/// Error talking to, or decoding data from, a repository.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Path or repository does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path exists but is not a file.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with an error status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl RepoError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a Decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether this error means "the path does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Input rejected before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Repository reference could not be parsed.
    #[error("malformed repository reference: {0}")]
    MalformedRepoRef(String),

    /// A required input was empty.
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    /// Commit requested for a path without local edits.
    #[error("no local changes to commit for {0}")]
    NothingToCommit(String),

    /// Retry requested but the last turn was answered.
    #[error("nothing to retry: the last message already has a reply")]
    NothingToRetry,
}
