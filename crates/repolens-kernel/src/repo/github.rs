//! GitHub REST backend.
//!
//! - listing: `GET /repos/{owner}/{repo}/git/trees/{branch}?recursive=1`
//! - content: `GET /repos/{owner}/{repo}/contents/{path}?ref={branch}`
//! - commit:  look up the current blob sha, then `PUT .../contents/{path}`
//!   carrying the sha only when the file already exists

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::decode::{bytes_to_text, decode_base64_text, encode_base64};
use super::{CommitOutcome, CommitRequest, RepoError, RepoRef, RepoResult, RepoSource};
use crate::config::GitHubConfig;
use crate::tree::{NodeKind, TreeEntry};

/// GitHub API version header value.
const API_VERSION: &str = "2022-11-28";

/// GitHub REST repository source.
pub struct GitHubRepo {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl std::fmt::Debug for GitHubRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubRepo")
            .field("api_base", &self.api_base)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: Option<String>,
}

#[derive(Deserialize)]
struct ContentsFile {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Deserialize)]
struct PutResponse {
    content: Option<PutContent>,
}

#[derive(Deserialize)]
struct PutContent {
    sha: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

impl GitHubRepo {
    /// Create a client from configuration.
    pub fn new(config: &GitHubConfig) -> RepoResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.resolve_token(),
        })
    }

    fn repo_url(&self, repo: &RepoRef, tail: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_base, repo.owner, repo.repo, tail)
    }

    fn contents_url(&self, repo: &RepoRef, path: &str) -> String {
        let encoded: Vec<String> = path.split('/').map(encode_segment).collect();
        self.repo_url(repo, &format!("contents/{}", encoded.join("/")))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_contents(&self, repo: &RepoRef, path: &str) -> RepoResult<ContentsFile> {
        let mut request = self.client.get(self.contents_url(repo, path));
        if let Some(branch) = &repo.branch {
            request = request.query(&[("ref", branch)]);
        }
        let response = check(self.authorized(request).send().await?, path).await?;
        let body: serde_json::Value = response.json().await?;
        if body.is_array() {
            return Err(RepoError::NotAFile(path.to_string()));
        }
        let file: ContentsFile = serde_json::from_value(body)
            .map_err(|e| RepoError::decode(format!("{}: unexpected contents payload: {}", path, e)))?;
        if file.kind != "file" {
            return Err(RepoError::NotAFile(path.to_string()));
        }
        Ok(file)
    }

    /// Download the raw body for files too large to be inlined.
    async fn download_raw(&self, url: &str, path: &str) -> RepoResult<String> {
        let response = check(self.authorized(self.client.get(url)).send().await?, path).await?;
        let bytes = response.bytes().await?;
        Ok(bytes_to_text(path, bytes.to_vec()))
    }
}

/// Map an HTTP status to a repository error.
async fn check(response: Response, path: &str) -> RepoResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RepoError::not_found(path));
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&text)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(text);
    Err(RepoError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Percent-encode one path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn tree_entries(items: Vec<TreeItem>) -> Vec<TreeEntry> {
    items
        .into_iter()
        .filter_map(|item| {
            let kind = match item.kind.as_str() {
                "blob" => NodeKind::Blob,
                "tree" => NodeKind::Tree,
                // Submodules ("commit") have no browsable content.
                _ => return None,
            };
            Some(TreeEntry {
                path: item.path,
                kind,
                locator: item.sha,
            })
        })
        .collect()
}

#[async_trait]
impl RepoSource for GitHubRepo {
    fn name(&self) -> &str {
        "github"
    }

    #[tracing::instrument(skip(self), fields(repo = %repo))]
    async fn fetch_tree(&self, repo: &RepoRef) -> RepoResult<Vec<TreeEntry>> {
        let branch = repo.branch.as_deref().unwrap_or("HEAD");
        let url = self.repo_url(repo, &format!("git/trees/{}", encode_segment(branch)));
        let request = self.client.get(url).query(&[("recursive", "1")]);
        let response = check(self.authorized(request).send().await?, &repo.slug()).await?;
        let listing: TreeResponse = response.json().await?;
        if listing.truncated {
            tracing::warn!(repo = %repo, "tree listing truncated by the API");
        }
        let entries = tree_entries(listing.tree);
        tracing::info!(repo = %repo, entries = entries.len(), "fetched tree");
        Ok(entries)
    }

    #[tracing::instrument(skip(self), fields(repo = %repo))]
    async fn fetch_content(&self, repo: &RepoRef, path: &str) -> RepoResult<String> {
        let file = self.get_contents(repo, path).await?;
        match (file.encoding.as_deref(), file.content.as_deref()) {
            (Some("base64"), Some(content)) if !content.is_empty() => {
                decode_base64_text(path, content)
            }
            _ => match file.download_url {
                Some(url) => self.download_raw(&url, path).await,
                None => Err(RepoError::decode(format!(
                    "{}: no inline content and no download url",
                    path
                ))),
            },
        }
    }

    #[tracing::instrument(skip(self, request), fields(repo = %repo, path = %request.path))]
    async fn commit(&self, repo: &RepoRef, request: CommitRequest) -> RepoResult<CommitOutcome> {
        let existing = match self.get_contents(repo, &request.path).await {
            Ok(file) => Some(file.sha),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let created = existing.is_none();

        let body = PutContents {
            message: &request.message,
            content: encode_base64(&request.content),
            branch: repo.branch.as_deref(),
            sha: existing,
        };
        let put = self.client.put(self.contents_url(repo, &request.path)).json(&body);
        let response = check(self.authorized(put).send().await?, &request.path).await?;
        let reply: PutResponse = response.json().await?;

        tracing::info!(path = %request.path, created, "committed file");
        Ok(CommitOutcome {
            path: request.path,
            locator: reply.content.and_then(|c| c.sha),
            created,
        })
    }
}
