//! repolens binary.
//!
//! Usage:
//!   # Print a repository's file tree
//!   repolens tree rust-lang/rustlings
//!
//!   # Chat about a repository, starting with a file open
//!   repolens chat octo/hello --file src/main.rs --branch dev
//!
//!   # Same loop over an empty in-memory repository
//!   repolens --offline chat local/scratch
//!
//! Logs go to stderr; set `RUST_LOG` to change the level.

mod render;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use repolens_kernel::tree::build_from_flat_list;
use repolens_kernel::{
    Config, GeminiProvider, GitHubRepo, LlmProvider, MemoryRepo, RepoRef, RepoSource, Session,
};

/// Chat with an AI assistant about a hosted repository.
#[derive(Parser, Debug)]
#[command(name = "repolens", version)]
#[command(about = "Browse a repository and let an assistant read and edit it")]
struct Args {
    /// Config file (default: ~/.config/repolens/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an empty in-memory repository instead of GitHub (chat still needs a
    /// model API key)
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the repository tree
    Tree {
        /// owner/repo, owner/repo@branch or a GitHub URL
        repo: String,

        #[arg(long)]
        branch: Option<String>,
    },

    /// Start an interactive chat
    Chat {
        /// owner/repo, owner/repo@branch or a GitHub URL
        repo: String,

        /// File to open first
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        branch: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(args.config.as_deref()).context("loading config")?;

    match args.command {
        Commands::Tree { repo, branch } => {
            let repo = repo_ref(&repo, branch)?;
            let source = source(&config, args.offline)?;
            let entries = source.fetch_tree(&repo).await?;
            println!("{}", repo);
            for line in render::format_tree(&build_from_flat_list(&entries), &[]) {
                println!("{}", line);
            }
        }
        Commands::Chat { repo, file, branch } => {
            let repo = repo_ref(&repo, branch)?;
            let source = source(&config, args.offline)?;
            let provider: Arc<dyn LlmProvider> = Arc::new(
                GeminiProvider::from_config(&config.llm).context("setting up the model provider")?,
            );

            let session = Session::load(&config, source, provider, repo).await?;
            if let Some(path) = file {
                session
                    .open(&path)
                    .await
                    .with_context(|| format!("opening {}", path))?;
            }
            tracing::info!(repo = %session.repo(), "session ready");
            repl::run(&session).await?;
        }
    }
    Ok(())
}

fn repo_ref(input: &str, branch: Option<String>) -> Result<RepoRef> {
    let repo = RepoRef::parse(input)?;
    Ok(match branch {
        Some(branch) => repo.with_branch(branch),
        None => repo,
    })
}

fn source(config: &Config, offline: bool) -> Result<Arc<dyn RepoSource>> {
    if offline {
        return Ok(Arc::new(MemoryRepo::new()));
    }
    Ok(Arc::new(GitHubRepo::new(&config.github)?))
}
