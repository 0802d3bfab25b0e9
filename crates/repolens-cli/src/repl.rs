//! Interactive chat loop.
//!
//! Plain lines go to the model. Lines starting with `/` are session commands.

use anyhow::{Result, anyhow};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use repolens_kernel::{Session, TurnStream};

use crate::render::format_tree;

const HELP: &str = "\
commands:
  /open PATH             make PATH the active file
  /discard [PATH]        drop local edits (default: active file)
  /commit PATH MESSAGE   commit the local edit of PATH
  /diff                  list files with local edits
  /tree                  show the repository tree
  /retry                 resend after a failed reply
  /help                  show this help
  /quit                  leave
anything else is sent to the assistant";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Chat(String),
    Open(String),
    Discard(Option<String>),
    Commit { path: String, message: String },
    Diff,
    Tree,
    Retry,
    Help,
    Quit,
}

/// Parse one input line.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(if line.is_empty() {
            Command::Empty
        } else {
            Command::Chat(line.to_string())
        });
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    match name {
        "open" if !args.is_empty() => Ok(Command::Open(args.to_string())),
        "open" => Err("usage: /open PATH".into()),
        "discard" => Ok(Command::Discard((!args.is_empty()).then(|| args.to_string()))),
        "commit" => match args.split_once(char::is_whitespace) {
            Some((path, message)) if !message.trim().is_empty() => Ok(Command::Commit {
                path: path.to_string(),
                message: message.trim().to_string(),
            }),
            _ => Err("usage: /commit PATH MESSAGE".into()),
        },
        "diff" => Ok(Command::Diff),
        "tree" => Ok(Command::Tree),
        "retry" => Ok(Command::Retry),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(format!("unknown command: /{} (try /help)", other)),
    }
}

/// Run the loop until `/quit` or end of input.
pub async fn run(session: &Session) -> Result<()> {
    let mut updates = session.subscribe_updates();
    let notifier = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => eprintln!("\n[edited {}: {}]", update.path, update.description),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed file update notifications")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut out = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    say(&mut out, format!("repolens: {} (type /help)", session.repo())).await?;
    prompt(&mut out, session).await?;

    while let Some(line) = lines.next_line().await? {
        match parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(e) = execute(session, command, &mut out).await {
                    eprintln!("error: {:#}", e);
                }
            }
            Err(message) => eprintln!("{}", message),
        }
        prompt(&mut out, session).await?;
    }

    notifier.abort();
    let dirty = session.dirty_paths();
    if !dirty.is_empty() {
        eprintln!("uncommitted edits discarded: {}", dirty.join(", "));
    }
    Ok(())
}

async fn say<W: AsyncWrite + Unpin>(out: &mut W, line: impl AsRef<str>) -> Result<()> {
    out.write_all(line.as_ref().as_bytes()).await?;
    out.write_all(b"\n").await?;
    Ok(())
}

async fn prompt<W: AsyncWrite + Unpin>(out: &mut W, session: &Session) -> Result<()> {
    let active = session.active_path().unwrap_or_default();
    out.write_all(format!("\n{}> ", active).as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Run one command. All normal output goes through `out`.
async fn execute<W: AsyncWrite + Unpin>(session: &Session, command: Command, out: &mut W) -> Result<()> {
    match command {
        Command::Empty | Command::Quit => {}
        Command::Help => say(out, HELP).await?,
        Command::Chat(text) => stream_reply(session.chat(&text, None).await?, out).await?,
        Command::Retry => stream_reply(session.retry().await?, out).await?,
        Command::Open(path) => {
            let content = session.open(&path).await?;
            let dirty = if session.overlay().is_dirty(&path) { ", edited" } else { "" };
            say(out, format!("opened {} ({} lines{})", path, content.lines().count(), dirty)).await?;
        }
        Command::Discard(path) => {
            let path = path
                .or_else(|| session.active_path())
                .ok_or_else(|| anyhow!("no file given and none is open"))?;
            let line = match session.discard(&path) {
                Some(_) => format!("discarded edits to {}", path),
                None => format!("{} has no local edits", path),
            };
            say(out, line).await?;
        }
        Command::Commit { path, message } => {
            let outcome = session.commit(&path, &message).await?;
            let verb = if outcome.created { "created" } else { "updated" };
            say(out, format!("{} {}", verb, outcome.path)).await?;
        }
        Command::Diff => {
            let dirty = session.dirty_paths();
            if dirty.is_empty() {
                say(out, "no local edits").await?;
            }
            for path in dirty {
                say(out, format!("M {}", path)).await?;
            }
        }
        Command::Tree => {
            let tree = session.tree();
            for line in format_tree(&tree, &session.dirty_paths()) {
                say(out, line).await?;
            }
        }
    }
    Ok(())
}

async fn stream_reply<W: AsyncWrite + Unpin>(mut stream: TurnStream, out: &mut W) -> Result<()> {
    while let Some(item) = stream.next().await {
        match item {
            Ok(fragment) => {
                out.write_all(fragment.as_bytes()).await?;
                out.flush().await?;
            }
            Err(e) => {
                out.write_all(b"\n").await?;
                out.flush().await?;
                if e.is_retryable() {
                    eprintln!("reply failed: {} (use /retry)", e);
                } else {
                    eprintln!("reply stopped: {}", e);
                }
            }
        }
    }
    out.write_all(b"\n").await?;
    Ok(())
}
