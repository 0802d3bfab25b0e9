//! Tool declarations and typed invocations.
//!
//! The model sees exactly two tools, `read_file` and `update_file`. Raw
//! [`ToolCall`]s are parsed into the closed [`ToolInvocation`] enum at the
//! dispatcher boundary; anything that fails to parse becomes a [`ToolError`]
//! and, from there, an error [`ToolResult`] fed back to the model.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::llm::{Part, ToolCall, ToolDefinition};
use crate::repo::RepoError;
use crate::tree::{PathConflict, normalize_path};

/// Default cap on characters returned by `read_file`.
pub const DEFAULT_READ_CAP: usize = 30_000;

/// Declared tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    UpdateFile,
}

impl ToolName {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Declarations sent with every model turn.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: ToolName::ReadFile.to_string(),
            description: "Read the contents of a file in the repository, including any \
                          uncommitted edits. Long files are truncated."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path of the file relative to the repository root"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: ToolName::UpdateFile.to_string(),
            description: "Replace the full contents of a file, creating it if it does not \
                          exist. The change stays local until the user commits it."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path of the file to write. Defaults to the file currently open"
                    },
                    "code": {
                        "type": "string",
                        "description": "The complete new contents of the file"
                    },
                    "description": {
                        "type": "string",
                        "description": "Short summary of the change"
                    }
                },
                "required": ["code", "description"]
            }),
        },
    ]
}

/// Tool execution failure. Never escapes the dispatcher; rendered as `{error}`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArgs { tool: String, message: String },

    #[error("no path was given and no file is open")]
    NoActiveFile,

    #[error("cannot write {path}: {source}")]
    PathConflict {
        path: String,
        #[source]
        source: PathConflict,
    },

    #[error("cannot read {path}: {source}")]
    Unresolvable {
        path: String,
        #[source]
        source: RepoError,
    },
}

impl ToolError {
    fn invalid(tool: ToolName, message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    Read {
        path: String,
    },
    Update {
        /// `None` means the active file.
        path: Option<String>,
        code: String,
        description: String,
    },
}

#[derive(Deserialize)]
struct ReadParams {
    path: Option<String>,
}

#[derive(Deserialize)]
struct UpdateParams {
    path: Option<String>,
    code: Option<String>,
    description: Option<String>,
}

fn required(tool: ToolName, field: &str, value: Option<String>) -> Result<String, ToolError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(ToolError::invalid(tool, format!("`{}` must not be empty", field))),
        None => Err(ToolError::invalid(tool, format!("missing `{}`", field))),
    }
}

/// Normalized path, or `None` when nothing names a file.
fn named_path(value: Option<&str>) -> Option<String> {
    value.map(|p| normalize_path(p.trim())).filter(|p| !p.is_empty())
}

fn required_path(tool: ToolName, value: Option<String>) -> Result<String, ToolError> {
    let raw = required(tool, "path", value)?;
    named_path(Some(&raw)).ok_or_else(|| ToolError::invalid(tool, "`path` names no file"))
}

impl ToolInvocation {
    /// Validate a raw call.
    pub fn parse(call: &ToolCall) -> Result<Self, ToolError> {
        let tool: ToolName = call
            .name
            .parse()
            .map_err(|_| ToolError::UnknownTool(call.name.clone()))?;
        if !call.args.is_object() {
            return Err(ToolError::invalid(tool, "arguments must be an object"));
        }

        match tool {
            ToolName::ReadFile => {
                let params: ReadParams = serde_json::from_value(call.args.clone())
                    .map_err(|e| ToolError::invalid(tool, e.to_string()))?;
                Ok(Self::Read {
                    path: required_path(tool, params.path)?,
                })
            }
            ToolName::UpdateFile => {
                let params: UpdateParams = serde_json::from_value(call.args.clone())
                    .map_err(|e| ToolError::invalid(tool, e.to_string()))?;
                // An empty code string clears the file.
                let code = params
                    .code
                    .ok_or_else(|| ToolError::invalid(tool, "missing `code`"))?;
                Ok(Self::Update {
                    path: named_path(params.path.as_deref()),
                    code,
                    description: required(tool, "description", params.description)?,
                })
            }
        }
    }
}

/// Short marker yielded to the host when a call is dispatched.
pub fn progress_marker(call: &ToolCall, active: Option<&str>) -> String {
    let raw_path = named_path(call.args.get("path").and_then(Value::as_str));

    match call.name.parse::<ToolName>() {
        Ok(ToolName::ReadFile) => {
            format!("\n\n> 🔧 Reading `{}`…\n\n", raw_path.as_deref().unwrap_or("?"))
        }
        Ok(ToolName::UpdateFile) => {
            let path = raw_path.as_deref().or(active).unwrap_or("?");
            format!("\n\n> ✏️ Updating `{}`…\n\n", path)
        }
        Err(_) => format!("\n\n> ⚠️ Unknown tool `{}`\n\n", call.name),
    }
}

/// Truncate to at most `cap` Unicode scalar values.
pub fn truncate_chars(text: &str, cap: usize) -> &str {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Content(Value),
    Error(String),
}

/// Result correlated 1:1 with a [`ToolCall`] by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Content(content),
        }
    }

    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Payload sent back to the model.
    pub fn response(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Content(value) => value.clone(),
            ToolOutcome::Error(message) => json!({ "error": message }),
        }
    }

    pub fn into_part(self) -> Part {
        let response = self.response();
        Part::FunctionResponse {
            id: self.id,
            name: self.name,
            response,
        }
    }
}

/// Side-channel notification fired for each successful `update_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub path: String,
    pub new_content: String,
    pub description: String,
}
