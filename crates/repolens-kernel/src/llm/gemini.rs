//! Gemini provider over the `streamGenerateContent` SSE endpoint.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::stream::{EventStream, StreamEvent, StreamRequest};
use super::{Content, LlmError, LlmProvider, LlmResult, Part, Role, ToolCall, ToolDefinition};
use crate::config::LlmConfig;

/// Default API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini streaming provider.
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl GeminiProvider {
    /// Create a provider with an explicit key and model.
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> LlmResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
        })
    }

    /// Create a provider from configuration.
    pub fn from_config(config: &LlmConfig) -> LlmResult<Self> {
        if config.provider != "gemini" {
            return Err(LlmError::Unavailable(format!(
                "unsupported provider: {}",
                config.provider
            )));
        }
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| LlmError::Unavailable("no Gemini API key configured".into()))?;
        let mut provider = Self::new(api_key, config.model.clone())?;
        if let Some(base_url) = &config.base_url {
            provider.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(provider)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTools<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools<'a> {
    function_declarations: &'a [ToolDefinition],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
    /// Set on reasoning summaries, which are not part of the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
}

fn to_wire_part(part: &Part) -> WirePart {
    match part {
        Part::Text { text } => WirePart {
            text: Some(text.clone()),
            ..Default::default()
        },
        Part::InlineData { mime_type, data } => WirePart {
            inline_data: Some(WireBlob {
                mime_type: mime_type.clone(),
                data: data.clone(),
            }),
            ..Default::default()
        },
        Part::FunctionCall { id, name, args } => WirePart {
            function_call: Some(WireFunctionCall {
                id: Some(id.clone()),
                name: name.clone(),
                args: args.clone(),
            }),
            ..Default::default()
        },
        Part::FunctionResponse { id, name, response } => WirePart {
            function_response: Some(WireFunctionResponse {
                id: Some(id.clone()),
                name: name.clone(),
                response: response.clone(),
            }),
            ..Default::default()
        },
    }
}

fn to_wire_content(content: &Content) -> WireContent {
    let role = match content.role {
        Role::User => "user",
        Role::Model => "model",
    };
    WireContent {
        role: Some(role.to_string()),
        parts: content.parts.iter().map(to_wire_part).collect(),
    }
}

fn build_request(request: &StreamRequest) -> GenerateRequest<'_> {
    let generation_config = (request.temperature.is_some() || request.max_output_tokens.is_some())
        .then(|| GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
        });
    GenerateRequest {
        contents: request.contents.iter().map(to_wire_content).collect(),
        system_instruction: request.system.as_ref().map(|system| WireContent {
            role: None,
            parts: vec![WirePart {
                text: Some(system.clone()),
                ..Default::default()
            }],
        }),
        tools: if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![WireTools {
                function_declarations: &request.tools,
            }]
        },
        generation_config,
    }
}

// ============================================================================
// Stream parsing
// ============================================================================

/// Converts SSE chunk payloads into stream events, accumulating turn metadata.
#[derive(Debug, Default)]
struct ChunkParser {
    stop_reason: Option<String>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl ChunkParser {
    fn parse(&mut self, raw: &str) -> Result<Vec<StreamEvent>, String> {
        let json: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("SSE parsing error: {}, data: {}", e, raw))?;
        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("An error occurred during streaming");
            return Err(format!("SSE API error: {}", message));
        }
        let chunk: GenerateChunk = serde_json::from_value(json)
            .map_err(|e| format!("SSE data schema error: {}, data: {}", e, raw))?;

        if let Some(usage) = chunk.usage_metadata {
            self.input_tokens = usage.prompt_token_count.or(self.input_tokens);
            self.output_tokens = usage.candidates_token_count.or(self.output_tokens);
        }

        let mut events = Vec::new();
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(events);
        };
        if let Some(reason) = candidate.finish_reason {
            self.stop_reason = Some(reason);
        }

        let mut calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if part.thought == Some(true) {
                continue;
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::TextDelta(text));
            }
            if let Some(call) = part.function_call {
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                calls.push(ToolCall::new(id, call.name, call.args));
            }
        }
        if !calls.is_empty() {
            events.push(StreamEvent::ToolCalls(calls));
        }
        Ok(events)
    }

    fn finish(self) -> StreamEvent {
        StreamEvent::Done {
            stop_reason: self.stop_reason,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

fn map_status(status: StatusCode, body: &str) -> LlmError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthError(message),
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(message),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => LlmError::InvalidRequest(message),
        _ => LlmError::ApiError(format!("{}: {}", status, message)),
    }
}

/// Read the SSE body and forward parsed events until the stream ends.
async fn pump(response: Response, tx: mpsc::UnboundedSender<StreamEvent>) {
    let mut events = response.bytes_stream().eventsource();
    let mut parser = ChunkParser::default();

    while let Some(item) = events.next().await {
        let sse = match item {
            Ok(sse) => sse,
            Err(e) => {
                tracing::error!("SSE stream error: {}", e);
                let _ = tx.send(StreamEvent::Error(format!("SSE stream error: {}", e)));
                return;
            }
        };
        tracing::trace!(data = %sse.data, "gemini sse");
        match parser.parse(&sse.data) {
            Ok(parsed) => {
                for event in parsed {
                    if tx.send(event).is_err() {
                        tracing::debug!("stream consumer dropped, stopping");
                        return;
                    }
                }
            }
            Err(msg) => {
                tracing::error!("{}", msg);
                let _ = tx.send(StreamEvent::Error(msg));
                return;
            }
        }
    }

    let _ = tx.send(parser.finish());
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn stream(&self, request: StreamRequest) -> LlmResult<EventStream> {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };
        let url = format!("{}/models/{}:streamGenerateContent", self.base_url, model);
        tracing::debug!(model, contents = request.contents.len(), "starting gemini stream");

        let response = self
            .client
            .post(url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(response, tx));
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }
}
