//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly with streaming enabled:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - SSE events decoded into typed [`StreamFragment`]s

use async_trait::async_trait;
use axon_config::AppConfig;
use axon_core::error::ProviderError;
use axon_core::message::Role;
use axon_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Time allowed until response headers arrive
    request_timeout: Duration,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            request_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Build from application configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key (set api_key, AXON_API_KEY or ANTHROPIC_API_KEY)".into(),
            )
        })?;
        let mut provider = Self::new(api_key)?
            .with_request_timeout(Duration::from_millis(config.request_timeout_ms));
        if let Some(url) = &config.base_url {
            provider = provider.with_base_url(url);
        }
        Ok(provider)
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Convert the conversation buffer to Anthropic API format.
    fn to_api_messages(messages: &[ProviderMessage]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let content = match m.content.as_slice() {
                    [ContentPart::Text { text }] => AnthropicContent::Text(text.clone()),
                    parts => AnthropicContent::Blocks(
                        parts.iter().map(ContentBlock::from_part).collect(),
                    ),
                };
                AnthropicMessage {
                    role: m.role.as_str().into(),
                    content,
                }
            })
            .collect()
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        // System turns in the buffer are folded into the top-level prompt.
        let mut system: Vec<String> = request.system.iter().cloned().collect();
        system.extend(
            request
                .messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.text()),
        );
        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }
}

#[async_trait]
impl axon_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ProviderRequest) -> Result<FragmentReceiver, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");
        if request.resume_token.is_some() {
            debug!("Messages API keeps no server-side session; resume token not sent");
        }

        let send = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!(
                    "no response within {}ms",
                    self.request_timeout.as_millis()
                ))
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in decoder.push(&bytes) {
                    let Some(item) = parse_event(&data) else {
                        continue;
                    };
                    let done = matches!(item, Ok(StreamFragment::MessageStop) | Err(_));
                    if tx.send(item).await.is_err() {
                        // Receiver dropped: the turn was cancelled.
                        return;
                    }
                    if done {
                        return;
                    }
                }
            }

            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "stream ended before message_stop".into(),
                )))
                .await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![
            "claude-sonnet-4-20250514".into(),
            "claude-opus-4-20250514".into(),
            "claude-3-5-haiku-20241022".into(),
        ])
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": "claude-3-5-haiku-20241022",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        // 200 = works, 401 = bad key, anything else = reachable but error
        Ok(response.status().is_success() || response.status().as_u16() != 401)
    }
}

/// Splits an SSE byte stream into `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    /// Raw bytes of the incomplete trailing line; chunk boundaries may split
    /// a multi-byte character.
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // `event:` lines repeat the JSON `type` field and are skipped.
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    out.push(data.to_string());
                }
            }
        }
        out
    }
}

/// Decode one SSE `data:` payload.
///
/// Returns `None` for events that carry nothing (pings, unknown types) and
/// for malformed payloads, which are logged and skipped.
fn parse_event(data: &str) -> Option<Result<StreamFragment, ProviderError>> {
    let event: SseEvent = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(e) => {
            trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
            return None;
        }
    };

    let fragment = match event {
        SseEvent::MessageStart { message } => StreamFragment::MessageStart {
            id: message.id,
            model: message.model,
            usage: message.usage.map(Usage::from),
        },
        SseEvent::ContentBlockStart {
            index,
            content_block,
        } => {
            let block = match content_block {
                SseBlock::Text => BlockStart::Text,
                SseBlock::ToolUse { id, name } => BlockStart::ToolUse { id, name },
                SseBlock::Other => {
                    debug!(index, "Skipping unsupported content block");
                    return None;
                }
            };
            StreamFragment::ContentBlockStart { index, block }
        }
        SseEvent::ContentBlockDelta { index, delta } => {
            let delta = match delta {
                SseDelta::TextDelta { text } => BlockDelta::TextDelta { text },
                SseDelta::InputJsonDelta { partial_json } => {
                    BlockDelta::InputJsonDelta { partial_json }
                }
                SseDelta::Other => return None,
            };
            StreamFragment::ContentBlockDelta { index, delta }
        }
        SseEvent::ContentBlockStop { index } => StreamFragment::ContentBlockStop { index },
        SseEvent::MessageDelta { delta, usage } => StreamFragment::MessageDelta {
            stop_reason: delta.stop_reason.as_deref().and_then(parse_stop_reason),
            usage: usage.map(Usage::from),
        },
        SseEvent::MessageStop => StreamFragment::MessageStop,
        SseEvent::Error { error } => {
            let err = if error.kind == "overloaded_error" || error.kind == "rate_limit_error" {
                ProviderError::RateLimited { retry_after_secs: 5 }
            } else {
                ProviderError::ApiError {
                    status_code: 200,
                    message: format!("{}: {}", error.kind, error.message),
                }
            };
            return Some(Err(err));
        }
        SseEvent::Ping | SseEvent::Unknown => return None,
    };
    Some(Ok(fragment))
}

fn parse_stop_reason(raw: &str) -> Option<StopReason> {
    match raw {
        "end_turn" => Some(StopReason::EndTurn),
        "tool_use" => Some(StopReason::ToolUse),
        "max_tokens" => Some(StopReason::MaxTokens),
        "stop_sequence" => Some(StopReason::StopSequence),
        other => {
            warn!(stop_reason = other, "Unknown stop reason");
            None
        }
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    fn from_part(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => Self::Text { text: text.clone() },
            ContentPart::ToolUse { id, name, input } => Self::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Self::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: match content {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                is_error: *is_error,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseEvent {
    MessageStart {
        message: SseMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: SseBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: SseDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: SseMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: SseError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct SseMessage {
    id: String,
    model: String,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SseMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }
    }
}
