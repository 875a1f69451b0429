use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::prompt::build_messages;
use super::{Collaborator, CollaboratorError, RequestedAction, TurnRequest, TurnResponse};

const MAX_RETRIES: usize = 3;
const BASE_BACKOFF_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_endpoint: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn is_available(&self) -> bool {
        self.api_key.as_deref().is_some_and(|v| !v.trim().is_empty())
            && !self.model.trim().is_empty()
            && !self.api_endpoint.trim().is_empty()
    }
}

/// Streaming chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiCollaborator {
    config: OpenAiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct ToolCallBuffer {
    name: String,
    arguments: String,
}

/// Accumulates SSE `data:` payloads into the final text and tool calls.
#[derive(Debug, Default)]
struct StreamAccumulator {
    /// Raw bytes of the unfinished line; a chunk may end mid-character.
    line_buffer: Vec<u8>,
    content: String,
    /// Only the first tool call is honoured.
    tool_call: Option<ToolCallBuffer>,
    done: bool,
}

impl StreamAccumulator {
    /// Feeds raw bytes; returns the content tokens completed by this chunk.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.line_buffer.extend_from_slice(bytes);
        let mut tokens = Vec::new();
        while let Some(pos) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(token) = self.apply_line(line.trim()) {
                tokens.push(token);
            }
        }
        tokens
    }

    fn apply_line(&mut self, line: &str) -> Option<String> {
        let data = line.strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            self.done = true;
            return None;
        }
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(error = %err, "skipping undecodable stream chunk");
                return None;
            }
        };
        let delta = chunk.choices.into_iter().next()?.delta;

        for call in delta.tool_calls {
            if call.index != 0 {
                debug!(index = call.index, "ignoring additional tool call");
                continue;
            }
            let buffer = self.tool_call.get_or_insert_with(ToolCallBuffer::default);
            if let Some(function) = call.function {
                if let Some(name) = function.name {
                    buffer.name = name;
                }
                if let Some(arguments) = function.arguments {
                    buffer.arguments.push_str(&arguments);
                }
            }
        }

        let token = delta.content.filter(|c| !c.is_empty())?;
        self.content.push_str(&token);
        Some(token)
    }

    fn finish(self) -> TurnResponse {
        let action = self
            .tool_call
            .filter(|call| !call.name.is_empty())
            .and_then(|call| {
                let raw = if call.arguments.trim().is_empty() { "{}" } else { call.arguments.as_str() };
                match serde_json::from_str::<Value>(raw) {
                    Ok(arguments) => Some(RequestedAction { name: call.name, arguments }),
                    Err(err) => {
                        warn!(action = %call.name, error = %err, "failed to parse tool arguments");
                        None
                    }
                }
            });
        TurnResponse {
            final_text: self.content,
            action,
        }
    }
}

impl OpenAiCollaborator {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.config.is_available()
    }

    async fn post_with_retry(&self, url: &str, api_key: &str, payload: &Value) -> Result<reqwest::Response, CollaboratorError> {
        let mut last_error: Option<CollaboratorError> = None;

        for retry in 0..=MAX_RETRIES {
            match self.client.post(url).bearer_auth(api_key).json(payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let err = CollaboratorError::HttpStatus { status, body };
                    if retry < MAX_RETRIES && is_retryable(status) {
                        warn!(retry, ?status, "collaborator request failed, retrying");
                        sleep(backoff(retry)).await;
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    let err = CollaboratorError::Request(e);
                    if retry < MAX_RETRIES {
                        warn!(retry, "collaborator request error, retrying");
                        sleep(backoff(retry)).await;
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_error.unwrap_or(CollaboratorError::EmptyResponse))
    }
}

#[async_trait]
impl Collaborator for OpenAiCollaborator {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn stream_turn(
        &self,
        request: TurnRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> Result<TurnResponse, CollaboratorError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(CollaboratorError::NotConfigured("LLM_API_KEY"))?;

        let url = format!("{}/chat/completions", self.config.api_endpoint.trim_end_matches('/'));
        let mut payload = json!({
            "model": self.config.model,
            "messages": build_messages(&request),
            "stream": true,
        });
        if request.allow_actions && !request.tools.is_empty() {
            payload["tools"] = Value::Array(request.tools.clone());
        }

        let response = self.post_with_retry(&url, api_key, &payload).await?;
        let mut stream = response.bytes_stream();
        let mut accumulator = StreamAccumulator::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for token in accumulator.feed(&chunk) {
                // Receiver gone means the turn was abandoned; keep draining.
                let _ = tokens.send(token);
            }
            if accumulator.done {
                break;
            }
        }

        let response = accumulator.finish();
        if response.final_text.is_empty() && response.action.is_none() {
            return Err(CollaboratorError::EmptyResponse);
        }
        Ok(response)
    }
}

pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") || trimmed.contains("/v1/") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn backoff(retry: usize) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS * (1 << retry))
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
