use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::StreamExt;
use serde_json::Value;

use crate::config::{ChannelConfig, ChannelKind};
use crate::error::RelayError;
use crate::protocols::{
    ChatCompletionRequest, ChatCompletionResponse, StreamOptions, Usage,
};
use crate::streaming::{ChunkStream, UsageHandle};

/// Operations a backend may support, declared statically per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    ChatStream,
    Generate,
}

/// Closed set of backend implementations. Dispatch checks capabilities up
/// front, so there is no runtime-cast failure path.
pub enum Provider {
    OpenAiCompatible(OpenAiCompatibleProvider),
    GenerateOnly(GenerateProvider),
}

fn channel_incapable() -> RelayError {
    RelayError::ChannelError("channel not implemented".to_string())
}

impl Provider {
    pub fn from_config(client: reqwest::Client, config: &ChannelConfig) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        match config.kind {
            ChannelKind::Openai => Provider::OpenAiCompatible(OpenAiCompatibleProvider {
                client,
                base_url,
                api_key: config.api_key.clone(),
            }),
            ChannelKind::Generate => {
                Provider::GenerateOnly(GenerateProvider { client, base_url })
            }
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Provider::OpenAiCompatible(_) => &[Capability::Chat, Capability::ChatStream],
            Provider::GenerateOnly(_) => &[Capability::Generate],
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, RelayError> {
        match self {
            Provider::OpenAiCompatible(provider) => provider.create_chat_completion(request).await,
            Provider::GenerateOnly(_) => Err(channel_incapable()),
        }
    }

    pub async fn create_chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<(ChunkStream, UsageHandle), RelayError> {
        match self {
            Provider::OpenAiCompatible(provider) => {
                provider.create_chat_completion_stream(request).await
            }
            Provider::GenerateOnly(_) => Err(channel_incapable()),
        }
    }

    pub async fn generate(&self, body: &Value) -> Result<Value, RelayError> {
        match self {
            Provider::GenerateOnly(provider) => provider.generate(body).await,
            Provider::OpenAiCompatible(_) => Err(channel_incapable()),
        }
    }
}

fn unreachable_backend(err: reqwest::Error) -> RelayError {
    RelayError::Provider {
        status: 502,
        message: format!("backend unreachable: {err}"),
    }
}

/// Pull the human-readable message out of an upstream error body, falling
/// back to the raw (truncated) body.
fn upstream_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "backend returned an error".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

/// OpenAI-compatible chat backend.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, RelayError> {
        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .json(request)
            .send()
            .await
            .map_err(unreachable_backend)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Provider {
                status: status.as_u16(),
                message: upstream_error_message(&body),
            });
        }
        Ok(response)
    }

    pub async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, RelayError> {
        let response = self.send(request).await?;
        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| RelayError::Provider {
                status: 502,
                message: format!("invalid backend response: {err}"),
            })
    }

    /// Open the backend stream. The backend is always asked for usage so the
    /// channel can report totals afterward; its usage-only frame is absorbed
    /// into the returned handle and never yielded.
    pub async fn create_chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<(ChunkStream, UsageHandle), RelayError> {
        let mut outbound = request.clone();
        outbound.stream = true;
        outbound.stream_options = Some(StreamOptions {
            include_usage: Some(true),
        });
        let response = self.send(&outbound).await?;
        let usage = UsageHandle::new();
        let chunks = sse_chunk_stream(response, usage.clone());
        Ok((chunks, usage))
    }
}

/// Bare text-generation backend; opaque JSON in, opaque JSON out.
pub struct GenerateProvider {
    client: reqwest::Client,
    base_url: String,
}

impl GenerateProvider {
    pub async fn generate(&self, body: &Value) -> Result<Value, RelayError> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(unreachable_backend)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Provider {
                status: status.as_u16(),
                message: upstream_error_message(&text),
            });
        }
        response.json::<Value>().await.map_err(|err| RelayError::Provider {
            status: 502,
            message: format!("invalid backend response: {err}"),
        })
    }
}

/// Incremental decoder for `data:` lines in an SSE byte stream. Payloads may
/// arrive split across arbitrary byte boundaries.
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn new() -> Self {
        SseParser {
            buffer: String::new(),
        }
    }

    /// Feed raw bytes, returning every complete `data:` payload found.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// Record usage carried by a frame into the handle. Frames that exist only
/// to report usage (empty choices) are absorbed: the relay appends its own
/// terminal frame instead.
fn absorb_usage(payload: String, usage: &UsageHandle) -> Option<String> {
    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
        return Some(payload);
    };
    let Some(reported) = value.get("usage").filter(|u| !u.is_null()) else {
        return Some(payload);
    };
    if let Ok(parsed) = serde_json::from_value::<Usage>(reported.clone()) {
        usage.record(parsed);
    }
    let choices_empty = value
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| choices.is_empty())
        .unwrap_or(true);
    if choices_empty { None } else { Some(payload) }
}

struct SseStreamState {
    body: Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    parser: SseParser,
    pending: VecDeque<String>,
    usage: UsageHandle,
    done: bool,
}

fn sse_chunk_stream(response: reqwest::Response, usage: UsageHandle) -> ChunkStream {
    let state = SseStreamState {
        body: Box::pin(response.bytes_stream()),
        parser: SseParser::new(),
        pending: VecDeque::new(),
        usage,
        done: false,
    };
    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }
            while let Some(payload) = state.pending.pop_front() {
                if payload == "[DONE]" {
                    state.done = true;
                    return None;
                }
                if let Some(payload) = absorb_usage(payload, &state.usage) {
                    return Some((Ok(payload), state));
                }
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let payloads = state.parser.feed(&bytes);
                    state.pending.extend(payloads);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((
                        Err(RelayError::Provider {
                            status: 502,
                            message: format!("backend stream failed: {err}"),
                        }),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    return None;
                }
            }
        }
    }))
}
