use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::RelayError;

/// Upper bound on `max_tokens`; anything above this would risk overflow in
/// downstream token-budget arithmetic.
pub const MAX_COMPLETION_TOKENS: i64 = (i32::MAX / 2) as i64;

fn default_model() -> String {
    "unknown".to_string()
}

/// Message content: plain text or structured multimodal parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>, // "auto", "low", or "high"
}

/// One conversation message. Fields the relay does not interpret
/// (`name`, `tool_calls`, `tool_call_id`, ...) ride through `other`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub other: Value,
}

impl ChatMessage {
    pub fn text(role: &str, content: &str) -> Self {
        ChatMessage {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.to_string())),
            other: Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

/// Inbound chat-completion request. Sampling parameters and other fields
/// the relay never touches are preserved verbatim in `other` and forwarded
/// to the backend unchanged.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(flatten)]
    pub other: Value,
}

impl ChatCompletionRequest {
    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), RelayError> {
        if let Some(max_tokens) = self.max_tokens {
            if !(0..=MAX_COMPLETION_TOKENS).contains(&max_tokens) {
                return Err(RelayError::InvalidParameter(
                    "max_tokens is invalid".to_string(),
                ));
            }
        }
        if !self.stream && self.stream_options.is_some() {
            return Err(RelayError::InvalidParameter(
                "the 'stream_options' parameter is only allowed when 'stream' is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Routing hint: tool-carrying requests must land on a tool-capable channel.
    pub fn needs_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|tools| !tools.is_empty())
    }

    pub fn include_usage(&self) -> bool {
        self.stream
            && self
                .stream_options
                .as_ref()
                .and_then(|opts| opts.include_usage)
                .unwrap_or(false)
    }

    /// Clone prepared for the backend: `model` replaced by the channel's
    /// upstream name. The inbound request itself is never mutated again.
    pub fn for_upstream(&self, routing_model: &str) -> Self {
        let mut outbound = self.clone();
        outbound.model = routing_model.to_string();
        outbound
    }
}

/// Provider-reported token counts, passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub other: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub other: Value,
}

/// Non-streaming terminal answer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub other: Value,
}

impl ChatCompletionResponse {
    /// Rendered text across all choices; an empty result means there is
    /// nothing worth caching.
    pub fn content(&self) -> String {
        self.choices
            .iter()
            .filter_map(|choice| choice.message.content.as_deref())
            .collect::<Vec<&str>>()
            .join("")
    }
}

/// One frame of a streaming answer. The relay only rewrites the top-level
/// `model`; `choices` stay as raw values so backend extensions pass through
/// untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub other: Value,
}

impl ChatCompletionStreamResponse {
    /// Synthetic terminal frame: empty choices, fresh id, usage totals only.
    pub fn usage_only(model: &str, usage: Usage) -> Self {
        ChatCompletionStreamResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.to_string(),
            choices: Vec::new(),
            usage: Some(usage),
            other: Value::Object(Map::new()),
        }
    }
}
