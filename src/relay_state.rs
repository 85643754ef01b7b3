use std::collections::HashMap;

use actix_web::HttpResponse;
use serde_json::Value;

use crate::cache::{DEFAULT_CACHE_CAPACITY, ResponseCache};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::preprocess::MessagePreprocessor;
use crate::protocols::ChatCompletionRequest;
use crate::provider::{Capability, Provider};
use crate::streaming::RelayStream;
use crate::tokens;

/// One configured backend binding: a provider plus its model mapping.
pub struct Channel {
    pub name: String,
    pub provider: Provider,
    /// Public model name -> upstream model name.
    pub models: HashMap<String, String>,
    pub only_chat: bool,
}

/// Immutable per-request routing facts, captured once before dispatch.
/// `caller_model` is what every outbound payload must show; `routing_model`
/// is what the backend is asked for. The two are never reused for the other
/// meaning.
struct RequestContext {
    caller_model: String,
    routing_model: String,
}

pub struct RelayState {
    channels: Vec<Channel>,
    cache: ResponseCache,
    preprocessor: MessagePreprocessor,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()?;
        let channels = config
            .channels
            .iter()
            .map(|channel| Channel {
                name: channel.name.clone(),
                provider: Provider::from_config(client.clone(), channel),
                models: channel.models.clone(),
                only_chat: channel.only_chat,
            })
            .collect();
        Ok(RelayState {
            channels,
            cache: ResponseCache::new(DEFAULT_CACHE_CAPACITY),
            preprocessor: MessagePreprocessor::from_config(config),
        })
    }

    /// Public model names the registry can route, for `/v1/models`.
    pub fn public_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .channels
            .iter()
            .flat_map(|channel| channel.models.keys().cloned())
            .collect();
        models.sort();
        models.dedup();
        models
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Resolve a caller model to a channel and its upstream name. Requests
    /// that carry tools skip channels marked `only_chat`.
    fn resolve(&self, model: &str, needs_tools: bool) -> Result<(&Channel, String), RelayError> {
        for channel in &self.channels {
            if needs_tools && channel.only_chat {
                continue;
            }
            if let Some(upstream) = channel.models.get(model) {
                return Ok((channel, upstream.clone()));
            }
        }
        Err(RelayError::ModelNotFound(model.to_string()))
    }

    /// The relay core: validate, preprocess, resolve, dispatch, republish.
    pub async fn relay_chat(&self, body: &[u8]) -> Result<HttpResponse, RelayError> {
        let mut request: ChatCompletionRequest = serde_json::from_slice(body)
            .map_err(|err| RelayError::MalformedRequest(err.to_string()))?;
        request.validate()?;

        let caller_model = request.model.clone();
        let needs_tools = request.needs_tools();
        self.preprocessor.apply(&mut request)?;

        let (channel, routing_model) = self.resolve(&caller_model, needs_tools)?;
        let context = RequestContext {
            caller_model,
            routing_model,
        };
        log::debug!(
            "relaying {} (~{} prompt tokens) via channel {} as {}",
            context.caller_model,
            tokens::estimate_prompt_tokens(&request.messages),
            channel.name,
            context.routing_model,
        );

        if request.stream {
            self.dispatch_streaming(channel, &request, &context).await
        } else {
            self.dispatch_json(channel, &request, &context).await
        }
    }

    async fn dispatch_streaming(
        &self,
        channel: &Channel,
        request: &ChatCompletionRequest,
        context: &RequestContext,
    ) -> Result<HttpResponse, RelayError> {
        if !channel.provider.supports(Capability::ChatStream) {
            return Err(RelayError::ChannelError(
                "channel not implemented".to_string(),
            ));
        }
        let outbound = request.for_upstream(&context.routing_model);
        let (chunks, usage) = channel
            .provider
            .create_chat_completion_stream(&outbound)
            .await?;
        let relay = RelayStream::new(
            chunks,
            context.caller_model.clone(),
            request.include_usage(),
            usage,
        );
        Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .streaming(relay))
    }

    async fn dispatch_json(
        &self,
        channel: &Channel,
        request: &ChatCompletionRequest,
        context: &RequestContext,
    ) -> Result<HttpResponse, RelayError> {
        if !channel.provider.supports(Capability::Chat) {
            return Err(RelayError::ChannelError(
                "channel not implemented".to_string(),
            ));
        }
        if let Some(cached) = self.cache.lookup(request) {
            log::info!("cache hit for model {}", context.caller_model);
            return Ok(HttpResponse::Ok().json(cached));
        }
        let outbound = request.for_upstream(&context.routing_model);
        let mut response = channel.provider.create_chat_completion(&outbound).await?;
        response.model = context.caller_model.clone();
        let http_response = HttpResponse::Ok().json(&response);
        if !response.content().is_empty() {
            self.cache.insert(request, &response);
        }
        Ok(http_response)
    }

    /// Raw passthrough for text-generation backends; body forwarded opaquely
    /// to the first generate-capable channel.
    pub async fn relay_generate(&self, body: &Value) -> Result<HttpResponse, RelayError> {
        let channel = self
            .channels
            .iter()
            .find(|channel| channel.provider.supports(Capability::Generate))
            .ok_or_else(|| {
                RelayError::ChannelError("no generate-capable channel".to_string())
            })?;
        let response = channel.provider.generate(body).await?;
        Ok(HttpResponse::Ok().json(response))
    }
}
