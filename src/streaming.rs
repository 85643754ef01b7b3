use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::error::RelayError;
use crate::protocols::{ChatCompletionStreamResponse, Usage};

/// Lazy sequence of JSON-encoded chunk payloads produced by a provider.
/// Finite and not restartable; consumed exactly once.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

/// Shared usage recorder: the provider fills it as upstream frames report
/// totals, the relay drains it once the stream completes.
#[derive(Clone, Default)]
pub struct UsageHandle(Arc<Mutex<Option<Usage>>>);

impl UsageHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: Usage) {
        *self.0.lock().expect("usage recorder lock") = Some(usage);
    }

    pub fn snapshot(&self) -> Option<Usage> {
        self.0.lock().expect("usage recorder lock").clone()
    }
}

/// Serialized terminal usage frame. Serialization failure degrades to an
/// empty string rather than failing the call — the answer has already been
/// delivered by the time this runs.
pub fn usage_chunk(model: &str, usage: Usage) -> String {
    serde_json::to_string(&ChatCompletionStreamResponse::usage_only(model, usage))
        .unwrap_or_default()
}

enum RelayStreamState {
    /// Chunks may still arrive from the provider.
    Open,
    /// Provider signaled natural end; terminal frames not yet emitted.
    Draining,
    /// Terminal frames emitted or an error surfaced.
    Closed,
}

/// Republishes a provider chunk sequence as SSE frames, forcing the
/// caller-visible model name into every frame and appending a synthetic
/// usage frame when the request asked for one. One chunk in flight at a
/// time; arrival order preserved.
pub struct RelayStream {
    chunks: ChunkStream,
    caller_model: String,
    include_usage: bool,
    usage: UsageHandle,
    state: RelayStreamState,
}

impl RelayStream {
    pub fn new(
        chunks: ChunkStream,
        caller_model: impl Into<String>,
        include_usage: bool,
        usage: UsageHandle,
    ) -> Self {
        RelayStream {
            chunks,
            caller_model: caller_model.into(),
            include_usage,
            usage,
            state: RelayStreamState::Open,
        }
    }

    /// Substitute the caller model into one provider chunk. A chunk that
    /// does not parse would leak the routing model, so it closes the stream
    /// instead of passing through raw.
    fn rewrite(&self, payload: &str) -> Result<Bytes, RelayError> {
        let mut chunk: ChatCompletionStreamResponse =
            serde_json::from_str(payload).map_err(|err| RelayError::Provider {
                status: 502,
                message: format!("malformed stream chunk from backend: {err}"),
            })?;
        chunk.model = self.caller_model.clone();
        let body = serde_json::to_string(&chunk).unwrap_or_default();
        Ok(Bytes::from(format!("data: {body}\n\n")))
    }

    fn terminal_frames(&self) -> Bytes {
        let mut out = String::new();
        if self.include_usage {
            let usage = self.usage.snapshot().unwrap_or_default();
            let frame = usage_chunk(&self.caller_model, usage);
            if !frame.is_empty() {
                out.push_str("data: ");
                out.push_str(&frame);
                out.push_str("\n\n");
            }
        }
        out.push_str("data: [DONE]\n\n");
        Bytes::from(out)
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.state {
                RelayStreamState::Open => match this.chunks.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(payload))) => match this.rewrite(&payload) {
                        Ok(frame) => return Poll::Ready(Some(Ok(frame))),
                        Err(err) => {
                            this.state = RelayStreamState::Closed;
                            return Poll::Ready(Some(Err(err)));
                        }
                    },
                    Poll::Ready(Some(Err(err))) => {
                        this.state = RelayStreamState::Closed;
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        this.state = RelayStreamState::Draining;
                    }
                    Poll::Pending => return Poll::Pending,
                },
                RelayStreamState::Draining => {
                    let frames = this.terminal_frames();
                    this.state = RelayStreamState::Closed;
                    return Poll::Ready(Some(Ok(frames)));
                }
                RelayStreamState::Closed => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn provider_chunk(model: &str, content: &str) -> String {
        json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion.chunk",
            "created": 1700000000u64,
            "model": model,
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}],
        })
        .to_string()
    }

    fn chunk_stream(items: Vec<Result<String, RelayError>>) -> ChunkStream {
        Box::pin(futures::stream::iter(items))
    }

    /// Split the relayed byte frames back into their `data:` payloads.
    fn collect_payloads(frames: &[Result<Bytes, RelayError>]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| frame.as_ref().ok())
            .flat_map(|bytes| {
                String::from_utf8(bytes.to_vec())
                    .unwrap()
                    .split("\n\n")
                    .filter(|block| !block.is_empty())
                    .map(|block| block.trim_start_matches("data: ").to_string())
                    .collect::<Vec<String>>()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_model_is_rewritten_in_every_frame() {
        let chunks = chunk_stream(vec![
            Ok(provider_chunk("internal-model", "Hel")),
            Ok(provider_chunk("internal-model", "lo")),
        ]);
        let relay = RelayStream::new(chunks, "gpt-x", false, UsageHandle::new());
        let frames: Vec<_> = relay.collect().await;
        let payloads = collect_payloads(&frames);

        assert_eq!(payloads.len(), 3); // two chunks + [DONE]
        for payload in &payloads[..2] {
            let value: serde_json::Value = serde_json::from_str(payload).unwrap();
            assert_eq!(value["model"], "gpt-x");
        }
        assert_eq!(payloads[2], "[DONE]");
    }

    #[tokio::test]
    async fn test_order_and_content_preserved() {
        let chunks = chunk_stream(vec![
            Ok(provider_chunk("m", "a")),
            Ok(provider_chunk("m", "b")),
            Ok(provider_chunk("m", "c")),
        ]);
        let relay = RelayStream::new(chunks, "gpt-x", false, UsageHandle::new());
        let frames: Vec<_> = relay.collect().await;
        let payloads = collect_payloads(&frames);
        let deltas: Vec<String> = payloads[..3]
            .iter()
            .map(|p| {
                let value: serde_json::Value = serde_json::from_str(p).unwrap();
                value["choices"][0]["delta"]["content"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(deltas, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_usage_frame_appended_when_requested() {
        let usage = UsageHandle::new();
        usage.record(Usage {
            prompt_tokens: 7,
            completion_tokens: 11,
            total_tokens: 18,
        });
        let chunks = chunk_stream(vec![Ok(provider_chunk("internal", "hi"))]);
        let relay = RelayStream::new(chunks, "gpt-x", true, usage);
        let frames: Vec<_> = relay.collect().await;
        let payloads = collect_payloads(&frames);

        assert_eq!(payloads.len(), 3);
        let terminal: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
        assert_eq!(terminal["model"], "gpt-x");
        assert_eq!(terminal["choices"].as_array().unwrap().len(), 0);
        assert_eq!(terminal["usage"]["total_tokens"], 18);
        assert!(
            terminal["id"]
                .as_str()
                .unwrap()
                .starts_with("chatcmpl-")
        );
        assert_eq!(payloads[2], "[DONE]");
    }

    #[tokio::test]
    async fn test_no_usage_frame_without_request() {
        let usage = UsageHandle::new();
        usage.record(Usage::default());
        let chunks = chunk_stream(vec![Ok(provider_chunk("internal", "hi"))]);
        let relay = RelayStream::new(chunks, "gpt-x", false, usage);
        let frames: Vec<_> = relay.collect().await;
        let payloads = collect_payloads(&frames);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1], "[DONE]");
    }

    #[tokio::test]
    async fn test_unrecorded_usage_degrades_to_zero_totals() {
        let chunks = chunk_stream(vec![Ok(provider_chunk("internal", "hi"))]);
        let relay = RelayStream::new(chunks, "gpt-x", true, UsageHandle::new());
        let frames: Vec<_> = relay.collect().await;
        let payloads = collect_payloads(&frames);
        let terminal: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
        assert_eq!(terminal["usage"]["total_tokens"], 0);
    }

    #[tokio::test]
    async fn test_error_before_first_chunk_emits_only_error() {
        let chunks = chunk_stream(vec![Err(RelayError::Provider {
            status: 500,
            message: "backend exploded".to_string(),
        })]);
        let mut relay = RelayStream::new(chunks, "gpt-x", true, UsageHandle::new());
        let first = relay.next().await.unwrap();
        assert!(first.is_err());
        assert!(relay.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_mid_stream_closes_without_terminal_frames() {
        let chunks = chunk_stream(vec![
            Ok(provider_chunk("internal", "partial")),
            Err(RelayError::Provider {
                status: 502,
                message: "connection reset".to_string(),
            }),
        ]);
        let mut relay = RelayStream::new(chunks, "gpt-x", true, UsageHandle::new());
        assert!(relay.next().await.unwrap().is_ok());
        assert!(relay.next().await.unwrap().is_err());
        assert!(relay.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_chunk_closes_the_stream() {
        let chunks = chunk_stream(vec![
            Ok("not json".to_string()),
            Ok(provider_chunk("internal", "never seen")),
        ]);
        let mut relay = RelayStream::new(chunks, "gpt-x", false, UsageHandle::new());
        let first = relay.next().await.unwrap();
        assert!(matches!(first, Err(RelayError::Provider { .. })));
        assert!(relay.next().await.is_none());
    }

    #[tokio::test]
    async fn test_synthetic_frame_ids_are_unique() {
        let mut ids = Vec::new();
        for _ in 0..2 {
            let chunks = chunk_stream(vec![Ok(provider_chunk("internal", "hi"))]);
            let relay = RelayStream::new(chunks, "gpt-x", true, UsageHandle::new());
            let frames: Vec<_> = relay.collect().await;
            let payloads = collect_payloads(&frames);
            let terminal: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
            ids.push(terminal["id"].as_str().unwrap().to_string());
        }
        assert_ne!(ids[0], ids[1]);
    }
}
