use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::protocols::{ChatCompletionRequest, ChatCompletionResponse};

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Completed-answer cache for non-streaming requests. The fingerprint is
/// owned here: callers hand over the request and the cache derives the key.
pub struct ResponseCache {
    entries: DashMap<String, ChatCompletionResponse>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        ResponseCache {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Key over the answer-determining request fields. Messages are hashed
    /// post-preprocessing, so augmentation changes invalidate naturally.
    fn fingerprint(request: &ChatCompletionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        if let Ok(messages) = serde_json::to_vec(&request.messages) {
            hasher.update(&messages);
        }
        if let Some(max_tokens) = request.max_tokens {
            hasher.update(max_tokens.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn lookup(&self, request: &ChatCompletionRequest) -> Option<ChatCompletionResponse> {
        self.entries
            .get(&Self::fingerprint(request))
            .map(|entry| entry.value().clone())
    }

    /// Fire-and-forget write. At capacity new entries are dropped rather
    /// than evicting live ones.
    pub fn insert(&self, request: &ChatCompletionRequest, response: &ChatCompletionResponse) {
        let key = Self::fingerprint(request);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            log::debug!("response cache full, skipping insert");
            return;
        }
        self.entries.insert(key, response.clone());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
