use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocols::{ChatCompletionRequest, MessageContent};

/// Wraps the first system message of a request with configured prefix and
/// suffix text. Strings come from `RelayConfig` at construction time.
pub struct MessagePreprocessor {
    preprompt: String,
    guideline: String,
}

impl MessagePreprocessor {
    pub fn new(preprompt: String, guideline: String) -> Self {
        MessagePreprocessor {
            preprompt,
            guideline,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.preprompt.clone(), config.guideline.clone())
    }

    /// Rewrites the first `system` message to `preprompt + content + guideline`
    /// and stops scanning. A request without a system message passes through
    /// untouched. Not idempotent: the dispatcher applies this exactly once.
    pub fn apply(&self, request: &mut ChatCompletionRequest) -> Result<(), RelayError> {
        for message in request.messages.iter_mut() {
            if message.role != "system" {
                continue;
            }
            return match message.content.as_mut() {
                Some(MessageContent::Text(text)) => {
                    *text = format!("{}{}{}", self.preprompt, text, self.guideline);
                    Ok(())
                }
                _ => Err(RelayError::UnsupportedContentType(
                    "system message content must be plain text".to_string(),
                )),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ChatMessage;
    use serde_json::json;

    fn request_with_messages(messages: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "gpt-x",
            "messages": messages,
        }))
        .unwrap()
    }

    fn text_of(message: &ChatMessage) -> &str {
        match message.content.as_ref().unwrap() {
            MessageContent::Text(text) => text,
            MessageContent::Parts(_) => panic!("expected text content"),
        }
    }

    #[test]
    fn test_wraps_first_system_message() {
        let preprocessor = MessagePreprocessor::new("P:".to_string(), ":S".to_string());
        let mut request = request_with_messages(json!([
            {"role": "user", "content": "hi"},
            {"role": "system", "content": "Be terse."},
            {"role": "user", "content": "bye"},
        ]));
        preprocessor.apply(&mut request).unwrap();
        assert_eq!(text_of(&request.messages[1]), "P:Be terse.:S");
        assert_eq!(text_of(&request.messages[0]), "hi");
        assert_eq!(text_of(&request.messages[2]), "bye");
    }

    #[test]
    fn test_only_first_system_message_is_rewritten() {
        let preprocessor = MessagePreprocessor::new("P:".to_string(), ":S".to_string());
        let mut request = request_with_messages(json!([
            {"role": "system", "content": "first"},
            {"role": "system", "content": "second"},
        ]));
        preprocessor.apply(&mut request).unwrap();
        assert_eq!(text_of(&request.messages[0]), "P:first:S");
        assert_eq!(text_of(&request.messages[1]), "second");
    }

    #[test]
    fn test_no_system_message_is_a_no_op() {
        let preprocessor = MessagePreprocessor::new("P:".to_string(), ":S".to_string());
        let mut request = request_with_messages(json!([
            {"role": "user", "content": "hi"},
        ]));
        let before = serde_json::to_value(&request).unwrap();
        preprocessor.apply(&mut request).unwrap();
        assert_eq!(serde_json::to_value(&request).unwrap(), before);
    }

    #[test]
    fn test_structured_system_content_is_rejected() {
        let preprocessor = MessagePreprocessor::new(String::new(), String::new());
        let mut request = request_with_messages(json!([
            {"role": "system", "content": [{"type": "text", "text": "nope"}]},
        ]));
        assert!(matches!(
            preprocessor.apply(&mut request),
            Err(RelayError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_reapplication_doubles_wrapping() {
        // Documents the non-idempotence contract.
        let preprocessor = MessagePreprocessor::new("P:".to_string(), ":S".to_string());
        let mut request = request_with_messages(json!([
            {"role": "system", "content": "x"},
        ]));
        preprocessor.apply(&mut request).unwrap();
        preprocessor.apply(&mut request).unwrap();
        assert_eq!(text_of(&request.messages[0]), "P:P:x:S:S");
    }
}
