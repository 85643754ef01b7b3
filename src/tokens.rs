use once_cell::sync::Lazy;
use tiktoken_rs::{CoreBPE, o200k_base};

use crate::protocols::{ChatMessage, ContentPart, MessageContent};

static BPE: Lazy<CoreBPE> = Lazy::new(|| o200k_base().expect("embedded o200k vocabulary"));

/// Estimate prompt tokens for a message list. Observability only — billing
/// always uses the provider-reported usage.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> usize {
    let mut num_tokens = 0;
    for message in messages {
        num_tokens += 4; // per-message framing overhead
        num_tokens += BPE.encode_with_special_tokens(&message.role).len();
        num_tokens += match &message.content {
            Some(MessageContent::Text(text)) => BPE.encode_with_special_tokens(text).len(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => BPE.encode_with_special_tokens(text).len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
            None => 0,
        };
    }
    num_tokens + 3 // reply priming
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_conversation_has_priming_only() {
        assert_eq!(estimate_prompt_tokens(&[]), 3);
    }

    #[test]
    fn test_longer_content_counts_more() {
        let short = vec![ChatMessage::text("user", "hi")];
        let long = vec![ChatMessage::text(
            "user",
            "a considerably longer message about nothing in particular",
        )];
        assert!(estimate_prompt_tokens(&long) > estimate_prompt_tokens(&short));
    }
}
