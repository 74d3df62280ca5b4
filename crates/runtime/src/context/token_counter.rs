//! Token estimation for context pressure accounting.
//!
//! The pressure policy only needs an estimator that is strictly positive for
//! non-empty text and deterministic; the default uses a words-per-token
//! heuristic and can be swapped for a real tokenizer without touching policy.

use crate::types::Message;

/// Trait for estimating token counts in text and messages.
pub trait TokenEstimator: Send + Sync {
    /// Estimate tokens in a single string.
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens across a slice of messages, counting the role tag.
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate(&m.tagged())).sum()
    }
}

/// Heuristic estimator: `words / 0.75`, i.e. roughly 1.33 tokens per word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordEstimator;

impl TokenEstimator for WordEstimator {
    fn estimate(&self, text: &str) -> usize {
        (text.split_whitespace().count() as f64 / 0.75) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(WordEstimator.estimate(""), 0);
    }

    #[test]
    fn nonempty_text_is_positive_and_deterministic() {
        let text = "the quick brown fox jumps over the lazy dog";
        let first = WordEstimator.estimate(text);
        assert!(first > 0);
        assert_eq!(first, WordEstimator.estimate(text));
        // 9 words / 0.75 = 12
        assert_eq!(first, 12);
    }

    #[test]
    fn message_estimate_includes_role_tag() {
        let msg = Message::new(Role::User, "hello world");
        let tagged = WordEstimator.estimate(&msg.tagged());
        let bare = WordEstimator.estimate(&msg.content);
        assert!(tagged > bare);
        assert_eq!(WordEstimator.estimate_messages(&[msg.clone()]), tagged);
    }
}
