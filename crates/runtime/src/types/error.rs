//! Error types for the memory engine
//!
//! One error enum per the taxonomy: transient external failures, LLM
//! contract violations, store failures, configuration problems. Pipeline
//! stages catch at their boundary and degrade; only initialization errors
//! are fatal.

use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for the memory engine.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Store error: {reason}")]
    Store { reason: String },

    #[error("Embedding error: {reason}")]
    Embedding { reason: String },

    #[error("LLM error: {reason}")]
    Llm { reason: String },

    #[error("LLM request timed out after {seconds}s")]
    LlmTimeout { seconds: u64 },

    #[error("Extraction contract violation: {reason}")]
    Extraction { reason: String },

    #[error("Not found: {reason}")]
    NotFound { reason: String },

    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },
}

impl MemoryError {
    /// Whether the error is a transient external failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemoryError::LlmTimeout { .. } | MemoryError::Llm { .. } | MemoryError::Store { .. }
        )
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Extraction {
            reason: format!("JSON parse failure: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(MemoryError::LlmTimeout { seconds: 90 }.is_transient());
        assert!(MemoryError::Store {
            reason: "connection reset".into()
        }
        .is_transient());
        assert!(!MemoryError::NotFound {
            reason: "entity".into()
        }
        .is_transient());
    }
}
