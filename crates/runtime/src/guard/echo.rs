//! Echo guard: near-duplicate response detection with escalating
//! regeneration.
//!
//! Wraps the LLM call. Each accepted response's embedding lands in a
//! bounded recent-history set; a new response whose cosine similarity
//! against any stored embedding reaches the threshold is an echo and is
//! regenerated under increasingly forceful system directives. The final
//! retry also strips retrieved-knowledge and state-memory overlays from the
//! window, removing the material the loop is feeding on.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EchoConfig;
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::inference::{InferenceOptions, InferenceProvider};
use crate::stores::{KvStore, RESPONSE_EMBEDDINGS_KEY};
use crate::types::{unix_time, MemoryError, Message};

const EMPTY_RESPONSE_FALLBACK: &str =
    "[ERROR] The model returned no usable content after repeated attempts.";
const INTERVENTION_FALLBACK: &str =
    "[SYSTEM INTERVENTION] The model was unable to produce a novel response. \
     Please rephrase your request or change the topic.";

/// Outcome of a guarded generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedResponse {
    pub content: String,
    /// Total LLM calls made (1 when the first response was accepted).
    pub attempts: u32,
    /// Whether the accepted response was still an echo (`[REPEATED]`).
    pub echo_detected: bool,
}

pub struct EchoGuard {
    llm: Arc<dyn InferenceProvider>,
    embedder: Arc<dyn EmbeddingService>,
    kv: Arc<dyn KvStore>,
    config: EchoConfig,
}

impl EchoGuard {
    pub fn new(
        llm: Arc<dyn InferenceProvider>,
        embedder: Arc<dyn EmbeddingService>,
        kv: Arc<dyn KvStore>,
        config: EchoConfig,
    ) -> Self {
        Self {
            llm,
            embedder,
            kv,
            config,
        }
    }

    /// Generate a response for the window, regenerating on echoes up to the
    /// configured attempt budget.
    pub async fn generate(
        &self,
        window: &[Message],
        options: &InferenceOptions,
    ) -> Result<GuardedResponse, MemoryError> {
        if !self.config.enabled {
            let content = self.llm.generate(window, options).await?;
            return Ok(GuardedResponse {
                content,
                attempts: 1,
                echo_detected: false,
            });
        }

        let max_attempts = self.config.max_regeneration_attempts;
        let mut overlays: Vec<Message> = Vec::new();

        // Attempt 0 is the initial call; attempts 1..=max are regenerations.
        for attempt in 0..=max_attempts {
            let mut view = if attempt == self.config.strip_context_on_retry && attempt > 0 {
                strip_memory_overlays(window)
            } else {
                window.to_vec()
            };
            view.extend(overlays.iter().cloned());

            let response = self.llm.generate(&view, options).await?;

            if response.trim().is_empty() {
                if attempt == max_attempts {
                    warn!("all attempts produced empty responses");
                    return Ok(GuardedResponse {
                        content: EMPTY_RESPONSE_FALLBACK.to_string(),
                        attempts: attempt + 1,
                        echo_detected: false,
                    });
                }
                overlays.push(Message::system(
                    "SYSTEM: Your previous response was empty. You must provide \
                     a substantive answer to the user's message.",
                ));
                continue;
            }

            let embedding = self.embedder.embed(&response).await?;
            let (is_echo, max_sim) = self.check_similarity(&embedding).await?;

            if !is_echo {
                debug!(max_similarity = max_sim, "response accepted");
                self.store_embedding(&embedding).await?;
                return Ok(GuardedResponse {
                    content: response,
                    attempts: attempt + 1,
                    echo_detected: false,
                });
            }

            info!(
                attempt,
                similarity = max_sim,
                threshold = self.config.similarity_threshold,
                "echo detected"
            );

            if attempt == max_attempts {
                // Out of retries: accept, marked.
                let content = if response.trim().len() < 3 {
                    INTERVENTION_FALLBACK.to_string()
                } else {
                    format!("[REPEATED] {response}")
                };
                self.store_embedding(&embedding).await?;
                return Ok(GuardedResponse {
                    content,
                    attempts: attempt + 1,
                    echo_detected: true,
                });
            }

            overlays.push(escalation_overlay(attempt + 1, &response));
        }

        // The loop always returns on its final attempt.
        unreachable!("echo guard attempt loop exhausted without returning")
    }

    /// Record a response into the recent-history set without guarding it
    /// (used when the guard is bypassed but history should stay warm).
    pub async fn remember_response(&self, content: &str) -> Result<(), MemoryError> {
        let embedding = self.embedder.embed(content).await?;
        self.store_embedding(&embedding).await
    }

    /// Compare an embedding against the recent-history set. Returns
    /// `(is_echo, max_similarity)`.
    async fn check_similarity(&self, embedding: &[f32]) -> Result<(bool, f32), MemoryError> {
        let stored = self.kv.zrange_all(RESPONSE_EMBEDDINGS_KEY).await?;
        let mut max_similarity = 0.0f32;

        for raw in stored {
            let Ok(prior) = serde_json::from_str::<Vec<f32>>(&raw) else {
                warn!("unparseable stored response embedding, skipping");
                continue;
            };
            let similarity = cosine_similarity(embedding, &prior);
            max_similarity = max_similarity.max(similarity);
            if similarity >= self.config.similarity_threshold {
                return Ok((true, similarity));
            }
        }
        Ok((false, max_similarity))
    }

    async fn store_embedding(&self, embedding: &[f32]) -> Result<(), MemoryError> {
        let member = serde_json::to_string(embedding)?;
        self.kv
            .zadd(RESPONSE_EMBEDDINGS_KEY, &member, unix_time())
            .await?;
        self.kv
            .ztrim_oldest(RESPONSE_EMBEDDINGS_KEY, self.config.history_size)
            .await
    }
}

/// Remove retrieved-knowledge and state-memory overlays from a window copy.
fn strip_memory_overlays(window: &[Message]) -> Vec<Message> {
    window
        .iter()
        .filter(|m| {
            !(m.content.starts_with("[RETRIEVED LONG-TERM KNOWLEDGE]")
                || m.content.starts_with("[STATE MEMORY]"))
        })
        .cloned()
        .collect()
}

/// Build the escalating anti-repetition directive for the given retry.
fn escalation_overlay(retry: u32, response: &str) -> Message {
    let preview: String = response.chars().take(200).collect();
    let content = match retry {
        1 => format!(
            "SYSTEM NOTICE: Your previous response was nearly identical to a \
             recent reply (preview: \"{preview}\"). Please answer again with new \
             substance. Consider: (1) approaching the question from a different \
             angle, (2) adding concrete details or examples you have not \
             mentioned yet, (3) asking the user a clarifying question."
        ),
        2 => format!(
            "SYSTEM DIRECTIVE: You are repeating yourself. Do NOT restate the \
             previous reply (preview: \"{preview}\"). You must respond with one \
             of the following: (a) a genuinely new answer built from different \
             information, (b) a concise summary of what has already been \
             established, or (c) the single line \"I have nothing further to \
             add on this topic.\""
        ),
        _ => "EMERGENCY OVERRIDE: A repetition loop has been detected. All \
              retrieved long-term memory has been removed from your context. \
              Disregard the phrasing of every previous reply and produce a \
              fresh response to the user's most recent message."
            .to_string(),
    };
    Message::system(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingService;
    use crate::stores::memory::MemoryKvStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Returns scripted responses in order and records each call's window.
    struct ScriptedProvider {
        responses: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        async fn generate(
            &self,
            messages: &[Message],
            _options: &InferenceOptions,
        ) -> Result<String, MemoryError> {
            self.calls.lock().push(messages.to_vec());
            self.responses.lock().pop().ok_or_else(|| MemoryError::Llm {
                reason: "script exhausted".to_string(),
            })
        }
    }

    fn guard(
        provider: Arc<ScriptedProvider>,
        kv: Arc<MemoryKvStore>,
    ) -> EchoGuard {
        EchoGuard::new(
            provider,
            Arc::new(HashEmbeddingService::new(64)),
            kv,
            EchoConfig::default(),
        )
    }

    #[tokio::test]
    async fn novel_response_accepted_first_try() {
        let provider = Arc::new(ScriptedProvider::new(&["A fresh answer."]));
        let kv = Arc::new(MemoryKvStore::new());
        let guard = guard(provider.clone(), kv.clone());

        let result = guard
            .generate(&[Message::user("hi")], &InferenceOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content, "A fresh answer.");
        assert_eq!(result.attempts, 1);
        assert!(!result.echo_detected);

        // The embedding was recorded
        let stored = kv.zrange_all(RESPONSE_EMBEDDINGS_KEY).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn persistent_echo_is_marked_repeated() {
        let provider = Arc::new(ScriptedProvider::new(&[
            "Hello.", "Hello.", "Hello.", "Hello.",
        ]));
        let kv = Arc::new(MemoryKvStore::new());
        let guard = guard(provider.clone(), kv.clone());

        // Seed the history so the first "Hello." is already an echo
        guard.remember_response("Hello.").await.unwrap();

        let window = vec![
            Message::system("[RETRIEVED LONG-TERM KNOWLEDGE]\nsome memory"),
            Message::system("[STATE MEMORY]\nActive Tasks: greet"),
            Message::user("say something new"),
        ];
        let result = guard
            .generate(&window, &InferenceOptions::default())
            .await
            .unwrap();

        assert_eq!(result.content, "[REPEATED] Hello.");
        assert_eq!(result.attempts, 4);
        assert!(result.echo_detected);

        let calls = provider.calls.lock();
        assert_eq!(calls.len(), 4);

        // Escalating overlays accumulate between attempts
        assert_eq!(calls[1].len(), window.len() + 1);
        assert!(calls[1].last().unwrap().content.starts_with("SYSTEM NOTICE"));
        assert!(calls[2].iter().any(|m| m.content.starts_with("SYSTEM DIRECTIVE")));
        assert!(calls[3].iter().any(|m| m.content.starts_with("EMERGENCY OVERRIDE")));

        // The final attempt's window has the memory overlays stripped
        let last = &calls[3];
        assert!(!last
            .iter()
            .any(|m| m.content.starts_with("[RETRIEVED LONG-TERM KNOWLEDGE]")));
        assert!(!last.iter().any(|m| m.content.starts_with("[STATE MEMORY]")));
        // Earlier attempts still saw them
        assert!(calls[1]
            .iter()
            .any(|m| m.content.starts_with("[RETRIEVED LONG-TERM KNOWLEDGE]")));
    }

    #[tokio::test]
    async fn echo_then_novel_recovers() {
        let provider = Arc::new(ScriptedProvider::new(&[
            "Hello.",
            "Something genuinely different about tidal forces.",
        ]));
        let kv = Arc::new(MemoryKvStore::new());
        let guard = guard(provider.clone(), kv.clone());
        guard.remember_response("Hello.").await.unwrap();

        let result = guard
            .generate(&[Message::user("hi")], &InferenceOptions::default())
            .await
            .unwrap();
        assert_eq!(
            result.content,
            "Something genuinely different about tidal forces."
        );
        assert_eq!(result.attempts, 2);
        assert!(!result.echo_detected);
    }

    #[tokio::test]
    async fn empty_responses_exhaust_to_error() {
        let provider = Arc::new(ScriptedProvider::new(&["", "  ", "", "\n"]));
        let kv = Arc::new(MemoryKvStore::new());
        let guard = guard(provider.clone(), kv.clone());

        let result = guard
            .generate(&[Message::user("hi")], &InferenceOptions::default())
            .await
            .unwrap();
        assert!(result.content.starts_with("[ERROR]"));
        assert_eq!(result.attempts, 4);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let provider = Arc::new(ScriptedProvider::new(&[]));
        let kv = Arc::new(MemoryKvStore::new());
        let guard = EchoGuard::new(
            provider,
            Arc::new(HashEmbeddingService::new(32)),
            kv.clone(),
            EchoConfig {
                history_size: 3,
                ..EchoConfig::default()
            },
        );

        for i in 0..6 {
            guard
                .remember_response(&format!("response number {i}"))
                .await
                .unwrap();
        }
        let stored = kv.zrange_all(RESPONSE_EMBEDDINGS_KEY).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn disabled_guard_passes_through() {
        let provider = Arc::new(ScriptedProvider::new(&["Hello."]));
        let kv = Arc::new(MemoryKvStore::new());
        let guard = EchoGuard::new(
            provider,
            Arc::new(HashEmbeddingService::new(32)),
            kv,
            EchoConfig {
                enabled: false,
                ..EchoConfig::default()
            },
        );

        let result = guard
            .generate(&[Message::user("hi")], &InferenceOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content, "Hello.");
        assert_eq!(result.attempts, 1);
    }
}
