//! Hybrid retrieval over the vector index and the knowledge graph.
//!
//! Four phases: classify the query's intent, run a filtered cosine kNN with
//! a score floor, expand the surviving nodes one hop through the graph, and
//! synthesize the results. Injection into the window is left to the context
//! manager.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::RagConfig;
use crate::embedding::EmbeddingService;
use crate::extractor::Extractor;
use crate::stores::{GraphStore, VectorIndex};
use crate::types::{MemoryError, RagResult};

pub struct Retriever {
    extractor: Arc<Extractor>,
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
    config: RagConfig,
}

impl Retriever {
    pub fn new(
        extractor: Arc<Extractor>,
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
        config: RagConfig,
    ) -> Self {
        Self {
            extractor,
            embedder,
            vectors,
            graph,
            config,
        }
    }

    /// Embed the query and run the four-phase retrieval with the configured
    /// semantic top-k.
    pub async fn retrieve(&self, query_text: &str) -> Result<RagResult, MemoryError> {
        let embedding = self.embedder.embed(query_text).await?;
        self.query(query_text, &embedding, self.config.top_k_semantic)
            .await
    }

    /// Four-phase retrieval over a precomputed query embedding.
    pub async fn query(
        &self,
        query_text: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<RagResult, MemoryError> {
        let start = Instant::now();

        // Phase 1: intent classification (never fails; degrades to general)
        let intent = self.extractor.classify_intent(query_text).await;
        debug!(?intent, "classified query intent");

        // Phase 2: filtered vector scan with score floor
        let hits = self
            .vectors
            .search(
                query_embedding,
                k,
                intent.domain(),
                Some(self.config.score_threshold),
            )
            .await?;

        let node_ids: Vec<String> = hits.iter().map(|h| h.payload.node_id.clone()).collect();
        let semantic_chunks: Vec<String> = hits
            .iter()
            .map(|h| {
                format!(
                    "[{}: {}] ({})",
                    h.payload.node_type, h.payload.name, h.payload.subtype
                )
            })
            .collect();

        // Phase 3: one-hop graph expansion of the survivors
        let expanded = self.graph.expand_context(&node_ids).await?;

        // Phase 4: synthesis
        let mut relational_facts = Vec::new();
        for item in expanded.iter().take(self.config.top_k_relational) {
            relational_facts.push(format!(
                "[{}: {}] {}",
                item.node_type, item.name, item.description
            ));
            for rel in &item.relationships {
                relational_facts.push(format!("  - {rel}"));
            }
        }

        let retrieval_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            semantic = semantic_chunks.len(),
            relational = relational_facts.len(),
            elapsed_ms = retrieval_time_ms as u64,
            "retrieval complete"
        );

        Ok(RagResult {
            semantic_chunks,
            relational_facts,
            retrieval_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingService;
    use crate::inference::{InferenceOptions, InferenceProvider};
    use crate::stores::memory::{MemoryGraphStore, MemoryVectorIndex};
    use crate::stores::VectorPayload;
    use crate::types::Message;
    use async_trait::async_trait;

    struct FixedIntentProvider;

    #[async_trait]
    impl InferenceProvider for FixedIntentProvider {
        async fn generate(
            &self,
            _messages: &[Message],
            _options: &InferenceOptions,
        ) -> Result<String, MemoryError> {
            Ok(r#"{"intent": "general"}"#.to_string())
        }
    }

    fn payload(domain: &str, name: &str) -> VectorPayload {
        VectorPayload {
            domain: domain.to_string(),
            node_id: format!("uid-{name}"),
            subtype: "thing".to_string(),
            name: name.to_string(),
            node_type: "Entity".to_string(),
        }
    }

    #[tokio::test]
    async fn score_floor_excludes_weak_hits() {
        let vectors = Arc::new(MemoryVectorIndex::new());
        // Points with known cosine against the unit-x query:
        // 0.72, 0.55, 0.41, 0.38, 0.12
        for (name, score) in [
            ("a", 0.72f32),
            ("b", 0.55),
            ("c", 0.41),
            ("d", 0.38),
            ("e", 0.12),
        ] {
            let y = (1.0 - score * score).sqrt();
            vectors
                .upsert(name, &[score, y, 0.0], &payload("general", name))
                .await
                .unwrap();
        }

        let retriever = Retriever::new(
            Arc::new(Extractor::new(Arc::new(FixedIntentProvider), 100)),
            Arc::new(HashEmbeddingService::new(3)),
            vectors,
            Arc::new(MemoryGraphStore::new()),
            RagConfig {
                score_threshold: 0.4,
                ..RagConfig::default()
            },
        );

        let result = retriever.query("anything", &[1.0, 0.0, 0.0], 10).await.unwrap();
        assert_eq!(result.semantic_chunks.len(), 3);
        assert!(result.semantic_chunks[0].contains("[Entity: a]"));
        assert!(result.semantic_chunks[2].contains("[Entity: c]"));
    }
}
