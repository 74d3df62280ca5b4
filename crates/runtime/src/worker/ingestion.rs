//! The per-job ingestion pipeline.
//!
//! Five stages, in order: persist the raw chunk first (a downstream failure
//! must never lose source text), extract entities and events, materialize
//! the Context node, materialize the Chunk node, then materialize entities
//! and events with their embeddings and edges. Stage failures are isolated:
//! a job succeeds once stages 1–4 commit; stage-5 failures are counted but
//! non-fatal.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingService;
use crate::extractor::{ExtractedEvent, Extraction, Extractor};
use crate::guard::state_extractor::{apply_state_changes, StateExtractor};
use crate::stores::{EdgeKind, GraphStore, KvStore, NodeLabel, VectorIndex, VectorPayload};
use crate::types::{
    scoped_uid, ChunkNode, ContextNode, EntityNode, EventNode, MemoryError, OffloadJob,
};
use uuid::Uuid;

/// Outcome of processing one offload job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    pub success: bool,
    pub entities: usize,
    pub events: usize,
    /// Non-fatal stage-5 failures (embedding, vector upsert, edge merges).
    pub materialization_failures: usize,
}

pub struct IngestionPipeline {
    extractor: Arc<Extractor>,
    embedder: Arc<dyn EmbeddingService>,
    kv: Arc<dyn KvStore>,
    vectors: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
    state_extractor: StateExtractor,
}

impl IngestionPipeline {
    pub fn new(
        extractor: Arc<Extractor>,
        embedder: Arc<dyn EmbeddingService>,
        kv: Arc<dyn KvStore>,
        vectors: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            extractor,
            embedder,
            kv,
            vectors,
            graph,
            state_extractor: StateExtractor::new(),
        }
    }

    /// Run the five-stage pipeline for one job.
    pub async fn process_job(&self, job: &OffloadJob) -> Result<JobOutcome, MemoryError> {
        let start = std::time::Instant::now();
        let domain = job.metadata.domain.as_str();
        debug!(job_id = %job.job_id, tokens = job.token_count, "processing offload job");

        // Stage 1: persist the raw chunk with an extractive summary.
        let summary = extractive_summary(&job.chunk_text);
        self.kv.store_chunk(job, &summary).await?;

        // Stage 2: extraction. A contract violation degrades to empty lists;
        // the chunk above already preserves provenance.
        let extraction = match self.extractor.extract(&job.chunk_text, domain).await {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "extraction failed, continuing with empty result");
                Extraction::default()
            }
        };

        // State tracking piggybacks on ingestion: transitions detected in
        // the evicted text create or move State nodes.
        let changes = self.state_extractor.extract(&job.chunk_text);
        if !changes.is_empty() {
            if let Err(e) = apply_state_changes(&self.graph, &changes).await {
                warn!(job_id = %job.job_id, error = %e, "state tracking update failed");
            }
        }

        // Stage 3: materialize the Context node.
        let context = ContextNode::for_domain(domain);
        self.graph.merge_context(&context).await?;

        // Stage 4: materialize the Chunk node with a snippet.
        let chunk = ChunkNode {
            uid: Uuid::new_v4().to_string(),
            content: snippet(&job.chunk_text, 200),
            source: "chat".to_string(),
            domain: domain.to_string(),
            token_count: job.token_count,
        };
        self.graph.merge_chunk(&chunk).await?;

        // Stage 5: entities first (so INITIATED edges can resolve), then
        // events, then flow linkage.
        let mut failures = 0usize;
        for entity in &extraction.entities {
            failures += self.materialize_entity(job, &context, &chunk, entity).await;
        }

        let flow_id = job.metadata.thread_id.as_str();
        let mut event_nodes: Vec<(EventNode, &ExtractedEvent)> = Vec::new();
        for (step, event) in extraction.events.iter().enumerate() {
            let node = EventNode {
                uid: Uuid::new_v4().to_string(),
                name: event.name.clone(),
                subtype: event.subtype.clone(),
                domain: domain.to_string(),
                description: event.description.clone(),
                timestamp: job.timestamp,
                flow_id: flow_id.to_string(),
                flow_step: step as i64,
                vector_id: None,
            };
            event_nodes.push((node, event));
        }
        for (node, event) in &mut event_nodes {
            failures += self
                .materialize_event(job, &context, &chunk, node, *event)
                .await;
        }

        // Stage 6: NEXT edges between consecutive events of the same flow.
        event_nodes.sort_by_key(|(node, _)| node.flow_step);
        for pair in event_nodes.windows(2) {
            let (prev, _) = &pair[0];
            let (next, _) = &pair[1];
            if prev.flow_id == next.flow_id {
                if let Err(e) = self
                    .graph
                    .merge_edge(
                        &prev.uid,
                        NodeLabel::Event,
                        &next.uid,
                        NodeLabel::Event,
                        EdgeKind::Next,
                    )
                    .await
                {
                    warn!(error = %e, "NEXT edge merge failed");
                    failures += 1;
                }
            }
        }

        info!(
            job_id = %job.job_id,
            entities = extraction.entities.len(),
            events = extraction.events.len(),
            failures,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "offload job complete"
        );

        Ok(JobOutcome {
            job_id: job.job_id.clone(),
            success: true,
            entities: extraction.entities.len(),
            events: extraction.events.len(),
            materialization_failures: failures,
        })
    }

    /// Embed, index, merge, and link one entity. Returns the number of
    /// non-fatal failures encountered.
    async fn materialize_entity(
        &self,
        job: &OffloadJob,
        context: &ContextNode,
        chunk: &ChunkNode,
        entity: &crate::extractor::ExtractedEntity,
    ) -> usize {
        let domain = job.metadata.domain.as_str();
        let uid = scoped_uid(domain, &entity.name);
        let mut failures = 0;

        let wrapper = contextual_wrapper(domain, &entity.subtype, &entity.name, &entity.description);
        let vector_id = match self.embed_and_index(&uid, &wrapper, domain, &entity.subtype, &entity.name, "Entity").await {
            Ok(()) => Some(uid.clone()),
            Err(e) => {
                warn!(name = %entity.name, error = %e, "entity embedding/indexing failed");
                failures += 1;
                None
            }
        };

        let node = EntityNode {
            uid: uid.clone(),
            name: entity.name.clone(),
            subtype: entity.subtype.clone(),
            domain: domain.to_string(),
            description: entity.description.clone(),
            vector_id,
        };
        if let Err(e) = self.graph.merge_entity(&node).await {
            warn!(name = %entity.name, error = %e, "entity merge failed");
            return failures + 1;
        }

        failures += self
            .link(&uid, NodeLabel::Entity, &context.uid, NodeLabel::Context, EdgeKind::BelongsTo)
            .await;
        failures += self
            .link(&chunk.uid, NodeLabel::Chunk, &uid, NodeLabel::Entity, EdgeKind::Mentions)
            .await;
        failures
    }

    /// Embed, index, merge, and link one event, including its INITIATED
    /// edges from `caused_by` entity names.
    async fn materialize_event(
        &self,
        job: &OffloadJob,
        context: &ContextNode,
        chunk: &ChunkNode,
        node: &mut EventNode,
        event: &ExtractedEvent,
    ) -> usize {
        let domain = job.metadata.domain.as_str();
        let mut failures = 0;

        let wrapper = contextual_wrapper(domain, &event.subtype, &event.name, &event.description);
        match self
            .embed_and_index(&node.uid, &wrapper, domain, &event.subtype, &event.name, "Event")
            .await
        {
            Ok(()) => node.vector_id = Some(node.uid.clone()),
            Err(e) => {
                warn!(name = %event.name, error = %e, "event embedding/indexing failed");
                failures += 1;
            }
        }

        if let Err(e) = self.graph.merge_event(node).await {
            warn!(name = %event.name, error = %e, "event merge failed");
            return failures + 1;
        }

        failures += self
            .link(&node.uid, NodeLabel::Event, &context.uid, NodeLabel::Context, EdgeKind::BelongsTo)
            .await;
        failures += self
            .link(&chunk.uid, NodeLabel::Chunk, &node.uid, NodeLabel::Event, EdgeKind::Mentions)
            .await;

        // INITIATED edges: re-derive each agent entity's uid from its name.
        // A miss (entity never materialized) is logged and skipped.
        for cause in &event.caused_by {
            let cause_uid = scoped_uid(domain, cause);
            if let Err(e) = self
                .graph
                .merge_edge(&cause_uid, NodeLabel::Entity, &node.uid, NodeLabel::Event, EdgeKind::Initiated)
                .await
            {
                warn!(agent = %cause, event = %event.name, error = %e, "INITIATED edge skipped");
            }
        }
        failures
    }

    async fn embed_and_index(
        &self,
        uid: &str,
        wrapper: &str,
        domain: &str,
        subtype: &str,
        name: &str,
        node_type: &str,
    ) -> Result<(), MemoryError> {
        let embedding = self.embedder.embed(wrapper).await?;
        let payload = VectorPayload {
            domain: domain.to_string(),
            node_id: uid.to_string(),
            subtype: subtype.to_string(),
            name: name.to_string(),
            node_type: node_type.to_string(),
        };
        self.vectors.upsert(uid, &embedding, &payload).await
    }

    async fn link(
        &self,
        start_uid: &str,
        start: NodeLabel,
        end_uid: &str,
        end: NodeLabel,
        edge: EdgeKind,
    ) -> usize {
        match self.graph.merge_edge(start_uid, start, end_uid, end, edge).await {
            Ok(()) => 0,
            Err(e) => {
                warn!(edge = edge.as_str(), error = %e, "edge merge failed");
                1
            }
        }
    }
}

/// The disambiguating frame embedded instead of the bare description, so
/// identically-named items in different domains land in different regions of
/// vector space.
pub fn contextual_wrapper(domain: &str, subtype: &str, name: &str, content: &str) -> String {
    format!("[Domain: {domain}] [Type: {subtype}] [Name: {name}] {content}")
}

/// Deterministic extractive summary: first three and last three lines,
/// capped at 500 characters. No LLM involved, so stage 1 cannot fail on a
/// model contract.
pub fn extractive_summary(text: &str) -> String {
    if text.len() < 100 {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut summary = if lines.len() <= 6 {
        text.chars().take(500).collect()
    } else {
        let head = lines[..3].join("\n");
        let tail = lines[lines.len() - 3..].join("\n");
        format!("{head}\n[...]\n{tail}")
    };

    if summary.len() > 500 {
        summary = summary.chars().take(500).collect::<String>() + "...";
    }
    summary
}

/// Truncate to at most `max_chars`, appending an ellipsis when cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_carries_the_disambiguating_frame() {
        let wrapper = contextual_wrapper("work", "person", "Alice", "a staff engineer");
        assert_eq!(
            wrapper,
            "[Domain: work] [Type: person] [Name: Alice] a staff engineer"
        );
    }

    #[test]
    fn short_text_summarizes_to_itself() {
        assert_eq!(extractive_summary("short"), "short");
    }

    #[test]
    fn long_text_keeps_head_and_tail() {
        let lines: Vec<String> = (0..20).map(|i| format!("line number {i} with text")).collect();
        let text = lines.join("\n");
        let summary = extractive_summary(&text);
        assert!(summary.contains("line number 0"));
        assert!(summary.contains("line number 19"));
        assert!(summary.contains("[...]"));
        assert!(summary.len() <= 503);
    }

    #[test]
    fn snippet_truncates_with_ellipsis() {
        assert_eq!(snippet("abc", 10), "abc");
        assert_eq!(snippet("abcdefghij", 5), "abcde...");
    }
}
