//! Storage ports for the memory engine.
//!
//! Three narrow adapters sit behind these traits: a KV store for raw chunks
//! and the response-embedding history, a vector index for embeddings, and a
//! graph store for the metaphysical schema. The engine never depends on
//! driver-specific features beyond what the traits list. In-memory
//! implementations back tests and driver-less development.

pub mod graph_neo4j;
pub mod kv_redis;
pub mod memory;
pub mod vector_qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{
    ChunkNode, ConceptNode, ContextNode, EntityNode, EventNode, MacroEventNode, MemoryError,
    OffloadJob, State, StateKind, StateStatus,
};

/// Sorted-set key holding recent response embeddings for the echo guard.
pub const RESPONSE_EMBEDDINGS_KEY: &str = "response_embeddings";

/// A chunk record as persisted in the KV store under `chunk:<job_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub job_id: String,
    pub chunk_text: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    pub timestamp: f64,
    pub token_count: usize,
    pub message_count: usize,
}

/// KV store port: chunk persistence plus sorted-set primitives for the
/// response-embedding history.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Persist the raw chunk and its extractive summary, with TTL, and index
    /// the job id by timestamp.
    async fn store_chunk(&self, job: &OffloadJob, summary: &str) -> Result<(), MemoryError>;

    /// Fetch chunk records by job id; missing ids are skipped.
    async fn chunks_by_ids(&self, job_ids: &[String]) -> Result<Vec<ChunkRecord>, MemoryError>;

    /// Most recent chunks by eviction timestamp.
    async fn recent_chunks(&self, limit: usize) -> Result<Vec<ChunkRecord>, MemoryError>;

    /// Number of indexed chunks.
    async fn chunk_count(&self) -> Result<usize, MemoryError>;

    /// Add a member to a sorted set with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), MemoryError>;

    /// All members of a sorted set, lowest score first.
    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, MemoryError>;

    /// Trim a sorted set to its `keep` highest-scored members.
    async fn ztrim_oldest(&self, key: &str, keep: usize) -> Result<(), MemoryError>;

    /// Release the underlying connection. Idempotent; called once at
    /// session shutdown.
    async fn shutdown(&self) {}
}

/// Payload attached to every vector point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub domain: String,
    /// Uid of the Entity/Event/MacroEvent node this vector represents.
    pub node_id: String,
    pub subtype: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

/// One kNN search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub point_id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

/// Vector index port: idempotent upserts and filtered cosine kNN.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Ensure the backing collection exists with the configured dimension.
    async fn ensure_collection(&self) -> Result<(), MemoryError>;

    async fn upsert(
        &self,
        point_id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<(), MemoryError>;

    /// Cosine kNN. A `domain_filter` admits points in that domain OR the
    /// `"general"` domain; `score_floor` excludes weaker hits.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        domain_filter: Option<&str>,
        score_floor: Option<f32>,
    ) -> Result<Vec<VectorHit>, MemoryError>;

    /// Release the underlying client. Idempotent; called once at session
    /// shutdown.
    async fn shutdown(&self) {}
}

/// Node labels of the metaphysical schema. Typed labels double as the
/// allow-list guarding parameterized graph writes against label injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLabel {
    Context,
    Entity,
    Event,
    Concept,
    Chunk,
    MacroEvent,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Context => "Context",
            NodeLabel::Entity => "Entity",
            NodeLabel::Event => "Event",
            NodeLabel::Concept => "Concept",
            NodeLabel::Chunk => "Chunk",
            NodeLabel::MacroEvent => "MacroEvent",
        }
    }
}

/// Edge labels of the metaphysical schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Entity|Event → Context
    BelongsTo,
    /// Chunk → Entity|Event
    Mentions,
    /// Entity → Event (agent of)
    Initiated,
    /// Event → Event|Entity (consequence)
    Caused,
    /// Event → Event (same flow, consecutive steps)
    Next,
    /// Event → MacroEvent
    ConsolidatedInto,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::BelongsTo => "BELONGS_TO",
            EdgeKind::Mentions => "MENTIONS",
            EdgeKind::Initiated => "INITIATED",
            EdgeKind::Caused => "CAUSED",
            EdgeKind::Next => "NEXT",
            EdgeKind::ConsolidatedInto => "CONSOLIDATED_INTO",
        }
    }
}

/// One expanded node with its one-hop relationship lines, ready for
/// retrieval synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExpansion {
    pub uid: String,
    pub node_type: String,
    pub name: String,
    pub description: String,
    /// Formatted one-hop lines: outgoing CAUSED, incoming INITIATED,
    /// outgoing NEXT.
    pub relationships: Vec<String>,
}

/// Graph store port: MERGE-idempotent writes over the metaphysical schema
/// plus the targeted reads retrieval and state tracking need.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create uniqueness constraints and indexes.
    async fn ensure_schema(&self) -> Result<(), MemoryError>;

    async fn merge_context(&self, node: &ContextNode) -> Result<(), MemoryError>;
    async fn merge_entity(&self, node: &EntityNode) -> Result<(), MemoryError>;
    async fn merge_event(&self, node: &EventNode) -> Result<(), MemoryError>;
    async fn merge_concept(&self, node: &ConceptNode) -> Result<(), MemoryError>;
    async fn merge_chunk(&self, node: &ChunkNode) -> Result<(), MemoryError>;
    async fn merge_macro_event(&self, node: &MacroEventNode) -> Result<(), MemoryError>;

    /// MERGE a typed edge between two existing nodes. Returns `NotFound`
    /// when either endpoint is missing.
    async fn merge_edge(
        &self,
        start_uid: &str,
        start: NodeLabel,
        end_uid: &str,
        end: NodeLabel,
        edge: EdgeKind,
    ) -> Result<(), MemoryError>;

    /// One-hop expansion for retrieval: outgoing CAUSED, incoming INITIATED,
    /// outgoing NEXT per start node.
    async fn expand_context(&self, uids: &[String]) -> Result<Vec<NodeExpansion>, MemoryError>;

    /// Events older than the cutoff timestamp that have no
    /// CONSOLIDATED_INTO edge yet, oldest first.
    async fn old_unconsolidated_events(
        &self,
        cutoff: f64,
        limit: usize,
    ) -> Result<Vec<EventNode>, MemoryError>;

    /// Link each event to the macro event with CONSOLIDATED_INTO.
    async fn consolidate_events(
        &self,
        event_uids: &[String],
        macro_uid: &str,
    ) -> Result<(), MemoryError>;

    // --- State tracking (loop prevention) ---

    async fn create_state(&self, state: &State) -> Result<(), MemoryError>;

    /// Fuzzy lookup by kind and description prefix overlap.
    async fn find_similar_state(
        &self,
        kind: StateKind,
        desc: &str,
    ) -> Result<Option<State>, MemoryError>;

    /// Transition a state's status. Any move away from `Active` resets
    /// `visit_count` to 0 and `last_visited` to 0. Returns whether the state
    /// existed.
    async fn update_state_status(
        &self,
        state_id: &str,
        status: StateStatus,
    ) -> Result<bool, MemoryError>;

    /// Active states of a kind, newest first.
    async fn active_states(
        &self,
        kind: StateKind,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError>;

    /// Completed states of a kind, most recently updated first.
    async fn completed_states(
        &self,
        kind: StateKind,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError>;

    /// Batch-increment visit counts and stamp `last_visited` on exactly the
    /// given states. Returns how many were updated.
    async fn increment_state_visits(&self, state_ids: &[String]) -> Result<usize, MemoryError>;

    /// Close the driver connection. Idempotent; called once at session
    /// shutdown.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_render_graph_names() {
        assert_eq!(NodeLabel::MacroEvent.as_str(), "MacroEvent");
        assert_eq!(EdgeKind::BelongsTo.as_str(), "BELONGS_TO");
        assert_eq!(EdgeKind::ConsolidatedInto.as_str(), "CONSOLIDATED_INTO");
    }

    #[test]
    fn payload_serializes_type_field() {
        let payload = VectorPayload {
            domain: "work".into(),
            node_id: "uid".into(),
            subtype: "person".into(),
            name: "Alice".into(),
            node_type: "Entity".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "Entity");
        assert!(json.get("node_type").is_none());
    }
}
