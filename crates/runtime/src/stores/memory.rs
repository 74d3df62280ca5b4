//! In-memory implementations of the storage ports.
//!
//! Back the test suite and driver-less development. Semantics mirror the
//! production adapters: MERGE-idempotent graph writes, cosine kNN with a
//! score floor, sorted sets with rank trimming.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{
    ChunkRecord, EdgeKind, GraphStore, KvStore, NodeExpansion, NodeLabel, VectorHit, VectorIndex,
    VectorPayload,
};
use crate::embedding::cosine_similarity;
use crate::types::{
    unix_time, ChunkNode, ConceptNode, ContextNode, EntityNode, EventNode, MacroEventNode,
    MemoryError, OffloadJob, State, StateKind, StateStatus,
};

/// In-memory KV store.
#[derive(Default)]
pub struct MemoryKvStore {
    chunks: Mutex<HashMap<String, ChunkRecord>>,
    chunk_index: Mutex<Vec<(f64, String)>>,
    zsets: Mutex<HashMap<String, Vec<(f64, String)>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn store_chunk(&self, job: &OffloadJob, summary: &str) -> Result<(), MemoryError> {
        let record = ChunkRecord {
            job_id: job.job_id.clone(),
            chunk_text: job.chunk_text.clone(),
            summary: summary.to_string(),
            metadata: serde_json::to_value(&job.metadata)?,
            timestamp: job.timestamp,
            token_count: job.token_count,
            message_count: job.message_count,
        };
        self.chunks.lock().insert(job.job_id.clone(), record);

        let mut index = self.chunk_index.lock();
        index.retain(|(_, id)| id != &job.job_id);
        index.push((job.timestamp, job.job_id.clone()));
        index.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(())
    }

    async fn chunks_by_ids(&self, job_ids: &[String]) -> Result<Vec<ChunkRecord>, MemoryError> {
        let chunks = self.chunks.lock();
        Ok(job_ids
            .iter()
            .filter_map(|id| chunks.get(id).cloned())
            .collect())
    }

    async fn recent_chunks(&self, limit: usize) -> Result<Vec<ChunkRecord>, MemoryError> {
        let ids: Vec<String> = {
            let index = self.chunk_index.lock();
            index
                .iter()
                .rev()
                .take(limit)
                .map(|(_, id)| id.clone())
                .collect()
        };
        self.chunks_by_ids(&ids).await
    }

    async fn chunk_count(&self) -> Result<usize, MemoryError> {
        Ok(self.chunk_index.lock().len())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), MemoryError> {
        let mut zsets = self.zsets.lock();
        let set = zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        set.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(())
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, MemoryError> {
        Ok(self
            .zsets
            .lock()
            .get(key)
            .map(|set| set.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn ztrim_oldest(&self, key: &str, keep: usize) -> Result<(), MemoryError> {
        let mut zsets = self.zsets.lock();
        if let Some(set) = zsets.get_mut(key) {
            let excess = set.len().saturating_sub(keep);
            set.drain(..excess);
        }
        Ok(())
    }
}

/// In-memory cosine vector index.
pub struct MemoryVectorIndex {
    points: Mutex<HashMap<String, (Vec<f32>, VectorPayload)>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn ensure_collection(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn upsert(
        &self,
        point_id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<(), MemoryError> {
        self.points
            .lock()
            .insert(point_id.to_string(), (vector.to_vec(), payload.clone()));
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        domain_filter: Option<&str>,
        score_floor: Option<f32>,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        let points = self.points.lock();
        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|(_, (_, payload))| match domain_filter {
                Some(domain) => payload.domain == domain || payload.domain == "general",
                None => true,
            })
            .map(|(id, (stored, payload))| VectorHit {
                point_id: id.clone(),
                score: cosine_similarity(vector, stored),
                payload: payload.clone(),
            })
            .filter(|hit| score_floor.map_or(true, |floor| hit.score >= floor))
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[derive(Default)]
struct GraphInner {
    contexts: HashMap<String, ContextNode>,
    entities: HashMap<String, EntityNode>,
    events: HashMap<String, EventNode>,
    concepts: HashMap<String, ConceptNode>,
    chunks: HashMap<String, ChunkNode>,
    macro_events: HashMap<String, MacroEventNode>,
    /// (start_uid, edge label, end_uid)
    edges: HashSet<(String, &'static str, String)>,
    states: HashMap<String, State>,
}

impl GraphInner {
    fn node_exists(&self, uid: &str) -> bool {
        self.contexts.contains_key(uid)
            || self.entities.contains_key(uid)
            || self.events.contains_key(uid)
            || self.concepts.contains_key(uid)
            || self.chunks.contains_key(uid)
            || self.macro_events.contains_key(uid)
    }

    /// `(type, name, subtype, description)` for any node kind.
    fn describe(&self, uid: &str) -> Option<(String, String, String, String)> {
        if let Some(n) = self.entities.get(uid) {
            return Some((
                "Entity".into(),
                n.name.clone(),
                n.subtype.clone(),
                n.description.clone(),
            ));
        }
        if let Some(n) = self.events.get(uid) {
            return Some((
                "Event".into(),
                n.name.clone(),
                n.subtype.clone(),
                n.description.clone(),
            ));
        }
        if let Some(n) = self.concepts.get(uid) {
            return Some((
                "Concept".into(),
                n.name.clone(),
                n.subtype.clone(),
                n.description.clone(),
            ));
        }
        if let Some(n) = self.macro_events.get(uid) {
            return Some((
                "MacroEvent".into(),
                n.name.clone(),
                String::new(),
                n.description.clone(),
            ));
        }
        if let Some(n) = self.contexts.get(uid) {
            return Some((
                "Context".into(),
                n.name.clone(),
                String::new(),
                n.description.clone(),
            ));
        }
        None
    }
}

/// In-memory graph store over the metaphysical schema.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Mutex<GraphInner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.lock().entities.len()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn macro_event_count(&self) -> usize {
        self.inner.lock().macro_events.len()
    }

    /// Whether a `(start)-[edge]->(end)` edge exists.
    pub fn has_edge(&self, start_uid: &str, edge: EdgeKind, end_uid: &str) -> bool {
        self.inner
            .lock()
            .edges
            .contains(&(start_uid.to_string(), edge.as_str(), end_uid.to_string()))
    }

    /// Number of `edge`-kind edges pointing into `uid`.
    pub fn edges_into(&self, uid: &str, edge: EdgeKind) -> usize {
        self.inner
            .lock()
            .edges
            .iter()
            .filter(|(_, kind, end)| *kind == edge.as_str() && end == uid)
            .count()
    }

    pub fn state(&self, state_id: &str) -> Option<State> {
        self.inner.lock().states.get(state_id).cloned()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ensure_schema(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn merge_context(&self, node: &ContextNode) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .contexts
            .insert(node.uid.clone(), node.clone());
        Ok(())
    }

    async fn merge_entity(&self, node: &EntityNode) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .entities
            .insert(node.uid.clone(), node.clone());
        Ok(())
    }

    async fn merge_event(&self, node: &EventNode) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .events
            .insert(node.uid.clone(), node.clone());
        Ok(())
    }

    async fn merge_concept(&self, node: &ConceptNode) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .concepts
            .insert(node.uid.clone(), node.clone());
        Ok(())
    }

    async fn merge_chunk(&self, node: &ChunkNode) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .chunks
            .insert(node.uid.clone(), node.clone());
        Ok(())
    }

    async fn merge_macro_event(&self, node: &MacroEventNode) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .macro_events
            .insert(node.uid.clone(), node.clone());
        Ok(())
    }

    async fn merge_edge(
        &self,
        start_uid: &str,
        _start: NodeLabel,
        end_uid: &str,
        _end: NodeLabel,
        edge: EdgeKind,
    ) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        if !inner.node_exists(start_uid) || !inner.node_exists(end_uid) {
            return Err(MemoryError::NotFound {
                reason: format!("edge endpoint missing: {start_uid} -> {end_uid}"),
            });
        }
        inner
            .edges
            .insert((start_uid.to_string(), edge.as_str(), end_uid.to_string()));
        Ok(())
    }

    async fn expand_context(&self, uids: &[String]) -> Result<Vec<NodeExpansion>, MemoryError> {
        let inner = self.inner.lock();
        let mut expanded = Vec::new();

        for uid in uids {
            let Some((node_type, name, _, description)) = inner.describe(uid) else {
                continue;
            };

            let mut relationships = Vec::new();
            for (start, edge, end) in &inner.edges {
                if start == uid && *edge == EdgeKind::Caused.as_str() {
                    if let Some((_, n, s, _)) = inner.describe(end) {
                        relationships.push(format!("CAUSED -> {n} ({s})"));
                    }
                }
                if end == uid && *edge == EdgeKind::Initiated.as_str() {
                    if let Some((_, n, s, _)) = inner.describe(start) {
                        relationships.push(format!("INITIATED BY <- {n} ({s})"));
                    }
                }
                if start == uid && *edge == EdgeKind::Next.as_str() {
                    if let Some((_, n, s, _)) = inner.describe(end) {
                        relationships.push(format!("NEXT -> {n} ({s})"));
                    }
                }
            }
            relationships.sort();

            expanded.push(NodeExpansion {
                uid: uid.clone(),
                node_type,
                name,
                description,
                relationships,
            });
        }
        Ok(expanded)
    }

    async fn old_unconsolidated_events(
        &self,
        cutoff: f64,
        limit: usize,
    ) -> Result<Vec<EventNode>, MemoryError> {
        let inner = self.inner.lock();
        let mut events: Vec<EventNode> = inner
            .events
            .values()
            .filter(|e| e.timestamp < cutoff)
            .filter(|e| {
                !inner.edges.iter().any(|(start, edge, _)| {
                    start == &e.uid && *edge == EdgeKind::ConsolidatedInto.as_str()
                })
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn consolidate_events(
        &self,
        event_uids: &[String],
        macro_uid: &str,
    ) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        if !inner.macro_events.contains_key(macro_uid) {
            return Err(MemoryError::NotFound {
                reason: format!("macro event {macro_uid} not found"),
            });
        }
        for uid in event_uids {
            if inner.events.contains_key(uid) {
                inner.edges.insert((
                    uid.clone(),
                    EdgeKind::ConsolidatedInto.as_str(),
                    macro_uid.to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn create_state(&self, state: &State) -> Result<(), MemoryError> {
        self.inner
            .lock()
            .states
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn find_similar_state(
        &self,
        kind: StateKind,
        desc: &str,
    ) -> Result<Option<State>, MemoryError> {
        let needle: String = desc.to_lowercase().chars().take(30).collect();
        let inner = self.inner.lock();
        Ok(inner
            .states
            .values()
            .find(|s| {
                s.kind == kind && {
                    let stored = s.desc.to_lowercase();
                    stored.contains(&needle) || needle.contains(&stored)
                }
            })
            .cloned())
    }

    async fn update_state_status(
        &self,
        state_id: &str,
        status: StateStatus,
    ) -> Result<bool, MemoryError> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.states.get_mut(state_id) else {
            return Ok(false);
        };
        state.status = status;
        state.updated = unix_time();
        if status != StateStatus::Active {
            state.visit_count = 0;
            state.last_visited = 0.0;
        }
        Ok(true)
    }

    async fn active_states(
        &self,
        kind: StateKind,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError> {
        let inner = self.inner.lock();
        let mut states: Vec<State> = inner
            .states
            .values()
            .filter(|s| s.kind == kind && s.status == StateStatus::Active)
            .cloned()
            .collect();
        states.sort_by(|a, b| b.created.total_cmp(&a.created));
        states.truncate(limit);
        Ok(states)
    }

    async fn completed_states(
        &self,
        kind: StateKind,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError> {
        let inner = self.inner.lock();
        let mut states: Vec<State> = inner
            .states
            .values()
            .filter(|s| s.kind == kind && s.status == StateStatus::Completed)
            .cloned()
            .collect();
        states.sort_by(|a, b| b.updated.total_cmp(&a.updated));
        states.truncate(limit);
        Ok(states)
    }

    async fn increment_state_visits(&self, state_ids: &[String]) -> Result<usize, MemoryError> {
        let now = unix_time();
        let mut inner = self.inner.lock();
        let mut updated = 0;
        for id in state_ids {
            if let Some(state) = inner.states.get_mut(id) {
                state.visit_count += 1;
                state.last_visited = now;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobMetadata;

    fn entity(domain: &str, name: &str) -> EntityNode {
        EntityNode {
            uid: crate::types::scoped_uid(domain, name),
            name: name.to_string(),
            subtype: "person".to_string(),
            domain: domain.to_string(),
            description: String::new(),
            vector_id: None,
        }
    }

    #[tokio::test]
    async fn chunk_store_round_trip() {
        let kv = MemoryKvStore::new();
        let job = OffloadJob::create("user: hello".into(), 12, 1, JobMetadata::default());
        kv.store_chunk(&job, "summary").await.unwrap();

        let records = kv.chunks_by_ids(&[job.job_id.clone()]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chunk_text, "user: hello");
        assert_eq!(records[0].summary, "summary");
        assert_eq!(kv.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_chunks_newest_first_with_zero_limit_empty() {
        let kv = MemoryKvStore::new();
        let mut old = OffloadJob::create("user: old".into(), 5, 1, JobMetadata::default());
        old.timestamp = 100.0;
        let mut new = OffloadJob::create("user: new".into(), 5, 1, JobMetadata::default());
        new.timestamp = 200.0;
        kv.store_chunk(&old, "old summary").await.unwrap();
        kv.store_chunk(&new, "new summary").await.unwrap();

        let recent = kv.recent_chunks(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].job_id, new.job_id);

        let both = kv.recent_chunks(10).await.unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].job_id, new.job_id);
        assert_eq!(both[1].job_id, old.job_id);

        assert!(kv.recent_chunks(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zset_trim_keeps_newest() {
        let kv = MemoryKvStore::new();
        for i in 0..5 {
            kv.zadd("history", &format!("m{i}"), i as f64).await.unwrap();
        }
        kv.ztrim_oldest("history", 3).await.unwrap();
        let members = kv.zrange_all("history").await.unwrap();
        assert_eq!(members, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn entity_merge_is_idempotent() {
        let graph = MemoryGraphStore::new();
        let node = entity("work", "Alice");
        graph.merge_entity(&node).await.unwrap();
        graph.merge_entity(&node).await.unwrap();
        assert_eq!(graph.entity_count(), 1);
    }

    #[tokio::test]
    async fn edge_to_missing_node_is_not_found() {
        let graph = MemoryGraphStore::new();
        let alice = entity("work", "Alice");
        graph.merge_entity(&alice).await.unwrap();

        let err = graph
            .merge_edge(
                &alice.uid,
                NodeLabel::Entity,
                "missing-uid",
                NodeLabel::Event,
                EdgeKind::Initiated,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn status_transition_resets_visits() {
        let graph = MemoryGraphStore::new();
        let state = State::create(StateKind::Task, "write the report", StateStatus::Active);
        graph.create_state(&state).await.unwrap();

        graph
            .increment_state_visits(&[state.id.clone()])
            .await
            .unwrap();
        graph
            .increment_state_visits(&[state.id.clone()])
            .await
            .unwrap();
        assert_eq!(graph.state(&state.id).unwrap().visit_count, 2);

        let found = graph
            .update_state_status(&state.id, StateStatus::Completed)
            .await
            .unwrap();
        assert!(found);
        let after = graph.state(&state.id).unwrap();
        assert_eq!(after.visit_count, 0);
        assert_eq!(after.last_visited, 0.0);
        assert_eq!(after.status, StateStatus::Completed);
    }

    #[tokio::test]
    async fn search_applies_domain_filter_and_floor() {
        let index = MemoryVectorIndex::new();
        let payload = |domain: &str, name: &str| VectorPayload {
            domain: domain.to_string(),
            node_id: name.to_string(),
            subtype: "thing".to_string(),
            name: name.to_string(),
            node_type: "Entity".to_string(),
        };

        // Unit vectors with known cosine against [1, 0, 0]
        index
            .upsert("a", &[1.0, 0.0, 0.0], &payload("coding", "exact"))
            .await
            .unwrap();
        index
            .upsert("b", &[0.5, 0.866, 0.0], &payload("general", "half"))
            .await
            .unwrap();
        index
            .upsert("c", &[0.0, 1.0, 0.0], &payload("story", "orthogonal"))
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0, 0.0], 10, Some("coding"), Some(0.4))
            .await
            .unwrap();
        // "story" is filtered out, "orthogonal" would be below floor anyway;
        // "general" is always admitted alongside the requested domain
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.name, "exact");
        assert_eq!(hits[1].payload.name, "half");
    }
}
