//! Core data model for the memory engine
//!
//! Messages and placeholder cards for the working buffer, offload jobs for
//! the queue, the metaphysical graph node kinds, retrieval results, and the
//! loop-prevention state record.

pub mod error;

pub use error::MemoryError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Seconds since the Unix epoch as a float, matching persisted timestamps.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Deterministic uid for a domain's Context node.
pub fn context_uid(domain: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, domain.as_bytes()).to_string()
}

/// Deterministic uid for a named node scoped to a domain, so the same name
/// in the same domain collapses onto one node.
pub fn scoped_uid(domain: &str, name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, format!("{domain}:{name}").as_bytes()).to_string()
}

/// Message role in the working buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message. Created on turn append, evicted only as part of a chunk,
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: f64,
    pub token_estimate: usize,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: unix_time(),
            token_estimate: 0,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Render as `role: content`, the form used for token accounting and
    /// chunk text.
    pub fn tagged(&self) -> String {
        format!("{}: {}", self.role, self.content)
    }

    /// Whether this is a placeholder card standing in for an evicted slice.
    pub fn is_placeholder(&self) -> bool {
        self.role == Role::System && self.content.starts_with("[ARCHIVED mem_id:")
    }
}

/// Build the placeholder card that replaces an evicted slice in the buffer.
pub fn placeholder_card(job_id: &str, token_count: usize, message_count: usize) -> Message {
    Message::system(format!(
        "[ARCHIVED mem_id:{job_id} tokens:{token_count} msgs:{message_count}]"
    ))
}

/// Parse the `mem_id` out of a placeholder card, if the message is one.
pub fn placeholder_job_id(message: &Message) -> Option<&str> {
    let rest = message.content.strip_prefix("[ARCHIVED mem_id:")?;
    rest.split_whitespace().next()
}

/// Metadata attached to an offload job at eviction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub domain: String,
    pub thread_id: String,
    pub relief_num: u64,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            domain: "general".to_string(),
            thread_id: "default_flow".to_string(),
            relief_num: 0,
        }
    }
}

/// A unit of work handed from the hot path to the cold path. Created at
/// eviction, consumed at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadJob {
    pub job_id: String,
    pub chunk_text: String,
    pub metadata: JobMetadata,
    pub timestamp: f64,
    pub token_count: usize,
    pub message_count: usize,
}

impl OffloadJob {
    pub fn create(
        chunk_text: String,
        token_count: usize,
        message_count: usize,
        metadata: JobMetadata,
    ) -> Self {
        Self {
            job_id: format!("job_{}", Uuid::new_v4().simple()),
            chunk_text,
            metadata,
            timestamp: unix_time(),
            token_count,
            message_count,
        }
    }
}

/// Persistent context header that never gets offloaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinnedHeader {
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
    pub definitions: BTreeMap<String, String>,
    pub plan: Plan,
    pub active_entities: Vec<String>,
    pub active_artifacts: Vec<String>,
}

/// Current plan step within the pinned header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub step_id: String,
    pub next: Option<String>,
    pub blockers: Vec<String>,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            step_id: "init".to_string(),
            next: None,
            blockers: Vec::new(),
        }
    }
}

impl PinnedHeader {
    /// Render the header as a system message, or `None` when empty.
    pub fn to_context_message(&self) -> Option<Message> {
        let mut parts = Vec::new();

        if !self.goals.is_empty() {
            parts.push(format!("GOALS: {}", self.goals.join(", ")));
        }
        if !self.constraints.is_empty() {
            parts.push(format!("CONSTRAINTS: {}", self.constraints.join(", ")));
        }
        if !self.definitions.is_empty() {
            let defs: Vec<String> = self
                .definitions
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect();
            parts.push(format!("DEFINITIONS: {}", defs.join(", ")));
        }
        if self.plan.step_id != "init" {
            parts.push(format!(
                "CURRENT PLAN: step={} next={} blockers=[{}]",
                self.plan.step_id,
                self.plan.next.as_deref().unwrap_or("none"),
                self.plan.blockers.join(", ")
            ));
        }
        if !self.active_entities.is_empty() {
            parts.push(format!("ACTIVE ENTITIES: {}", self.active_entities.join(", ")));
        }
        if !self.active_artifacts.is_empty() {
            parts.push(format!(
                "ACTIVE ARTIFACTS: {}",
                self.active_artifacts.join(", ")
            ));
        }

        if parts.is_empty() {
            return None;
        }

        Some(Message::system(format!(
            "[PINNED STATE]\n{}\n[END PINNED STATE]",
            parts.join("\n")
        )))
    }
}

/// Result of hybrid retrieval: semantic hits plus relational facts from
/// graph expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagResult {
    pub semantic_chunks: Vec<String>,
    pub relational_facts: Vec<String>,
    pub retrieval_time_ms: f64,
}

impl RagResult {
    pub fn total_items(&self) -> usize {
        self.semantic_chunks.len() + self.relational_facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    /// Render as the single retrieved-knowledge system message.
    pub fn to_context_message(&self) -> Option<Message> {
        if self.is_empty() {
            return None;
        }

        let mut parts = vec!["[RETRIEVED LONG-TERM KNOWLEDGE]".to_string()];

        if !self.semantic_chunks.is_empty() {
            parts.push("\n[SEMANTIC MEMORY]".to_string());
            for (i, chunk) in self.semantic_chunks.iter().enumerate() {
                parts.push(format!("{}. {chunk}", i + 1));
            }
        }
        if !self.relational_facts.is_empty() {
            parts.push("\n[RELATIONAL STATE]".to_string());
            parts.extend(self.relational_facts.iter().cloned());
        }
        parts.push("\n[END RETRIEVED KNOWLEDGE]".to_string());

        Some(Message::system(parts.join("\n")))
    }
}

/// Kind of a tracked state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Goal,
    Task,
    Decision,
    Fact,
}

impl StateKind {
    pub const ALL: [StateKind; 4] = [
        StateKind::Goal,
        StateKind::Task,
        StateKind::Decision,
        StateKind::Fact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Goal => "goal",
            StateKind::Task => "task",
            StateKind::Decision => "decision",
            StateKind::Fact => "fact",
        }
    }

    pub fn parse(s: &str) -> Option<StateKind> {
        match s {
            "goal" => Some(StateKind::Goal),
            "task" => Some(StateKind::Task),
            "decision" => Some(StateKind::Decision),
            "fact" => Some(StateKind::Fact),
            _ => None,
        }
    }
}

/// Lifecycle status of a tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStatus {
    Active,
    Completed,
    Invalid,
}

impl StateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateStatus::Active => "active",
            StateStatus::Completed => "completed",
            StateStatus::Invalid => "invalid",
        }
    }
}

/// Minimal state record for loop prevention with boredom detection.
/// `visit_count` tracks how many times the state was injected into context;
/// any status transition away from `Active` resets it to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub kind: StateKind,
    pub desc: String,
    pub status: StateStatus,
    pub created: f64,
    pub updated: f64,
    pub visit_count: u64,
    pub last_visited: f64,
}

impl State {
    pub fn create(kind: StateKind, desc: impl Into<String>, status: StateStatus) -> Self {
        let now = unix_time();
        Self {
            id: format!("state_{}", Uuid::new_v4().simple()),
            kind,
            desc: desc.into(),
            status,
            created: now,
            updated: now,
            visit_count: 0,
            last_visited: 0.0,
        }
    }
}

// --- Metaphysical graph node kinds ---

/// Root node for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextNode {
    pub uid: String,
    pub name: String,
    pub domain: String,
    pub description: String,
}

impl ContextNode {
    /// Context nodes have a deterministic uid per domain.
    pub fn for_domain(domain: &str) -> Self {
        let mut name = domain.to_string();
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        Self {
            uid: context_uid(domain),
            name,
            domain: domain.to_string(),
            description: format!("Context for {domain} domain"),
        }
    }
}

/// Nouns: objects, people, variables, files, places.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub uid: String,
    pub name: String,
    pub subtype: String,
    pub domain: String,
    pub description: String,
    pub vector_id: Option<String>,
}

/// Actions: things that happen at a point in time, ordered within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNode {
    pub uid: String,
    pub name: String,
    pub subtype: String,
    pub domain: String,
    pub description: String,
    pub timestamp: f64,
    pub flow_id: String,
    pub flow_step: i64,
    pub vector_id: Option<String>,
}

/// Abstract ideas: genres, design patterns, emotions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub uid: String,
    pub name: String,
    pub subtype: String,
    pub domain: String,
    pub description: String,
    pub vector_id: Option<String>,
}

/// Proof of provenance: a snippet of the raw evicted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkNode {
    pub uid: String,
    pub content: String,
    pub source: String,
    pub domain: String,
    pub token_count: usize,
}

/// Consolidation of two or more aged Events by the sleep cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroEventNode {
    pub uid: String,
    pub name: String,
    pub description: String,
    pub event_count: usize,
}
