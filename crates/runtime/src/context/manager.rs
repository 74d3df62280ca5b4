//! The hot-path context manager.
//!
//! `append` is synchronous and non-suspending: pressure relief extracts the
//! oldest non-system messages, enqueues one offload job under a local mutex,
//! and inserts a placeholder card — downstream processing never blocks a
//! turn. Shed-to-target plus hysteresis keeps relief from re-triggering on
//! every subsequent message.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::token_counter::{TokenEstimator, WordEstimator};
use crate::config::{ContextConfig, StateConfig};
use crate::queue::OffloadQueue;
use crate::retriever::Retriever;
use crate::stores::GraphStore;
use crate::types::{
    placeholder_card, JobMetadata, Message, OffloadJob, PinnedHeader, Role, State, StateKind,
};

/// Snapshot of context-manager state.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStats {
    pub current_tokens: usize,
    pub max_tokens: usize,
    pub message_count: usize,
    pub offload_count: u64,
    pub placeholder_count: usize,
    pub pressure_percentage: f64,
}

pub struct ContextManager {
    config: ContextConfig,
    state_config: StateConfig,
    estimator: Box<dyn TokenEstimator>,
    queue: Arc<OffloadQueue>,
    retriever: Option<Arc<Retriever>>,
    graph: Option<Arc<dyn GraphStore>>,
    pinned: PinnedHeader,
    buffer: Vec<Message>,
    relief_count: u64,
    last_relief_tokens: usize,
    placeholder_jobs: Vec<String>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, state_config: StateConfig, queue: Arc<OffloadQueue>) -> Self {
        info!(
            max_context = config.max_context_tokens,
            "context manager initialized"
        );
        Self {
            config,
            state_config,
            estimator: Box::new(WordEstimator),
            queue,
            retriever: None,
            graph: None,
            pinned: PinnedHeader::default(),
            buffer: Vec::new(),
            relief_count: 0,
            last_relief_tokens: 0,
            placeholder_jobs: Vec::new(),
        }
    }

    /// Attach the retriever used by [`augment`](Self::augment).
    pub fn with_retriever(mut self, retriever: Arc<Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Attach the graph store used for state memory and boredom tracking.
    pub fn with_graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Swap the token estimator (the policy is estimator-agnostic).
    pub fn with_estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Total estimated tokens currently in the working buffer.
    pub fn token_count(&self) -> usize {
        self.estimator.estimate_messages(&self.buffer)
    }

    /// Append a message and relieve pressure if the buffer crossed the
    /// threshold. This is the hot path: no awaits, no I/O.
    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        let mut message = Message::new(role, content);
        message.token_estimate = self.estimator.estimate(&message.tagged());
        self.buffer.push(message);

        let current = self.token_count();
        let max = self.config.max_context_tokens;
        let pressure = (max as f64 * self.config.offload_threshold) as usize;
        let hysteresis = (max as f64 * self.config.hysteresis_threshold) as usize;

        debug!(
            tokens = current,
            max,
            percentage = (current as f64 / max as f64) * 100.0,
            role = %role,
            "context pressure"
        );

        if current > pressure {
            // Hysteresis: after a relief, wait for enough new content to
            // accumulate before relieving again.
            if self.last_relief_tokens == 0 || current > hysteresis {
                info!(
                    tokens = current,
                    threshold = pressure,
                    "pressure threshold exceeded, relieving"
                );
                self.relieve_pressure();
            } else {
                debug!(
                    tokens = current,
                    hysteresis, "within hysteresis band, not relieving"
                );
            }
        }
    }

    /// Evict the oldest non-system messages down to the relief target,
    /// enqueue them as one offload job, and leave a placeholder card at the
    /// head of the evicted region.
    fn relieve_pressure(&mut self) {
        let start = Instant::now();
        let tokens_before = self.token_count();
        let target = (self.config.max_context_tokens as f64 * self.config.target_after_relief)
            as usize;
        let tokens_to_extract = tokens_before.saturating_sub(target);

        let mut extracted: Vec<Message> = Vec::new();
        let mut extracted_tokens = 0usize;
        let mut insert_at: Option<usize> = None;

        while extracted_tokens < tokens_to_extract && self.buffer.len() > 1 {
            // Pinned header lives outside the buffer; system messages in the
            // buffer are prompts and placeholder cards, both non-evictable.
            let Some(idx) = self.buffer.iter().position(|m| m.role != Role::System) else {
                warn!("cannot extract more: only system messages remain");
                break;
            };
            insert_at.get_or_insert(idx);
            let message = self.buffer.remove(idx);
            extracted_tokens += self.estimator.estimate(&message.tagged());
            extracted.push(message);
        }

        if extracted.is_empty() {
            warn!(
                tokens = tokens_before,
                "pressure relief extracted nothing; buffer may exceed threshold"
            );
            return;
        }

        let chunk_text: Vec<String> = extracted.iter().map(Message::tagged).collect();
        self.relief_count += 1;
        let job = OffloadJob::create(
            chunk_text.join("\n"),
            extracted_tokens,
            extracted.len(),
            JobMetadata {
                domain: self.config.domain.clone(),
                thread_id: self.config.thread_id.clone(),
                relief_num: self.relief_count,
            },
        );
        let job_id = job.job_id.clone();

        // Non-blocking handoff to the cold path.
        self.queue.enqueue(job);

        let position = insert_at.unwrap_or(0).min(self.buffer.len());
        self.buffer.insert(
            position,
            placeholder_card(&job_id, extracted_tokens, extracted.len()),
        );
        self.placeholder_jobs.push(job_id.clone());

        let tokens_after = self.token_count();
        self.last_relief_tokens = tokens_after;

        info!(
            tokens_before,
            tokens_after,
            job_id = %job_id,
            messages = extracted.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "pressure relief complete"
        );
    }

    /// The ordered context for generation: pinned header, then the buffer.
    pub fn window(&self) -> Vec<Message> {
        let mut window = Vec::with_capacity(self.buffer.len() + 1);
        if let Some(pinned) = self.pinned.to_context_message() {
            window.push(pinned);
        }
        window.extend(self.buffer.iter().cloned());
        window
    }

    /// Retrieve long-term memories for the query and inject them, plus the
    /// state-memory message when tracking is enabled. Returns how many
    /// retrieved items were injected; failures degrade to zero.
    pub async fn augment(&mut self, query: &str) -> usize {
        let Some(retriever) = self.retriever.clone() else {
            warn!("no retriever attached, skipping augmentation");
            return 0;
        };

        let injected = match retriever.retrieve(query).await {
            Ok(result) if result.is_empty() => {
                debug!("retrieval found no relevant memories");
                0
            }
            Ok(result) => {
                let total = result.total_items();
                if let Some(message) = result.to_context_message() {
                    // Inject immediately before the most recent user turn
                    if self.buffer.last().map(|m| m.role) == Some(Role::User) {
                        let at = self.buffer.len() - 1;
                        self.buffer.insert(at, message);
                    } else {
                        self.buffer.push(message);
                    }
                }
                info!(items = total, "injected retrieved memories");
                total
            }
            Err(e) => {
                error!(error = %e, "retrieval failed, continuing without augmentation");
                0
            }
        };

        if self.state_config.tracking_enabled {
            match self.build_state_message().await {
                Ok(Some(message)) => {
                    self.buffer.push(message);
                    debug!("injected state memory");
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "state memory injection failed"),
            }
        }

        injected
    }

    /// Build the `[STATE MEMORY]` message from tracked states, incrementing
    /// visit counts on the injected active states and prepending a loop
    /// warning when any of them crosses the boredom threshold.
    async fn build_state_message(
        &self,
    ) -> Result<Option<Message>, crate::types::MemoryError> {
        let Some(graph) = &self.graph else {
            return Ok(None);
        };

        let limits = &self.state_config.injection_limits;
        let mut sections: Vec<String> = Vec::new();
        let mut injected_active: Vec<State> = Vec::new();

        for kind in StateKind::ALL {
            let limit = match kind {
                StateKind::Goal => limits.goal,
                StateKind::Task => limits.task,
                StateKind::Decision => limits.decision,
                StateKind::Fact => limits.fact,
            };
            let states = graph.active_states(kind, limit).await?;
            if states.is_empty() {
                continue;
            }
            let label = match kind {
                StateKind::Goal => "Active Goals",
                StateKind::Task => "Active Tasks",
                StateKind::Decision => "Decisions",
                StateKind::Fact => "Known Facts",
            };
            let descriptions: Vec<&str> = states.iter().map(|s| s.desc.as_str()).collect();
            sections.push(format!("{label}: {}", descriptions.join(", ")));
            injected_active.extend(states);
        }

        let mut completed: Vec<State> = graph.completed_states(StateKind::Goal, 2).await?;
        completed.extend(graph.completed_states(StateKind::Task, 2).await?);
        if !completed.is_empty() {
            let descriptions: Vec<&str> = completed.iter().map(|s| s.desc.as_str()).collect();
            sections.push(format!("Completed: {}", descriptions.join(", ")));
        }

        if sections.is_empty() {
            return Ok(None);
        }

        // Visiting = injecting. Stamp exactly the injected active states.
        let ids: Vec<String> = injected_active.iter().map(|s| s.id.clone()).collect();
        graph.increment_state_visits(&ids).await?;

        let mut parts = vec!["[STATE MEMORY]".to_string()];
        if self.state_config.boredom_enabled {
            let threshold = self.state_config.boredom_threshold;
            let fatigued: Vec<&State> = injected_active
                .iter()
                .filter(|s| s.visit_count + 1 > threshold)
                .collect();
            if !fatigued.is_empty() {
                parts.push(self.boredom_warning(&fatigued));
            }
        }
        parts.extend(sections);
        parts.push(String::new());
        parts.push(
            "Note: Avoid repeating completed actions or contradicting known facts.".to_string(),
        );
        parts.push("[END STATE MEMORY]".to_string());

        Ok(Some(Message::system(parts.join("\n"))))
    }

    fn boredom_warning(&self, fatigued: &[&State]) -> String {
        const ALTERNATIVES: [&str; 4] = [
            "shift attention to a different active goal",
            "break the stuck item into smaller concrete steps",
            "review completed work to pick the next action",
            "ask the user to reprioritize",
        ];
        let suggestions: Vec<&str> = ALTERNATIVES
            .iter()
            .take(self.state_config.alternative_count.max(1))
            .copied()
            .collect();
        let names: Vec<&str> = fatigued.iter().map(|s| s.desc.as_str()).collect();
        format!(
            "⚠️ LOOP DETECTED: revisited without progress: {}. Consider alternatives: {}.",
            names.join(", "),
            suggestions.join("; ")
        )
    }

    /// Clear the buffer, counters, and placeholders; the pinned header
    /// survives.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.relief_count = 0;
        self.last_relief_tokens = 0;
        self.placeholder_jobs.clear();
        info!("context manager reset");
    }

    /// Mutate the pinned header in place.
    pub fn update_pinned<F: FnOnce(&mut PinnedHeader)>(&mut self, update: F) {
        update(&mut self.pinned);
    }

    pub fn pinned(&self) -> &PinnedHeader {
        &self.pinned
    }

    pub fn stats(&self) -> ContextStats {
        let current = self.token_count();
        ContextStats {
            current_tokens: current,
            max_tokens: self.config.max_context_tokens,
            message_count: self.buffer.len(),
            offload_count: self.relief_count,
            placeholder_count: self.placeholder_jobs.len(),
            pressure_percentage: (current as f64 / self.config.max_context_tokens as f64) * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, StateConfig};
    use crate::types::placeholder_job_id;

    fn manager(max: usize, offload: f64, target: f64, hysteresis: f64) -> (ContextManager, Arc<OffloadQueue>) {
        let queue = Arc::new(OffloadQueue::new(100));
        let config = ContextConfig {
            max_context_tokens: max,
            offload_threshold: offload,
            target_after_relief: target,
            hysteresis_threshold: hysteresis,
            ..ContextConfig::default()
        };
        (
            ContextManager::new(config, StateConfig::default(), queue.clone()),
            queue,
        )
    }

    /// A message whose tagged form estimates to roughly `tokens` tokens.
    fn filler(tokens: usize) -> String {
        // words / 0.75 = tokens  =>  words = 0.75 * tokens; subtract one for
        // the role tag the estimator counts.
        let words = ((tokens as f64) * 0.75) as usize;
        vec!["word"; words.saturating_sub(1)].join(" ")
    }

    #[test]
    fn pressure_relief_sheds_to_target() {
        // S1: max 1000, trigger at 0.8, shed to 0.5
        let (mut manager, queue) = manager(1000, 0.8, 0.5, 0.7);

        for _ in 0..9 {
            manager.append(Role::User, filler(100));
        }

        let stats = manager.stats();
        assert_eq!(stats.offload_count, 1, "exactly one relief");
        assert!(
            stats.current_tokens <= 500 + 20,
            "sheds to ~target, got {}",
            stats.current_tokens
        );
        assert_eq!(queue.stats().current_size, 1);
        assert_eq!(stats.placeholder_count, 1);

        // The placeholder card sits at the head and names the queued job
        let window = manager.window();
        assert!(window[0].is_placeholder());
        let queued = queue.dequeue().unwrap();
        assert_eq!(placeholder_job_id(&window[0]), Some(queued.job_id.as_str()));
    }

    #[test]
    fn hysteresis_prevents_immediate_retrigger() {
        // S2: after relief to ~500, small appends stay under hysteresis (700)
        let (mut manager, queue) = manager(1000, 0.8, 0.5, 0.7);
        for _ in 0..9 {
            manager.append(Role::User, filler(100));
        }
        assert_eq!(manager.stats().offload_count, 1);

        manager.append(Role::User, filler(50));
        let stats = manager.stats();
        assert_eq!(stats.offload_count, 1, "no second relief inside the band");
        assert_eq!(queue.stats().enqueued_total, 1);
    }

    #[test]
    fn relief_refuses_to_evict_system_messages() {
        let (mut manager, queue) = manager(100, 0.5, 0.3, 0.4);
        manager.append(Role::System, filler(200));
        // Only system content: nothing evictable, no job enqueued
        assert_eq!(queue.stats().enqueued_total, 0);
        assert_eq!(manager.stats().offload_count, 0);

        // A user message arrives; relief can now evict it
        manager.append(Role::User, filler(80));
        assert_eq!(queue.stats().enqueued_total, 1);
        let job = queue.dequeue().unwrap();
        assert!(job.chunk_text.starts_with("user:"));
    }

    #[test]
    fn chunk_text_is_role_tagged_and_ordered() {
        let (mut manager, queue) = manager(100, 0.5, 0.2, 0.4);
        manager.append(Role::User, "first ".repeat(10));
        manager.append(Role::Assistant, "second ".repeat(10));
        manager.append(Role::User, "third ".repeat(30));

        let job = queue.dequeue().expect("relief should have enqueued");
        let lines: Vec<&str> = job.chunk_text.lines().collect();
        assert!(lines[0].starts_with("user: first"));
        assert!(lines[1].starts_with("assistant: second"));
        assert_eq!(job.message_count, lines.len());
        assert_eq!(job.metadata.relief_num, 1);
    }

    #[test]
    fn window_includes_pinned_header_first() {
        let (mut manager, _queue) = manager(1000, 0.8, 0.6, 0.7);
        manager.update_pinned(|p| p.goals.push("finish the bridge".into()));
        manager.append(Role::User, "hello");

        let window = manager.window();
        assert_eq!(window.len(), 2);
        assert!(window[0].content.starts_with("[PINNED STATE]"));
        assert_eq!(window[1].role, Role::User);
    }

    #[test]
    fn reset_clears_buffer_but_keeps_pinned() {
        let (mut manager, _queue) = manager(1000, 0.8, 0.6, 0.7);
        manager.update_pinned(|p| p.goals.push("persist".into()));
        manager.append(Role::User, "hello");
        manager.reset();

        assert_eq!(manager.stats().message_count, 0);
        assert_eq!(manager.stats().offload_count, 0);
        let window = manager.window();
        assert_eq!(window.len(), 1);
        assert!(window[0].content.contains("persist"));
    }
}
