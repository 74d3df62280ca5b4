//! Pattern-based state extraction from conversation text.
//!
//! Materializes goal/task/decision/fact states out of turns using trigger
//! phrases, so the boredom tracker has something to count. Completion and
//! invalidation triggers take priority over creation triggers within a
//! sentence.

use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::stores::GraphStore;
use crate::types::{MemoryError, State, StateKind, StateStatus};

/// A detected state transition: create a state, or move an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub kind: StateKind,
    pub desc: String,
    pub status: StateStatus,
}

struct PatternGroup {
    kind: StateKind,
    create: &'static [&'static str],
    complete: &'static [&'static str],
    invalidate: &'static [&'static str],
}

const PATTERNS: [PatternGroup; 4] = [
    PatternGroup {
        kind: StateKind::Goal,
        create: &["my goal is", "the goal is", "i want to", "we need to", "the objective is"],
        complete: &["achieved", "accomplished", "reached the goal"],
        invalidate: &["abandon", "give up on", "no longer want"],
    },
    PatternGroup {
        kind: StateKind::Task,
        create: &["i will", "let's", "we should", "next step is", "i need to"],
        complete: &["finished", "completed", "is done"],
        invalidate: &["cancel", "skip", "no longer need"],
    },
    PatternGroup {
        kind: StateKind::Decision,
        create: &["we decided", "i've decided", "we agreed", "the decision is"],
        complete: &[],
        invalidate: &["changed my mind about", "reconsider"],
    },
    PatternGroup {
        kind: StateKind::Fact,
        create: &["note that", "remember that", "for the record", "keep in mind that"],
        complete: &[],
        invalidate: &["correction:", "that's wrong about", "actually no"],
    },
];

/// Extracts state changes from text using trigger-phrase tables.
pub struct StateExtractor {
    sentence_split: Regex,
    article_strip: Regex,
    clause_split: Regex,
}

impl Default for StateExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl StateExtractor {
    pub fn new() -> Self {
        Self {
            sentence_split: Regex::new(r"[.!?]\s+").expect("static sentence regex"),
            article_strip: Regex::new(r"(?i)^(to|that|the|a|an)\s+").expect("static article regex"),
            clause_split: Regex::new(r"[,;.!?]").expect("static clause regex"),
        }
    }

    /// Extract `(kind, description, status)` changes from a turn's text.
    pub fn extract(&self, text: &str) -> Vec<StateChange> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut changes = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for sentence in self.sentence_split.split(text) {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let lower = sentence.to_lowercase();

            for group in &PATTERNS {
                // Transition triggers win over creation triggers
                let matched = group
                    .complete
                    .iter()
                    .find(|p| lower.contains(**p))
                    .map(|p| (*p, StateStatus::Completed))
                    .or_else(|| {
                        group
                            .invalidate
                            .iter()
                            .find(|p| lower.contains(**p))
                            .map(|p| (*p, StateStatus::Invalid))
                    })
                    .or_else(|| {
                        group
                            .create
                            .iter()
                            .find(|p| lower.contains(**p))
                            .map(|p| (*p, StateStatus::Active))
                    });

                if let Some((pattern, status)) = matched {
                    if let Some(desc) = self.describe(sentence, pattern) {
                        if seen.insert(desc.clone()) {
                            changes.push(StateChange {
                                kind: group.kind,
                                desc,
                                status,
                            });
                        }
                    }
                }
            }
        }

        if !changes.is_empty() {
            debug!(count = changes.len(), "extracted state changes");
        }
        changes
    }

    /// Pull the meaningful description out of a sentence, after the trigger.
    fn describe(&self, sentence: &str, pattern: &str) -> Option<String> {
        let lower = sentence.to_lowercase();
        let idx = lower.find(pattern)?;
        let after = sentence[idx + pattern.len()..].trim();
        let after = self.article_strip.replace(after, "");
        let clause = self.clause_split.split(&after).next()?.trim().to_string();

        let description = clause.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if description.len() < 3 || description.len() > 100 {
            return None;
        }
        const SKIP: [&str; 11] = [
            "the", "a", "an", "and", "or", "but", "if", "then", "we", "i", "you",
        ];
        if SKIP.contains(&description.as_str()) {
            return None;
        }
        Some(description)
    }
}

/// Apply extracted state changes to the graph: create new states, transition
/// existing ones (which resets their visit counts).
pub async fn apply_state_changes(
    graph: &Arc<dyn GraphStore>,
    changes: &[StateChange],
) -> Result<usize, MemoryError> {
    let mut applied = 0;
    for change in changes {
        match graph.find_similar_state(change.kind, &change.desc).await? {
            Some(existing) => {
                if existing.status != change.status {
                    graph
                        .update_state_status(&existing.id, change.status)
                        .await?;
                    applied += 1;
                }
            }
            None => {
                // Only materialize new states for creations; a transition
                // trigger with no matching state is noise.
                if change.status == StateStatus::Active {
                    let state = State::create(change.kind, change.desc.clone(), change.status);
                    graph.create_state(&state).await?;
                    applied += 1;
                }
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryGraphStore;

    #[test]
    fn creation_trigger_yields_active_state() {
        let extractor = StateExtractor::new();
        let changes = extractor.extract("My goal is to climb the northern ridge before winter.");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, StateKind::Goal);
        assert_eq!(changes[0].status, StateStatus::Active);
        assert_eq!(changes[0].desc, "climb the northern ridge before winter");
    }

    #[test]
    fn completion_trigger_beats_creation() {
        let extractor = StateExtractor::new();
        let changes =
            extractor.extract("I finished the report section. I will start the review tomorrow.");
        let task_changes: Vec<_> = changes
            .iter()
            .filter(|c| c.kind == StateKind::Task)
            .collect();
        assert!(task_changes.iter().any(|c| c.status == StateStatus::Completed));
        assert!(task_changes.iter().any(|c| c.status == StateStatus::Active));
    }

    #[test]
    fn short_or_empty_descriptions_dropped() {
        let extractor = StateExtractor::new();
        assert!(extractor.extract("I will.").is_empty());
        assert!(extractor.extract("").is_empty());
    }

    #[test]
    fn duplicate_descriptions_deduplicated() {
        let extractor = StateExtractor::new();
        let changes =
            extractor.extract("I need to fix the parser. I need to fix the parser.");
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn apply_creates_then_transitions() {
        let graph = MemoryGraphStore::new();
        let graph: Arc<dyn GraphStore> = Arc::new(graph);

        let created = apply_state_changes(
            &graph,
            &[StateChange {
                kind: StateKind::Task,
                desc: "fix the parser".to_string(),
                status: StateStatus::Active,
            }],
        )
        .await
        .unwrap();
        assert_eq!(created, 1);

        let active = graph.active_states(StateKind::Task, 10).await.unwrap();
        assert_eq!(active.len(), 1);

        let transitioned = apply_state_changes(
            &graph,
            &[StateChange {
                kind: StateKind::Task,
                desc: "fix the parser".to_string(),
                status: StateStatus::Completed,
            }],
        )
        .await
        .unwrap();
        assert_eq!(transitioned, 1);
        assert!(graph.active_states(StateKind::Task, 10).await.unwrap().is_empty());
        assert_eq!(
            graph.completed_states(StateKind::Task, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn orphan_transition_is_ignored() {
        let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let applied = apply_state_changes(
            &graph,
            &[StateChange {
                kind: StateKind::Goal,
                desc: "a goal nobody created".to_string(),
                status: StateStatus::Completed,
            }],
        )
        .await
        .unwrap();
        assert_eq!(applied, 0);
    }
}
