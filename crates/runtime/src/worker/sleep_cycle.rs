//! The sleep cycle: periodic consolidation of aged events.
//!
//! Events older than the age threshold that no MacroEvent has absorbed yet
//! are grouped, summarized, and linked CONSOLIDATED_INTO a new MacroEvent,
//! which is embedded and indexed like any other node. Source events are
//! retained; consolidation is additive.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ColdPathConfig;
use crate::embedding::EmbeddingService;
use crate::extractor::Extractor;
use crate::stores::{GraphStore, VectorIndex, VectorPayload};
use crate::types::{unix_time, MacroEventNode, MemoryError};

pub struct SleepCycle {
    extractor: Arc<Extractor>,
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
    config: ColdPathConfig,
}

impl SleepCycle {
    pub fn new(
        extractor: Arc<Extractor>,
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
        config: ColdPathConfig,
    ) -> Self {
        Self {
            extractor,
            embedder,
            vectors,
            graph,
            config,
        }
    }

    /// One consolidation pass. Returns the number of MacroEvents created.
    pub async fn run_once(&self) -> Result<usize, MemoryError> {
        let cutoff = unix_time() - self.config.consolidation_age_secs as f64;
        let events = self
            .graph
            .old_unconsolidated_events(cutoff, self.config.consolidation_scan_limit)
            .await?;

        if events.len() < 2 {
            return Ok(0);
        }
        info!(count = events.len(), "sleep cycle found events to consolidate");

        let mut created = 0usize;
        for group in events.chunks(self.config.consolidation_group_size) {
            if group.len() < 2 {
                continue;
            }

            let descriptions: Vec<String> = group
                .iter()
                .map(|e| {
                    if e.description.is_empty() {
                        e.name.clone()
                    } else {
                        e.description.clone()
                    }
                })
                .collect();

            let summary = match self.extractor.summarize(&descriptions).await {
                Ok(summary) if !summary.trim().is_empty() => summary,
                Ok(_) | Err(_) => {
                    warn!("macro summary generation failed, using fallback");
                    format!("Consolidated sequence of {} events.", group.len())
                }
            };

            let macro_event = MacroEventNode {
                uid: Uuid::new_v4().to_string(),
                name: format!("Macro-Event {}", unix_time() as u64),
                description: summary.clone(),
                event_count: group.len(),
            };
            self.graph.merge_macro_event(&macro_event).await?;

            let uids: Vec<String> = group.iter().map(|e| e.uid.clone()).collect();
            self.graph
                .consolidate_events(&uids, &macro_event.uid)
                .await?;

            // Index the macro event for retrieval; a failure here leaves the
            // graph consolidation intact.
            match self.embedder.embed(&summary).await {
                Ok(embedding) => {
                    let payload = VectorPayload {
                        domain: "consolidated".to_string(),
                        node_id: macro_event.uid.clone(),
                        subtype: "consolidation".to_string(),
                        name: macro_event.name.clone(),
                        node_type: "MacroEvent".to_string(),
                    };
                    if let Err(e) = self
                        .vectors
                        .upsert(&macro_event.uid, &embedding, &payload)
                        .await
                    {
                        warn!(error = %e, "macro event vector upsert failed");
                    }
                }
                Err(e) => warn!(error = %e, "macro event embedding failed"),
            }

            info!(
                macro_uid = %macro_event.uid,
                events = group.len(),
                "consolidated events into macro event"
            );
            created += 1;
        }
        Ok(created)
    }
}
