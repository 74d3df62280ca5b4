//! # vicw-runtime
//!
//! The memory engine behind a virtual infinite context window: a bounded
//! working buffer whose overflow is evicted onto a background pipeline that
//! summarizes, embeds, and materializes conversation history into a
//! knowledge graph, plus hybrid retrieval that re-injects relevant memories
//! on each turn.
//!
//! ## Architecture
//!
//! Four stages, hot to cold:
//!
//! 1. **[`context::ContextManager`]** — the hot path. Appends turns, tracks
//!    estimated tokens, and on pressure evicts the oldest non-pinned slice
//!    behind a placeholder card. Threshold, shed-to-target, and hysteresis
//!    keep relief from thrashing.
//! 2. **[`queue::OffloadQueue`]** — a bounded FIFO between hot and cold.
//!    Overflow drops the oldest job; the hot path never blocks.
//! 3. **[`worker::ColdPathWorker`]** — drains the queue in batches through
//!    the five-stage ingestion pipeline (raw chunk first, then extraction
//!    and graph/vector materialization), and periodically consolidates aged
//!    events into MacroEvents.
//! 4. **[`retriever::Retriever`]** — intent-filtered vector scan with a
//!    score floor, one-hop graph expansion, and synthesis into a context
//!    message.
//!
//! Two guards keep the agent out of repetition loops: the
//! [`guard::EchoGuard`] regenerates near-duplicate responses under
//! escalating directives, and boredom tracking in the context manager warns
//! when the same state keeps being injected without progress.
//!
//! External systems (LLM endpoint, embedding model, KV/vector/graph stores)
//! sit behind ports in [`inference`], [`embedding`], and [`stores`]; each
//! port ships a production adapter and an in-memory implementation.

pub mod config;
pub mod context;
pub mod embedding;
pub mod extractor;
pub mod guard;
pub mod inference;
pub mod queue;
pub mod retriever;
pub mod stores;
pub mod types;
pub mod worker;

pub use config::{ConfigError, MemoryConfig};
pub use context::{ContextManager, ContextStats};
pub use extractor::{Extraction, Extractor, QueryIntent};
pub use guard::{EchoGuard, GuardedResponse};
pub use inference::{InferenceOptions, InferenceProvider, OpenAiCompatProvider};
pub use queue::{OffloadQueue, QueueStats};
pub use retriever::Retriever;
pub use types::{MemoryError, Message, OffloadJob, RagResult, Role};
pub use worker::{ColdPathWorker, IngestionPipeline, SleepCycle};
