//! Hot-path context management.
//!
//! The working buffer absorbs turns; when estimated tokens cross the
//! pressure threshold, the oldest non-pinned slice is evicted onto the
//! offload queue and replaced by a placeholder card. Retrieval and state
//! memory are injected here before generation.

pub mod manager;
pub mod token_counter;

pub use manager::{ContextManager, ContextStats};
pub use token_counter::{TokenEstimator, WordEstimator};
