//! Loop-prevention guards.
//!
//! Two subsystems keep the agent from degenerating into repetition: the echo
//! guard compares each generated response against recent response embeddings
//! and drives regeneration with escalating directives, and the state
//! extractor feeds the boredom tracker by materializing goal/task/decision/
//! fact states from conversation text.

pub mod echo;
pub mod state_extractor;

pub use echo::{EchoGuard, GuardedResponse};
pub use state_extractor::{apply_state_changes, StateChange, StateExtractor};
