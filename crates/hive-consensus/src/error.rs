//! Error types for hive-consensus.

use thiserror::Error;

/// Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors surfaced by the consensus manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Another node claims leadership of the term we lead.
    ///
    /// Two leaders in one term breaks election safety. This is never
    /// arbitrated locally.
    #[error("split brain: {leader_id} claims term {term} already led by {self_id}")]
    SplitBrain {
        term: u64,
        leader_id: String,
        self_id: String,
    },
}
