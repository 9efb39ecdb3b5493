//! Error types for the bee node.

use thiserror::Error;

use crate::pacemaker::PacemakerError;
use crate::parity::ParityError;

/// Result type for bee operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in bee operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Bad configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// The controller connection closed or failed
    #[error("Controller connection lost")]
    ControllerLost,

    /// Parity reconstruction failed
    #[error("Parity error: {0}")]
    Parity(#[from] ParityError),

    /// Barrier synchronization failed
    #[error("Pacemaker error: {0}")]
    Pacemaker(#[from] PacemakerError),

    /// Grid geometry or sharding error
    #[error("Topology error: {0}")]
    Topology(#[from] hive_topology::TopologyError),

    /// Consensus safety violation
    #[error("Consensus error: {0}")]
    Consensus(#[from] hive_consensus::ConsensusError),

    /// Blacklist or attestation error
    #[error("Immune error: {0}")]
    Immune(#[from] hive_immune::ImmuneError),
}
