//! Error types for hive-immune.

use thiserror::Error;

/// Result type for immune operations.
pub type Result<T> = std::result::Result<T, ImmuneError>;

/// Errors raised by the immune layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImmuneError {
    /// Attestation text was not 64 hex characters.
    #[error("malformed attestation: {0}")]
    MalformedAttestation(String),

    /// Bloom filter sizing parameters were unusable.
    #[error("invalid bloom parameters: {0}")]
    InvalidBloomParameters(String),
}
