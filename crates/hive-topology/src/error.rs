//! Error types for hive-topology.

use thiserror::Error;

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors raised at the topology call boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Greco-Latin generation is only defined for odd primes.
    #[error("grid size {0} is not an odd prime")]
    NonPrimeGridSize(usize),

    /// A cell lookup fell outside the grid.
    #[error("cell ({i}, {j}) is outside a {size}x{size} grid")]
    OutOfBounds { i: usize, j: usize, size: usize },

    /// Direction text did not name one of the four cardinal slots.
    #[error("unknown direction: {0}")]
    UnknownDirection(String),
}
