//! Hive Mesh Topology
//!
//! Cardinal grid geometry for the Hive compute mesh and the Greco-Latin
//! square generator used to partition a block of work across that grid.
//!
//! # Grid Model
//!
//! Every bee occupies one cell `(i, j)` of a rectangular grid assigned by the
//! controller. `i` grows southward (rows), `j` grows eastward (columns).
//! Each cell has at most four neighbors:
//!
//! ```text
//!              NORTH (i-1, j)
//!                    │
//!   WEST (i, j-1) ── ● ── EAST (i, j+1)
//!                    │
//!              SOUTH (i+1, j)
//! ```
//!
//! # Systolic Flow
//!
//! Cannon's algorithm shifts the `A` operand westward and the `B` operand
//! northward every step, so a bee consumes `A` from its EAST neighbor and
//! `B` from its SOUTH neighbor.
//!
//! # Recursive Sharding
//!
//! A lead bee partitions its block into an N×N grid of `(task, data)` pairs
//! drawn from two mutually orthogonal Latin squares, see [`GlsGrid`].

mod error;
mod grid;
mod gls;
mod neighbors;

pub use error::{Result, TopologyError};
pub use grid::{Direction, GridCoord};
pub use gls::{is_odd_prime, GlsCell, GlsGrid};
pub use neighbors::count_present_neighbors;

/// Number of directional neighbor slots per bee (invariant: always 4)
pub const SLOTS_PER_NODE: usize = 4;

/// Directions a bee receives systolic operands from.
pub const OPERAND_SOURCES: [Direction; 2] = [Direction::East, Direction::South];

/// Directions a bee shifts systolic operands toward.
pub const OPERAND_SINKS: [Direction; 2] = [Direction::West, Direction::North];

const _: () = assert!(Direction::ALL.len() == SLOTS_PER_NODE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_sources_mirror_sinks() {
        for (source, sink) in OPERAND_SOURCES.iter().zip(OPERAND_SINKS.iter()) {
            assert_eq!(source.opposite(), *sink);
        }
    }
}
