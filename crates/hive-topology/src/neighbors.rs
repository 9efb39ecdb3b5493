//! Four-slot neighbor bookkeeping.
//!
//! Every bee has at most 4 neighbors: NORTH, SOUTH, EAST, WEST.
//! Edge and corner cells have fewer because the grid does not wrap.

use crate::grid::Direction;

/// Count how many of a cell's directional slots satisfy `is_present`.
pub fn count_present_neighbors<F>(is_present: F) -> usize
where
    F: Fn(Direction) -> bool,
{
    Direction::ALL.iter().filter(|&&d| is_present(d)).count()
}
