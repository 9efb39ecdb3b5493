//! Grid coordinates and the four cardinal directions.

use std::fmt;
use std::str::FromStr;

use crate::error::TopologyError;

/// One of the four directional neighbor slots of a bee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    /// All four slots, in wire order.
    pub const ALL: [Self; 4] = [Self::North, Self::South, Self::East, Self::West];

    /// The slot a neighbor uses to point back at us.
    pub const fn opposite(self) -> Self {
        match self {
            Self::North => Self::South,
            Self::South => Self::North,
            Self::East => Self::West,
            Self::West => Self::East,
        }
    }

    /// Row/column offset of the neighbor in this direction.
    pub const fn delta(self) -> (i64, i64) {
        match self {
            Self::North => (-1, 0),
            Self::South => (1, 0),
            Self::East => (0, 1),
            Self::West => (0, -1),
        }
    }

    /// Wire name (`"NORTH"`, `"SOUTH"`, ...).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::North => "NORTH",
            Self::South => "SOUTH",
            Self::East => "EAST",
            Self::West => "WEST",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORTH" => Ok(Self::North),
            "SOUTH" => Ok(Self::South),
            "EAST" => Ok(Self::East),
            "WEST" => Ok(Self::West),
            _ => Err(TopologyError::UnknownDirection(s.to_string())),
        }
    }
}

/// A cell in the controller-assigned grid.
///
/// `i` is the row (grows southward), `j` the column (grows eastward).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GridCoord {
    pub i: u32,
    pub j: u32,
}

impl GridCoord {
    /// Top-left corner of the grid.
    pub const ORIGIN: Self = Self { i: 0, j: 0 };

    /// Create a new coordinate.
    pub const fn new(i: u32, j: u32) -> Self {
        Self { i, j }
    }

    /// Direction from `self` to an orthogonally adjacent `other`.
    ///
    /// Returns `None` when the two cells are not direct neighbors.
    pub fn direction_to(&self, other: &Self) -> Option<Direction> {
        let di = i64::from(other.i) - i64::from(self.i);
        let dj = i64::from(other.j) - i64::from(self.j);
        Direction::ALL.into_iter().find(|d| d.delta() == (di, dj))
    }
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.i, self.j)
    }
}
