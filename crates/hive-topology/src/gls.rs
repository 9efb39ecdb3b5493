//! Greco-Latin square generation for recursive sharding.
//!
//! Two Latin squares over the prime field Z/nZ:
//!
//! ```text
//! task(i, j) = (i + j)  mod n
//! data(i, j) = (i + 2j) mod n
//! ```
//!
//! Both are Latin for any odd prime `n`, and they are mutually orthogonal:
//! the map `(i, j) -> (task, data)` is a bijection because the determinant
//! of `[[1, 1], [1, 2]]` is 1, which is invertible mod n. So every
//! `(task, data)` pair appears exactly once in the grid.
//!
//! For `n = 2` the data square collapses to `i mod 2` and is not Latin,
//! hence the odd-prime restriction.

use crate::error::{Result, TopologyError};
use crate::grid::GridCoord;

/// One grid cell of the sharding plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlsCell {
    pub task_id: u32,
    pub data_id: u32,
}

/// Immutable N×N grid of `(task, data)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlsGrid {
    size: usize,
    /// Row-major cells
    cells: Vec<GlsCell>,
}

impl GlsGrid {
    /// Generate the grid for an odd prime `n`.
    ///
    /// # Errors
    ///
    /// [`TopologyError::NonPrimeGridSize`] for any other `n`.
    ///
    /// # Examples
    ///
    /// ```
    /// use hive_topology::GlsGrid;
    ///
    /// let grid = GlsGrid::generate(3).unwrap();
    /// assert_eq!(grid.cell(1, 2).unwrap().task_id, 0);
    /// assert_eq!(grid.cell(1, 2).unwrap().data_id, 2);
    /// assert!(GlsGrid::generate(4).is_err());
    /// ```
    pub fn generate(n: usize) -> Result<Self> {
        if !is_odd_prime(n) {
            return Err(TopologyError::NonPrimeGridSize(n));
        }

        let mut cells = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                cells.push(GlsCell {
                    task_id: ((i + j) % n) as u32,
                    data_id: ((i + 2 * j) % n) as u32,
                });
            }
        }

        Ok(Self { size: n, cells })
    }

    /// Side length of the grid.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Look up cell `(i, j)`.
    pub fn cell(&self, i: usize, j: usize) -> Result<GlsCell> {
        if i >= self.size || j >= self.size {
            return Err(TopologyError::OutOfBounds { i, j, size: self.size });
        }
        Ok(self.cells[i * self.size + j])
    }

    /// One row of the grid.
    pub fn row(&self, i: usize) -> &[GlsCell] {
        &self.cells[i * self.size..(i + 1) * self.size]
    }

    /// All cells in row-major order, paired with their coordinate.
    pub fn iter(&self) -> impl Iterator<Item = (GridCoord, GlsCell)> + '_ {
        let n = self.size;
        self.cells
            .iter()
            .enumerate()
            .map(move |(idx, cell)| (GridCoord::new((idx / n) as u32, (idx % n) as u32), *cell))
    }
}

/// True for 3, 5, 7, 11, ...
pub fn is_odd_prime(n: usize) -> bool {
    if n < 3 || n % 2 == 0 {
        return false;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn assert_orthogonal_latin(grid: &GlsGrid) {
        let n = grid.size();

        for i in 0..n {
            let tasks: HashSet<u32> = (0..n).map(|j| grid.cell(i, j).unwrap().task_id).collect();
            let data: HashSet<u32> = (0..n).map(|j| grid.cell(i, j).unwrap().data_id).collect();
            assert_eq!(tasks.len(), n, "row {} repeats a task id", i);
            assert_eq!(data.len(), n, "row {} repeats a data id", i);
        }

        for j in 0..n {
            let tasks: HashSet<u32> = (0..n).map(|i| grid.cell(i, j).unwrap().task_id).collect();
            let data: HashSet<u32> = (0..n).map(|i| grid.cell(i, j).unwrap().data_id).collect();
            assert_eq!(tasks.len(), n, "column {} repeats a task id", j);
            assert_eq!(data.len(), n, "column {} repeats a data id", j);
        }

        let pairs: HashSet<(u32, u32)> = grid.iter().map(|(_, c)| (c.task_id, c.data_id)).collect();
        assert_eq!(pairs.len(), n * n, "a (task, data) pair repeats");
    }

    #[test]
    fn intended_sizes_are_orthogonal_latin() {
        for n in [3, 5, 7] {
            let grid = GlsGrid::generate(n).unwrap();
            assert_eq!(grid.iter().count(), n * n);
            assert_orthogonal_latin(&grid);
        }
    }

    #[test]
    fn three_by_three_matches_formula() {
        let grid = GlsGrid::generate(3).unwrap();
        let expected = [
            [(0, 0), (1, 2), (2, 1)],
            [(1, 1), (2, 0), (0, 2)],
            [(2, 2), (0, 1), (1, 0)],
        ];
        for (i, row) in expected.iter().enumerate() {
            for (j, &(task, data)) in row.iter().enumerate() {
                let cell = grid.cell(i, j).unwrap();
                assert_eq!((cell.task_id, cell.data_id), (task, data), "cell ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn non_prime_sizes_rejected() {
        for n in [0, 1, 2, 4, 6, 9, 15, 25] {
            assert_eq!(GlsGrid::generate(n), Err(TopologyError::NonPrimeGridSize(n)));
        }
    }

    #[test]
    fn out_of_bounds_lookup() {
        let grid = GlsGrid::generate(3).unwrap();
        assert!(matches!(grid.cell(3, 0), Err(TopologyError::OutOfBounds { .. })));
        assert_eq!(grid.row(2).len(), 3);
    }

    #[test]
    fn iter_is_row_major() {
        let grid = GlsGrid::generate(5).unwrap();
        let coords: Vec<GridCoord> = grid.iter().map(|(c, _)| c).collect();
        assert_eq!(coords[0], GridCoord::new(0, 0));
        assert_eq!(coords[4], GridCoord::new(0, 4));
        assert_eq!(coords[5], GridCoord::new(1, 0));
        assert_eq!(coords[24], GridCoord::new(4, 4));
    }

    proptest! {
        #[test]
        fn generation_succeeds_only_for_odd_primes(n in 0usize..60) {
            match GlsGrid::generate(n) {
                Ok(grid) => {
                    prop_assert!(is_odd_prime(n));
                    assert_orthogonal_latin(&grid);
                }
                Err(e) => {
                    prop_assert!(!is_odd_prime(n));
                    prop_assert_eq!(e, TopologyError::NonPrimeGridSize(n));
                }
            }
        }
    }
}
