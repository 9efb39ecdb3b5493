//! Strict-majority quorum math.
//!
//! A candidate needs more than half of the known electorate, itself included:
//!
//! ```text
//! electorate   1  2  3  4  5  6  7
//! majority     1  2  2  3  3  4  4
//! ```

/// Minimum votes that form a strict majority of `electorate` voters.
pub const fn majority(electorate: usize) -> usize {
    electorate / 2 + 1
}

/// Check whether `votes` out of `electorate` is a strict majority.
pub const fn has_majority(votes: usize, electorate: usize) -> bool {
    electorate > 0 && votes >= majority(electorate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_table() {
        let cases = [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4), (10, 6)];
        for (electorate, expected) in cases {
            assert_eq!(majority(electorate), expected, "majority({})", electorate);
        }
    }

    #[test]
    fn majority_is_strict() {
        for n in 1..=50 {
            assert!(2 * majority(n) > n, "majority({}) is not strict", n);
            assert!(2 * (majority(n) - 1) <= n, "majority({}) is not minimal", n);
        }
    }

    #[test]
    fn empty_electorate_never_has_majority() {
        assert!(!has_majority(0, 0));
        assert!(!has_majority(5, 0));
    }

    #[test]
    fn has_majority_checks() {
        assert!(has_majority(1, 1));
        assert!(!has_majority(1, 2));
        assert!(has_majority(3, 5));
        assert!(!has_majority(2, 5));
    }
}
