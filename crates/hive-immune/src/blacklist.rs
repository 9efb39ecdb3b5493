//! Approximate-membership blacklist of malicious peers.
//!
//! A Bloom filter over bee ids. Bit positions come from BLAKE3 with double
//! hashing (`h1 + i·h2 mod m`), so `contains` never misses an added id.
//!
//! # False Positives
//!
//! Sized for `n` expected ids at target rate `p`:
//!
//! ```text
//! m = ceil(-n · ln p / (ln 2)²)      bits
//! k = max(1, round(m / n · ln 2))    hash functions
//! ```
//!
//! The default ([`Blacklist::default`]) is 1024 ids at 1%, which is 9816
//! bits and 7 hashes. The rate rises past `p` once more than `n` ids are
//! added; [`BloomFilter::estimated_fp_rate`] reports the current bound.
//! There is no removal.

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ImmuneError, Result};

/// Expected blacklist size for the default filter.
pub const DEFAULT_EXPECTED_IDS: usize = 1024;

/// Target false-positive rate for the default filter.
pub const DEFAULT_FP_RATE: f64 = 0.01;

/// `m` for [`DEFAULT_EXPECTED_IDS`] at [`DEFAULT_FP_RATE`].
const DEFAULT_NUM_BITS: u64 = 9816;

/// `k` for [`DEFAULT_EXPECTED_IDS`] at [`DEFAULT_FP_RATE`].
const DEFAULT_NUM_HASHES: u32 = 7;

/// Plain Bloom filter over byte strings.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: usize,
}

impl BloomFilter {
    /// Create a filter with explicit size.
    pub fn new(num_bits: u64, num_hashes: u32) -> Result<Self> {
        if num_bits == 0 || num_hashes == 0 {
            return Err(ImmuneError::InvalidBloomParameters(format!(
                "bits={} hashes={}",
                num_bits, num_hashes
            )));
        }
        Ok(Self::sized(num_bits, num_hashes))
    }

    fn sized(num_bits: u64, num_hashes: u32) -> Self {
        Self {
            words: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
            inserted: 0,
        }
    }

    /// Size a filter for `expected` items at false-positive rate `fp_rate`.
    pub fn with_rate(expected: usize, fp_rate: f64) -> Result<Self> {
        if expected == 0 || !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(ImmuneError::InvalidBloomParameters(format!(
                "expected={} fp_rate={}",
                expected, fp_rate
            )));
        }
        let ln2 = std::f64::consts::LN_2;
        let n = expected as f64;
        let m = (-n * fp_rate.ln() / (ln2 * ln2)).ceil();
        let k = ((m / n) * ln2).round().max(1.0);
        Self::new(m as u64, k as u32)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of `insert` calls so far.
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn insert(&mut self, item: &[u8]) {
        for bit in self.bit_positions(item) {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.inserted += 1;
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.bit_positions(item)
            .all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// `(1 - e^(-k·n/m))^k` for the current fill.
    pub fn estimated_fp_rate(&self) -> f64 {
        let k = f64::from(self.num_hashes);
        let n = self.inserted as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn bit_positions(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let hash = blake3::hash(item);
        let bytes = hash.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[0..8]);
        hi.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(lo);
        // Odd step so successive probes cycle through distinct residues
        let h2 = u64::from_le_bytes(hi) | 1;
        let m = self.num_bits;
        (0..u64::from(self.num_hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}

/// Thread-safe blacklist of bee ids.
#[derive(Debug)]
pub struct Blacklist {
    filter: RwLock<BloomFilter>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self {
            filter: RwLock::new(BloomFilter::sized(DEFAULT_NUM_BITS, DEFAULT_NUM_HASHES)),
        }
    }
}

impl Blacklist {
    /// Blacklist sized for `expected` ids at `fp_rate`.
    pub fn with_rate(expected: usize, fp_rate: f64) -> Result<Self> {
        Ok(Self {
            filter: RwLock::new(BloomFilter::with_rate(expected, fp_rate)?),
        })
    }

    pub fn add(&self, bee_id: &str) {
        self.filter.write().insert(bee_id.as_bytes());
        debug!(bee_id, "Blacklisted");
    }

    pub fn contains(&self, bee_id: &str) -> bool {
        self.filter.read().contains(bee_id.as_bytes())
    }

    /// Number of `add` calls so far (duplicates included).
    pub fn len(&self) -> usize {
        self.filter.read().inserted()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn estimated_fp_rate(&self) -> f64 {
        self.filter.read().estimated_fp_rate()
    }
}
