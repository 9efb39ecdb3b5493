//! XOR parity over a set of shards.
//!
//! ```text
//! P = S1 ⊕ S2 ⊕ … ⊕ Sn            (sealed once every shard is in)
//! Sk = P ⊕ (⊕ of the shards still held)
//! ```
//!
//! Shards are zero-padded to the longest one; each shard's true length is
//! kept so reconstruction returns the original bytes exactly. One missing
//! shard can be recovered, never two.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info};

/// Errors from the parity buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParityError {
    #[error("shard {0} already present")]
    DuplicateShard(String),

    #[error("shard {0} not present")]
    UnknownShard(String),

    /// Reconstruction needs all but one shard
    #[error("{held} of {total} shards held; exactly one may be missing")]
    TooManyMissing { held: usize, total: usize },

    #[error("parity has not been sealed")]
    NotSealed,
}

/// Shards, their running XOR, and the sealed parity.
#[derive(Debug, Default, Clone)]
pub struct ParityBuffer {
    shards: BTreeMap<String, Vec<u8>>,
    /// XOR of every shard currently held
    accumulator: Vec<u8>,
    /// Original length of every shard ever added
    lengths: HashMap<String, usize>,
    sealed: Option<Vec<u8>>,
}

fn xor_into(acc: &mut Vec<u8>, bytes: &[u8]) {
    if acc.len() < bytes.len() {
        acc.resize(bytes.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(bytes) {
        *a ^= b;
    }
}

impl ParityBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a shard and fold it into the accumulator.
    pub fn add_shard(&mut self, id: impl Into<String>, bytes: Vec<u8>) -> Result<(), ParityError> {
        let id = id.into();
        if self.shards.contains_key(&id) {
            return Err(ParityError::DuplicateShard(id));
        }
        xor_into(&mut self.accumulator, &bytes);
        self.lengths.insert(id.clone(), bytes.len());
        self.shards.insert(id, bytes);
        Ok(())
    }

    /// Fix the parity as the XOR of every shard held now.
    pub fn seal(&mut self) {
        self.sealed = Some(self.accumulator.clone());
        debug!(shards = self.shards.len(), "Parity sealed");
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Drop a shard and fold it back out of the accumulator.
    pub fn mark_lost(&mut self, id: &str) -> Result<(), ParityError> {
        let bytes = self
            .shards
            .remove(id)
            .ok_or_else(|| ParityError::UnknownShard(id.to_string()))?;
        xor_into(&mut self.accumulator, &bytes);
        info!(shard = id, "Shard marked lost");
        Ok(())
    }

    /// Recompute `missing_id` from the sealed parity and the other
    /// `total_expected - 1` shards.
    pub fn reconstruct(
        &self,
        missing_id: &str,
        total_expected: usize,
    ) -> Result<Vec<u8>, ParityError> {
        if self.shards.contains_key(missing_id) {
            return Err(ParityError::DuplicateShard(missing_id.to_string()));
        }
        if self.shards.len() + 1 != total_expected {
            return Err(ParityError::TooManyMissing {
                held: self.shards.len(),
                total: total_expected,
            });
        }
        let parity = self.sealed.as_ref().ok_or(ParityError::NotSealed)?;

        let mut out = parity.clone();
        xor_into(&mut out, &self.accumulator);
        let len = self.lengths.get(missing_id).copied().unwrap_or(out.len());
        out.resize(len, 0);
        Ok(out)
    }

    /// Reconstruct `missing_id` and put it back.
    pub fn recover(
        &mut self,
        missing_id: &str,
        total_expected: usize,
    ) -> Result<Vec<u8>, ParityError> {
        let bytes = self.reconstruct(missing_id, total_expected)?;
        self.add_shard(missing_id, bytes.clone())?;
        info!(shard = missing_id, bytes = bytes.len(), "Shard reconstructed from parity");
        Ok(bytes)
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.shards.get(id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn accumulator(&self) -> &[u8] {
        &self.accumulator
    }
}
