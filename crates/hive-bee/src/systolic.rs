//! Cannon's-algorithm systolic engine.
//!
//! Each bee holds one block of `A`, `B` and the accumulator `C`. A step is:
//!
//! ```text
//! 1. C += A × B
//! 2. send A → WEST, B → NORTH          (PULSE_DATA, attested)
//! 3. await quorum for the step          (A' from EAST, B' from SOUTH)
//! 4. A, B := A', B'
//! ```
//!
//! Steps run strictly in sequence; step `k + 1` starts only after step `k`
//! has both sent and received its operands.

use std::fmt;

use hive_immune::Attestor;
use hive_topology::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mesh::MeshService;
use crate::pacemaker::Pacemaker;
use crate::protocol::{pulse_signing_bytes, Operand, PeerMessage};

/// Largest accepted row or column count for a block.
pub const MAX_BLOCK_DIM: usize = 4096;

/// Dense row-major matrix block.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    /// Build from rows; all rows must have equal length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(Error::InvalidInput("ragged matrix rows".into()));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Check a deserialized matrix is self-consistent and within
    /// [`MAX_BLOCK_DIM`] on both axes.
    pub fn validate(&self) -> Result<()> {
        if self.rows > MAX_BLOCK_DIM || self.cols > MAX_BLOCK_DIM {
            return Err(Error::InvalidInput(format!(
                "matrix {}x{} exceeds the {} block limit",
                self.rows, self.cols, MAX_BLOCK_DIM
            )));
        }
        if self.rows.checked_mul(self.cols) != Some(self.data.len()) {
            return Err(Error::InvalidInput(format!(
                "matrix {}x{} carries {} values",
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// BLAKE3 over shape and little-endian values.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.rows as u64).to_le_bytes());
        hasher.update(&(self.cols as u64).to_le_bytes());
        for v in &self.data {
            hasher.update(&v.to_le_bytes());
        }
        hasher.finalize()
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix({}x{})", self.rows, self.cols)
    }
}

/// Block multiply-accumulate.
pub trait BlockKernel: Send + Sync {
    /// `c += a × b`
    fn multiply_accumulate(&self, c: &mut Matrix, a: &Matrix, b: &Matrix) -> Result<()>;
}

/// Triple-loop kernel on the CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaiveKernel;

impl BlockKernel for NaiveKernel {
    fn multiply_accumulate(&self, c: &mut Matrix, a: &Matrix, b: &Matrix) -> Result<()> {
        if a.cols != b.rows || c.rows != a.rows || c.cols != b.cols {
            return Err(Error::InvalidInput(format!(
                "shape mismatch: C{:?} += A{:?} x B{:?}",
                c.shape(),
                a.shape(),
                b.shape()
            )));
        }
        for i in 0..a.rows {
            for k in 0..a.cols {
                let aik = a.data[i * a.cols + k];
                if aik == 0.0 {
                    continue;
                }
                for j in 0..b.cols {
                    c.data[i * c.cols + j] += aik * b.data[k * b.cols + j];
                }
            }
        }
        Ok(())
    }
}

/// Explicit operand blocks.
#[derive(Debug, Deserialize)]
struct BlockPair {
    a: Matrix,
    b: Matrix,
}

/// A data chunk from a lead's block plan.
#[derive(Debug, Deserialize)]
struct ChunkFragment {
    chunk: String,
}

/// Shard fragment formats accepted by [`SystolicEngine::load_shard`].
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Fragment {
    Blocks(BlockPair),
    Chunk(ChunkFragment),
}

/// Pack bytes row-major into the smallest square block, zero padded.
fn chunk_block(bytes: &[u8]) -> Matrix {
    let mut n = 1;
    while n * n < bytes.len() {
        n += 1;
    }
    let mut m = Matrix::zeros(n, n);
    for (slot, byte) in m.data.iter_mut().zip(bytes) {
        *slot = f64::from(*byte);
    }
    m
}

/// Local state of one bee's systolic computation.
pub struct SystolicEngine {
    kernel: Box<dyn BlockKernel>,
    a: Option<Matrix>,
    b: Option<Matrix>,
    c: Option<Matrix>,
}

impl Default for SystolicEngine {
    fn default() -> Self {
        Self::new(Box::new(NaiveKernel))
    }
}

impl SystolicEngine {
    pub fn new(kernel: Box<dyn BlockKernel>) -> Self {
        Self {
            kernel,
            a: None,
            b: None,
            c: None,
        }
    }

    /// Install the initial blocks and a zero accumulator.
    ///
    /// `fragment` is either `{"a": Matrix, "b": Matrix}` or a lead's data
    /// chunk `{"taskId", "dataId", "chunk": hex}`. A chunk becomes `A` as a
    /// square byte block with `B = I`, so one step leaves the chunk in `C`.
    pub fn load_shard(&mut self, fragment: &serde_json::Value) -> Result<()> {
        let (a, b) = match serde_json::from_value::<Fragment>(fragment.clone()) {
            Ok(Fragment::Blocks(pair)) => (pair.a, pair.b),
            Ok(Fragment::Chunk(chunk)) => {
                let bytes = hex::decode(&chunk.chunk)
                    .map_err(|e| Error::InvalidInput(format!("chunk is not hex: {}", e)))?;
                let a = chunk_block(&bytes);
                let b = Matrix::identity(a.rows);
                (a, b)
            }
            Err(e) => {
                return Err(Error::InvalidInput(format!("unrecognized shard fragment: {}", e)))
            }
        };
        a.validate()?;
        b.validate()?;
        if a.cols != b.rows {
            return Err(Error::InvalidInput(format!(
                "incompatible blocks A{:?} B{:?}",
                a.shape(),
                b.shape()
            )));
        }
        self.c = Some(Matrix::zeros(a.rows, b.cols));
        debug!(a = ?a.shape(), b = ?b.shape(), "Shard loaded");
        self.a = Some(a);
        self.b = Some(b);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.a.is_some() && self.b.is_some() && self.c.is_some()
    }

    /// `C += A × B`, returning the blocks to shift out.
    pub fn multiply_accumulate(&mut self) -> Result<(Matrix, Matrix)> {
        let (Some(a), Some(b), Some(c)) = (&self.a, &self.b, &mut self.c) else {
            return Err(Error::InvalidInput("no shard loaded".into()));
        };
        self.kernel.multiply_accumulate(c, a, b)?;
        Ok((a.clone(), b.clone()))
    }

    /// Replace `A` and `B` with the blocks received for the next step.
    pub fn install(&mut self, a: Matrix, b: Matrix) -> Result<()> {
        a.validate()?;
        b.validate()?;
        let (Some(old_a), Some(old_b)) = (&self.a, &self.b) else {
            return Err(Error::InvalidInput("no shard loaded".into()));
        };
        if a.shape() != old_a.shape() || b.shape() != old_b.shape() {
            return Err(Error::InvalidInput(format!(
                "received A{:?} B{:?}, expected A{:?} B{:?}",
                a.shape(),
                b.shape(),
                old_a.shape(),
                old_b.shape()
            )));
        }
        self.a = Some(a);
        self.b = Some(b);
        Ok(())
    }

    pub fn accumulator(&self) -> Option<&Matrix> {
        self.c.as_ref()
    }
}

/// Outcome of a multi-step run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub steps: u32,
    /// Steps whose operands were reused under the straggler policy
    pub degraded_steps: Vec<u64>,
    /// Digest of the final accumulator
    pub digest: blake3::Hash,
}

/// What a step needs beyond the engine.
pub struct StepContext<'a> {
    pub self_id: &'a str,
    pub mesh: &'a MeshService,
    pub pacemaker: &'a Pacemaker<Matrix>,
    pub attestor: &'a Attestor,
}

impl StepContext<'_> {
    async fn pulse(&self, step: u64, operand: Operand, block: &Matrix) -> Result<bool> {
        let payload = serde_json::to_value(block)?;
        let attestation = self
            .attestor
            .sign(&pulse_signing_bytes(step, operand, &payload)?, self.self_id)
            .to_hex();
        let message = PeerMessage::PulseData {
            bee_id: self.self_id.to_string(),
            step,
            operand,
            payload,
            attestation,
        };
        Ok(self.mesh.pulse(operand.sink(), &message).await)
    }
}

/// Run `steps` Cannon steps numbered `1..=steps`.
pub async fn run_steps(
    engine: &mut SystolicEngine,
    ctx: &StepContext<'_>,
    steps: u32,
) -> Result<RunReport> {
    let mut degraded_steps = Vec::new();

    for step in 1..=u64::from(steps) {
        let (out_a, out_b) = engine.multiply_accumulate()?;

        let sent_a = ctx.pulse(step, Operand::A, &out_a).await?;
        let sent_b = ctx.pulse(step, Operand::B, &out_b).await?;
        if !sent_a {
            warn!(step, "Pulse to {} undelivered", Direction::West);
        }
        if !sent_b {
            warn!(step, "Pulse to {} undelivered", Direction::North);
        }
        debug!(step, "Systolic pulse fired, waiting for quorum");

        let inputs = ctx.pacemaker.await_quorum(step).await?;
        if inputs.is_degraded() {
            degraded_steps.push(step);
        }
        engine.install(inputs.east, inputs.south)?;
    }

    let digest = engine
        .accumulator()
        .map(Matrix::digest)
        .ok_or_else(|| Error::InvalidInput("no shard loaded".into()))?;
    info!(steps, degraded = degraded_steps.len(), "Systolic run complete");
    Ok(RunReport {
        steps,
        degraded_steps,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(rows: Vec<Vec<f64>>) -> Matrix {
        Matrix::from_rows(rows).unwrap()
    }

    #[test]
    fn naive_kernel_accumulates() {
        let a = m(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let b = m(vec![vec![5.0, 6.0], vec![7.0, 8.0]]);
        let mut c = Matrix::zeros(2, 2);
        NaiveKernel.multiply_accumulate(&mut c, &a, &b).unwrap();
        NaiveKernel.multiply_accumulate(&mut c, &a, &b).unwrap();
        assert_eq!(c, m(vec![vec![38.0, 44.0], vec![86.0, 100.0]]));
    }

    #[test]
    fn kernel_rejects_shape_mismatch() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 2);
        let mut c = Matrix::zeros(2, 2);
        assert!(NaiveKernel.multiply_accumulate(&mut c, &a, &b).is_err());
    }

    #[test]
    fn ragged_rows_rejected() {
        assert!(Matrix::from_rows(vec![vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn loads_explicit_blocks() {
        let mut engine = SystolicEngine::default();
        let fragment = json!({
            "a": {"rows": 1, "cols": 2, "data": [1.0, 2.0]},
            "b": {"rows": 2, "cols": 1, "data": [3.0, 4.0]}
        });
        engine.load_shard(&fragment).unwrap();
        let (out_a, out_b) = engine.multiply_accumulate().unwrap();
        assert_eq!(out_a.shape(), (1, 2));
        assert_eq!(out_b.shape(), (2, 1));
        assert_eq!(engine.accumulator().unwrap().get(0, 0), 11.0);
    }

    #[test]
    fn loads_lead_chunk_as_identity_product() {
        let mut engine = SystolicEngine::default();
        let fragment = json!({"taskId": 1, "dataId": 2, "chunk": hex::encode(b"hello")});
        engine.load_shard(&fragment).unwrap();
        engine.multiply_accumulate().unwrap();
        let c = engine.accumulator().unwrap();
        assert_eq!(c.shape(), (3, 3));
        assert_eq!(c.get(0, 0), f64::from(b'h'));
        assert_eq!(c.get(1, 1), f64::from(b'o'));
        assert_eq!(c.get(2, 2), 0.0);
    }

    #[test]
    fn rejects_bad_fragments() {
        let mut engine = SystolicEngine::default();
        assert!(engine.load_shard(&json!("opaque")).is_err());
        assert!(engine
            .load_shard(&json!({
                "a": {"rows": 2, "cols": 2, "data": [1.0]},
                "b": {"rows": 2, "cols": 2, "data": [1.0, 0.0, 0.0, 1.0]},
            }))
            .is_err());
        assert!(engine.load_shard(&json!({"chunk": "zz"})).is_err());
        assert!(!engine.is_loaded());
    }

    #[test]
    fn hostile_shapes_fail_validation() {
        let overflow: Matrix =
            serde_json::from_str(r#"{"rows":4294967296,"cols":4294967296,"data":[]}"#).unwrap();
        assert!(overflow.validate().is_err());

        let wide: Matrix =
            serde_json::from_str(r#"{"rows":0,"cols":1099511627776,"data":[]}"#).unwrap();
        assert!(wide.validate().is_err());

        let mut engine = SystolicEngine::default();
        assert!(engine
            .load_shard(&json!({
                "a": {"rows": 1099511627776u64, "cols": 0, "data": []},
                "b": {"rows": 0, "cols": 1099511627776u64, "data": []},
            }))
            .is_err());
        assert!(!engine.is_loaded());
    }

    #[test]
    fn install_checks_shapes() {
        let mut engine = SystolicEngine::default();
        assert!(engine.multiply_accumulate().is_err());
        engine
            .load_shard(&json!({"taskId": 0, "dataId": 0, "chunk": "01020304"}))
            .unwrap();
        assert!(engine.install(Matrix::zeros(2, 2), Matrix::identity(2)).is_ok());
        assert!(engine.install(Matrix::zeros(3, 3), Matrix::identity(2)).is_err());
    }

    #[test]
    fn digest_tracks_contents() {
        let a = m(vec![vec![1.0, 2.0]]);
        let b = m(vec![vec![1.0, 2.5]]);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }
}
