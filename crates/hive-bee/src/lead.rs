//! Lead-bee block handling: recursive sharding and shard recovery.
//!
//! A lead receives one block of a job, cuts its data into N chunks and
//! assigns cell `(r, c)` of an N×N grid the pair `(task, data)` from the
//! Greco-Latin square. The cell's fragment is chunk `data` tagged with
//! `task`. Every fragment goes into a sealed [`ParityBuffer`] under `"r-c"`
//! so a single lost cell can be rebuilt and re-dispatched.

use std::collections::{HashMap, VecDeque};

use hive_topology::{GlsGrid, GridCoord};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::parity::ParityBuffer;
use crate::protocol::ControlMessage;

/// One cell's work, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardDispatch {
    pub cell: GridCoord,
    pub task_id: u32,
    pub data_id: u32,
    pub fragment: serde_json::Value,
}

/// Sub-sharding of one block.
#[derive(Debug)]
pub struct BlockPlan {
    job_id: String,
    block_id: u32,
    total_blocks: u32,
    grid: GlsGrid,
    dispatches: Vec<ShardDispatch>,
    parity: ParityBuffer,
}

fn cell_key(cell: GridCoord) -> String {
    format!("{}-{}", cell.i, cell.j)
}

/// Split `data` into `n` contiguous chunks of `ceil(len / n)` bytes; trailing
/// chunks may be short or empty.
fn split_chunks(data: &[u8], n: usize) -> Vec<&[u8]> {
    let size = data.len().div_ceil(n).max(1);
    (0..n)
        .map(|k| {
            let start = (k * size).min(data.len());
            let end = ((k + 1) * size).min(data.len());
            &data[start..end]
        })
        .collect()
}

impl BlockPlan {
    /// Build the plan for a block on an `n`×`n` grid (`n` an odd prime).
    pub fn build(
        job_id: &str,
        block_id: u32,
        total_blocks: u32,
        data: &[u8],
        n: usize,
    ) -> Result<Self> {
        let grid = GlsGrid::generate(n)?;
        let chunks = split_chunks(data, n);

        let mut parity = ParityBuffer::new();
        let mut dispatches = Vec::with_capacity(n * n);
        for (cell, gls) in grid.iter() {
            let chunk = chunks[gls.data_id as usize];
            let fragment = json!({
                "taskId": gls.task_id,
                "dataId": gls.data_id,
                "chunk": hex::encode(chunk),
            });
            parity.add_shard(cell_key(cell), serde_json::to_vec(&fragment)?)?;
            dispatches.push(ShardDispatch {
                cell,
                task_id: gls.task_id,
                data_id: gls.data_id,
                fragment,
            });
        }
        parity.seal();

        info!(job_id, block_id, total_blocks, n, "Generated {}x{} Greco-Latin sharding", n, n);
        Ok(Self {
            job_id: job_id.to_string(),
            block_id,
            total_blocks,
            grid,
            dispatches,
            parity,
        })
    }

    pub fn dispatches(&self) -> &[ShardDispatch] {
        &self.dispatches
    }

    pub fn grid(&self) -> &GlsGrid {
        &self.grid
    }

    /// `SHARD_ASSIGNMENT` for one dispatch.
    pub fn assignment(&self, dispatch: &ShardDispatch, steps: u32) -> ControlMessage {
        ControlMessage::ShardAssignment {
            job_id: self.job_id.clone(),
            block_id: self.block_id,
            total_blocks: self.total_blocks,
            task_id: dispatch.task_id,
            data_id: dispatch.data_id,
            cell: Some(dispatch.cell),
            fragment: dispatch.fragment.clone(),
            steps,
        }
    }

    /// `SHARD_ASSIGNMENT` for every cell, row-major.
    pub fn assignments(&self, steps: u32) -> Vec<ControlMessage> {
        self.dispatches.iter().map(|d| self.assignment(d, steps)).collect()
    }

    /// Rebuild a lost cell's fragment from parity.
    pub fn recover(&mut self, cell: GridCoord) -> Result<ShardDispatch> {
        let key = cell_key(cell);
        let gls = self.grid.cell(cell.i as usize, cell.j as usize)?;
        let total = self.grid.size() * self.grid.size();

        self.parity.mark_lost(&key)?;
        let bytes = self.parity.recover(&key, total)?;
        let fragment: serde_json::Value = serde_json::from_slice(&bytes)?;

        Ok(ShardDispatch {
            cell,
            task_id: gls.task_id,
            data_id: gls.data_id,
            fragment,
        })
    }
}

/// Block plans a lead keeps for recovery. Nothing signals job completion,
/// so the oldest plan is evicted once this many are held.
pub const MAX_PLANS: usize = 64;

type PlanKey = (String, u32);

#[derive(Debug, Default)]
struct Plans {
    by_key: HashMap<PlanKey, BlockPlan>,
    /// Keys oldest first
    order: VecDeque<PlanKey>,
}

/// Block plans held by a lead, keyed by `(job_id, block_id)`.
#[derive(Debug, Default)]
pub struct LeadRegistry {
    plans: Mutex<Plans>,
}

impl LeadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a `BLOCK_ASSIGNMENT` and return the shard assignments to send.
    pub fn handle_block(
        &self,
        job_id: &str,
        block_id: u32,
        total_blocks: u32,
        data: &str,
        n: usize,
    ) -> Result<Vec<ControlMessage>> {
        info!(job_id, "Received block {}/{}", block_id, total_blocks);
        let plan = BlockPlan::build(job_id, block_id, total_blocks, data.as_bytes(), n)?;
        let messages = plan.assignments(1);
        let key = (job_id.to_string(), block_id);

        let mut plans = self.plans.lock();
        if plans.by_key.insert(key.clone(), plan).is_some() {
            warn!(job_id, block_id, "Block re-assigned, previous plan dropped");
            plans.order.retain(|k| *k != key);
        }
        plans.order.push_back(key);
        while plans.order.len() > MAX_PLANS {
            if let Some((old_job, old_block)) = plans.order.pop_front() {
                plans.by_key.remove(&(old_job.clone(), old_block));
                debug!(job_id = %old_job, block_id = old_block, "Evicted oldest block plan");
            }
        }
        Ok(messages)
    }

    /// Rebuild the shard of `cell` and return its re-assignment.
    pub fn handle_lost(
        &self,
        job_id: &str,
        block_id: u32,
        cell: GridCoord,
    ) -> Result<ControlMessage> {
        let mut plans = self.plans.lock();
        let plan = plans
            .by_key
            .get_mut(&(job_id.to_string(), block_id))
            .ok_or_else(|| {
                Error::InvalidInput(format!("no plan for job {} block {}", job_id, block_id))
            })?;
        let dispatch = plan.recover(cell)?;
        info!(job_id, block_id, %cell, "Re-dispatching reconstructed shard");
        Ok(plan.assignment(&dispatch, 1))
    }

    pub fn len(&self) -> usize {
        self.plans.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_assignment_yields_nine_deterministic_dispatches() {
        let registry = LeadRegistry::new();
        let messages = registry.handle_block("job-1", 0, 1, "QUJDREVGR0hJ", 3).unwrap();
        assert_eq!(messages.len(), 9);

        let mut cells = Vec::new();
        for msg in &messages {
            let ControlMessage::ShardAssignment {
                task_id,
                data_id,
                cell: Some(cell),
                block_id,
                total_blocks,
                ..
            } = msg
            else {
                panic!("unexpected {:?}", msg);
            };
            let (i, j) = (cell.i, cell.j);
            assert_eq!(*task_id, (i + j) % 3);
            assert_eq!(*data_id, (i + 2 * j) % 3);
            assert_eq!((*block_id, *total_blocks), (0, 1));
            cells.push((i, j));
        }
        let expected: Vec<(u32, u32)> = (0..3).flat_map(|i| (0..3).map(move |j| (i, j))).collect();
        assert_eq!(cells, expected);

        // Same input, same plan
        let again = LeadRegistry::new().handle_block("job-1", 0, 1, "QUJDREVGR0hJ", 3).unwrap();
        assert_eq!(messages, again);
    }

    #[test]
    fn fragments_carry_their_data_chunk() {
        let plan = BlockPlan::build("job", 0, 1, b"aaabbbccc", 3).unwrap();
        assert!(plan.parity.is_sealed());
        assert_eq!(plan.parity.len(), 9);
        for d in plan.dispatches() {
            let chunk = d.fragment["chunk"].as_str().unwrap();
            let bytes = hex::decode(chunk).unwrap();
            let expected = [b"aaa", b"bbb", b"ccc"][d.data_id as usize];
            assert_eq!(&bytes, expected);
            assert_eq!(d.fragment["taskId"], d.task_id);
        }
    }

    #[test]
    fn short_data_splits_without_panicking() {
        assert_eq!(split_chunks(b"ab", 3), vec![&b"a"[..], &b"b"[..], &b""[..]]);
        assert_eq!(split_chunks(b"", 3).len(), 3);
        let plan = BlockPlan::build("job", 0, 1, b"", 5).unwrap();
        assert_eq!(plan.dispatches().len(), 25);
    }

    #[test]
    fn non_prime_grid_rejected() {
        assert!(BlockPlan::build("job", 0, 1, b"data", 4).is_err());
    }

    #[test]
    fn lost_shard_is_rebuilt_identically() {
        let registry = LeadRegistry::new();
        let messages = registry.handle_block("job-2", 1, 2, "some block payload", 3).unwrap();
        let original = messages[5].clone();

        let rebuilt = registry.handle_lost("job-2", 1, GridCoord::new(1, 2)).unwrap();
        assert_eq!(rebuilt, original);

        // Recovered shard is back in the set; the cell can be lost again
        let again = registry.handle_lost("job-2", 1, GridCoord::new(1, 2)).unwrap();
        assert_eq!(again, original);
    }

    #[test]
    fn oldest_plans_are_evicted_past_the_cap() {
        let registry = LeadRegistry::new();
        for block in 0..=MAX_PLANS as u32 {
            registry.handle_block("job", block, MAX_PLANS as u32 + 1, "abc", 3).unwrap();
        }
        assert_eq!(registry.len(), MAX_PLANS);
        assert!(registry.handle_lost("job", 0, GridCoord::ORIGIN).is_err());
        assert!(registry.handle_lost("job", MAX_PLANS as u32, GridCoord::ORIGIN).is_ok());

        // Re-assigning a block refreshes its age
        registry.handle_block("job", 1, MAX_PLANS as u32 + 1, "abc", 3).unwrap();
        registry.handle_block("job-2", 0, 1, "abc", 3).unwrap();
        assert_eq!(registry.len(), MAX_PLANS);
        assert!(registry.handle_lost("job", 1, GridCoord::ORIGIN).is_ok());
        assert!(registry.handle_lost("job", 2, GridCoord::ORIGIN).is_err());
    }

    #[test]
    fn lost_shard_for_unknown_block_fails() {
        let registry = LeadRegistry::new();
        assert!(registry.handle_lost("nope", 0, GridCoord::ORIGIN).is_err());
        registry.handle_block("job", 0, 1, "x", 3).unwrap();
        assert!(registry.handle_lost("job", 0, GridCoord::new(9, 9)).is_err());
    }
}
