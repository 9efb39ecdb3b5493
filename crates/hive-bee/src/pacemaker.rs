//! Barrier synchronization of systolic steps.
//!
//! Each operand source (EAST for `A`, SOUTH for `B`) has a small map of
//! pending payloads keyed by step index. Quorum for step `k` fires only when
//! both sources hold a payload tagged exactly `k`; consuming it drops every
//! entry at or below `k`.
//!
//! A straggler that misses the deadline is handled by [`StragglerPolicy`]:
//! fail the step, or reuse the operand consumed last time and mark the step
//! degraded.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hive_topology::{Direction, OPERAND_SOURCES};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Look-ahead bound per direction; the oldest entry is evicted beyond it.
const MAX_PENDING_STEPS: usize = 8;

/// Errors from the pacemaker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacemakerError {
    /// Payload from a direction that does not feed operands
    #[error("{0} is not an operand source")]
    NotOperandSource(Direction),

    /// Deadline passed and the policy could not fill the gap
    #[error("step {step} timed out waiting on {missing:?}")]
    StragglerTimeout { step: u64, missing: Vec<Direction> },
}

/// What to do when a quorum deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StragglerPolicy {
    /// Fail the step
    #[default]
    Fail,
    /// Substitute the last consumed operand and mark the step degraded
    ReusePrevious,
}

impl fmt::Display for StragglerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::ReusePrevious => write!(f, "reuse"),
        }
    }
}

impl FromStr for StragglerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "reuse" | "reuse-previous" | "reuse_previous" => Ok(Self::ReusePrevious),
            other => Err(format!("unknown straggler policy {:?}", other)),
        }
    }
}

/// Inputs released for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumInputs<T> {
    /// Payload from EAST (next `A`)
    pub east: T,
    /// Payload from SOUTH (next `B`)
    pub south: T,
    /// Directions filled from the previous step under [`StragglerPolicy::ReusePrevious`]
    pub degraded: Vec<Direction>,
}

impl<T> QuorumInputs<T> {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

#[derive(Debug)]
struct Slot<T> {
    pending: BTreeMap<u64, T>,
    last_consumed: Option<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            last_consumed: None,
        }
    }
}

#[derive(Debug)]
struct Slots<T> {
    east: Slot<T>,
    south: Slot<T>,
}

impl<T> Slots<T> {
    fn get_mut(&mut self, direction: Direction) -> Option<&mut Slot<T>> {
        match direction {
            Direction::East => Some(&mut self.east),
            Direction::South => Some(&mut self.south),
            _ => None,
        }
    }
}

/// Step-indexed barrier over the two operand sources.
#[derive(Debug)]
pub struct Pacemaker<T> {
    slots: Mutex<Slots<T>>,
    notify: Notify,
    straggler_timeout: Duration,
    policy: StragglerPolicy,
}

impl<T: Clone> Pacemaker<T> {
    pub fn new(straggler_timeout: Duration, policy: StragglerPolicy) -> Self {
        Self {
            slots: Mutex::new(Slots {
                east: Slot::default(),
                south: Slot::default(),
            }),
            notify: Notify::new(),
            straggler_timeout,
            policy,
        }
    }

    pub fn policy(&self) -> StragglerPolicy {
        self.policy
    }

    /// Store `payload` for `(direction, step)`, replacing any entry for the
    /// same step.
    pub fn enqueue(
        &self,
        direction: Direction,
        step: u64,
        payload: T,
    ) -> Result<(), PacemakerError> {
        {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(direction)
                .ok_or(PacemakerError::NotOperandSource(direction))?;
            slot.pending.insert(step, payload);
            while slot.pending.len() > MAX_PENDING_STEPS {
                if let Some((evicted, _)) = slot.pending.pop_first() {
                    debug!(%direction, step = evicted, "Evicted stale pulse");
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Whether a payload for `(direction, step)` is waiting.
    pub fn has_pending(&self, direction: Direction, step: u64) -> bool {
        let mut slots = self.slots.lock();
        slots
            .get_mut(direction)
            .is_some_and(|slot| slot.pending.contains_key(&step))
    }

    /// Drop everything pending from `direction`, e.g. after losing that peer.
    pub fn discard_direction(&self, direction: Direction) {
        if let Some(slot) = self.slots.lock().get_mut(direction) {
            if !slot.pending.is_empty() {
                debug!(%direction, dropped = slot.pending.len(), "Discarded pending pulses");
            }
            slot.pending.clear();
        }
        self.notify.notify_waiters();
    }

    /// Wait until both EAST and SOUTH hold payloads for exactly `step`, then
    /// take them.
    ///
    /// After the straggler timeout the configured [`StragglerPolicy`] decides.
    pub async fn await_quorum(&self, step: u64) -> Result<QuorumInputs<T>, PacemakerError> {
        let deadline = Instant::now() + self.straggler_timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(inputs) = self.try_take(step) {
                return Ok(inputs);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.on_deadline(step);
            }
        }
    }

    /// Take step `step` if both payloads are present.
    pub fn try_take(&self, step: u64) -> Option<QuorumInputs<T>> {
        let mut slots = self.slots.lock();
        if !(slots.east.pending.contains_key(&step) && slots.south.pending.contains_key(&step)) {
            return None;
        }
        let east = Self::consume(&mut slots.east, step)?;
        let south = Self::consume(&mut slots.south, step)?;
        Some(QuorumInputs {
            east,
            south,
            degraded: Vec::new(),
        })
    }

    fn consume(slot: &mut Slot<T>, step: u64) -> Option<T> {
        let payload = slot.pending.remove(&step)?;
        slot.pending.retain(|&s, _| s > step);
        slot.last_consumed = Some(payload.clone());
        Some(payload)
    }

    fn on_deadline(&self, step: u64) -> Result<QuorumInputs<T>, PacemakerError> {
        let mut slots = self.slots.lock();
        let missing: Vec<Direction> = OPERAND_SOURCES
            .into_iter()
            .filter(|&d| {
                slots
                    .get_mut(d)
                    .map_or(true, |slot| !slot.pending.contains_key(&step))
            })
            .collect();

        if self.policy == StragglerPolicy::Fail
            || missing.iter().any(|&d| {
                slots
                    .get_mut(d)
                    .map_or(true, |slot| slot.last_consumed.is_none())
            })
        {
            warn!(step, ?missing, policy = %self.policy, "Quorum timed out");
            for d in OPERAND_SOURCES {
                if let Some(slot) = slots.get_mut(d) {
                    slot.pending.retain(|&s, _| s > step);
                }
            }
            return Err(PacemakerError::StragglerTimeout { step, missing });
        }

        let mut take = |d: Direction| -> Option<T> {
            let slot = slots.get_mut(d)?;
            match slot.pending.remove(&step) {
                Some(payload) => {
                    slot.pending.retain(|&s, _| s > step);
                    slot.last_consumed = Some(payload.clone());
                    Some(payload)
                }
                None => {
                    slot.pending.retain(|&s, _| s > step);
                    slot.last_consumed.clone()
                }
            }
        };
        let east = take(Direction::East);
        let south = take(Direction::South);
        match (east, south) {
            (Some(east), Some(south)) => {
                warn!(step, degraded = ?missing, "Degraded step, reusing previous operands");
                Ok(QuorumInputs {
                    east,
                    south,
                    degraded: missing,
                })
            }
            _ => Err(PacemakerError::StragglerTimeout { step, missing }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pacemaker(policy: StragglerPolicy) -> Arc<Pacemaker<u32>> {
        Arc::new(Pacemaker::new(Duration::from_secs(5), policy))
    }

    #[tokio::test(start_paused = true)]
    async fn fires_when_both_sources_match_step() {
        let pm = pacemaker(StragglerPolicy::Fail);
        pm.enqueue(Direction::East, 1, 10).unwrap();
        pm.enqueue(Direction::South, 1, 20).unwrap();
        let inputs = pm.await_quorum(1).await.unwrap();
        assert_eq!((inputs.east, inputs.south), (10, 20));
        assert!(!inputs.is_degraded());
        // Consumed
        assert!(!pm.has_pending(Direction::East, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn east_only_never_fires() {
        let pm = pacemaker(StragglerPolicy::Fail);
        pm.enqueue(Direction::East, 1, 10).unwrap();
        let err = pm.await_quorum(1).await.unwrap_err();
        assert_eq!(
            err,
            PacemakerError::StragglerTimeout {
                step: 1,
                missing: vec![Direction::South]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_steps_never_fire() {
        let pm = pacemaker(StragglerPolicy::Fail);
        pm.enqueue(Direction::East, 1, 10).unwrap();
        pm.enqueue(Direction::South, 2, 20).unwrap();
        assert!(pm.try_take(1).is_none());
        assert!(pm.try_take(2).is_none());
        assert!(pm.await_quorum(1).await.is_err());
        assert!(pm.await_quorum(2).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_late_arrival() {
        let pm = pacemaker(StragglerPolicy::Fail);
        let waiter = tokio::spawn({
            let pm = Arc::clone(&pm);
            async move { pm.await_quorum(3).await }
        });
        tokio::task::yield_now().await;

        pm.enqueue(Direction::South, 3, 30).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        pm.enqueue(Direction::East, 3, 31).unwrap();

        let inputs = waiter.await.unwrap().unwrap();
        assert_eq!((inputs.east, inputs.south), (31, 30));
    }

    #[tokio::test(start_paused = true)]
    async fn later_step_waits_for_its_own_quorum() {
        let pm = pacemaker(StragglerPolicy::Fail);
        pm.enqueue(Direction::East, 1, 1).unwrap();
        pm.enqueue(Direction::South, 1, 1).unwrap();
        pm.enqueue(Direction::East, 2, 2).unwrap();
        assert!(pm.try_take(1).is_some());
        assert!(pm.has_pending(Direction::East, 2));
        pm.enqueue(Direction::South, 2, 2).unwrap();
        assert_eq!(pm.try_take(2).map(|q| q.east), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_policy_substitutes_previous() {
        let pm = pacemaker(StragglerPolicy::ReusePrevious);
        pm.enqueue(Direction::East, 1, 10).unwrap();
        pm.enqueue(Direction::South, 1, 20).unwrap();
        pm.await_quorum(1).await.unwrap();

        pm.enqueue(Direction::East, 2, 11).unwrap();
        let inputs = pm.await_quorum(2).await.unwrap();
        assert_eq!((inputs.east, inputs.south), (11, 20));
        assert_eq!(inputs.degraded, vec![Direction::South]);
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_policy_fails_without_history() {
        let pm = pacemaker(StragglerPolicy::ReusePrevious);
        pm.enqueue(Direction::East, 1, 10).unwrap();
        assert!(pm.await_quorum(1).await.is_err());
    }

    #[test]
    fn rejects_non_source_directions() {
        let pm = pacemaker(StragglerPolicy::Fail);
        assert_eq!(
            pm.enqueue(Direction::West, 1, 0),
            Err(PacemakerError::NotOperandSource(Direction::West))
        );
    }

    #[test]
    fn discard_clears_direction() {
        let pm = pacemaker(StragglerPolicy::Fail);
        pm.enqueue(Direction::South, 4, 1).unwrap();
        pm.discard_direction(Direction::South);
        assert!(!pm.has_pending(Direction::South, 4));
    }

    #[test]
    fn pending_window_is_bounded() {
        let pm = pacemaker(StragglerPolicy::Fail);
        for step in 0..20 {
            pm.enqueue(Direction::East, step, step as u32).unwrap();
        }
        assert!(!pm.has_pending(Direction::East, 0));
        assert!(pm.has_pending(Direction::East, 19));
    }

    #[test]
    fn policy_parses() {
        assert_eq!("fail".parse::<StragglerPolicy>().unwrap(), StragglerPolicy::Fail);
        assert_eq!("REUSE".parse::<StragglerPolicy>().unwrap(), StragglerPolicy::ReusePrevious);
        assert!("skip".parse::<StragglerPolicy>().is_err());
    }
}
