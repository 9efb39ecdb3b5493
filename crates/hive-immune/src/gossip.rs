//! Malice gossip: flag format, dedup and TTL decisions.
//!
//! The mesh is a torus, so naive flooding loops forever. Each flag carries a
//! `message_id` and a hop budget:
//!
//! - a bee handles a given `message_id` once within [`DEFAULT_DEDUP_WINDOW`];
//! - a flag that arrives with `hops_remaining == 0` is absorbed, not forwarded;
//! - forwarded copies carry `hops_remaining - 1`.
//!
//! [`GossipRouter`] only decides. Sending is left to the mesh layer, which
//! excludes the direction a flag arrived from.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::blacklist::Blacklist;

/// Hops on a locally originated flag.
pub const DEFAULT_GOSSIP_TTL: u32 = 3;

/// How long a seen `message_id` is remembered.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Report that `target_id` misbehaved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipFlag {
    pub message_id: String,
    pub target_id: String,
    pub reason: String,
    /// Bee that first raised the flag
    pub origin_id: String,
    pub hops_remaining: u32,
}

/// What to do with an incoming flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagDecision {
    /// Already handled this `message_id`
    Duplicate,
    /// Applied locally; hop budget exhausted
    Absorbed,
    /// Applied locally; send this copy onward
    Forward(GossipFlag),
}

/// Time-windowed set of seen message ids.
#[derive(Debug)]
pub struct SeenCache {
    window: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl SeenCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id` at `now`. Returns false if it was already present.
    pub fn insert(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back((now, id.to_string()));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            if let Some((_, id)) = self.order.pop_front() {
                self.seen.remove(&id);
                trace!(message_id = %id, "Evicted gossip id");
            }
        }
    }
}

/// Dedup and TTL bookkeeping for one bee.
#[derive(Debug)]
pub struct GossipRouter {
    self_id: String,
    ttl: u32,
    seen: Mutex<SeenCache>,
    blacklist: Arc<Blacklist>,
}

impl GossipRouter {
    pub fn new(self_id: impl Into<String>, ttl: u32, blacklist: Arc<Blacklist>) -> Self {
        Self::with_window(self_id, ttl, DEFAULT_DEDUP_WINDOW, blacklist)
    }

    pub fn with_window(
        self_id: impl Into<String>,
        ttl: u32,
        window: Duration,
        blacklist: Arc<Blacklist>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            ttl,
            seen: Mutex::new(SeenCache::new(window)),
            blacklist,
        }
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    /// Blacklist `target_id` and build a fresh flag to broadcast.
    pub fn originate(&self, target_id: &str, reason: &str) -> GossipFlag {
        let flag = GossipFlag {
            message_id: new_message_id(),
            target_id: target_id.to_string(),
            reason: reason.to_string(),
            origin_id: self.self_id.clone(),
            hops_remaining: self.ttl,
        };
        self.apply(&flag);
        self.seen.lock().insert(&flag.message_id, Instant::now());
        info!(
            target_id,
            reason,
            message_id = %flag.message_id,
            "Reporting malicious peer"
        );
        flag
    }

    pub fn receive(&self, flag: GossipFlag) -> FlagDecision {
        self.receive_at(flag, Instant::now())
    }

    /// [`GossipRouter::receive`] with an explicit clock.
    pub fn receive_at(&self, flag: GossipFlag, now: Instant) -> FlagDecision {
        if !self.seen.lock().insert(&flag.message_id, now) {
            trace!(message_id = %flag.message_id, "Duplicate gossip flag");
            return FlagDecision::Duplicate;
        }

        self.apply(&flag);

        if flag.hops_remaining == 0 {
            debug!(message_id = %flag.message_id, "Gossip flag absorbed");
            return FlagDecision::Absorbed;
        }

        FlagDecision::Forward(GossipFlag {
            hops_remaining: flag.hops_remaining - 1,
            ..flag
        })
    }

    fn apply(&self, flag: &GossipFlag) {
        if flag.target_id == self.self_id {
            debug!(origin_id = %flag.origin_id, "Ignoring flag against self");
            return;
        }
        if !self.blacklist.contains(&flag.target_id) {
            self.blacklist.add(&flag.target_id);
        }
    }
}

fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn router(id: &str) -> GossipRouter {
        GossipRouter::new(id, DEFAULT_GOSSIP_TTL, Arc::new(Blacklist::default()))
    }

    fn flag(id: &str, hops: u32) -> GossipFlag {
        GossipFlag {
            message_id: id.to_string(),
            target_id: "bee-evil".to_string(),
            reason: "bad attestation".to_string(),
            origin_id: "bee-origin".to_string(),
            hops_remaining: hops,
        }
    }

    #[test]
    fn originate_blacklists_and_uses_ttl() {
        let r = router("bee-a");
        let f = r.originate("bee-evil", "bad attestation");
        assert!(r.blacklist().contains("bee-evil"));
        assert_eq!(f.hops_remaining, DEFAULT_GOSSIP_TTL);
        assert_eq!(f.origin_id, "bee-a");
        assert_eq!(f.message_id.len(), 32);

        // Our own flag echoed back is a duplicate
        assert_eq!(r.receive(f), FlagDecision::Duplicate);
    }

    #[test]
    fn forward_decrements_hops() {
        let r = router("bee-a");
        match r.receive(flag("m1", 2)) {
            FlagDecision::Forward(f) => assert_eq!(f.hops_remaining, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(r.blacklist().contains("bee-evil"));
    }

    #[test]
    fn zero_hops_is_absorbed() {
        let r = router("bee-a");
        assert_eq!(r.receive(flag("m1", 0)), FlagDecision::Absorbed);
        assert!(r.blacklist().contains("bee-evil"));
    }

    #[test]
    fn flag_against_self_is_not_applied() {
        let r = router("bee-evil");
        assert!(matches!(r.receive(flag("m1", 1)), FlagDecision::Forward(_)));
        assert!(!r.blacklist().contains("bee-evil"));
    }

    #[test]
    fn seen_ids_expire_after_window() {
        let r = GossipRouter::with_window(
            "bee-a",
            3,
            Duration::from_secs(10),
            Arc::new(Blacklist::default()),
        );
        let t0 = Instant::now();
        assert!(matches!(r.receive_at(flag("m1", 1), t0), FlagDecision::Forward(_)));
        assert_eq!(
            r.receive_at(flag("m1", 1), t0 + Duration::from_secs(9)),
            FlagDecision::Duplicate
        );
        assert!(matches!(
            r.receive_at(flag("m1", 1), t0 + Duration::from_secs(11)),
            FlagDecision::Forward(_)
        ));
    }

    #[test]
    fn flag_wire_shape() {
        let json = serde_json::to_value(flag("m1", 2)).unwrap();
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["targetId"], "bee-evil");
        assert_eq!(json["hopsRemaining"], 2);
    }

    proptest! {
        #[test]
        fn each_message_forwarded_at_most_once(
            ids in proptest::collection::vec(0u8..8, 1..64),
            hops in 0u32..4,
        ) {
            let r = router("bee-a");
            let mut forwarded = std::collections::HashMap::new();
            for id in ids {
                let id = format!("m{}", id);
                if let FlagDecision::Forward(f) = r.receive(flag(&id, hops)) {
                    prop_assert!(f.hops_remaining < hops);
                    *forwarded.entry(id).or_insert(0) += 1;
                }
            }
            prop_assert!(forwarded.values().all(|&n| n == 1));
            if hops == 0 {
                prop_assert!(forwarded.is_empty());
            }
        }
    }
}
