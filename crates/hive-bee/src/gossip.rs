//! Flag gossip over the mesh.

use std::sync::Arc;

use hive_immune::{Blacklist, FlagDecision, GossipFlag, GossipRouter};
use hive_topology::Direction;
use tracing::{debug, info, warn};

use crate::mesh::MeshService;
use crate::protocol::PeerMessage;

/// Raises and relays malicious-peer flags.
pub struct FlagManager {
    router: GossipRouter,
    mesh: Arc<MeshService>,
}

impl FlagManager {
    pub fn new(router: GossipRouter, mesh: Arc<MeshService>) -> Self {
        Self { router, mesh }
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        self.router.blacklist()
    }

    /// Blacklist `target_id` and flag it to every neighbor.
    ///
    /// Returns the number of neighbors reached.
    pub async fn report_malice(&self, target_id: &str, reason: &str) -> usize {
        let flag = self.router.originate(target_id, reason);
        let reached = self.mesh.broadcast(&PeerMessage::GossipFlag(flag), None).await;
        if reached == 0 {
            warn!(target = %target_id, "No neighbors to flag to");
        }
        debug!(reached, "Flag broadcast");
        reached
    }

    /// Absorb a flag from a neighbor and relay it if hops remain.
    ///
    /// Returns the number of neighbors it was relayed to.
    pub async fn handle_flag(&self, flag: GossipFlag, from: Option<Direction>) -> usize {
        match self.router.receive(flag) {
            FlagDecision::Duplicate | FlagDecision::Absorbed => 0,
            FlagDecision::Forward(next) => {
                info!(
                    target = %next.target_id,
                    hops = next.hops_remaining,
                    "Relaying flag"
                );
                self.mesh
                    .broadcast(&PeerMessage::GossipFlag(next), from)
                    .await
            }
        }
    }
}
