//! Consensus state and the replicated cluster snapshot.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Raft role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => write!(f, "FOLLOWER"),
            Self::Candidate => write!(f, "CANDIDATE"),
            Self::Leader => write!(f, "LEADER"),
        }
    }
}

/// A node eligible to vote in standby-controller elections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voter {
    /// Bee id of the voter
    pub id: String,
    /// Mesh listener address that answers vote requests
    pub addr: SocketAddr,
}

/// Controller-visible cluster state, replicated wholesale to standbys.
///
/// Followers treat this as read-only; each accepted replication replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSnapshot {
    /// Grid occupancy: bee id per cell, `None` for empty cells
    pub grid: Vec<Vec<Option<String>>>,
    /// Number of bees registered with the controller
    pub bee_count: usize,
    /// Standby nodes that take part in elections
    pub voters: Vec<Voter>,
}

/// Per-node Raft state.
#[derive(Debug, Clone)]
pub struct ConsensusState {
    /// Current term (never decreases)
    pub term: u64,
    /// Current role
    pub role: Role,
    /// Candidate granted our vote in `term`, if any
    pub voted_for: Option<String>,
    /// Leader of `term`, if known
    pub leader_id: Option<String>,
    /// Last time a leader or candidate reset our election timer
    pub last_heartbeat_at: Instant,
    /// Randomized timeout for the current timer period
    pub election_timeout: Duration,
    /// Last replicated cluster snapshot
    pub shadow_state: ClusterSnapshot,
}

impl ConsensusState {
    /// Fresh follower state at term 0.
    pub fn new(election_timeout: Duration) -> Self {
        Self {
            term: 0,
            role: Role::Follower,
            voted_for: None,
            leader_id: None,
            last_heartbeat_at: Instant::now(),
            election_timeout,
            shadow_state: ClusterSnapshot::default(),
        }
    }

    /// Whether the election timer has run out.
    pub fn timer_expired(&self) -> bool {
        self.last_heartbeat_at.elapsed() > self.election_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_controller_shape() {
        let json = r#"{"grid":[["bee-a",null],[null,null]],"beeCount":1}"#;
        let snap: ClusterSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.bee_count, 1);
        assert_eq!(snap.grid[0][0].as_deref(), Some("bee-a"));
        assert!(snap.voters.is_empty());
    }

    #[test]
    fn snapshot_parses_voters() {
        let json = r#"{"voters":[{"id":"bee-b","addr":"127.0.0.1:9100"}]}"#;
        let snap: ClusterSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.voters.len(), 1);
        assert_eq!(snap.voters[0].addr.port(), 9100);
    }
}
