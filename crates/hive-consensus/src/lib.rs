//! Standby-Controller Consensus
//!
//! Standby nodes ("princes") shadow the controller's cluster state and elect
//! one of themselves to act as controller when the controller's replication
//! heartbeat stops.
//!
//! # Model
//!
//! This is Raft's leader election with the log replaced by a snapshot:
//!
//! - **Replication**: each accepted message overwrites the whole
//!   [`ClusterSnapshot`]; there is no history to reconcile.
//! - **Election**: on timeout a follower becomes candidate at `term + 1`,
//!   votes for itself, and asks every voter in the snapshot for a vote.
//! - **Safety**: one vote per term per node, and leadership only with a
//!   strict majority of the electorate frozen at election start.
//!
//! # Known Limits
//!
//! Snapshots must be self-contained and idempotent. If partial updates are
//! ever needed, a replicated log has to come back.

mod error;
mod manager;
mod quorum;
mod rpc;
mod state;

pub use error::{ConsensusError, Result};
pub use manager::{ConsensusConfig, ConsensusManager, Promotion};
pub use quorum::{has_majority, majority};
pub use rpc::{VoteRequest, VoteResponse, VoteTransport};
pub use state::{ClusterSnapshot, ConsensusState, Role, Voter};
