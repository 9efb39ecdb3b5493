//! Vote RPC messages and the transport seam.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::state::Voter;

/// A candidate asking for a vote in `term`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
}

/// A voter's answer. `term` is the voter's term after handling the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: u64,
    pub voter_id: String,
    pub granted: bool,
}

/// Delivers vote requests to peers.
///
/// Each call is independent. The manager applies its own timeout around the
/// returned future, so implementations need not bound it.
pub trait VoteTransport: Send + Sync + 'static {
    fn request_vote(
        &self,
        voter: &Voter,
        request: VoteRequest,
    ) -> BoxFuture<'static, std::io::Result<VoteResponse>>;
}
