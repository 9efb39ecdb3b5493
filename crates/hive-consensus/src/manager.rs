//! The consensus manager: replication acceptance, voting, elections.
//!
//! # State Machine
//!
//! ```text
//!            timeout                 majority of electorate
//! FOLLOWER ──────────▶ CANDIDATE ──────────────────────────▶ LEADER
//!    ▲                  │    ▲ │                               │
//!    │  term >= current │    │ └── timeout: new election ──────┘ (never)
//!    └──────────────────┘    └──── (term + 1)
//!    ▲                                                           │
//!    └──────────── replication with term > current ──────────────┘
//! ```
//!
//! A LEADER never yields to an equal-term replication; that is reported as
//! [`ConsensusError::SplitBrain`].

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConsensusError, Result};
use crate::quorum::has_majority;
use crate::rpc::{VoteRequest, VoteResponse, VoteTransport};
use crate::state::{ClusterSnapshot, ConsensusState, Role, Voter};

/// Timing knobs for the election monitor.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Range the randomized election timeout is drawn from
    pub election_timeout: RangeInclusive<Duration>,
    /// How often the monitor checks the timer
    pub poll_interval: Duration,
    /// Per-request bound on vote RPCs
    pub vote_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150)..=Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            vote_timeout: Duration::from_millis(100),
        }
    }
}

impl ConsensusConfig {
    fn random_timeout(&self) -> Duration {
        let (lo, hi) = (*self.election_timeout.start(), *self.election_timeout.end());
        if hi <= lo {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }
}

/// Emitted once each time this node wins an election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub term: u64,
}

/// Ballot box for one election.
#[derive(Debug)]
struct Election {
    term: u64,
    /// Frozen at election start, self included
    electorate: HashSet<String>,
    votes: HashSet<String>,
}

struct Inner {
    state: ConsensusState,
    election: Option<Election>,
}

/// Raft-style standby-controller election without a log.
///
/// Replication carries a whole [`ClusterSnapshot`] instead of log entries.
pub struct ConsensusManager {
    self_id: String,
    config: ConsensusConfig,
    inner: Mutex<Inner>,
    transport: Arc<dyn VoteTransport>,
    promotions: mpsc::UnboundedSender<Promotion>,
}

impl ConsensusManager {
    /// Create a follower at term 0.
    ///
    /// The returned receiver yields one [`Promotion`] per won election.
    pub fn new(
        self_id: impl Into<String>,
        config: ConsensusConfig,
        transport: Arc<dyn VoteTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<Promotion>) {
        let (promotions, rx) = mpsc::unbounded_channel();
        let state = ConsensusState::new(config.random_timeout());
        let manager = Self {
            self_id: self_id.into(),
            config,
            inner: Mutex::new(Inner { state, election: None }),
            transport,
            promotions,
        };
        (manager, rx)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().state.term
    }

    pub fn role(&self) -> Role {
        self.inner.lock().state.role
    }

    pub fn leader_id(&self) -> Option<String> {
        self.inner.lock().state.leader_id.clone()
    }

    pub fn voted_for(&self) -> Option<String> {
        self.inner.lock().state.voted_for.clone()
    }

    /// Copy of the last replicated snapshot.
    pub fn shadow_state(&self) -> ClusterSnapshot {
        self.inner.lock().state.shadow_state.clone()
    }

    /// Copy of the full state (for diagnostics).
    pub fn snapshot(&self) -> ConsensusState {
        self.inner.lock().state.clone()
    }

    /// Apply a replication message (AppendEntries without a log).
    ///
    /// Returns `Ok(false)` without touching state when `term` is stale,
    /// `Ok(true)` when accepted, and [`ConsensusError::SplitBrain`] when
    /// another node claims the term this node leads.
    pub fn process_replication(
        &self,
        term: u64,
        leader_id: &str,
        snapshot: ClusterSnapshot,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let current = inner.state.term;

        if term < current {
            debug!(term, current, leader_id, "Rejected stale replication");
            return Ok(false);
        }

        // A leader only yields to a strictly newer term
        if term == current && inner.state.role == Role::Leader {
            if leader_id == self.self_id {
                debug!(term, "Ignoring replication echo of own leadership");
                return Ok(true);
            }
            error!(term, leader_id, self_id = %self.self_id, "Two leaders claim the same term");
            return Err(ConsensusError::SplitBrain {
                term,
                leader_id: leader_id.to_string(),
                self_id: self.self_id.clone(),
            });
        }

        if inner.state.role != Role::Follower {
            info!(term, leader_id, from = %inner.state.role, "Stepping down to follower");
        }
        if term > current {
            inner.state.voted_for = None;
        }

        inner.state.role = Role::Follower;
        inner.state.term = term;
        inner.state.leader_id = Some(leader_id.to_string());
        inner.state.shadow_state = snapshot;
        inner.election = None;
        self.reset_timer(&mut inner.state);
        Ok(true)
    }

    /// Answer a vote request. At most one candidate gets our vote per term.
    pub fn handle_vote_request(&self, request: &VoteRequest) -> VoteResponse {
        let mut inner = self.inner.lock();

        if request.term < inner.state.term {
            return VoteResponse {
                term: inner.state.term,
                voter_id: self.self_id.clone(),
                granted: false,
            };
        }

        if request.term > inner.state.term {
            Self::step_down(&mut inner, request.term);
        }

        let granted = match inner.state.voted_for.as_deref() {
            None => true,
            Some(id) => id == request.candidate_id,
        };
        if granted {
            inner.state.voted_for = Some(request.candidate_id.clone());
            self.reset_timer(&mut inner.state);
        }

        debug!(
            term = request.term,
            candidate = %request.candidate_id,
            granted,
            "Handled vote request"
        );

        VoteResponse {
            term: inner.state.term,
            voter_id: self.self_id.clone(),
            granted,
        }
    }

    /// Count a vote response for the running election.
    ///
    /// Stale terms, unknown voters and repeated votes do not change the tally.
    pub fn handle_vote_response(&self, response: VoteResponse) {
        let mut inner = self.inner.lock();

        if response.term > inner.state.term {
            info!(
                term = response.term,
                voter = %response.voter_id,
                "Saw newer term in vote response"
            );
            Self::step_down(&mut inner, response.term);
            return;
        }

        let term = inner.state.term;
        let is_candidate = inner.state.role == Role::Candidate;
        let Some(election) = inner.election.as_mut() else {
            return;
        };
        if !is_candidate || election.term != term || response.term != term {
            return;
        }
        if !response.granted || !election.electorate.contains(&response.voter_id) {
            return;
        }

        election.votes.insert(response.voter_id);
        self.try_become_leader(&mut inner);
    }

    /// Begin a new election at `term + 1`.
    ///
    /// Vote requests are fire-and-forget tasks; this never waits on the network.
    /// Returns the new term.
    pub fn start_election(self: &Arc<Self>) -> u64 {
        let (request, peers, won) = {
            let mut inner = self.inner.lock();
            inner.state.term += 1;
            inner.state.role = Role::Candidate;
            inner.state.voted_for = Some(self.self_id.clone());
            inner.state.leader_id = None;
            self.reset_timer(&mut inner.state);

            let term = inner.state.term;
            let peers: Vec<Voter> = inner
                .state
                .shadow_state
                .voters
                .iter()
                .filter(|v| v.id != self.self_id)
                .cloned()
                .collect();

            let mut electorate: HashSet<String> = peers.iter().map(|v| v.id.clone()).collect();
            electorate.insert(self.self_id.clone());
            let votes = HashSet::from([self.self_id.clone()]);

            info!(term, electorate = electorate.len(), "Leader heartbeat lost, starting election");
            inner.election = Some(Election { term, electorate, votes });

            let won = self.try_become_leader(&mut inner);
            let request = VoteRequest {
                term,
                candidate_id: self.self_id.clone(),
            };
            (request, peers, won)
        };

        let term = request.term;
        if won {
            return term;
        }

        for voter in peers {
            let this = Arc::clone(self);
            let request = request.clone();
            tokio::spawn(async move {
                let call = this.transport.request_vote(&voter, request);
                match tokio::time::timeout(this.config.vote_timeout, call).await {
                    Ok(Ok(response)) => this.handle_vote_response(response),
                    Ok(Err(e)) => debug!(voter = %voter.id, "Vote request failed: {}", e),
                    Err(_) => debug!(voter = %voter.id, "Vote request timed out"),
                }
            });
        }

        term
    }

    /// Whether a non-leader's election timer has expired.
    pub fn election_due(&self) -> bool {
        let inner = self.inner.lock();
        inner.state.role != Role::Leader && inner.state.timer_expired()
    }

    /// Restart the election timer with a fresh timeout, e.g. when the monitor
    /// starts long after construction.
    pub fn reset_election_timer(&self) {
        let mut inner = self.inner.lock();
        self.reset_timer(&mut inner.state);
    }

    /// Poll the election timer until `cancel` fires.
    ///
    /// A partitioned candidate keeps re-electing at increasing terms.
    pub async fn run_election_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Election monitor stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if self.election_due() {
                self.start_election();
            }
        }
    }

    fn reset_timer(&self, state: &mut ConsensusState) {
        state.last_heartbeat_at = Instant::now();
        state.election_timeout = self.config.random_timeout();
    }

    fn step_down(inner: &mut Inner, term: u64) {
        inner.state.term = term;
        inner.state.role = Role::Follower;
        inner.state.voted_for = None;
        inner.state.leader_id = None;
        inner.election = None;
    }

    fn try_become_leader(&self, inner: &mut Inner) -> bool {
        let Some(election) = inner.election.as_ref() else {
            return false;
        };
        if inner.state.role != Role::Candidate || election.term != inner.state.term {
            return false;
        }
        if !has_majority(election.votes.len(), election.electorate.len()) {
            return false;
        }

        let term = election.term;
        let votes = election.votes.len();
        inner.state.role = Role::Leader;
        inner.state.leader_id = Some(self.self_id.clone());
        inner.election = None;

        info!(term, votes, "Won election");
        if self.promotions.send(Promotion { term }).is_err() {
            warn!(term, "Promotion receiver dropped");
        }
        true
    }
}
