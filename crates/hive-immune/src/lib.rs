//! Hive Immune Layer
//!
//! Defences against peers that return tampered results:
//!
//! - [`Blacklist`]: append-only Bloom filter of banned bee ids
//! - [`Attestor`]: keyed-hash attestation binding a result to its producer
//! - [`GossipRouter`]: dedup and hop-budget decisions for malice reports
//!
//! ```text
//!   verify fails ──► originate ──► Blacklist.add
//!                        │
//!                        ▼
//!                 GOSSIP_FLAG(ttl) ──► neighbors ──► receive ──► Forward(ttl-1)
//!                                                       │
//!                                                       └─► Duplicate / Absorbed
//! ```
//!
//! Nothing here touches the network.

mod attestation;
mod blacklist;
mod error;
mod gossip;

pub use attestation::{Attestation, Attestor};
pub use blacklist::{Blacklist, BloomFilter, DEFAULT_EXPECTED_IDS, DEFAULT_FP_RATE};
pub use error::{ImmuneError, Result};
pub use gossip::{
    FlagDecision, GossipFlag, GossipRouter, SeenCache, DEFAULT_DEDUP_WINDOW, DEFAULT_GOSSIP_TTL,
};
