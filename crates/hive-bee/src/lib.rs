//! Hive Bee - Worker Node
//!
//! A compute node of the Hive matrix fabric. A bee finds the controller,
//! takes a grid cell and role, links to its four neighbors and runs
//! systolic multiply steps over that mesh.
//!
//! # Architecture
//!
//! - **Node**: controller session, heartbeats, task wiring
//! - **Mesh**: four directional peer links and the vote listener
//! - **Pacemaker / Systolic**: step-gated Cannon's algorithm
//! - **Lead / Parity**: GLS block sharding with XOR recovery
//! - **Gossip**: malicious-peer flags over the mesh
//! - **Discovery**: UDP beacons in and out
//!
//! # Example
//!
//! ```no_run
//! use hive_bee::{BeeConfig, BeeNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BeeConfig::from_env()?;
//!     let node = BeeNode::new(config);
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod gossip;
pub mod lead;
pub mod mesh;
pub mod metrics;
pub mod node;
pub mod pacemaker;
pub mod parity;
pub mod protocol;
pub mod systolic;

pub use config::BeeConfig;
pub use error::{Error, Result};
pub use mesh::{InboundMessage, LinkKind, MeshEvent, MeshService, TcpVoteTransport};
pub use node::{BeeNode, NodeIdentity};
pub use pacemaker::{Pacemaker, StragglerPolicy};
pub use parity::{ParityBuffer, ParityError};
pub use protocol::{BeeRole, ControlMessage, PeerMessage};
