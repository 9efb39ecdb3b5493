//! Wire protocol for the controller link and mesh links.
//!
//! Both links carry newline-delimited JSON objects tagged by `"type"`.
//! Beacons travel as single UDP datagrams of the same encoding.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hive_consensus::{ClusterSnapshot, VoteRequest, VoteResponse};
use hive_immune::GossipFlag;
use hive_topology::{Direction, GridCoord, OPERAND_SINKS, OPERAND_SOURCES};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::metrics::NodeMetrics;

/// Role assigned by the controller, or taken on after promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BeeRole {
    Worker,
    Prince,
    QueenActing,
}

impl fmt::Display for BeeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "WORKER"),
            Self::Prince => write!(f, "PRINCE"),
            Self::QueenActing => write!(f, "QUEEN_ACTING"),
        }
    }
}

/// Where a neighbor's mesh listener can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub port: u16,
}

impl ConnectionInfo {
    /// Resolve to a socket address.
    ///
    /// Accepts IPv4-mapped IPv6 text (`::ffff:10.0.0.2`) and `localhost`.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = self.ip.trim();
        let ip = ip.strip_prefix("::ffff:").unwrap_or(ip);
        let ip: IpAddr = if ip.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            ip.parse()
                .map_err(|_| Error::Protocol(format!("bad neighbor ip {:?}", self.ip)))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn default_steps() -> u32 {
    1
}

/// Messages on the controller link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Controller presence advertisement (UDP)
    #[serde(rename_all = "camelCase")]
    Beacon {
        queen_ip: String,
        hive_port: u16,
        hive_version: String,
        timestamp: f64,
    },

    #[serde(rename_all = "camelCase")]
    Handshake {
        bee_id: String,
        metrics: NodeMetrics,
        p2p_port: u16,
    },

    Ack {
        status: String,
        coordinates: GridCoord,
        role: BeeRole,
    },

    #[serde(rename_all = "camelCase")]
    Heartbeat { bee_id: String, metrics: NodeMetrics },

    /// Consensus replication of the cluster snapshot
    #[serde(rename_all = "camelCase")]
    AppendEntries {
        term: u64,
        leader_id: String,
        hive_state: ClusterSnapshot,
    },

    #[serde(rename_all = "camelCase")]
    BlockAssignment {
        job_id: String,
        block_id: u32,
        total_blocks: u32,
        data: String,
    },

    /// One GLS cell of a block; `cell` routes it through the controller
    #[serde(rename_all = "camelCase")]
    ShardAssignment {
        job_id: String,
        block_id: u32,
        total_blocks: u32,
        task_id: u32,
        data_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cell: Option<GridCoord>,
        fragment: serde_json::Value,
        #[serde(default = "default_steps")]
        steps: u32,
    },

    /// The worker at `cell` dropped its shard
    #[serde(rename_all = "camelCase")]
    ShardLost {
        job_id: String,
        block_id: u32,
        cell: GridCoord,
    },

    #[serde(rename_all = "camelCase")]
    NeighborUpdate {
        direction: Direction,
        connection_info: ConnectionInfo,
    },

    #[serde(rename_all = "camelCase")]
    Goodbye { bee_id: String },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Beacon { .. } => "BEACON",
            Self::Handshake { .. } => "HANDSHAKE",
            Self::Ack { .. } => "ACK",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::AppendEntries { .. } => "APPEND_ENTRIES",
            Self::BlockAssignment { .. } => "BLOCK_ASSIGNMENT",
            Self::ShardAssignment { .. } => "SHARD_ASSIGNMENT",
            Self::ShardLost { .. } => "SHARD_LOST",
            Self::NeighborUpdate { .. } => "NEIGHBOR_UPDATE",
            Self::Goodbye { .. } => "GOODBYE",
        }
    }
}

/// Which Cannon operand a pulse carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// Shifts west, arrives from EAST
    A,
    /// Shifts north, arrives from SOUTH
    B,
}

impl Operand {
    /// Direction this operand is sent toward.
    pub const fn sink(self) -> Direction {
        OPERAND_SINKS[self.index()]
    }

    /// Direction this operand arrives from.
    pub const fn source(self) -> Direction {
        OPERAND_SOURCES[self.index()]
    }

    const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Messages on mesh links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    /// First message on every mesh connection, in both directions
    #[serde(rename = "P2P_HANDSHAKE", rename_all = "camelCase")]
    P2pHandshake {
        bee_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coord: Option<GridCoord>,
        /// Slot the sender files this connection under
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },

    /// Systolic operand shift
    #[serde(rename_all = "camelCase")]
    PulseData {
        bee_id: String,
        step: u64,
        operand: Operand,
        payload: serde_json::Value,
        attestation: String,
    },

    GossipFlag(GossipFlag),

    RequestVote(VoteRequest),

    VoteResponse(VoteResponse),
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::P2pHandshake { .. } => "P2P_HANDSHAKE",
            Self::PulseData { .. } => "PULSE_DATA",
            Self::GossipFlag(_) => "GOSSIP_FLAG",
            Self::RequestVote(_) => "REQUEST_VOTE",
            Self::VoteResponse(_) => "VOTE_RESPONSE",
        }
    }
}

/// Bytes a pulse attestation covers: step, operand and payload.
pub fn pulse_signing_bytes(
    step: u64,
    operand: Operand,
    payload: &serde_json::Value,
) -> Result<Vec<u8>> {
    let mut bytes = format!("{}:{}:", step, operand).into_bytes();
    serde_json::to_writer(&mut bytes, payload)?;
    Ok(bytes)
}

/// Serialize `message` as one line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line.
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(line)?)
}

/// Write `message` followed by a newline.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(&encode_line(message)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Newline framing over a byte stream.
///
/// [`LineReader::next_line`] is cancel safe: bytes read before a cancelled
/// call stay buffered and complete the line on the next call.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next non-blank line without its terminator, or `None` at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let n = self.inner.read_until(b'\n', &mut self.buf).await?;
            if n == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            let mut line = std::mem::take(&mut self.buf);
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Ok(Some(line));
            }
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Next line parsed as `T`.
    pub async fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next_line().await? {
            Some(line) => Ok(Some(decode_line(&line)?)),
            None => Ok(None),
        }
    }
}
