//! Bee configuration, read from `HIVE_*` environment variables.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use hive_consensus::ConsensusConfig;
use hive_immune::{Attestor, DEFAULT_GOSSIP_TTL};
use hive_topology::is_odd_prime;

use crate::error::{Error, Result};
use crate::pacemaker::StragglerPolicy;

/// Version advertised in beacons.
pub const HIVE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP port for controller beacons.
pub const DEFAULT_DISCOVERY_PORT: u16 = 41234;

/// How often the election monitor checks its timer.
pub const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound on a single vote request.
pub const VOTE_TIMEOUT: Duration = Duration::from_millis(100);

/// Time an incoming mesh connection has to send `P2P_HANDSHAKE`.
pub const HANDSHAKE_GRACE: Duration = Duration::from_secs(5);

/// Bound on the farewell and mesh teardown during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Beacon period while acting as controller.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for a bee.
#[derive(Debug, Clone)]
pub struct BeeConfig {
    /// UDP port beacons arrive on
    pub discovery_port: u16,

    /// Controller address; skips discovery when set
    pub queen_addr: Option<String>,

    /// Mesh listener bind address
    pub mesh_addr: SocketAddr,

    /// Longest gap between heartbeats
    pub heartbeat_interval: Duration,

    /// Relative metrics change that forces an early heartbeat
    pub spike_threshold: f64,

    /// Longest wait on the controller link before checking heartbeats
    pub heartbeat_check: Duration,

    /// Range the election timeout is drawn from
    pub election_timeout: RangeInclusive<Duration>,

    /// GLS size for block sub-sharding (odd prime)
    pub lead_grid: usize,

    /// Hops on locally raised gossip flags
    pub gossip_ttl: u32,

    /// How long the pacemaker waits for a straggler
    pub straggler_timeout: Duration,

    pub straggler_policy: StragglerPolicy,

    /// Cluster attestation key
    pub attestor: Attestor,

    /// Reported free VRAM in MB
    pub vram_free_mb: f64,
}

impl BeeConfig {
    /// Read config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read config through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let discovery_port = parse_or(&get, "HIVE_DISCOVERY_PORT", DEFAULT_DISCOVERY_PORT)?;
        let queen_addr = get("HIVE_QUEEN_ADDR").map(|s| s.trim().to_string());
        let mesh_addr = parse_or(&get, "HIVE_MESH_ADDR", SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let heartbeat_interval = Duration::from_secs(parse_or(&get, "HIVE_HEARTBEAT_SECS", 60u64)?);
        let spike_threshold: f64 = parse_or(&get, "HIVE_SPIKE_THRESHOLD", 0.05)?;
        if !(spike_threshold > 0.0) {
            return Err(Error::Config(format!(
                "HIVE_SPIKE_THRESHOLD must be positive, got {}",
                spike_threshold
            )));
        }
        let heartbeat_check =
            Duration::from_millis(parse_or(&get, "HIVE_HEARTBEAT_CHECK_MS", 1000u64)?);
        if heartbeat_check.is_zero() {
            return Err(Error::Config("HIVE_HEARTBEAT_CHECK_MS must be non-zero".into()));
        }

        let election_timeout = match get("HIVE_ELECTION_TIMEOUT_MS") {
            Some(text) => parse_range_ms(&text)?,
            None => Duration::from_millis(150)..=Duration::from_millis(300),
        };

        let lead_grid = parse_or(&get, "HIVE_LEAD_GRID", 3usize)?;
        if !is_odd_prime(lead_grid) {
            return Err(Error::Config(format!(
                "HIVE_LEAD_GRID must be an odd prime, got {}",
                lead_grid
            )));
        }

        let gossip_ttl = parse_or(&get, "HIVE_GOSSIP_TTL", DEFAULT_GOSSIP_TTL)?;
        let straggler_timeout =
            Duration::from_millis(parse_or(&get, "HIVE_STRAGGLER_MS", 5000u64)?);
        let straggler_policy = parse_or(&get, "HIVE_STRAGGLER_POLICY", StragglerPolicy::Fail)?;

        let attestor = match get("HIVE_ATTESTATION_KEY") {
            Some(key) => Attestor::from_hex_key(&key)
                .map_err(|e| Error::Config(format!("HIVE_ATTESTATION_KEY: {}", e)))?,
            None => Attestor::default(),
        };

        let vram_free_mb = parse_or(&get, "HIVE_VRAM_FREE_MB", 8000.0)?;

        Ok(Self {
            discovery_port,
            queen_addr,
            mesh_addr,
            heartbeat_interval,
            spike_threshold,
            heartbeat_check,
            election_timeout,
            lead_grid,
            gossip_ttl,
            straggler_timeout,
            straggler_policy,
            attestor,
            vram_free_mb,
        })
    }

    /// Election timing for the consensus manager.
    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            election_timeout: self.election_timeout.clone(),
            poll_interval: ELECTION_POLL_INTERVAL,
            vote_timeout: VOTE_TIMEOUT,
        }
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(text) => text
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}={:?}: {}", name, text, e))),
        None => Ok(default),
    }
}

/// `"150-300"` or `"200"`, in milliseconds.
fn parse_range_ms(text: &str) -> Result<RangeInclusive<Duration>> {
    let bad = || Error::Config(format!("Invalid HIVE_ELECTION_TIMEOUT_MS={:?}", text));
    let (lo, hi) = match text.split_once('-') {
        Some((lo, hi)) => (lo.trim(), hi.trim()),
        None => (text.trim(), text.trim()),
    };
    let lo: u64 = lo.parse().map_err(|_| bad())?;
    let hi: u64 = hi.parse().map_err(|_| bad())?;
    if lo == 0 || hi < lo {
        return Err(bad());
    }
    Ok(Duration::from_millis(lo)..=Duration::from_millis(hi))
}
