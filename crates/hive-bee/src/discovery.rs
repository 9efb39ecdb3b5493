//! Controller discovery over UDP beacons, and the beacon broadcaster a
//! promoted bee runs.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BEACON_INTERVAL, HIVE_VERSION};
use crate::error::{Error, Result};
use crate::protocol::ControlMessage;

/// Largest beacon datagram accepted.
const MAX_BEACON_SIZE: usize = 2048;

/// Bind a UDP socket with address reuse, so several bees on one host can
/// listen on the shared beacon port.
fn bind_udp(addr: SocketAddr, broadcast: bool) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Controller address advertised by a beacon datagram.
///
/// An unparsable `queenIp` falls back to the datagram's source address.
pub fn parse_beacon(datagram: &[u8], source: SocketAddr) -> Option<SocketAddr> {
    let Ok(ControlMessage::Beacon {
        queen_ip,
        hive_port,
        hive_version,
        ..
    }) = serde_json::from_slice::<ControlMessage>(datagram)
    else {
        return None;
    };
    let ip = queen_ip
        .strip_prefix("::ffff:")
        .unwrap_or(&queen_ip)
        .parse::<IpAddr>()
        .unwrap_or_else(|_| source.ip());
    debug!(%ip, hive_port, %hive_version, "Beacon received");
    Some(SocketAddr::new(ip, hive_port))
}

/// Wait for a controller beacon on `port`.
pub async fn discover_queen(port: u16, cancel: &CancellationToken) -> Result<SocketAddr> {
    let socket = bind_udp(SocketAddr::from(([0, 0, 0, 0], port)), false)?;
    info!("Listening for controller beacon on UDP {}", port);

    let mut buf = vec![0u8; MAX_BEACON_SIZE];
    loop {
        let (len, source) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Network("discovery cancelled".into()));
            }
            received = socket.recv_from(&mut buf) => received?,
        };
        match parse_beacon(&buf[..len], source) {
            Some(addr) => {
                info!("Discovered controller at {}", addr);
                return Ok(addr);
            }
            None => debug!(%source, "Ignoring non-beacon datagram"),
        }
    }
}

/// Periodic beacon of a bee acting as controller. Starts at most once.
#[derive(Debug, Default)]
pub struct BeaconBroadcaster {
    started: AtomicBool,
}

impl BeaconBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Broadcast `advertise` to `discovery_port` every beacon interval until
    /// `cancel` fires. Returns false if already started.
    pub fn start(
        &self,
        advertise: SocketAddr,
        discovery_port: u16,
        cancel: CancellationToken,
    ) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), discovery_port);
        tokio::spawn(async move {
            if let Err(e) = run_beacon(advertise, target, cancel).await {
                warn!("Beacon broadcaster stopped: {}", e);
            }
        });
        true
    }
}

fn beacon_datagram(advertise: SocketAddr) -> Result<Vec<u8>> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);
    Ok(serde_json::to_vec(&ControlMessage::Beacon {
        queen_ip: advertise.ip().to_string(),
        hive_port: advertise.port(),
        hive_version: HIVE_VERSION.to_string(),
        timestamp,
    })?)
}

async fn run_beacon(
    advertise: SocketAddr,
    target: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = bind_udp(SocketAddr::from(([0, 0, 0, 0], 0)), true)?;
    info!(%advertise, %target, "Beacon broadcaster active");

    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Beacon broadcaster stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }
        let datagram = beacon_datagram(advertise)?;
        if let Err(e) = socket.send_to(&datagram, target).await {
            warn!("Beacon send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SocketAddr {
        "192.168.1.50:41234".parse().unwrap()
    }

    #[test]
    fn parses_controller_beacon() {
        let datagram = br#"{"type":"BEACON","queenIp":"10.0.0.7","hivePort":41234,"hiveVersion":"0.1.0-alpha","timestamp":1700000000000}"#;
        assert_eq!(
            parse_beacon(datagram, source()),
            Some("10.0.0.7:41234".parse().unwrap())
        );
    }

    #[test]
    fn bad_ip_falls_back_to_source() {
        let datagram = br#"{"type":"BEACON","queenIp":"queen.local","hivePort":8080,"hiveVersion":"x","timestamp":1.5}"#;
        assert_eq!(
            parse_beacon(datagram, source()),
            Some("192.168.1.50:8080".parse().unwrap())
        );
    }

    #[test]
    fn ignores_other_datagrams() {
        assert!(parse_beacon(b"not json", source()).is_none());
        assert!(parse_beacon(br#"{"type":"GOODBYE","beeId":"b"}"#, source()).is_none());
    }

    #[test]
    fn own_beacon_parses_back() {
        let addr: SocketAddr = "10.9.8.7:5555".parse().unwrap();
        let datagram = beacon_datagram(addr).unwrap();
        assert_eq!(parse_beacon(&datagram, source()), Some(addr));
    }

    #[tokio::test]
    async fn broadcaster_starts_once() {
        let beacon = BeaconBroadcaster::new();
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(beacon.start(addr, 1, cancel.clone()));
        assert!(!beacon.start(addr, 1, cancel.clone()));
        assert!(beacon.is_started());
        cancel.cancel();
    }

    #[tokio::test]
    async fn discovery_receives_beacon() {
        let cancel = CancellationToken::new();
        // Find a free port, then listen on it with reuse
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let listen = tokio::spawn({
            let cancel = cancel.clone();
            async move { discover_queen(port, &cancel).await }
        });

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = beacon_datagram("127.0.0.1:41000".parse().unwrap()).unwrap();
        let found = loop {
            sender.send_to(&datagram, ("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if listen.is_finished() {
                break listen.await.unwrap().unwrap();
            }
        };
        assert_eq!(found, "127.0.0.1:41000".parse().unwrap());
    }

    #[tokio::test]
    async fn discovery_cancels() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert!(discover_queen(port, &cancel).await.is_err());
    }
}
