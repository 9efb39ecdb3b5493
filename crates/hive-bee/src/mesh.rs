//! Directional peer mesh.
//!
//! Each bee owns up to four outbound links, one per [`Direction`], opened
//! only on a controller `NEIGHBOR_UPDATE`. Pulses go out over these links.
//! Neighbors dial us back for their own slots; those inbound connections
//! are mapped to a direction during the `P2P_HANDSHAKE` and their messages
//! are dispatched tagged with it. A newer inbound connection for a
//! direction closes the older one.
//!
//! The listener also answers one-shot `REQUEST_VOTE` connections for the
//! standby election.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use hive_consensus::{ConsensusManager, VoteRequest, VoteResponse, VoteTransport, Voter};
use hive_immune::Blacklist;
use hive_topology::{count_present_neighbors, Direction, GridCoord};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HANDSHAKE_GRACE;
use crate::error::Result;
use crate::protocol::{decode_line, encode_line, write_message, LineReader, PeerMessage};

/// Capacity of the inbound message queue.
pub const INBOUND_CAPACITY: usize = 1024;

const EVENT_CAPACITY: usize = 64;

/// A mesh message together with where it came from.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Slot the connection is mapped to; `None` if the handshake gave no way
    /// to place it
    pub from: Option<Direction>,
    /// Bee id from the connection's handshake
    pub peer_id: String,
    pub message: PeerMessage,
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Outbound,
    Inbound,
}

/// Topology changes other components react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    NeighborLost {
        direction: Direction,
        peer_id: Option<String>,
        kind: LinkKind,
    },
}

struct Link {
    conn_id: u64,
    peer_id: Option<String>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

/// Owner of the four directional slots and the mesh listener.
pub struct MeshService {
    self_id: String,
    coord: RwLock<Option<GridCoord>>,
    slots: Mutex<HashMap<Direction, Link>>,
    /// Newest inbound connection per direction, with its cancel handle
    inbound_links: Mutex<HashMap<Direction, (u64, CancellationToken)>>,
    next_conn: AtomicU64,
    inbound: mpsc::Sender<InboundMessage>,
    events: broadcast::Sender<MeshEvent>,
    blacklist: Arc<Blacklist>,
    consensus: Arc<ConsensusManager>,
    shutdown: CancellationToken,
    local_addr: RwLock<Option<SocketAddr>>,
}

/// Id a message claims to come from, beyond the connection's own.
fn claimed_sender(message: &PeerMessage) -> Option<&str> {
    match message {
        PeerMessage::PulseData { bee_id, .. } => Some(bee_id),
        PeerMessage::GossipFlag(flag) => Some(&flag.origin_id),
        _ => None,
    }
}

impl MeshService {
    /// Create the mesh. The receiver yields every accepted inbound message.
    pub fn new(
        self_id: impl Into<String>,
        blacklist: Arc<Blacklist>,
        consensus: Arc<ConsensusManager>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mesh = Arc::new(Self {
            self_id: self_id.into(),
            coord: RwLock::new(None),
            slots: Mutex::new(HashMap::new()),
            inbound_links: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            inbound,
            events,
            blacklist,
            consensus,
            shutdown: CancellationToken::new(),
            local_addr: RwLock::new(None),
        });
        (mesh, rx)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Record our grid cell; used to place inbound peers that omit a direction.
    pub fn set_coord(&self, coord: GridCoord) {
        *self.coord.write() = Some(coord);
    }

    pub fn coord(&self) -> Option<GridCoord> {
        *self.coord.read()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Bind the mesh listener and start accepting. Returns the bound address.
    pub async fn start_listener(self: &Arc<Self>, bind: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write() = Some(addr);
        info!("Mesh listening on {}", addr);

        let mesh = Arc::clone(self);
        tokio::spawn(async move { mesh.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Mesh listener stopped");
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming mesh connection from {}", addr);
                    let mesh = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = mesh.accept_incoming(stream, addr).await {
                            warn!("Mesh connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Mesh accept error: {}", e);
                }
            }
        }
    }

    fn handshake(&self, direction: Option<Direction>) -> PeerMessage {
        PeerMessage::P2pHandshake {
            bee_id: self.self_id.clone(),
            coord: self.coord(),
            direction,
        }
    }

    /// Handle one inbound connection until it closes.
    async fn accept_incoming(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = LineReader::new(reader);

        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            first = tokio::time::timeout(HANDSHAKE_GRACE, reader.next_line()) => first,
        };
        let line = match first {
            Err(_) => {
                warn!("No handshake from {} within {:?}, dropping", addr, HANDSHAKE_GRACE);
                return Ok(());
            }
            Ok(line) => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
        };

        match decode_line::<PeerMessage>(&line) {
            Ok(PeerMessage::RequestVote(request)) => {
                let response = self.consensus.handle_vote_request(&request);
                write_message(&mut writer, &PeerMessage::VoteResponse(response)).await?;
                Ok(())
            }
            Ok(PeerMessage::P2pHandshake {
                bee_id,
                coord,
                direction,
            }) => {
                if self.blacklist.contains(&bee_id) {
                    warn!(peer = %bee_id, "Rejecting handshake from blacklisted bee");
                    return Ok(());
                }
                // The peer files us under `direction`; we sit opposite
                let direction = direction.map(Direction::opposite).or_else(|| {
                    let own = self.coord()?;
                    own.direction_to(&coord?)
                });
                write_message(&mut writer, &self.handshake(direction)).await?;
                match direction {
                    Some(d) => info!(peer = %bee_id, "Inbound mesh peer on {}", d),
                    None => warn!(peer = %bee_id, %addr, "Inbound mesh peer with no direction"),
                }

                let cancel = self.shutdown.child_token();
                let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
                if let Some(direction) = direction {
                    let previous = self
                        .inbound_links
                        .lock()
                        .insert(direction, (conn_id, cancel.clone()));
                    if let Some((_, old)) = previous {
                        warn!(
                            peer = %bee_id,
                            "Second inbound peer on {}, superseding the older link",
                            direction
                        );
                        old.cancel();
                    }
                }

                self.read_loop(reader, direction, Some(bee_id.clone()), None, cancel)
                    .await;
                drop(writer);

                if let Some(direction) = direction {
                    let current = {
                        let mut links = self.inbound_links.lock();
                        let ours = links.get(&direction).is_some_and(|(id, _)| *id == conn_id);
                        if ours {
                            links.remove(&direction);
                        }
                        ours
                    };
                    if current && !self.shutdown.is_cancelled() {
                        self.emit_lost(direction, Some(bee_id), LinkKind::Inbound);
                    }
                }
                Ok(())
            }
            Ok(other) => {
                warn!("Expected handshake from {}, got {}", addr, other.kind());
                Ok(())
            }
            Err(e) => {
                warn!("Malformed first message from {}: {}", addr, e);
                Ok(())
            }
        }
    }

    /// Dispatch messages from one connection until EOF, error or `cancel`.
    ///
    /// `conn_id` is set for outbound links so a reply handshake can name the
    /// slot's peer.
    async fn read_loop(
        &self,
        mut reader: LineReader<OwnedReadHalf>,
        from: Option<Direction>,
        mut peer_id: Option<String>,
        conn_id: Option<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = reader.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!(peer = ?peer_id, "Mesh peer on {:?} disconnected", from);
                    return;
                }
                Err(e) => {
                    warn!(peer = ?peer_id, "Mesh read error on {:?}: {}", from, e);
                    return;
                }
            };

            let message = match decode_line::<PeerMessage>(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer = ?peer_id, "Dropping malformed mesh message: {}", e);
                    continue;
                }
            };

            if let PeerMessage::P2pHandshake { bee_id, .. } = &message {
                if self.blacklist.contains(bee_id) {
                    warn!(peer = %bee_id, "Closing link to blacklisted bee");
                    return;
                }
                if let (Some(direction), Some(conn_id)) = (from, conn_id) {
                    self.record_peer(direction, conn_id, bee_id);
                }
                peer_id = Some(bee_id.clone());
                continue;
            }

            let Some(sender) = peer_id.clone() else {
                warn!("Dropping {} received before handshake", message.kind());
                continue;
            };
            if self.blacklist.contains(&sender)
                || claimed_sender(&message).is_some_and(|id| self.blacklist.contains(id))
            {
                debug!(peer = %sender, "Dropping {} from blacklisted bee", message.kind());
                continue;
            }

            let inbound = InboundMessage {
                from,
                peer_id: sender,
                message,
            };
            if self.inbound.send(inbound).await.is_err() {
                debug!("Inbound queue closed");
                return;
            }
        }
    }

    fn record_peer(&self, direction: Direction, conn_id: u64, peer_id: &str) {
        if let Some(link) = self.slots.lock().get_mut(&direction) {
            if link.conn_id == conn_id {
                link.peer_id = Some(peer_id.to_string());
                info!(peer = %peer_id, "Mesh link {} handshake complete", direction);
            }
        }
    }

    /// Open the link for `direction`, replacing whatever holds that slot.
    ///
    /// Returns false and leaves the slot empty on failure; no retry.
    pub async fn connect(self: &Arc<Self>, direction: Direction, addr: SocketAddr) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if let Some(old) = self.slots.lock().remove(&direction) {
            info!("Superseding {} link", direction);
            old.cancel.cancel();
        }

        let stream = match tokio::time::timeout(HANDSHAKE_GRACE, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Mesh connect {} to {} failed: {}", direction, addr, e);
                return false;
            }
            Err(_) => {
                warn!("Mesh connect {} to {} timed out", direction, addr);
                return false;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        let (reader, mut writer) = stream.into_split();
        if let Err(e) = write_message(&mut writer, &self.handshake(Some(direction))).await {
            warn!("Mesh handshake {} to {} failed: {}", direction, addr, e);
            return false;
        }

        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let link = Link {
            conn_id,
            peer_id: None,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            cancel: cancel.clone(),
        };
        if let Some(old) = self.slots.lock().insert(direction, link) {
            old.cancel.cancel();
        }
        info!("Mesh link {} -> {} established", direction, addr);

        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            mesh.read_loop(LineReader::new(reader), Some(direction), None, Some(conn_id), cancel)
                .await;
            mesh.clear_slot(direction, conn_id);
        });
        true
    }

    /// Empty `direction` if it still holds connection `conn_id`.
    fn clear_slot(&self, direction: Direction, conn_id: u64) {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(&direction) {
                Some(link) if link.conn_id == conn_id => slots.remove(&direction),
                _ => None,
            }
        };
        if let Some(link) = removed {
            link.cancel.cancel();
            warn!(peer = ?link.peer_id, "Neighbor {} lost, slot emptied", direction);
            self.emit_lost(direction, link.peer_id, LinkKind::Outbound);
        }
    }

    fn emit_lost(&self, direction: Direction, peer_id: Option<String>, kind: LinkKind) {
        // No subscribers is fine
        let _ = self.events.send(MeshEvent::NeighborLost {
            direction,
            peer_id,
            kind,
        });
    }

    /// Best-effort send on the link for `direction`.
    ///
    /// A failed write empties the slot.
    pub async fn pulse(&self, direction: Direction, message: &PeerMessage) -> bool {
        let link = {
            self.slots
                .lock()
                .get(&direction)
                .map(|l| (l.conn_id, Arc::clone(&l.writer)))
        };
        let Some((conn_id, writer)) = link else {
            debug!("No {} neighbor for {}", direction, message.kind());
            return false;
        };

        let line = match encode_line(message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot encode {}: {}", message.kind(), e);
                return false;
            }
        };

        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Send to {} failed: {}", direction, e);
                self.clear_slot(direction, conn_id);
                false
            }
        }
    }

    /// Send to every connected slot except `except`. Returns deliveries.
    pub async fn broadcast(&self, message: &PeerMessage, except: Option<Direction>) -> usize {
        let mut delivered = 0;
        for direction in self.connected_directions() {
            if Some(direction) == except {
                continue;
            }
            if self.pulse(direction, message).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Occupied slots in wire order.
    pub fn connected_directions(&self) -> Vec<Direction> {
        let slots = self.slots.lock();
        Direction::ALL
            .into_iter()
            .filter(|d| slots.contains_key(d))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        let slots = self.slots.lock();
        count_present_neighbors(|d| slots.contains_key(&d))
    }

    pub fn is_connected(&self, direction: Direction) -> bool {
        self.slots.lock().contains_key(&direction)
    }

    /// Peer id learned from the reply handshake on `direction`.
    pub fn peer_id(&self, direction: Direction) -> Option<String> {
        self.slots
            .lock()
            .get(&direction)
            .and_then(|l| l.peer_id.clone())
    }

    /// Stop the listener and close every link. Idempotent.
    pub async fn close_all(&self) {
        self.shutdown.cancel();
        let links: Vec<(Direction, Link)> = self.slots.lock().drain().collect();
        for (direction, link) in links {
            link.cancel.cancel();
            let mut writer = link.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Closing {} link: {}", direction, e);
            }
        }
        debug!("Mesh closed");
    }
}

/// Vote RPC over a one-shot connection to the voter's mesh listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpVoteTransport;

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

impl VoteTransport for TcpVoteTransport {
    fn request_vote(
        &self,
        voter: &Voter,
        request: VoteRequest,
    ) -> BoxFuture<'static, std::io::Result<VoteResponse>> {
        let addr = voter.addr;
        async move {
            let stream = TcpStream::connect(addr).await?;
            let (reader, mut writer) = stream.into_split();
            write_message(&mut writer, &PeerMessage::RequestVote(request))
                .await
                .map_err(|e| invalid_data(e.to_string()))?;

            match LineReader::new(reader).next_message::<PeerMessage>().await {
                Ok(Some(PeerMessage::VoteResponse(response))) => Ok(response),
                Ok(Some(other)) => Err(invalid_data(format!(
                    "expected VOTE_RESPONSE, got {}",
                    other.kind()
                ))),
                Ok(None) => Err(std::io::ErrorKind::UnexpectedEof.into()),
                Err(e) => Err(invalid_data(e.to_string())),
            }
        }
        .boxed()
    }
}
