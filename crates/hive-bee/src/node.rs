//! The bee node: controller session, task wiring and shutdown.
//!
//! # Session
//!
//! ```text
//! discover ─▶ connect ─▶ HANDSHAKE ─▶ ACK ─▶ control loop ─▶ GOODBYE
//!                                      │
//!                                      ├─ inbound mesh dispatcher
//!                                      ├─ neighbor-loss watcher
//!                                      └─ election monitor (PRINCE only)
//! ```
//!
//! Losing the controller ends the session with [`Error::ControllerLost`].

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hive_consensus::{ConsensusManager, Promotion};
use hive_immune::{Blacklist, GossipRouter};
use hive_topology::{GridCoord, OPERAND_SOURCES};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BeeConfig, HANDSHAKE_GRACE, SHUTDOWN_GRACE};
use crate::discovery::{discover_queen, BeaconBroadcaster};
use crate::error::{Error, Result};
use crate::gossip::FlagManager;
use crate::lead::LeadRegistry;
use crate::mesh::{InboundMessage, MeshEvent, MeshService, TcpVoteTransport};
use crate::metrics::{MetricsSource, ProcMetrics, SpikeMonitor};
use crate::pacemaker::Pacemaker;
use crate::protocol::{
    decode_line, pulse_signing_bytes, write_message, BeeRole, ControlMessage, LineReader,
    PeerMessage,
};
use crate::systolic::{run_steps, Matrix, StepContext, SystolicEngine};

/// Status the controller sends when it admits a bee.
const ACK_ACCEPTED: &str = "ACCEPTED";

/// Who this bee is and where the controller placed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub bee_id: String,
    pub coord: Option<GridCoord>,
    pub role: Option<BeeRole>,
}

fn new_bee_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("bee-{}", hex::encode(bytes))
}

/// A worker bee.
pub struct BeeNode {
    config: BeeConfig,
    identity: RwLock<NodeIdentity>,
    consensus: Arc<ConsensusManager>,
    promotions: Mutex<Option<mpsc::UnboundedReceiver<Promotion>>>,
    mesh: Arc<MeshService>,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    flags: FlagManager,
    pacemaker: Pacemaker<Matrix>,
    engine: tokio::sync::Mutex<SystolicEngine>,
    lead: LeadRegistry,
    beacon: BeaconBroadcaster,
    heartbeat: Mutex<SpikeMonitor>,
    controller: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Our address as seen on the controller link
    controller_local_ip: RwLock<Option<IpAddr>>,
    background_started: AtomicBool,
    monitor_started: AtomicBool,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl BeeNode {
    /// Build a node sampling metrics from `/proc`.
    pub fn new(config: BeeConfig) -> Arc<Self> {
        let metrics = Arc::new(ProcMetrics::new(config.vram_free_mb));
        Self::with_metrics(config, metrics)
    }

    pub fn with_metrics(config: BeeConfig, metrics: Arc<dyn MetricsSource>) -> Arc<Self> {
        let bee_id = new_bee_id();
        let blacklist = Arc::new(Blacklist::default());

        let (consensus, promotions) = ConsensusManager::new(
            bee_id.clone(),
            config.consensus_config(),
            Arc::new(TcpVoteTransport),
        );
        let consensus = Arc::new(consensus);
        let (mesh, inbound) =
            MeshService::new(bee_id.clone(), Arc::clone(&blacklist), Arc::clone(&consensus));
        let router = GossipRouter::new(bee_id.clone(), config.gossip_ttl, blacklist);
        let flags = FlagManager::new(router, Arc::clone(&mesh));
        let pacemaker = Pacemaker::new(config.straggler_timeout, config.straggler_policy);
        let heartbeat =
            SpikeMonitor::new(metrics, config.heartbeat_interval, config.spike_threshold);

        info!(%bee_id, "Bee initialized");
        Arc::new(Self {
            config,
            identity: RwLock::new(NodeIdentity {
                bee_id,
                coord: None,
                role: None,
            }),
            consensus,
            promotions: Mutex::new(Some(promotions)),
            mesh,
            inbound: Mutex::new(Some(inbound)),
            flags,
            pacemaker,
            engine: tokio::sync::Mutex::new(SystolicEngine::default()),
            lead: LeadRegistry::new(),
            beacon: BeaconBroadcaster::new(),
            heartbeat: Mutex::new(heartbeat),
            controller: tokio::sync::Mutex::new(None),
            controller_local_ip: RwLock::new(None),
            background_started: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn bee_id(&self) -> String {
        self.identity.read().bee_id.clone()
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity.read().clone()
    }

    /// Bees this node refuses to deal with.
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        self.flags.blacklist()
    }

    pub fn mesh(&self) -> &Arc<MeshService> {
        &self.mesh
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus
    }

    /// Run one controller session, then shut down.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let result = match self.run_session().await {
            // Our own shutdown closed the link
            Err(Error::ControllerLost) if self.cancel.is_cancelled() => Ok(()),
            other => other,
        };
        self.shutdown().await;
        result
    }

    async fn run_session(self: &Arc<Self>) -> Result<()> {
        let mesh_addr = self.mesh.start_listener(self.config.mesh_addr).await?;

        let Some(queen) = self.locate_queen().await? else {
            return Ok(());
        };
        info!("Connecting to controller at {}", queen);
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            stream = TcpStream::connect(queen) => stream
                .map_err(|e| Error::Network(format!("controller {}: {}", queen, e)))?,
        };
        *self.controller_local_ip.write() = stream.local_addr().ok().map(|a| a.ip());
        let (reader, writer) = stream.into_split();
        *self.controller.lock().await = Some(writer);
        let mut reader = LineReader::new(reader);

        let metrics = self.heartbeat.lock().handshake_metrics();
        self.send_control(&ControlMessage::Handshake {
            bee_id: self.bee_id(),
            metrics,
            p2p_port: mesh_addr.port(),
        })
        .await?;

        if !self.await_ack(&mut reader).await? {
            return Ok(());
        }
        self.spawn_background();
        self.control_loop(&mut reader).await
    }

    /// Controller address from config, or from a beacon. `None` if cancelled.
    async fn locate_queen(&self) -> Result<Option<SocketAddr>> {
        if let Some(addr) = &self.config.queen_addr {
            let resolved = tokio::net::lookup_host(addr.as_str())
                .await?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!("HIVE_QUEEN_ADDR {:?} did not resolve", addr))
                })?;
            return Ok(Some(resolved));
        }
        match discover_queen(self.config.discovery_port, &self.cancel).await {
            Ok(addr) => Ok(Some(addr)),
            Err(_) if self.cancel.is_cancelled() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait for the controller's ACK. Returns false if cancelled first.
    async fn await_ack(self: &Arc<Self>, reader: &mut LineReader<OwnedReadHalf>) -> Result<bool> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                next = tokio::time::timeout(HANDSHAKE_GRACE, reader.next_line()) => next,
            };
            let line = match next {
                Err(_) => return Err(Error::Protocol("no ACK from controller".into())),
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) | Ok(Err(_)) => return Err(Error::ControllerLost),
            };
            match decode_line::<ControlMessage>(&line) {
                Ok(ControlMessage::Ack {
                    status,
                    coordinates,
                    role,
                }) => {
                    if status != ACK_ACCEPTED {
                        return Err(Error::Protocol(format!("controller answered {}", status)));
                    }
                    self.apply_ack(coordinates, role);
                    return Ok(true);
                }
                Ok(other) => warn!("Dropping {} received before ACK", other.kind()),
                Err(e) => warn!("Dropping malformed controller message: {}", e),
            }
        }
    }

    fn apply_ack(self: &Arc<Self>, coord: GridCoord, role: BeeRole) {
        {
            let mut identity = self.identity.write();
            identity.coord = Some(coord);
            identity.role = Some(role);
        }
        self.mesh.set_coord(coord);
        info!(%coord, %role, "Admitted by controller");

        if role == BeeRole::Prince && self.background_started.load(Ordering::SeqCst) {
            self.spawn_election();
        }
    }

    fn spawn_background(self: &Arc<Self>) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut inbound) = self.inbound.lock().take() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = node.cancel.cancelled() => break,
                        message = inbound.recv() => message,
                    };
                    let Some(message) = message else { break };
                    node.handle_peer_message(message).await;
                }
                debug!("Mesh dispatcher stopped");
            });
        }

        let mut events = self.mesh.subscribe();
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(MeshEvent::NeighborLost {
                        direction,
                        peer_id,
                        kind,
                    }) => {
                        warn!(
                            peer = ?peer_id,
                            ?kind,
                            "Lost {} neighbor, awaiting NEIGHBOR_UPDATE",
                            direction
                        );
                        if OPERAND_SOURCES.contains(&direction) {
                            node.pacemaker.discard_direction(direction);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} mesh events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if self.identity.read().role == Some(BeeRole::Prince) {
            self.spawn_election();
        }
    }

    /// Start the election monitor and promotion watcher, once.
    fn spawn_election(self: &Arc<Self>) {
        if self.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Standby controller: election monitor running");
        self.consensus.reset_election_timer();
        tokio::spawn(
            Arc::clone(&self.consensus).run_election_monitor(self.cancel.child_token()),
        );

        if let Some(mut promotions) = self.promotions.lock().take() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let promotion = tokio::select! {
                        _ = node.cancel.cancelled() => break,
                        promotion = promotions.recv() => promotion,
                    };
                    let Some(promotion) = promotion else { break };
                    node.on_promotion(promotion);
                }
            });
        }
    }

    fn on_promotion(&self, promotion: Promotion) {
        self.identity.write().role = Some(BeeRole::QueenActing);
        warn!(term = promotion.term, "Promoted to acting controller");

        let Some(mesh_addr) = self.mesh.local_addr() else {
            error!("Promoted without a mesh listener; no beacon");
            return;
        };
        let ip = (*self.controller_local_ip.read()).unwrap_or_else(|| mesh_addr.ip());
        let advertise = SocketAddr::new(ip, mesh_addr.port());
        if self
            .beacon
            .start(advertise, self.config.discovery_port, self.cancel.child_token())
        {
            info!(%advertise, "Beacon broadcaster started");
        }
    }

    async fn control_loop(self: &Arc<Self>, reader: &mut LineReader<OwnedReadHalf>) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout(self.config.heartbeat_check, reader.next_line()) => {
                    next
                }
            };
            match next {
                // Quiet link; fall through to the heartbeat check
                Err(_) => {}
                Ok(Ok(Some(line))) => match decode_line::<ControlMessage>(&line) {
                    Ok(message) => self.handle_control(message).await?,
                    Err(e) => warn!("Dropping malformed controller message: {}", e),
                },
                Ok(Ok(None)) => {
                    warn!("Controller closed the connection");
                    return Err(Error::ControllerLost);
                }
                Ok(Err(e)) => {
                    warn!("Controller read failed: {}", e);
                    return Err(Error::ControllerLost);
                }
            }
            self.maybe_heartbeat().await?;
        }
    }

    async fn maybe_heartbeat(&self) -> Result<()> {
        let due = self.heartbeat.lock().should_pulse();
        if let Some(metrics) = due {
            debug!(?metrics, "Sending heartbeat");
            self.send_control(&ControlMessage::Heartbeat {
                bee_id: self.bee_id(),
                metrics,
            })
            .await?;
        }
        Ok(())
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let mut controller = self.controller.lock().await;
        let writer = controller.as_mut().ok_or(Error::ControllerLost)?;
        if let Err(e) = write_message(writer, message).await {
            warn!("Send of {} to controller failed: {}", message.kind(), e);
            return Err(Error::ControllerLost);
        }
        Ok(())
    }

    /// Act on one controller message. Only session-ending failures are
    /// returned.
    async fn handle_control(self: &Arc<Self>, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::AppendEntries {
                term,
                leader_id,
                hive_state,
            } => match self.consensus.process_replication(term, &leader_id, hive_state) {
                Ok(true) => {}
                Ok(false) => warn!(term, leader = %leader_id, "Rejected stale replication"),
                Err(e) => {
                    error!("{}", e);
                    return Err(e.into());
                }
            },

            ControlMessage::BlockAssignment {
                job_id,
                block_id,
                total_blocks,
                data,
            } => match self
                .lead
                .handle_block(&job_id, block_id, total_blocks, &data, self.config.lead_grid)
            {
                Ok(assignments) => {
                    for assignment in &assignments {
                        self.send_control(assignment).await?;
                    }
                    info!(job_id, block_id, shards = assignments.len(), "Block sharded");
                }
                Err(e) => warn!(job_id, block_id, "Cannot shard block: {}", e),
            },

            ControlMessage::ShardAssignment {
                job_id,
                block_id,
                task_id,
                data_id,
                fragment,
                steps,
                ..
            } => {
                info!(job_id, block_id, task_id, data_id, steps, "Shard assigned");
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = node.run_shard(&job_id, block_id, &fragment, steps).await {
                        warn!(job_id, block_id, "Systolic run failed: {}", e);
                    }
                });
            }

            ControlMessage::ShardLost {
                job_id,
                block_id,
                cell,
            } => match self.lead.handle_lost(&job_id, block_id, cell) {
                Ok(assignment) => self.send_control(&assignment).await?,
                Err(e) => warn!(job_id, block_id, %cell, "Cannot recover shard: {}", e),
            },

            ControlMessage::NeighborUpdate {
                direction,
                connection_info,
            } => match connection_info.socket_addr() {
                Ok(addr) => {
                    info!("Neighbor update: {} at {}", direction, addr);
                    let mesh = Arc::clone(&self.mesh);
                    tokio::spawn(async move {
                        mesh.connect(direction, addr).await;
                    });
                }
                Err(e) => warn!("Bad neighbor update for {}: {}", direction, e),
            },

            ControlMessage::Ack {
                status,
                coordinates,
                role,
            } if status == ACK_ACCEPTED => self.apply_ack(coordinates, role),

            other => warn!("Unexpected {} from controller", other.kind()),
        }
        Ok(())
    }

    /// Load a shard and run its systolic steps, then attest the result.
    async fn run_shard(
        &self,
        job_id: &str,
        block_id: u32,
        fragment: &serde_json::Value,
        steps: u32,
    ) -> Result<()> {
        let mut engine = self.engine.lock().await;
        engine.load_shard(fragment)?;

        let bee_id = self.bee_id();
        let ctx = StepContext {
            self_id: &bee_id,
            mesh: &self.mesh,
            pacemaker: &self.pacemaker,
            attestor: &self.config.attestor,
        };
        let report = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            report = run_steps(&mut engine, &ctx, steps) => report?,
        };

        let attestation = self.config.attestor.sign(report.digest.as_bytes(), &bee_id);
        info!(
            job_id,
            block_id,
            steps = report.steps,
            degraded = report.degraded_steps.len(),
            digest = %report.digest.to_hex(),
            %attestation,
            "Shard result attested"
        );
        Ok(())
    }

    async fn handle_peer_message(&self, inbound: InboundMessage) {
        match inbound.message {
            PeerMessage::PulseData { .. } => self.accept_pulse(inbound).await,
            PeerMessage::GossipFlag(flag) => {
                self.flags.handle_flag(flag, inbound.from).await;
            }
            PeerMessage::VoteResponse(response) => self.consensus.handle_vote_response(response),
            other => warn!(peer = %inbound.peer_id, "Unexpected {} on mesh link", other.kind()),
        }
    }

    /// Verify a pulse and hand its operand to the pacemaker.
    async fn accept_pulse(&self, inbound: InboundMessage) {
        let InboundMessage {
            from,
            peer_id,
            message:
                PeerMessage::PulseData {
                    bee_id,
                    step,
                    operand,
                    payload,
                    attestation,
                },
        } = inbound
        else {
            return;
        };

        if bee_id != peer_id {
            warn!(peer = %peer_id, claimed = %bee_id, "Pulse sender does not match link");
            self.flags.report_malice(&peer_id, "pulse sender mismatch").await;
            return;
        }
        let verified = pulse_signing_bytes(step, operand, &payload)
            .map(|bytes| self.config.attestor.verify_hex(&bytes, &attestation, &bee_id))
            .unwrap_or(false);
        if !verified {
            warn!(peer = %bee_id, step, "Pulse attestation failed");
            self.flags.report_malice(&bee_id, "invalid pulse attestation").await;
            return;
        }

        let source = operand.source();
        if from != Some(source) {
            warn!(
                peer = %bee_id,
                step,
                "Operand {} arrived from {:?}, expected {}",
                operand,
                from,
                source
            );
            return;
        }
        let block = match serde_json::from_value::<Matrix>(payload) {
            Ok(block) => block,
            Err(e) => {
                warn!(peer = %bee_id, step, "Dropping unreadable operand: {}", e);
                return;
            }
        };
        if let Err(e) = block.validate() {
            warn!(peer = %bee_id, step, "Dropping operand: {}", e);
            return;
        }
        if let Err(e) = self.pacemaker.enqueue(source, step, block) {
            warn!(peer = %bee_id, step, "{}", e);
        }
    }

    /// Cancel tasks, say goodbye, close the mesh. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down");
        self.cancel.cancel();

        let bee_id = self.bee_id();
        let farewell = async {
            let mut controller = self.controller.lock().await;
            if let Some(mut writer) = controller.take() {
                let goodbye = ControlMessage::Goodbye { bee_id };
                if let Err(e) = write_message(&mut writer, &goodbye).await {
                    debug!("GOODBYE not delivered: {}", e);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, farewell).await.is_err() {
            warn!("GOODBYE timed out");
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.mesh.close_all()).await.is_err() {
            warn!("Mesh close timed out");
        }
    }

    /// Whether [`BeeNode::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
