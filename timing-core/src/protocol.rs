//! # protocol
//!
//! Pairing and session protocol over one link association.
//!
//! Both devices start in dual mode, advertising and scanning at once; the
//! first association resolves roles (the side whose advertised service was
//! connected to becomes server and reference clock). The handshake then
//! negotiates session parameters and gate assignments, the client runs the
//! clock-sync protocol, and both sides settle into Ready with a heartbeat.
//!
//! All protocol transitions are serialised through one task: link events,
//! commands from the embedding app and timer ticks are branches of a single
//! select loop, so the state machine never observes concurrent mutation.
//!
//! ## Critical delivery
//! Critical messages carry a fresh `message_id` and live in a pending table
//! until the matching Ack arrives. Retransmissions re-envelope the payload
//! with a fresh sequence number but the same `message_id`; the receiver acks
//! every delivery and forwards only the first. A message that exhausts its
//! retry budget is a fatal session error, never silently forgotten.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use timing_types::{
    GateAssignment, MessagePayload, Role, SessionConfig, SyncMode, TimingMessage, PROTOCOL_VERSION,
};

use crate::clock::SharedClock;
use crate::error::TimingError;
use crate::events::{SessionEvent, SessionState};
use crate::sync::{PongEnvelope, SyncChannel, SyncEngine};
use crate::transport::{LinkEvent, LinkSession, WriteQueue};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Stable identifier of this device, echoed in every envelope.
    pub device_id: String,
    /// When set on the joining side, wins over the host's complement rule.
    pub preferred_role: Option<Role>,
    /// Dual-mode discovery gives up after this long without an association.
    pub scan_timeout: Duration,
    /// Host side: force-send SessionConfig if the subscription signal never
    /// arrives. Some radio stacks signal subscription only implicitly.
    pub subscription_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub critical_retry_interval: Duration,
    pub critical_max_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            preferred_role: None,
            scan_timeout: Duration::from_secs(30),
            subscription_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
            critical_retry_interval: Duration::from_millis(500),
            critical_max_retries: 5,
        }
    }
}

/// Heartbeat pongs outstanding before observers are told the link is stale.
const HEARTBEAT_STALE_AFTER: u32 = 2;

// ── Commands & Handle ────────────────────────────────────────────────────────

enum SessionCommand {
    Send(MessagePayload),
    SendCritical(MessagePayload),
    StartMiniSync,
    Stop,
    /// Ping emitted by the sync task, to be enveloped and transmitted.
    SyncOutbound(MessagePayload),
    /// The sync task finished (client side).
    SyncFinished(Result<crate::sync::SyncResult, TimingError>),
}

/// The embedding app's grip on one running session.
#[derive(Debug)]
pub struct SessionHandle {
    cmd: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    /// Payload-level events, after acks/dedup/sequencing.
    pub events: mpsc::Receiver<SessionEvent>,
    engine: Arc<SyncEngine>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch channel for reactive observers.
    pub fn state_stream(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Fire-and-forget message to the peer.
    pub async fn send(&self, payload: MessagePayload) -> Result<(), TimingError> {
        self.cmd
            .send(SessionCommand::Send(payload))
            .await
            .map_err(|_| TimingError::SessionStopped)
    }

    /// Acknowledged delivery with retries; exhaustion is a fatal session
    /// error surfaced on the state channel.
    pub async fn send_critical(&self, payload: MessagePayload) -> Result<(), TimingError> {
        self.cmd
            .send(SessionCommand::SendCritical(payload))
            .await
            .map_err(|_| TimingError::SessionStopped)
    }

    /// Refresh the offset mid-session with a 30-sample burst.
    pub async fn start_mini_sync(&self) -> Result<(), TimingError> {
        self.cmd
            .send(SessionCommand::StartMiniSync)
            .await
            .map_err(|_| TimingError::SessionStopped)
    }

    /// Tear everything down and clear session state.
    pub async fn stop(&self) {
        let _ = self.cmd.send(SessionCommand::Stop).await;
    }
}

// ── Session entry points ─────────────────────────────────────────────────────

pub struct TransportSession;

impl TransportSession {
    /// Dual mode: advertise and scan simultaneously; the association decides
    /// which side hosts. `session_config` is used if we end up server.
    pub fn start_auto_sync(
        link: LinkSession,
        session_config: SessionConfig,
        clock: SharedClock,
        cfg: ProtocolConfig,
    ) -> Result<SessionHandle, TimingError> {
        check_link(&link)?;
        if !session_config.is_valid() {
            return Err(TimingError::InvalidConfig(format!(
                "distance {} m / {} gates",
                session_config.distance_m, session_config.gate_count
            )));
        }
        Ok(SessionTask::spawn(link, Some(session_config), clock, cfg))
    }

    /// Advertise only.
    pub fn start_as_server(
        link: LinkSession,
        session_config: SessionConfig,
        clock: SharedClock,
        cfg: ProtocolConfig,
    ) -> Result<SessionHandle, TimingError> {
        Self::start_auto_sync(link, session_config, clock, cfg)
    }

    /// Scan only; session parameters arrive from the host.
    pub fn start_as_client(
        link: LinkSession,
        clock: SharedClock,
        cfg: ProtocolConfig,
    ) -> Result<SessionHandle, TimingError> {
        check_link(&link)?;
        Ok(SessionTask::spawn(link, None, clock, cfg))
    }
}

/// A link whose outbound endpoint is already gone can never carry a session;
/// surfaced immediately rather than as a mid-handshake error.
fn check_link(link: &LinkSession) -> Result<(), TimingError> {
    if link.frames.is_closed() {
        return Err(TimingError::TransportUnavailable(
            "link endpoints are closed".into(),
        ));
    }
    Ok(())
}

// ── Pending critical bookkeeping ─────────────────────────────────────────────

struct PendingCritical {
    payload: MessagePayload,
    retries_left: u32,
    next_retry: tokio::time::Instant,
}

// ── The session task ─────────────────────────────────────────────────────────

struct SessionTask {
    cfg: ProtocolConfig,
    clock: SharedClock,
    engine: Arc<SyncEngine>,
    writes: WriteQueue,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_tx: watch::Sender<SessionState>,
    events_tx: mpsc::Sender<SessionEvent>,

    host_config: Option<SessionConfig>,
    session_config: Option<SessionConfig>,
    session_id: String,
    session_id_fixed: bool,
    is_server: Option<bool>,
    my_role: Option<Role>,
    gate_assignment: Option<GateAssignment>,

    seq: u64,
    last_peer_seq: Option<u64>,
    pending: HashMap<String, PendingCritical>,
    seen_message_ids: HashSet<String>,

    subscription_seen: bool,
    config_sent: bool,
    started_at: tokio::time::Instant,
    connected_at: Option<tokio::time::Instant>,

    heartbeat_seq: u64,
    outstanding_heartbeats: u32,

    pong_tx: Option<mpsc::Sender<PongEnvelope>>,
    sync_cancel: Arc<AtomicBool>,
    sync_mode: Option<SyncMode>,
}

impl SessionTask {
    fn spawn(
        link: LinkSession,
        host_config: Option<SessionConfig>,
        clock: SharedClock,
        cfg: ProtocolConfig,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::channel(64);
        let engine = Arc::new(SyncEngine::new(clock.clone()));
        let writes = WriteQueue::spawn(link.frames);

        let task = SessionTask {
            cfg,
            clock,
            engine: engine.clone(),
            writes,
            cmd_tx: cmd_tx.clone(),
            state_tx,
            events_tx,
            host_config,
            session_config: None,
            session_id: Uuid::new_v4().to_string(),
            session_id_fixed: false,
            is_server: None,
            my_role: None,
            gate_assignment: None,
            seq: 0,
            last_peer_seq: None,
            pending: HashMap::new(),
            seen_message_ids: HashSet::new(),
            subscription_seen: false,
            config_sent: false,
            started_at: tokio::time::Instant::now(),
            connected_at: None,
            heartbeat_seq: 0,
            outstanding_heartbeats: 0,
            pong_tx: None,
            sync_cancel: Arc::new(AtomicBool::new(false)),
            sync_mode: None,
        };
        tokio::spawn(task.run(link.events, cmd_rx));

        SessionHandle {
            cmd: cmd_tx,
            state: state_rx,
            events: events_rx,
            engine,
        }
    }

    async fn run(
        mut self,
        mut link_events: mpsc::Receiver<LinkEvent>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let done = tokio::select! {
                ev = link_events.recv() => match ev {
                    Some(ev) => self.on_link_event(ev).await,
                    None => {
                        self.fail(TimingError::LinkClosed).await;
                        true
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => true,
                },
                _ = tick.tick() => self.on_tick().await,
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                    false
                }
            };
            if done {
                self.sync_cancel.store(true, Ordering::Release);
                return;
            }
        }
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: SessionState) {
        if *self.state_tx.borrow() != next {
            info!(state = ?next, "session state");
            let _ = self.state_tx.send(next);
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Recoverable fault: surface through the state channel, cancel the sync
    /// run, drop pending criticals. The first error wins; later ones are
    /// logged only.
    async fn fail(&mut self, error: TimingError) {
        warn!(%error, "session error");
        self.sync_cancel.store(true, Ordering::Release);
        self.pending.clear();
        if !self.state().is_terminal() {
            self.set_state(SessionState::Error(error.to_string()));
        }
    }

    // ── Link events ──────────────────────────────────────────────────────

    async fn on_link_event(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Associated {
                peer_device_id,
                is_server,
            } => {
                info!(peer = %peer_device_id, is_server, "peer associated");
                self.is_server = Some(is_server);
                self.connected_at = Some(tokio::time::Instant::now());
                if is_server && self.host_config.is_none() {
                    self.fail(TimingError::InvalidConfig(
                        "associated as server without a session config".into(),
                    ))
                    .await;
                    return true;
                }
                self.set_state(SessionState::Connected);
                false
            }
            LinkEvent::SubscriptionEnabled => {
                self.subscription_seen = true;
                if self.is_server == Some(true) && !self.config_sent {
                    self.begin_host_handshake().await;
                }
                false
            }
            LinkEvent::Frame(bytes) => {
                // T4 / T2 stamp: the instant the frame leaves the inbox
                let received_at = self.clock.now_nanos();
                match TimingMessage::decode(&bytes) {
                    Ok(msg) => self.handle_message(msg, received_at).await,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        false
                    }
                }
            }
            LinkEvent::Disconnected => {
                self.fail(TimingError::LinkClosed).await;
                true
            }
        }
    }

    /// Host: ClientReady → send SessionConfig (critical) → AwaitingRole.
    async fn begin_host_handshake(&mut self) {
        let Some(config) = self.host_config.clone() else {
            return;
        };
        self.set_state(SessionState::ClientReady);
        self.config_sent = true;
        self.send_critical_payload(MessagePayload::SessionConfig { config })
            .await;
        self.set_state(SessionState::AwaitingRole);
    }

    // ── Timer ticks ──────────────────────────────────────────────────────

    async fn on_tick(&mut self) -> bool {
        let now = tokio::time::Instant::now();

        // Discovery window
        if self.is_server.is_none() {
            if now.duration_since(self.started_at) >= self.cfg.scan_timeout {
                self.fail(TimingError::ScanTimeout).await;
                return true;
            }
            return false;
        }

        // Subscription safety timeout: some stacks never signal the CCC
        // write, so the handshake must not deadlock waiting for it.
        if self.is_server == Some(true) && !self.subscription_seen && !self.config_sent {
            if let Some(connected_at) = self.connected_at {
                if now.duration_since(connected_at) >= self.cfg.subscription_timeout {
                    warn!("subscription signal missing, force-sending session config");
                    self.begin_host_handshake().await;
                }
            }
        }

        // Critical retransmissions
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.next_retry <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for message_id in due {
            let Some(entry) = self.pending.get_mut(&message_id) else {
                continue;
            };
            if entry.retries_left == 0 {
                self.fail(TimingError::AckTimeout { message_id }).await;
                return false;
            }
            entry.retries_left -= 1;
            entry.next_retry = now + self.cfg.critical_retry_interval;
            let payload = entry.payload.clone();
            debug!(message_id = %message_id, "retransmitting critical message");
            let msg = self.make_message(payload, Some(message_id));
            self.transmit(&msg).await;
        }
        false
    }

    async fn on_heartbeat(&mut self) {
        if self.state() != SessionState::Ready {
            return;
        }
        self.heartbeat_seq += 1;
        self.outstanding_heartbeats += 1;
        if self.outstanding_heartbeats > HEARTBEAT_STALE_AFTER {
            self.emit(SessionEvent::HeartbeatStale {
                missed: self.outstanding_heartbeats - 1,
            })
            .await;
        }
        let seq = self.heartbeat_seq;
        self.send_payload(MessagePayload::HeartbeatPing { seq }).await;
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Send(payload) | SessionCommand::SyncOutbound(payload) => {
                self.send_payload(payload).await;
                false
            }
            SessionCommand::SendCritical(payload) => {
                self.send_critical_payload(payload).await;
                false
            }
            SessionCommand::StartMiniSync => {
                if self.is_server == Some(false) {
                    self.begin_sync(SyncMode::Mini);
                } else {
                    warn!("mini-sync requested on the host side, ignoring");
                }
                false
            }
            SessionCommand::SyncFinished(result) => {
                self.on_sync_finished(result).await;
                false
            }
            SessionCommand::Stop => {
                info!("session stopped by user");
                self.set_state(SessionState::Stopped);
                true
            }
        }
    }

    async fn on_sync_finished(&mut self, result: Result<crate::sync::SyncResult, TimingError>) {
        self.pong_tx = None;
        let mode = self.sync_mode.take();
        match result {
            Ok(result) => {
                self.send_payload(MessagePayload::SyncComplete {
                    offset_nanos: result.offset_nanos,
                    uncertainty_nanos: result.uncertainty_nanos,
                    quality: result.quality,
                })
                .await;
                self.emit(SessionEvent::SyncFinished {
                    offset_nanos: result.offset_nanos,
                    uncertainty_nanos: result.uncertainty_nanos,
                    quality: result.quality,
                })
                .await;
                if self.state() == SessionState::Syncing {
                    self.set_state(SessionState::Ready);
                }
            }
            Err(error) => {
                if mode == Some(SyncMode::Mini) {
                    // Mini-sync keeps the previous offset; not fatal
                    warn!(%error, "mini-sync failed, previous offset retained");
                } else {
                    self.fail(error).await;
                }
            }
        }
    }

    // ── Inbound messages ─────────────────────────────────────────────────

    async fn handle_message(&mut self, msg: TimingMessage, received_at: i64) -> bool {
        if msg.protocol_version != PROTOCOL_VERSION {
            warn!(
                version = msg.protocol_version,
                "dropping message with unsupported protocol version"
            );
            return false;
        }

        // The client adopts the host's session id on first contact
        if !self.session_id_fixed {
            if self.is_server == Some(false) {
                self.session_id = msg.session_id.clone();
            }
            self.session_id_fixed = true;
        } else if msg.session_id != self.session_id {
            warn!(
                theirs = %msg.session_id,
                ours = %self.session_id,
                "dropping message for a different session"
            );
            return false;
        }

        // FIFO verification
        if let Some(last) = self.last_peer_seq {
            if msg.sequence <= last {
                warn!(seq = msg.sequence, last, "dropping out-of-order message");
                return false;
            }
        }
        self.last_peer_seq = Some(msg.sequence);

        // Critical contract: ack every delivery, forward only the first
        if msg.requires_ack {
            let Some(message_id) = msg.message_id.clone() else {
                warn!("dropping critical message without a message id");
                return false;
            };
            self.send_payload(MessagePayload::Ack {
                ack_message_id: message_id.clone(),
            })
            .await;
            if !self.seen_message_ids.insert(message_id) {
                debug!("duplicate critical delivery swallowed");
                return false;
            }
        }

        self.dispatch_payload(msg.payload, received_at).await
    }

    async fn dispatch_payload(&mut self, payload: MessagePayload, received_at: i64) -> bool {
        match payload {
            // ── Joiner side ──
            MessagePayload::SessionConfig { config } => {
                if self.is_server == Some(true) {
                    warn!("host received a session config, dropping");
                    return false;
                }
                if self.state() != SessionState::Connected {
                    warn!(state = ?self.state(), "unexpected session config, dropping");
                    return false;
                }
                info!(
                    distance_m = config.distance_m,
                    host_role = %config.host_role,
                    "session config received"
                );
                self.session_config = Some(config.clone());
                self.set_state(SessionState::AwaitingConfig);
                self.send_payload(MessagePayload::SessionConfigAck).await;
                self.emit(SessionEvent::SessionConfigured { config }).await;
                let device_id = self.cfg.device_id.clone();
                let preferred_role = self.cfg.preferred_role;
                self.send_critical_payload(MessagePayload::RoleRequest {
                    device_id,
                    preferred_role,
                })
                .await;
                self.set_state(SessionState::AwaitingAssignment);
                false
            }
            MessagePayload::RoleAssigned { role } => {
                self.my_role = Some(role);
                self.emit(SessionEvent::RoleAssigned { role }).await;
                self.send_payload(MessagePayload::RoleAssignedAck).await;
                self.maybe_complete_client_handshake().await;
                false
            }
            MessagePayload::GateAssigned { assignment } => {
                if assignment.target_device_id != self.cfg.device_id {
                    warn!(
                        target = %assignment.target_device_id,
                        "dropping gate assignment addressed to another device"
                    );
                    return false;
                }
                self.my_role = Some(assignment.role);
                self.gate_assignment = Some(assignment.clone());
                self.emit(SessionEvent::GateAssigned { assignment }).await;
                self.send_payload(MessagePayload::GateAssignedAck).await;
                self.maybe_complete_client_handshake().await;
                false
            }

            // ── Host side ──
            MessagePayload::RoleRequest {
                device_id,
                preferred_role,
            } => {
                if self.is_server != Some(true) {
                    warn!("role request on the joining side, dropping");
                    return false;
                }
                self.assign_roles(device_id, preferred_role).await;
                false
            }
            MessagePayload::SyncRequest { mode } => {
                debug!(?mode, "peer began a sync run");
                self.set_state(SessionState::Syncing);
                false
            }
            MessagePayload::SyncComplete {
                offset_nanos,
                uncertainty_nanos,
                quality,
            } => {
                // The peer measured t_host = t_peer + offset; our own
                // conversion convention needs the opposite sign.
                self.engine.adopt_peer_offset(-offset_nanos);
                self.emit(SessionEvent::PeerSyncComplete {
                    offset_nanos,
                    uncertainty_nanos,
                    quality,
                })
                .await;
                self.set_state(SessionState::Ready);
                false
            }

            // ── Clock sync plumbing ──
            MessagePayload::SyncPing { ping_id, t1 } => {
                let pong = self.engine.on_sync_ping(&ping_id, t1, received_at);
                self.send_payload(pong).await;
                false
            }
            MessagePayload::SyncPong {
                ping_id,
                t1_echo,
                t2,
                t3,
            } => {
                if let Some(pong_tx) = &self.pong_tx {
                    let _ = pong_tx
                        .send(PongEnvelope {
                            ping_id,
                            t1_echo,
                            t2,
                            t3,
                            t4: received_at,
                        })
                        .await;
                } else {
                    warn!("sync pong outside a sync run, dropping");
                }
                false
            }

            // ── Race flow ──
            MessagePayload::StartEvent {
                run_id,
                start_time_nanos,
                uncertainty_nanos,
            } => {
                self.emit(SessionEvent::StartReceived {
                    run_id,
                    start_time_nanos,
                    uncertainty_nanos,
                })
                .await;
                false
            }
            MessagePayload::CrossingEvent {
                run_id,
                role,
                crossing_time_nanos,
            } => {
                self.emit(SessionEvent::CrossingReceived {
                    run_id,
                    role,
                    crossing_time_nanos,
                })
                .await;
                false
            }
            MessagePayload::NewRun { run_id } => {
                self.emit(SessionEvent::NewRun { run_id }).await;
                false
            }
            MessagePayload::CancelRun { run_id } => {
                self.emit(SessionEvent::RunCancelled { run_id }).await;
                false
            }
            MessagePayload::Abort { reason } => {
                self.emit(SessionEvent::PeerAborted { reason }).await;
                false
            }

            // ── Keepalive & acks ──
            MessagePayload::HeartbeatPing { seq } => {
                self.send_payload(MessagePayload::HeartbeatPong { seq }).await;
                false
            }
            MessagePayload::HeartbeatPong { .. } => {
                self.outstanding_heartbeats = 0;
                false
            }
            MessagePayload::Ack { ack_message_id } => {
                if self.pending.remove(&ack_message_id).is_some() {
                    debug!(message_id = %ack_message_id, "critical message acknowledged");
                } else {
                    debug!(message_id = %ack_message_id, "stale ack");
                }
                false
            }
            MessagePayload::SessionConfigAck
            | MessagePayload::RoleAssignedAck
            | MessagePayload::GateAssignedAck => {
                debug!(tag = payload.tag(), "handshake ack received");
                false
            }
        }
    }

    /// Client: the first of GateAssigned / RoleAssigned completes the
    /// handshake and starts the sync run; the second only acks.
    async fn maybe_complete_client_handshake(&mut self) {
        if self.state() != SessionState::AwaitingAssignment {
            return;
        }
        let Some(config) = self.session_config.clone() else {
            warn!("assignment arrived before the session config, dropping");
            return;
        };
        info!(
            role = ?self.my_role,
            gate = ?self.gate_assignment.as_ref().map(|a| a.gate_index),
            distance_m = config.distance_m,
            "handshake complete"
        );
        self.set_state(SessionState::HandshakeComplete);
        self.send_payload(MessagePayload::SyncRequest {
            mode: SyncMode::Full,
        })
        .await;
        self.set_state(SessionState::Syncing);
        self.begin_sync(SyncMode::Full);
    }

    /// Host: answer a RoleRequest with gate and role assignments. The
    /// host-declared role wins unless the client stated a preference.
    async fn assign_roles(&mut self, client_device_id: String, preferred: Option<Role>) {
        let Some(config) = self.host_config.clone() else {
            self.fail(TimingError::InvalidConfig(
                "role request before session config".into(),
            ))
            .await;
            return;
        };
        let client_role = preferred.unwrap_or_else(|| config.host_role.complement());
        let host_role = client_role.complement();
        self.my_role = Some(host_role);
        info!(%client_role, %host_role, "roles assigned");

        let assignment = GateAssignment::for_role(client_role, &config, client_device_id);
        self.gate_assignment = Some(GateAssignment::for_role(
            host_role,
            &config,
            self.cfg.device_id.clone(),
        ));
        self.emit(SessionEvent::RoleAssigned { role: host_role }).await;
        self.send_critical_payload(MessagePayload::GateAssigned { assignment })
            .await;
        self.send_critical_payload(MessagePayload::RoleAssigned { role: client_role })
            .await;
        self.set_state(SessionState::HandshakeComplete);
    }

    // ── Sync run management ──────────────────────────────────────────────

    fn begin_sync(&mut self, mode: SyncMode) {
        let (ping_tx, mut ping_rx) = mpsc::channel::<MessagePayload>(32);
        let (pong_tx, pong_rx) = mpsc::channel::<PongEnvelope>(128);
        self.pong_tx = Some(pong_tx);
        self.sync_cancel = Arc::new(AtomicBool::new(false));
        self.sync_mode = Some(mode);

        let cancel = self.sync_cancel.clone();
        let engine = self.engine.clone();
        let forward_cmd = self.cmd_tx.clone();
        let finish_cmd = self.cmd_tx.clone();

        // Bridge sync-task pings into the session outbox
        tokio::spawn(async move {
            while let Some(payload) = ping_rx.recv().await {
                if forward_cmd
                    .send(SessionCommand::SyncOutbound(payload))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut channel = SyncChannel {
                outbound: ping_tx,
                pongs: pong_rx,
            };
            let result = match mode {
                SyncMode::Full => engine.start_full_sync(&mut channel, &cancel).await,
                SyncMode::Mini => engine.start_mini_sync(&mut channel, &cancel).await,
            };
            let _ = finish_cmd.send(SessionCommand::SyncFinished(result)).await;
        });
    }

    // ── Outbound plumbing ────────────────────────────────────────────────

    fn make_message(
        &mut self,
        payload: MessagePayload,
        message_id: Option<String>,
    ) -> TimingMessage {
        self.seq += 1;
        TimingMessage {
            protocol_version: PROTOCOL_VERSION,
            sequence: self.seq,
            sender_id: self.cfg.device_id.clone(),
            session_id: self.session_id.clone(),
            timestamp: self.clock.now_nanos(),
            requires_ack: message_id.is_some(),
            message_id,
            payload,
        }
    }

    async fn send_payload(&mut self, payload: MessagePayload) {
        let msg = self.make_message(payload, None);
        self.transmit(&msg).await;
    }

    async fn send_critical_payload(&mut self, payload: MessagePayload) {
        let message_id = Uuid::new_v4().to_string();
        self.pending.insert(
            message_id.clone(),
            PendingCritical {
                payload: payload.clone(),
                retries_left: self.cfg.critical_max_retries,
                next_retry: tokio::time::Instant::now() + self.cfg.critical_retry_interval,
            },
        );
        let msg = self.make_message(payload, Some(message_id));
        self.transmit(&msg).await;
    }

    async fn transmit(&mut self, msg: &TimingMessage) {
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                return;
            }
        };
        if self.writes.enqueue(bytes).await.is_err() {
            self.fail(TimingError::LinkClosed).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::transport::OutboundFrame;
    use timing_types::StartType;

    fn test_config(device_id: &str) -> ProtocolConfig {
        ProtocolConfig {
            device_id: device_id.to_string(),
            ..ProtocolConfig::default()
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            distance_m: 40.0,
            start_type: StartType::Flying,
            gate_count: 2,
            host_role: Role::Start,
        }
    }

    /// A hand-driven fake link: the test plays the peer.
    struct FakeLink {
        events: mpsc::Sender<LinkEvent>,
        frames: mpsc::Receiver<OutboundFrame>,
        seq: u64,
        session_id: String,
    }

    fn fake_link() -> (LinkSession, FakeLink) {
        let (ev_tx, ev_rx) = mpsc::channel(64);
        let (fr_tx, fr_rx) = mpsc::channel(64);
        (
            LinkSession {
                events: ev_rx,
                frames: fr_tx,
            },
            FakeLink {
                events: ev_tx,
                frames: fr_rx,
                seq: 0,
                session_id: String::new(),
            },
        )
    }

    impl FakeLink {
        /// Receive, confirm and decode the next outbound message.
        async fn next_message(&mut self) -> TimingMessage {
            let frame = tokio::time::timeout(Duration::from_secs(20), self.frames.recv())
                .await
                .expect("timed out waiting for an outbound frame")
                .expect("link closed");
            let _ = frame.delivered.send(true);
            let msg = TimingMessage::decode(&frame.payload).unwrap();
            if self.session_id.is_empty() {
                self.session_id = msg.session_id.clone();
            }
            msg
        }

        async fn next_payload(&mut self) -> MessagePayload {
            self.next_message().await.payload
        }

        async fn deliver(&mut self, payload: MessagePayload, message_id: Option<String>) {
            self.seq += 1;
            let msg = TimingMessage {
                protocol_version: PROTOCOL_VERSION,
                sequence: self.seq,
                sender_id: "peer".into(),
                session_id: self.session_id.clone(),
                timestamp: 0,
                requires_ack: message_id.is_some(),
                message_id,
                payload,
            };
            self.events
                .send(LinkEvent::Frame(msg.encode().unwrap()))
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn host_sends_config_after_subscription_and_retries_without_ack() {
        let (link, mut peer) = fake_link();
        let handle = TransportSession::start_as_server(
            link,
            session_config(),
            Arc::new(SystemClock::new()),
            test_config("host"),
        )
        .unwrap();

        peer.events
            .send(LinkEvent::Associated {
                peer_device_id: "client".into(),
                is_server: true,
            })
            .await
            .unwrap();
        peer.events.send(LinkEvent::SubscriptionEnabled).await.unwrap();

        let first = peer.next_message().await;
        assert!(matches!(
            first.payload,
            MessagePayload::SessionConfig { .. }
        ));
        assert!(first.requires_ack);
        let first_id = first.message_id.clone().unwrap();

        // Never ack: the message must be retransmitted with the same
        // message id and a fresh sequence, then become a fatal error.
        let retry = peer.next_message().await;
        assert_eq!(retry.message_id.as_deref(), Some(first_id.as_str()));
        assert!(retry.sequence > first.sequence);

        let mut state = handle.state_stream();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if matches!(handle.state(), SessionState::Error(_)) {
                break;
            }
            // Keep confirming retransmissions so the write queue drains
            tokio::select! {
                m = peer.next_message() => { let _ = m; }
                r = state.changed() => { r.unwrap(); }
                _ = tokio::time::sleep_until(deadline) => panic!("no ack-timeout error"),
            }
        }
        match handle.state() {
            SessionState::Error(reason) => {
                assert!(reason.contains("never acknowledged"), "reason: {reason}")
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn dead_link_is_rejected_up_front() {
        let (link, peer) = fake_link();
        drop(peer);
        let err = TransportSession::start_as_client(
            link,
            Arc::new(SystemClock::new()),
            test_config("client"),
        )
        .unwrap_err();
        assert!(matches!(err, TimingError::TransportUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn host_force_sends_config_when_subscription_never_arrives() {
        let (link, mut peer) = fake_link();
        let _handle = TransportSession::start_as_server(
            link,
            session_config(),
            Arc::new(SystemClock::new()),
            test_config("host"),
        )
        .unwrap();

        peer.events
            .send(LinkEvent::Associated {
                peer_device_id: "client".into(),
                is_server: true,
            })
            .await
            .unwrap();
        // No SubscriptionEnabled: the 5 s safety timer must fire
        let msg = peer.next_message().await;
        assert!(matches!(msg.payload, MessagePayload::SessionConfig { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_timeout_surfaces_no_peer_found() {
        let (link, peer) = fake_link();
        let handle = TransportSession::start_as_client(
            link,
            Arc::new(SystemClock::new()),
            test_config("client"),
        )
        .unwrap();
        // Nobody associates
        tokio::time::sleep(Duration::from_secs(31)).await;
        match handle.state() {
            SessionState::Error(reason) => assert!(reason.contains("no peer")),
            other => panic!("unexpected state {other:?}"),
        }
        drop(peer);
    }

    #[tokio::test(start_paused = true)]
    async fn client_handshake_walks_the_states_in_order() {
        let (link, mut peer) = fake_link();
        let handle = TransportSession::start_as_client(
            link,
            Arc::new(SystemClock::new()),
            test_config("client"),
        )
        .unwrap();
        let mut states = handle.state_stream();

        peer.events
            .send(LinkEvent::Associated {
                peer_device_id: "host".into(),
                is_server: false,
            })
            .await
            .unwrap();

        peer.deliver(
            MessagePayload::SessionConfig {
                config: session_config(),
            },
            Some("cfg-1".into()),
        )
        .await;

        // Envelope ack first, then the payload-level config ack, then the
        // critical role request
        assert!(matches!(
            peer.next_payload().await,
            MessagePayload::Ack { ack_message_id } if ack_message_id == "cfg-1"
        ));
        assert!(matches!(
            peer.next_payload().await,
            MessagePayload::SessionConfigAck
        ));
        let role_req = peer.next_message().await;
        let MessagePayload::RoleRequest { device_id, .. } = &role_req.payload else {
            panic!("expected role request, got {:?}", role_req.payload);
        };
        assert_eq!(device_id, "client");
        assert!(role_req.requires_ack);
        // Ack the critical request like a real host, or it will retransmit
        peer.deliver(
            MessagePayload::Ack {
                ack_message_id: role_req.message_id.clone().unwrap(),
            },
            None,
        )
        .await;

        // First of GateAssigned/RoleAssigned completes the handshake; sync
        // pings begin immediately after, so read tolerantly from here on
        let assignment = GateAssignment::for_role(Role::Finish, &session_config(), "client".into());
        peer.deliver(
            MessagePayload::GateAssigned { assignment },
            Some("gate-1".into()),
        )
        .await;
        peer.deliver(
            MessagePayload::RoleAssigned { role: Role::Finish },
            Some("role-1".into()),
        )
        .await;

        const TRUE_OFFSET: i64 = 2_000_000;
        let mut acked = Vec::new();
        let mut gate_acks = 0;
        let mut role_acks = 0;
        let mut sync_requests = 0;
        loop {
            let msg = peer.next_message().await;
            match msg.payload {
                MessagePayload::Ack { ack_message_id } => acked.push(ack_message_id),
                MessagePayload::GateAssignedAck => gate_acks += 1,
                MessagePayload::RoleAssignedAck => role_acks += 1,
                MessagePayload::SyncRequest {
                    mode: SyncMode::Full,
                } => sync_requests += 1,
                MessagePayload::SyncPing { ping_id, t1 } => {
                    let t2 = t1 + TRUE_OFFSET;
                    peer.deliver(
                        MessagePayload::SyncPong {
                            ping_id,
                            t1_echo: t1,
                            t2,
                            t3: t2,
                        },
                        None,
                    )
                    .await;
                }
                MessagePayload::SyncComplete { offset_nanos, .. } => {
                    assert!((offset_nanos - TRUE_OFFSET).abs() < 2_000_000);
                    break;
                }
                MessagePayload::HeartbeatPing { .. } => {}
                other => panic!("unexpected payload during sync: {other:?}"),
            }
        }
        assert!(acked.contains(&"gate-1".to_string()));
        assert!(acked.contains(&"role-1".to_string()));
        assert_eq!(gate_acks, 1);
        assert_eq!(role_acks, 1);
        assert_eq!(sync_requests, 1, "handshake completed more than once");

        // Wait for Ready
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while handle.state() != SessionState::Ready {
            tokio::select! {
                r = states.changed() => r.unwrap(),
                _ = tokio::time::sleep_until(deadline) => panic!("never reached Ready"),
            }
        }
        assert!(handle.engine().has_synced());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_critical_delivery_acks_again_but_forwards_once() {
        let (link, mut peer) = fake_link();
        let _handle = TransportSession::start_as_client(
            link,
            Arc::new(SystemClock::new()),
            test_config("client"),
        )
        .unwrap();

        peer.events
            .send(LinkEvent::Associated {
                peer_device_id: "host".into(),
                is_server: false,
            })
            .await
            .unwrap();

        peer.deliver(
            MessagePayload::SessionConfig {
                config: session_config(),
            },
            Some("cfg-1".into()),
        )
        .await;
        assert!(matches!(peer.next_payload().await, MessagePayload::Ack { .. }));
        assert!(matches!(
            peer.next_payload().await,
            MessagePayload::SessionConfigAck
        ));
        assert!(matches!(
            peer.next_payload().await,
            MessagePayload::RoleRequest { .. }
        ));

        // Redelivery (fresh sequence, same message id): exactly one more
        // Ack, no second config ack or role request
        peer.deliver(
            MessagePayload::SessionConfig {
                config: session_config(),
            },
            Some("cfg-1".into()),
        )
        .await;
        assert!(matches!(
            peer.next_payload().await,
            MessagePayload::Ack { ack_message_id } if ack_message_id == "cfg-1"
        ));
        let extra = tokio::time::timeout(Duration::from_millis(400), peer.frames.recv()).await;
        match extra {
            Err(_) => {}
            Ok(Some(frame)) => {
                let _ = frame.delivered.send(true);
                let msg = TimingMessage::decode(&frame.payload).unwrap();
                panic!("duplicate delivery was forwarded: {:?}", msg.payload);
            }
            Ok(None) => panic!("link closed unexpectedly"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_messages_are_dropped() {
        let (link, mut peer) = fake_link();
        let _handle = TransportSession::start_as_client(
            link,
            Arc::new(SystemClock::new()),
            test_config("client"),
        )
        .unwrap();
        peer.events
            .send(LinkEvent::Associated {
                peer_device_id: "host".into(),
                is_server: false,
            })
            .await
            .unwrap();

        // Seed the peer sequence high, then replay a lower one
        peer.seq = 10;
        peer.deliver(MessagePayload::HeartbeatPing { seq: 1 }, None).await;
        assert!(matches!(
            peer.next_payload().await,
            MessagePayload::HeartbeatPong { seq: 1 }
        ));

        peer.seq = 4; // deliver() bumps to 5, below the last seen 11
        peer.deliver(MessagePayload::HeartbeatPing { seq: 2 }, None).await;
        let extra = tokio::time::timeout(Duration::from_millis(400), peer.frames.recv()).await;
        assert!(extra.is_err(), "out-of-order message was processed");
    }
}
