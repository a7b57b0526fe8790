//! # timing-types
//!
//! Shared protocol types for the Splitline two-phone sprint-timing system.
//!
//! These types are used by:
//! - `timing-core`: the clock-sync engine, pairing protocol and split calculator
//! - `gate-simulator`: the simulated link and two-device test harness
//! - Swift/Kotlin bridges: the JSON wire shapes here are the cross-platform
//!   contract and must stay byte-identical between peers
//!
//! ## Wire Conventions
//!
//! - Envelope and payload field names are snake_case, fixed forever
//! - Payload variants are internally tagged (`type`) in SCREAMING_SNAKE_CASE
//! - All timestamps are signed 64-bit nanoseconds on a monotonic clock
//!
//! ## Invariants
//! - `sequence` is strictly increasing per sender within a session
//! - `message_id` is present iff `requires_ack` is true
//! - Encoding then decoding a `TimingMessage` yields an equal value

use serde::{Deserialize, Serialize};

// ── Protocol & Link Descriptor Constants ─────────────────────────────────────

/// Wire protocol version. Bump only on incompatible envelope changes.
pub const PROTOCOL_VERSION: u32 = 3;

/// Service descriptor advertised by the host device. Opaque, chosen once,
/// never changed — must match byte-for-byte on every platform.
pub const LINK_SERVICE_UUID: &str = "8f1e7a52-4d6b-4b9e-9c3a-2f0d81c55e10";

/// TX characteristic (host → client, notify + read).
pub const LINK_TX_CHAR_UUID: &str = "8f1e7a53-4d6b-4b9e-9c3a-2f0d81c55e10";

/// RX characteristic (client → host, write with/without response).
pub const LINK_RX_CHAR_UUID: &str = "8f1e7a54-4d6b-4b9e-9c3a-2f0d81c55e10";

/// Maximum payload per link frame. The preferred MTU equals this so full
/// JSON messages fit without fragmentation.
pub const LINK_MAX_PAYLOAD: usize = 512;

// ── Roles & Session Parameters ───────────────────────────────────────────────

/// Which gate a device operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Start,
    Finish,
}

impl Role {
    pub fn complement(self) -> Role {
        match self {
            Role::Start => Role::Finish,
            Role::Finish => Role::Start,
        }
    }

    /// Gate index convention: 0 = start gate, 1 = finish gate.
    pub fn gate_index(self) -> u8 {
        match self {
            Role::Start => 0,
            Role::Finish => 1,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Start => write!(f, "start"),
            Role::Finish => write!(f, "finish"),
        }
    }
}

/// How the athlete begins the run. Closed set — scoring semantics differ
/// downstream but the timing core treats these as an opaque tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartType {
    Standing,
    Flying,
    ThreePoint,
    Blocks,
    TouchRelease,
}

/// Session parameters. Negotiated once at handshake; the host is the source
/// of truth and the config is immutable for the life of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Gate-to-gate distance in metres. Must be positive.
    pub distance_m: f64,
    pub start_type: StartType,
    /// Number of gates in the session. Two in this protocol version.
    pub gate_count: u8,
    /// The role the host declared for itself.
    pub host_role: Role,
}

impl SessionConfig {
    pub fn is_valid(&self) -> bool {
        self.distance_m > 0.0 && self.gate_count == 2
    }
}

/// One gate assignment, addressed to a specific device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateAssignment {
    pub role: Role,
    /// 0 = start, 1 = finish.
    pub gate_index: u8,
    /// 0 for the start gate, the session distance for the finish gate.
    pub distance_from_start_m: f64,
    /// The device this assignment applies to.
    pub target_device_id: String,
}

impl GateAssignment {
    pub fn for_role(role: Role, session: &SessionConfig, target_device_id: String) -> Self {
        let distance_from_start_m = match role {
            Role::Start => 0.0,
            Role::Finish => session.distance_m,
        };
        Self {
            role,
            gate_index: role.gate_index(),
            distance_from_start_m,
            target_device_id,
        }
    }
}

// ── Sync Quality ─────────────────────────────────────────────────────────────

/// Discrete grading of one sync run, keyed on aggregate uncertainty.
/// Tier boundaries: EXCELLENT < 3 ms ≤ GOOD < 5 ≤ FAIR < 10 ≤ POOR < 15 ≤ BAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl SyncQuality {
    pub fn from_uncertainty_nanos(uncertainty_nanos: i64) -> Self {
        const MS: i64 = 1_000_000;
        if uncertainty_nanos < 3 * MS {
            SyncQuality::Excellent
        } else if uncertainty_nanos < 5 * MS {
            SyncQuality::Good
        } else if uncertainty_nanos < 10 * MS {
            SyncQuality::Fair
        } else if uncertainty_nanos < 15 * MS {
            SyncQuality::Poor
        } else {
            SyncQuality::Bad
        }
    }

    /// A run is usable for timing iff quality ≥ FAIR.
    pub fn is_acceptable(self) -> bool {
        matches!(
            self,
            SyncQuality::Excellent | SyncQuality::Good | SyncQuality::Fair
        )
    }
}

// ── Sync Mode ────────────────────────────────────────────────────────────────

/// Full sync establishes the offset before a race; mini-sync refreshes it
/// mid-session with a shorter burst and a looser RTT ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    Full,
    Mini,
}

impl SyncMode {
    /// Number of ping/pong exchanges in one run.
    pub fn sample_count(self) -> usize {
        match self {
            SyncMode::Full => 100,
            SyncMode::Mini => 30,
        }
    }

    /// Nominal inter-ping interval (jitter is applied on top).
    pub fn interval_ms(self) -> u64 {
        match self {
            SyncMode::Full => 50,
            SyncMode::Mini => 100,
        }
    }

    /// Per-mode RTT admission ceiling.
    pub fn rtt_ceiling_nanos(self) -> i64 {
        const MS: i64 = 1_000_000;
        match self {
            SyncMode::Full => 200 * MS,
            SyncMode::Mini => 350 * MS,
        }
    }
}

// ── Timing Message Envelope ──────────────────────────────────────────────────

/// The wire envelope. Every message between the two devices, on every path
/// (link or relay), uses this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingMessage {
    pub protocol_version: u32,
    /// Strictly increasing per sender. Verifies FIFO delivery on the link.
    pub sequence: u64,
    pub sender_id: String,
    pub session_id: String,
    /// Sender's monotonic clock at enqueue, nanoseconds.
    pub timestamp: i64,
    /// End-to-end acknowledgement demanded. See critical-delivery contract.
    pub requires_ack: bool,
    /// Present iff `requires_ack`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub payload: MessagePayload,
}

impl TimingMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── Message Payloads ─────────────────────────────────────────────────────────

/// Closed payload variant set. The tag string is the cross-platform contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    /// Host → client: the negotiated session parameters. Critical.
    SessionConfig { config: SessionConfig },
    SessionConfigAck,
    /// Client → host: request a role. Critical.
    RoleRequest {
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        preferred_role: Option<Role>,
    },
    /// Host → client: the role this client will operate. Critical.
    RoleAssigned { role: Role },
    RoleAssignedAck,
    /// Host → client: gate parameters for the client's role. Critical.
    GateAssigned { assignment: GateAssignment },
    GateAssignedAck,
    /// Client → server clock probe. `t1` is the client send timestamp.
    SyncPing { ping_id: String, t1: i64 },
    /// Server reply. `t1_echo` is an integrity check against the ping.
    SyncPong {
        ping_id: String,
        t1_echo: i64,
        t2: i64,
        t3: i64,
    },
    /// Client → host: about to begin a sync run.
    SyncRequest { mode: SyncMode },
    /// Client → host: sync run finished; carries the client's estimate.
    SyncComplete {
        offset_nanos: i64,
        uncertainty_nanos: i64,
        quality: SyncQuality,
    },
    /// Start-gate crossing, already translated into the receiver's clock.
    StartEvent {
        run_id: String,
        start_time_nanos: i64,
        uncertainty_nanos: i64,
    },
    /// Raw crossing observation (either gate), in the sender's clock.
    CrossingEvent {
        run_id: String,
        role: Role,
        crossing_time_nanos: i64,
    },
    HeartbeatPing { seq: u64 },
    /// Echoes the ping's `seq`.
    HeartbeatPong { seq: u64 },
    NewRun { run_id: String },
    CancelRun { run_id: String },
    Abort { reason: String },
    /// End-to-end acknowledgement of a critical message.
    Ack { ack_message_id: String },
}

impl MessagePayload {
    /// Payloads that demand end-to-end acknowledgement when sent through
    /// the normal handshake path.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            MessagePayload::SessionConfig { .. }
                | MessagePayload::RoleRequest { .. }
                | MessagePayload::RoleAssigned { .. }
                | MessagePayload::GateAssigned { .. }
        )
    }

    /// Stable tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            MessagePayload::SessionConfig { .. } => "SESSION_CONFIG",
            MessagePayload::SessionConfigAck => "SESSION_CONFIG_ACK",
            MessagePayload::RoleRequest { .. } => "ROLE_REQUEST",
            MessagePayload::RoleAssigned { .. } => "ROLE_ASSIGNED",
            MessagePayload::RoleAssignedAck => "ROLE_ASSIGNED_ACK",
            MessagePayload::GateAssigned { .. } => "GATE_ASSIGNED",
            MessagePayload::GateAssignedAck => "GATE_ASSIGNED_ACK",
            MessagePayload::SyncPing { .. } => "SYNC_PING",
            MessagePayload::SyncPong { .. } => "SYNC_PONG",
            MessagePayload::SyncRequest { .. } => "SYNC_REQUEST",
            MessagePayload::SyncComplete { .. } => "SYNC_COMPLETE",
            MessagePayload::StartEvent { .. } => "START_EVENT",
            MessagePayload::CrossingEvent { .. } => "CROSSING_EVENT",
            MessagePayload::HeartbeatPing { .. } => "HEARTBEAT_PING",
            MessagePayload::HeartbeatPong { .. } => "HEARTBEAT_PONG",
            MessagePayload::NewRun { .. } => "NEW_RUN",
            MessagePayload::CancelRun { .. } => "CANCEL_RUN",
            MessagePayload::Abort { .. } => "ABORT",
            MessagePayload::Ack { .. } => "ACK",
        }
    }
}

// ── Cloud Relay Record ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayEventType {
    Start,
    Finish,
}

/// Race event published through the best-effort cloud relay as a redundant
/// path alongside the link. Loss is not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceEventRecord {
    pub session_id: String,
    pub event_type: RelayEventType,
    /// Crossing time in the publisher's monotonic clock, nanoseconds.
    pub crossing_time_nanos: i64,
    pub device_id: String,
    /// The publisher's clock offset at emission, so the recipient can
    /// interpret `crossing_time_nanos` in its own frame.
    pub clock_offset_nanos: i64,
    pub uncertainty_ms: f64,
}

impl RaceEventRecord {
    /// Recipients deduplicate on this key; the first-arriving copy wins.
    pub fn dedup_key(&self) -> (String, RelayEventType, String) {
        (
            self.session_id.clone(),
            self.event_type,
            self.device_id.clone(),
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
