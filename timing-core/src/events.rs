//! # events
//!
//! Observable session surface: the reactive state channel, the event stream
//! delivered to the embedding app, and the race-result record handed to the
//! persistence collaborator.

use serde::{Deserialize, Serialize};
use timing_types::{GateAssignment, Role, SessionConfig, StartType, SyncQuality};

// ── Session State ────────────────────────────────────────────────────────────

/// Protocol state as observed on the `watch` channel. The client walks
/// Idle → Connected → AwaitingConfig → AwaitingAssignment → HandshakeComplete
/// → Syncing → Ready; the host walks Idle → Connected → ClientReady →
/// AwaitingRole → HandshakeComplete → Syncing → Ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Connected,
    AwaitingConfig,
    AwaitingAssignment,
    ClientReady,
    AwaitingRole,
    HandshakeComplete,
    Syncing,
    Ready,
    /// Recoverable fault — session torn down, user-visible reason attached.
    Error(String),
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error(_) | SessionState::Stopped)
    }
}

// ── Session Events ───────────────────────────────────────────────────────────

/// Payload-level happenings forwarded to the embedding app after protocol
/// bookkeeping (acks, dedup, sequencing) has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session parameters learned from the host.
    SessionConfigured { config: SessionConfig },
    /// Our negotiated role for this session.
    RoleAssigned { role: Role },
    /// Our gate parameters for this session.
    GateAssigned { assignment: GateAssignment },
    /// Peer's start-gate crossing, already translated into our time frame.
    StartReceived {
        run_id: String,
        start_time_nanos: i64,
        uncertainty_nanos: i64,
    },
    /// Raw crossing observation from the peer, in the peer's clock.
    CrossingReceived {
        run_id: String,
        role: Role,
        crossing_time_nanos: i64,
    },
    /// Peer finished its sync run and reported its estimate.
    PeerSyncComplete {
        offset_nanos: i64,
        uncertainty_nanos: i64,
        quality: SyncQuality,
    },
    /// Our own sync run finished.
    SyncFinished {
        offset_nanos: i64,
        uncertainty_nanos: i64,
        quality: SyncQuality,
    },
    NewRun { run_id: String },
    RunCancelled { run_id: String },
    PeerAborted { reason: String },
    /// Heartbeat pongs stopped arriving. Informational — the session is not
    /// torn down automatically.
    HeartbeatStale { missed: u32 },
}

// ── Race Result ──────────────────────────────────────────────────────────────

/// Published to the external persistence collaborator after a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceResult {
    pub run_id: String,
    pub distance_m: f64,
    pub start_type: StartType,
    pub split_secs: f64,
    /// Combined measurement uncertainty: sync plus one half-frame of
    /// quantization per detector.
    pub uncertainty_secs: f64,
}

/// Object-store key for a crossing thumbnail written by the capture side.
pub fn thumbnail_key(session_id: &str, role: Role, epoch_ms: u64) -> String {
    format!("sessions/{session_id}/crossing_{role}_{epoch_ms}.jpg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_key_shape() {
        assert_eq!(
            thumbnail_key("s-1", Role::Finish, 1700000000123),
            "sessions/s-1/crossing_finish_1700000000123.jpg"
        );
    }
}
