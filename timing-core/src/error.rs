//! # error
//!
//! Error surface of the timing core. Per-frame input rejections are values
//! on `DetectionResult`, never errors; protocol violations are logged and
//! the offending message dropped. What remains here are the recoverable
//! transport faults and the fatal configuration faults.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimingError {
    /// The link closed underneath an active operation.
    #[error("link transport closed")]
    LinkClosed,

    /// Dual-mode advertise/scan expired without an association.
    #[error("no peer found within the scan window")]
    ScanTimeout,

    /// A sync run could not produce an acceptable result.
    #[error("clock sync failed: {0}")]
    SyncFailed(String),

    /// A sync run was cancelled at a suspension point.
    #[error("clock sync cancelled")]
    SyncCancelled,

    /// A critical message exhausted its retry budget without an Ack.
    #[error("critical message {message_id} was never acknowledged")]
    AckTimeout { message_id: String },

    /// Session parameters failed validation before any negotiation.
    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    /// The session was stopped by the user while an operation was pending.
    #[error("session stopped")]
    SessionStopped,

    /// The transport is not available on this device (missing radio,
    /// permission denied). Surfaced immediately; the core shuts down.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}
