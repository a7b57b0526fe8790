//! # timing-core
//!
//! Timing core of the Splitline two-phone sprint timer: a start device and a
//! finish device, paired over a short-range radio link, measure an athlete's
//! split across a known distance. Each device watches its own gate with its
//! camera; the two observations are fused through a pairwise clock-sync
//! protocol.
//!
//! The crate has four load-bearing pieces:
//! - [`sync`]: NTP-style offset estimation with quality gating and
//!   [`drift`] tracking
//! - [`protocol`]: discovery, role negotiation and reliable critical
//!   delivery over the asymmetric link in [`transport`]
//! - [`detector`]: the per-frame photo-finish pipeline over [`ccl`]
//! - [`split`]: the cross-device split contract, with the optional
//!   [`relay`] backup path
//!
//! No platform I/O happens here: cameras, radios and persistence are
//! collaborators behind the seams in [`transport`], [`clock`], [`relay`]
//! and [`events`].

pub mod ccl;
pub mod clock;
pub mod detector;
pub mod drift;
pub mod error;
pub mod events;
pub mod protocol;
pub mod relay;
pub mod split;
pub mod sync;
pub mod transport;

pub use clock::{MonotonicClock, SharedClock, SystemClock};
pub use detector::{DetectionResult, DetectorState, PhotoFinishDetector, RejectionReason};
pub use error::TimingError;
pub use events::{RaceResult, SessionEvent, SessionState};
pub use protocol::{ProtocolConfig, SessionHandle, TransportSession};
pub use split::SplitCalculator;
pub use sync::{SyncEngine, SyncResult};
