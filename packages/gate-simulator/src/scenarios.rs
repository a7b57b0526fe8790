//! scenarios.rs — Scenario presets and the config.toml schema
//!
//! Each scenario reproduces one real-world condition the core must survive:
//! clean short-range radio, a congested asymmetric path, lossy handshakes,
//! silent subscription stacks. The numeric session parameters (distance,
//! split, frame rate, clock offset, latency floor) live in `config.toml`;
//! a scenario preset layers its fault knobs on top. Used by the `gate-sim`
//! binary and the end-to-end tests.

use serde::{Deserialize, Serialize};

use crate::frames::CameraSpec;
use crate::link::SimLinkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    /// Short, steady latency; everything arrives.
    CleanLink,
    /// Long-tailed RTTs with bursts of host-side delay.
    AsymmetricDelay,
    /// The first SessionConfig deliveries vanish; retransmission recovers.
    HandshakeLoss,
    /// No subscription signal; the host's safety timeout must fire.
    SilentSubscription,
}

impl ScenarioType {
    pub fn link_config(self, seed: u64) -> SimLinkConfig {
        match self {
            ScenarioType::CleanLink => SimLinkConfig {
                seed,
                ..SimLinkConfig::default()
            },
            ScenarioType::AsymmetricDelay => SimLinkConfig {
                latency_mean_ms: 12.0,
                latency_sigma_ms: 6.0,
                asym_extra_ms: 80.0,
                asym_fraction: 0.3,
                seed,
                ..SimLinkConfig::default()
            },
            ScenarioType::HandshakeLoss => SimLinkConfig {
                drop_first_to_client: 3,
                seed,
                ..SimLinkConfig::default()
            },
            ScenarioType::SilentSubscription => SimLinkConfig {
                subscription_delay_ms: None,
                seed,
                ..SimLinkConfig::default()
            },
        }
    }
}

/// Camera preset for a given frame rate, with the matching rear-camera
/// readout duration.
pub fn camera_for_fps(fps: f64) -> CameraSpec {
    let readout_nanos = if fps >= 200.0 {
        3_000_000
    } else if fps >= 100.0 {
        5_000_000
    } else {
        12_000_000
    };
    CameraSpec::rear(fps, readout_nanos)
}

// ── config.toml schema ───────────────────────────────────────────────────────

/// Parsed `config.toml`. Scenario fault knobs are not in here — they come
/// from the [`ScenarioType`] preset; the `[link]` section only adjusts the
/// latency floor the preset builds on.
#[derive(Debug, Clone, Deserialize)]
pub struct SimFileConfig {
    pub race: RaceSection,
    pub camera: CameraSection,
    pub clock: ClockSection,
    #[serde(default)]
    pub link: LinkSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaceSection {
    /// Gate-to-gate distance in metres.
    pub distance_m: f64,
    /// Ground-truth split to simulate, seconds.
    pub split_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraSection {
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockSection {
    /// Artificial offset of the host device's monotonic clock, milliseconds.
    pub host_offset_ms: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkSection {
    pub latency_mean_ms: Option<f64>,
    pub latency_sigma_ms: Option<f64>,
    pub drop_probability: Option<f64>,
}

impl SimFileConfig {
    /// Link config for one run: the scenario preset, with the file's
    /// `[link]` overrides applied on top.
    pub fn link_config(&self, scenario: ScenarioType, seed: u64) -> SimLinkConfig {
        let mut cfg = scenario.link_config(seed);
        if let Some(v) = self.link.latency_mean_ms {
            cfg.latency_mean_ms = v;
        }
        if let Some(v) = self.link.latency_sigma_ms {
            cfg.latency_sigma_ms = v;
        }
        if let Some(v) = self.link.drop_probability {
            cfg.drop_probability = v;
        }
        cfg
    }

    pub fn camera(&self) -> CameraSpec {
        camera_for_fps(self.camera.fps)
    }
}
