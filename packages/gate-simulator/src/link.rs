//! link.rs — Simulated short-range radio link
//!
//! Builds a pair of `LinkSession`s joined by two direction tasks. Each task
//! delivers frames strictly in order after a Normal-distributed latency, so
//! FIFO ordering holds and the core's single-writer queue is paced the way a
//! real write-with-response characteristic paces it. Drop knobs cover lossy
//! conditions and the handshake-loss scenario (first N host→client
//! deliveries vanish after the radio confirms the write).

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::sync::mpsc;
use tracing::{debug, info};

use timing_core::transport::{LinkEvent, LinkSession, OutboundFrame};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimLinkConfig {
    /// One-way latency distribution, milliseconds.
    pub latency_mean_ms: f64,
    pub latency_sigma_ms: f64,
    /// Probability that a delivery is lost after the write is confirmed.
    pub drop_probability: f64,
    /// Extra host-side delay added to this fraction of host→client
    /// deliveries (asymmetric-path stress).
    pub asym_extra_ms: f64,
    pub asym_fraction: f64,
    /// Drop the first N host→client deliveries outright.
    pub drop_first_to_client: u32,
    /// Delay before the client's notification subscription is signalled.
    /// None models a stack that never signals it.
    pub subscription_delay_ms: Option<u64>,
    pub seed: u64,
}

impl Default for SimLinkConfig {
    fn default() -> Self {
        Self {
            latency_mean_ms: std::env::var("GATE_SIM_LATENCY_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(5.0),
            latency_sigma_ms: std::env::var("GATE_SIM_LATENCY_SIGMA_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
            drop_probability: std::env::var("GATE_SIM_DROP_PROBABILITY")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(0.0),
            asym_extra_ms: 0.0,
            asym_fraction: 0.0,
            drop_first_to_client: 0,
            subscription_delay_ms: Some(50),
            seed: 42,
        }
    }
}

// ── Pair construction ────────────────────────────────────────────────────────

/// Create a connected (host, client) pair of link sessions. Association and
/// the subscription signal are emitted by a small setup task.
pub fn spawn_pair(config: SimLinkConfig) -> (LinkSession, LinkSession) {
    let (host_ev_tx, host_ev_rx) = mpsc::channel::<LinkEvent>(256);
    let (client_ev_tx, client_ev_rx) = mpsc::channel::<LinkEvent>(256);
    let (host_fr_tx, host_fr_rx) = mpsc::channel::<OutboundFrame>(64);
    let (client_fr_tx, client_fr_rx) = mpsc::channel::<OutboundFrame>(64);

    // Host → client direction carries the drop-first and asymmetric knobs
    tokio::spawn(run_direction(
        DirectionConfig {
            label: "host→client",
            latency_mean_ms: config.latency_mean_ms,
            latency_sigma_ms: config.latency_sigma_ms,
            drop_probability: config.drop_probability,
            asym_extra_ms: config.asym_extra_ms,
            asym_fraction: config.asym_fraction,
            drop_first: config.drop_first_to_client,
            seed: config.seed,
        },
        host_fr_rx,
        client_ev_tx.clone(),
    ));
    tokio::spawn(run_direction(
        DirectionConfig {
            label: "client→host",
            latency_mean_ms: config.latency_mean_ms,
            latency_sigma_ms: config.latency_sigma_ms,
            drop_probability: config.drop_probability,
            asym_extra_ms: 0.0,
            asym_fraction: 0.0,
            drop_first: 0,
            seed: config.seed.wrapping_add(1),
        },
        client_fr_rx,
        host_ev_tx.clone(),
    ));

    // Association + subscription signalling
    let subscription_delay = config.subscription_delay_ms;
    tokio::spawn(async move {
        let _ = host_ev_tx
            .send(LinkEvent::Associated {
                peer_device_id: "sim-client".into(),
                is_server: true,
            })
            .await;
        let _ = client_ev_tx
            .send(LinkEvent::Associated {
                peer_device_id: "sim-host".into(),
                is_server: false,
            })
            .await;
        if let Some(delay_ms) = subscription_delay {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            info!("sim link: client subscribed to notifications");
            let _ = host_ev_tx.send(LinkEvent::SubscriptionEnabled).await;
        }
    });

    (
        LinkSession {
            events: host_ev_rx,
            frames: host_fr_tx,
        },
        LinkSession {
            events: client_ev_rx,
            frames: client_fr_tx,
        },
    )
}

struct DirectionConfig {
    label: &'static str,
    latency_mean_ms: f64,
    latency_sigma_ms: f64,
    drop_probability: f64,
    asym_extra_ms: f64,
    asym_fraction: f64,
    drop_first: u32,
    seed: u64,
}

/// One direction of the link. Frames are processed strictly one at a time:
/// sleep the sampled latency, deliver (or drop), then confirm the write so
/// the sender's queue releases the next frame.
async fn run_direction(
    cfg: DirectionConfig,
    mut frames: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let latency = Normal::new(cfg.latency_mean_ms, cfg.latency_sigma_ms)
        .unwrap_or_else(|_| Normal::new(cfg.latency_mean_ms, 0.001).unwrap());
    let mut dropped_head = 0u32;

    while let Some(frame) = frames.recv().await {
        let mut delay_ms = latency.sample(&mut rng).max(0.1);
        if cfg.asym_fraction > 0.0 && rng.gen_bool(cfg.asym_fraction) {
            delay_ms += cfg.asym_extra_ms;
        }
        tokio::time::sleep(Duration::from_micros((delay_ms * 1000.0) as u64)).await;

        let head_drop = dropped_head < cfg.drop_first;
        let random_drop =
            cfg.drop_probability > 0.0 && rng.gen_bool(cfg.drop_probability);
        if head_drop || random_drop {
            if head_drop {
                dropped_head += 1;
            }
            debug!(direction = cfg.label, "sim link dropped a delivery");
        } else if events
            .send(LinkEvent::Frame(frame.payload))
            .await
            .is_err()
        {
            return;
        }
        // The radio confirmed the write either way; loss happens above it
        let _ = frame.delivered.send(true);
    }
}
