//! main.rs — Two-device simulation entry point
//!
//! Wires two timing-core sessions through the simulated link, runs pairing
//! and full clock sync, then drives a synthetic athlete pass across both
//! gate cameras and prints the measured split next to ground truth.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use timing_core::split::{self, SplitCalculator};
use timing_core::{
    MonotonicClock, PhotoFinishDetector, ProtocolConfig, SessionEvent, SessionHandle,
    SessionState, SharedClock, SystemClock, TransportSession,
};
use timing_types::{MessagePayload, Role, SessionConfig, StartType};

use gate_simulator::clocks::OffsetClock;
use gate_simulator::frames::SyntheticGate;
use gate_simulator::link::spawn_pair;
use gate_simulator::scenarios::{ScenarioType, SimFileConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "gate-sim", about = "Splitline two-device timing simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Link scenario preset
    #[arg(long, value_enum, default_value = "clean-link")]
    scenario: Scenario,
    /// Noise seed for the link and the cameras
    #[arg(long, default_value = "42")]
    seed: u64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Scenario {
    CleanLink,
    AsymmetricDelay,
    HandshakeLoss,
    SilentSubscription,
}

impl From<Scenario> for ScenarioType {
    fn from(s: Scenario) -> Self {
        match s {
            Scenario::CleanLink => ScenarioType::CleanLink,
            Scenario::AsymmetricDelay => ScenarioType::AsymmetricDelay,
            Scenario::HandshakeLoss => ScenarioType::HandshakeLoss,
            Scenario::SilentSubscription => ScenarioType::SilentSubscription,
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn wait_ready(handle: &SessionHandle, label: &str) -> Result<()> {
    let mut states = handle.state_stream();
    loop {
        match handle.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Error(reason) => bail!("{label} session failed: {reason}"),
            _ => states
                .changed()
                .await
                .context("session task ended unexpectedly")?,
        }
    }
}

/// Feed synthetic frames to a detector until it triggers; report the
/// compensated crossing time on the channel.
fn spawn_gate_camera(clock: SharedClock, fps: f64, mut gate: SyntheticGate, triggers: mpsc::Sender<i64>) {
    tokio::spawn(async move {
        let spec = gate.spec;
        let mut detector = PhotoFinishDetector::new();
        detector.configure(fps, false);
        detector.set_gate_position(0.5);

        let mut buf = Vec::new();
        let mut ticker = tokio::time::interval(Duration::from_nanos(
            spec.frame_duration_nanos() as u64,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
        let mut frame_index = 0u64;
        loop {
            ticker.tick().await;
            let pts = clock.now_nanos();
            gate.render_into(pts, &mut buf);
            let result = detector.process_frame(
                &buf,
                spec.width,
                spec.height,
                spec.row_stride,
                frame_index,
                pts,
            );
            frame_index += 1;
            if let Some(t) = result.crossing_time_nanos {
                let _ = triggers.send(t).await;
                return;
            }
        }
    });
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gate_sim=info,timing_core=info".into()),
        )
        .init();

    let args = Args::parse();

    // Session parameters from config.toml; fall back to the bundled defaults
    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let file: SimFileConfig =
        toml::from_str(&config_str).with_context(|| format!("invalid {}", args.config))?;

    let scenario: ScenarioType = args.scenario.into();
    info!(
        "🏁 gate-sim starting — {:.0} m, {} fps, host offset {} ms, scenario {:?}",
        file.race.distance_m, file.camera.fps, file.clock.host_offset_ms, scenario
    );

    // Two devices, one shared time base with a known offset for scoring
    let base = SystemClock::new();
    let host_clock = Arc::new(OffsetClock::new(
        base,
        (file.clock.host_offset_ms * 1e6) as i64,
    ));
    let client_clock = Arc::new(OffsetClock::new(base, 0));

    let (host_link, client_link) = spawn_pair(file.link_config(scenario, args.seed));

    let session_config = SessionConfig {
        distance_m: file.race.distance_m,
        start_type: StartType::Flying,
        gate_count: 2,
        host_role: Role::Start,
    };

    let mut host = TransportSession::start_as_server(
        host_link,
        session_config.clone(),
        host_clock.clone(),
        ProtocolConfig {
            device_id: "sim-host".into(),
            ..ProtocolConfig::default()
        },
    )?;
    let mut client = TransportSession::start_as_client(
        client_link,
        client_clock.clone(),
        ProtocolConfig {
            device_id: "sim-client".into(),
            ..ProtocolConfig::default()
        },
    )?;

    wait_ready(&host, "host").await?;
    wait_ready(&client, "client").await?;

    let sync = client
        .engine()
        .last_result()
        .context("client reached Ready without a sync result")?;
    info!(
        "clock sync: offset {:.3} ms (truth {:.3}), quality {:?}, rtt p50 {:.1} ms",
        sync.offset_nanos as f64 / 1e6,
        file.clock.host_offset_ms,
        sync.quality,
        sync.rtt_p50_nanos as f64 / 1e6,
    );

    // Capture the peer-reported uncertainty for the start event
    let mut start_uncertainty = sync.uncertainty_nanos;
    while let Ok(event) = host.events.try_recv() {
        if let SessionEvent::PeerSyncComplete {
            uncertainty_nanos, ..
        } = event
        {
            start_uncertainty = uncertainty_nanos;
        }
    }

    // ── Synthetic athlete pass ────────────────────────────────────────────
    let run_id = Uuid::new_v4().to_string();
    host.send(MessagePayload::NewRun {
        run_id: run_id.clone(),
    })
    .await?;

    let spec = file.camera();
    let gate_capture_x = spec.width as f64 / 2.0;
    let velocity = 1200.0; // capture px/s
    let lead_in_nanos = 1_500_000_000; // settle + warm-up margin

    // Plan both crossings on the shared base, then express each camera's
    // schedule in its own device clock
    let plan_base = base.now_nanos();
    let start_cross_base = plan_base + lead_in_nanos;
    let finish_cross_base = start_cross_base + (file.race.split_secs * 1e9) as i64;
    let entry_px = gate_capture_x - 140.0;
    let entry_offset = ((140.0 / velocity) * 1e9) as i64;

    let host_gate = SyntheticGate::new(
        spec,
        entry_px,
        velocity,
        start_cross_base + (file.clock.host_offset_ms * 1e6) as i64 - entry_offset,
        0.5,
        args.seed,
    );
    let client_gate = SyntheticGate::new(
        spec,
        entry_px,
        velocity,
        finish_cross_base - entry_offset,
        0.5,
        args.seed + 1,
    );

    let (host_trigger_tx, mut host_trigger_rx) = mpsc::channel(1);
    let (client_trigger_tx, mut client_trigger_rx) = mpsc::channel(1);
    spawn_gate_camera(host_clock.clone(), spec.fps, host_gate, host_trigger_tx);
    spawn_gate_camera(
        client_clock.clone(),
        spec.fps,
        client_gate,
        client_trigger_tx,
    );

    let mut calc = SplitCalculator::new(session_config, spec.fps);
    calc.begin_run(&run_id);

    let mut finish_time: Option<i64> = None;
    let result = loop {
        tokio::select! {
            Some(t) = host_trigger_rx.recv() => {
                info!("start gate triggered at host time {t}");
                host.send(split::start_event_payload(
                    host.engine(), &run_id, t, start_uncertainty,
                ))
                .await?;
            }
            Some(t) = client_trigger_rx.recv() => {
                info!("finish gate triggered at client time {t}");
                finish_time = Some(t);
                if let Some(result) = calc.observe_finish(t) {
                    break result;
                }
            }
            Some(event) = client.events.recv() => {
                if let SessionEvent::StartReceived { run_id: id, start_time_nanos, uncertainty_nanos } = event {
                    calc.observe_start(&id, start_time_nanos, uncertainty_nanos);
                    if let Some(t) = finish_time {
                        if let Some(result) = calc.observe_finish(t) {
                            break result;
                        }
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                bail!("simulated pass never completed");
            }
        }
    };

    info!(
        "🏃 split: {:.3} s over {:.0} m (truth {:.3} s, error {:+.1} ms, ±{:.1} ms)",
        result.split_secs,
        result.distance_m,
        file.race.split_secs,
        (result.split_secs - file.race.split_secs) * 1e3,
        result.uncertainty_secs * 1e3,
    );

    client.stop().await;
    host.stop().await;
    Ok(())
}
