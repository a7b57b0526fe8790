//! # sync
//!
//! NTP-style clock synchronization over the paired link.
//!
//! The client emits SyncPing bursts; the server answers each with a SyncPong
//! carrying its receive/send timestamps. Each exchange yields a four-timestamp
//! sample (T1 client-send, T2 server-receive, T3 server-send, T4
//! client-receive) from which offset and round-trip time are derived:
//!
//!   rtt    = (T4 − T1) − (T3 − T2)
//!   offset = ((T2 − T1) + (T3 − T4)) / 2        (t_remote = t_local + offset)
//!
//! Transport queuing inflates RTT asymmetrically, so only the lowest-RTT 15 %
//! of admitted samples feed the offset estimate; the median of their offsets
//! is robust against the remaining outliers.
//!
//! ## Invariants
//! - A sample is admitted only if 0 ≤ rtt ≤ the per-mode ceiling
//! - A sync run either commits a full result or leaves all state untouched
//! - The published offset is a single atomic word — readers on the frame
//!   thread always observe a consistent value

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use timing_types::{MessagePayload, SyncMode, SyncQuality};

use crate::clock::SharedClock;
use crate::drift::DriftTracker;
use crate::error::TimingError;

// ── Constants ────────────────────────────────────────────────────────────────

/// Fewer admitted samples than this and the run fails outright.
pub const MIN_VALID_SAMPLES: usize = 10;

/// Fraction of admitted samples (lowest RTT first) kept for the estimate.
const KEEP_FRACTION: f64 = 0.15;

/// Uniform jitter applied to the inter-ping interval, either direction.
/// Breaks aliasing against the link's connection interval.
const PING_JITTER_MS: i64 = 10;

/// Window after the last ping during which late pongs are still collected.
const TAIL_WAIT_MS: u64 = 300;

/// Full-sync runs are retried this many times on unacceptable quality.
const MAX_RETRIES: u32 = 3;

/// Pause between retry attempts.
const RETRY_PAUSE_MS: u64 = 1000;

const MS: i64 = 1_000_000;

// ── Sync Sample ──────────────────────────────────────────────────────────────

/// One completed ping/pong exchange, all timestamps in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    /// Client send.
    pub t1: i64,
    /// Server receive.
    pub t2: i64,
    /// Server send.
    pub t3: i64,
    /// Client receive.
    pub t4: i64,
}

impl SyncSample {
    /// Round-trip time excluding server processing.
    pub fn rtt(&self) -> i64 {
        (self.t4 - self.t1) - (self.t3 - self.t2)
    }

    pub fn offset(&self) -> i64 {
        ((self.t2 - self.t1) + (self.t3 - self.t4)) / 2
    }

    /// Half the RTT bounds how far the offset estimate can be off.
    pub fn uncertainty(&self) -> i64 {
        self.rtt() / 2
    }
}

// ── Sync Result ──────────────────────────────────────────────────────────────

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncResult {
    pub offset_nanos: i64,
    /// Largest half-RTT among the kept samples.
    pub uncertainty_nanos: i64,
    pub samples_used: usize,
    pub samples_total: usize,
    pub rtt_min_nanos: i64,
    pub rtt_max_nanos: i64,
    pub rtt_p50_nanos: i64,
    pub rtt_p95_nanos: i64,
    pub quality: SyncQuality,
}

impl SyncResult {
    pub fn jitter_nanos(&self) -> i64 {
        self.rtt_p95_nanos - self.rtt_p50_nanos
    }

    pub fn is_acceptable(&self) -> bool {
        self.quality.is_acceptable()
    }

    /// Stricter gate for precision mode: a short and steady connection in
    /// addition to acceptable quality.
    pub fn is_precision_mode_valid(&self) -> bool {
        self.rtt_min_nanos < 30 * MS && self.jitter_nanos() < 10 * MS && self.is_acceptable()
    }
}

// ── Sync Calculator ──────────────────────────────────────────────────────────

/// Accumulates samples for one run and produces the offset estimate.
/// Created per run, discarded on reset — never reused across runs.
#[derive(Debug)]
pub struct SyncCalculator {
    mode: SyncMode,
    samples: Vec<SyncSample>,
}

impl SyncCalculator {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            samples: Vec::with_capacity(mode.sample_count()),
        }
    }

    /// Admission-gate one sample. Returns whether it was kept.
    pub fn add_sample(&mut self, sample: SyncSample) -> bool {
        let rtt = sample.rtt();
        if rtt < 0 || rtt > self.mode.rtt_ceiling_nanos() {
            debug!(rtt_ms = rtt / MS, "sync sample rejected (rtt out of range)");
            return false;
        }
        self.samples.push(sample);
        true
    }

    pub fn admitted(&self) -> usize {
        self.samples.len()
    }

    /// The offset estimate, or None with fewer than `MIN_VALID_SAMPLES`
    /// admitted samples.
    pub fn calculate(&self) -> Option<SyncResult> {
        let n = self.samples.len();
        if n < MIN_VALID_SAMPLES {
            return None;
        }

        // Sort indices by RTT ascending; the shortest round trips are the
        // least distorted by transport queuing.
        let mut by_rtt: Vec<usize> = (0..n).collect();
        by_rtt.sort_by_key(|&i| self.samples[i].rtt());

        let keep = ((n as f64 * KEEP_FRACTION) as usize)
            .max(MIN_VALID_SAMPLES)
            .min(n);

        let mut kept_offsets: Vec<i64> = by_rtt[..keep]
            .iter()
            .map(|&i| self.samples[i].offset())
            .collect();
        kept_offsets.sort_unstable();
        // Median; even counts take the lower of the two middle values
        let offset_nanos = kept_offsets[(keep - 1) / 2];

        let uncertainty_nanos = by_rtt[..keep]
            .iter()
            .map(|&i| self.samples[i].uncertainty())
            .max()
            .unwrap_or(0);

        // RTT statistics over ALL admitted samples so jitter reflects the
        // true connection, not the filtered subset.
        let mut rtts: Vec<i64> = self.samples.iter().map(|s| s.rtt()).collect();
        rtts.sort_unstable();

        Some(SyncResult {
            offset_nanos,
            uncertainty_nanos,
            samples_used: keep,
            samples_total: n,
            rtt_min_nanos: rtts[0],
            rtt_max_nanos: rtts[n - 1],
            rtt_p50_nanos: percentile(&rtts, 0.50),
            rtt_p95_nanos: percentile(&rtts, 0.95),
            quality: SyncQuality::from_uncertainty_nanos(uncertainty_nanos),
        })
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[i64], q: f64) -> i64 {
    let n = sorted.len();
    let rank = (q * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

// ── Sync Channel ─────────────────────────────────────────────────────────────

/// A pong paired with the local receive instant (T4), stamped by the
/// protocol layer the moment the message left the inbox.
#[derive(Debug, Clone)]
pub struct PongEnvelope {
    pub ping_id: String,
    pub t1_echo: i64,
    pub t2: i64,
    pub t3: i64,
    pub t4: i64,
}

/// The sync run's view of the session: ping payloads out, matched pongs in.
pub struct SyncChannel {
    pub outbound: mpsc::Sender<MessagePayload>,
    pub pongs: mpsc::Receiver<PongEnvelope>,
}

// ── Sync Engine ──────────────────────────────────────────────────────────────

/// Owns the published offset, the drift history and the run machinery.
/// Lives for the whole session; the per-run calculator is created fresh
/// each run.
pub struct SyncEngine {
    clock: SharedClock,
    offset_nanos: AtomicI64,
    synced: AtomicBool,
    drift: RwLock<DriftTracker>,
    last_result: RwLock<Option<SyncResult>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("offset_nanos", &self.offset_nanos)
            .field("synced", &self.synced)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            offset_nanos: AtomicI64::new(0),
            synced: AtomicBool::new(false),
            drift: RwLock::new(DriftTracker::new()),
            last_result: RwLock::new(None),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// 0 until the first successful sync, then the most recent offset.
    pub fn offset_nanos(&self) -> i64 {
        if self.synced.load(Ordering::Acquire) {
            self.offset_nanos.load(Ordering::Acquire)
        } else {
            0
        }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<SyncResult> {
        *self.last_result.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn to_remote_time(&self, local_nanos: i64) -> i64 {
        local_nanos + self.offset_nanos()
    }

    pub fn to_local_time(&self, remote_nanos: i64) -> i64 {
        remote_nanos - self.offset_nanos()
    }

    /// Like [`to_remote_time`](Self::to_remote_time) but extrapolates the
    /// offset along the measured drift once ≥ 30 s of history exists.
    pub fn to_remote_time_with_drift(&self, local_nanos: i64) -> i64 {
        let drift = self.drift.read().unwrap_or_else(|e| e.into_inner());
        if drift.has_estimate() {
            if let Some(offset) = drift.predict_offset(local_nanos) {
                return local_nanos + offset;
            }
        }
        drop(drift);
        self.to_remote_time(local_nanos)
    }

    pub fn drift_ppm(&self) -> Option<f64> {
        self.drift
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .drift_ppm()
    }

    /// Host side: adopt the peer-reported offset (the caller flips the sign
    /// so the `t_remote = t_local + offset` convention holds on this device).
    pub fn adopt_peer_offset(&self, offset_nanos: i64) {
        self.offset_nanos.store(offset_nanos, Ordering::Release);
        self.synced.store(true, Ordering::Release);
        let now = self.clock.now_nanos();
        self.drift
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(now, offset_nanos);
    }

    /// Server-side ping handler. `t2` is the delivery instant stamped by the
    /// protocol layer; T3 is taken here, immediately before enqueue.
    pub fn on_sync_ping(&self, ping_id: &str, t1: i64, t2: i64) -> MessagePayload {
        MessagePayload::SyncPong {
            ping_id: ping_id.to_string(),
            t1_echo: t1,
            t2,
            t3: self.clock.now_nanos(),
        }
    }

    /// Full sync: 100 samples at 50 ms. Retried on unacceptable quality; on
    /// exhaustion the previously established offset (if any) is preserved.
    pub async fn start_full_sync(
        &self,
        channel: &mut SyncChannel,
        cancel: &AtomicBool,
    ) -> Result<SyncResult, TimingError> {
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                self.check_cancel(cancel)?;
                tokio::time::sleep(Duration::from_millis(RETRY_PAUSE_MS)).await;
                self.check_cancel(cancel)?;
                info!(attempt, "retrying full sync");
            }
            match self.run_once(SyncMode::Full, channel, cancel).await? {
                Some(result) if result.is_acceptable() => {
                    self.commit(&result);
                    return Ok(result);
                }
                Some(result) => {
                    warn!(
                        quality = ?result.quality,
                        uncertainty_ms = result.uncertainty_nanos / MS,
                        "full sync attempt unacceptable"
                    );
                }
                None => {
                    warn!("full sync attempt collected too few valid samples");
                }
            }
        }
        Err(TimingError::SyncFailed(
            "no acceptable result after retries".into(),
        ))
    }

    /// Mini-sync: 30 samples at 100 ms, looser RTT ceiling. A single
    /// attempt; an unacceptable result falls back to the previous one.
    pub async fn start_mini_sync(
        &self,
        channel: &mut SyncChannel,
        cancel: &AtomicBool,
    ) -> Result<SyncResult, TimingError> {
        match self.run_once(SyncMode::Mini, channel, cancel).await? {
            Some(result) if result.is_acceptable() => {
                self.commit(&result);
                Ok(result)
            }
            other => {
                if let Some(result) = other {
                    warn!(quality = ?result.quality, "mini-sync unacceptable, retaining previous offset");
                } else {
                    warn!("mini-sync collected too few valid samples, retaining previous offset");
                }
                self.last_result()
                    .ok_or_else(|| TimingError::SyncFailed("mini-sync failed with no prior result".into()))
            }
        }
    }

    fn check_cancel(&self, cancel: &AtomicBool) -> Result<(), TimingError> {
        if cancel.load(Ordering::Acquire) {
            Err(TimingError::SyncCancelled)
        } else {
            Ok(())
        }
    }

    /// One burst of pings plus the tail wait. Never touches engine state.
    async fn run_once(
        &self,
        mode: SyncMode,
        channel: &mut SyncChannel,
        cancel: &AtomicBool,
    ) -> Result<Option<SyncResult>, TimingError> {
        let mut calc = SyncCalculator::new(mode);
        let mut pending: HashMap<String, i64> = HashMap::with_capacity(mode.sample_count());

        for _ in 0..mode.sample_count() {
            self.check_cancel(cancel)?;

            let ping_id = Uuid::new_v4().to_string();
            let t1 = self.clock.now_nanos();
            pending.insert(ping_id.clone(), t1);
            channel
                .outbound
                .send(MessagePayload::SyncPing { ping_id, t1 })
                .await
                .map_err(|_| TimingError::LinkClosed)?;

            let jitter_ms = {
                let mut rng = rand::thread_rng();
                rng.gen_range(-PING_JITTER_MS..=PING_JITTER_MS)
            };
            let wait = (mode.interval_ms() as i64 + jitter_ms).max(1) as u64;
            self.collect_pongs(Duration::from_millis(wait), channel, &mut pending, &mut calc)
                .await?;
        }

        self.check_cancel(cancel)?;
        self.collect_pongs(
            Duration::from_millis(TAIL_WAIT_MS),
            channel,
            &mut pending,
            &mut calc,
        )
        .await?;

        Ok(calc.calculate())
    }

    /// Drain pongs for the given window; the window also paces the pings.
    async fn collect_pongs(
        &self,
        window: Duration,
        channel: &mut SyncChannel,
        pending: &mut HashMap<String, i64>,
        calc: &mut SyncCalculator,
    ) -> Result<(), TimingError> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            match tokio::time::timeout(deadline - now, channel.pongs.recv()).await {
                Ok(Some(pong)) => self.accept_pong(pong, pending, calc),
                Ok(None) => return Err(TimingError::LinkClosed),
                Err(_) => return Ok(()),
            }
        }
    }

    fn accept_pong(
        &self,
        pong: PongEnvelope,
        pending: &mut HashMap<String, i64>,
        calc: &mut SyncCalculator,
    ) {
        let Some(t1) = pending.remove(&pong.ping_id) else {
            warn!(ping_id = %pong.ping_id, "dropping pong with unknown ping id");
            return;
        };
        if pong.t1_echo != t1 {
            warn!(
                ping_id = %pong.ping_id,
                "dropping pong with mismatched t1 echo"
            );
            return;
        }
        let sample = SyncSample {
            t1,
            t2: pong.t2,
            t3: pong.t3,
            t4: pong.t4,
        };
        let admitted = calc.add_sample(sample);
        debug!(
            rtt_ms = sample.rtt() / MS,
            offset_us = sample.offset() / 1000,
            admitted,
            "sync sample"
        );
    }

    /// Publish one successful run. The only place engine state changes.
    fn commit(&self, result: &SyncResult) {
        self.offset_nanos
            .store(result.offset_nanos, Ordering::Release);
        self.synced.store(true, Ordering::Release);
        let now = self.clock.now_nanos();
        self.drift
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(now, result.offset_nanos);
        *self
            .last_result
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(*result);
        info!(
            offset_us = result.offset_nanos / 1000,
            uncertainty_ms = result.uncertainty_nanos / MS,
            quality = ?result.quality,
            used = result.samples_used,
            total = result.samples_total,
            "sync committed"
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MonotonicClock, SystemClock};
    use std::sync::Arc;

    /// Build a sample with the requested rtt and true offset, symmetric path.
    fn sample(t1: i64, rtt: i64, offset: i64) -> SyncSample {
        let t2 = t1 + rtt / 2 + offset;
        let t3 = t2;
        let t4 = t1 + rtt;
        SyncSample { t1, t2, t3, t4 }
    }

    #[test]
    fn sample_derivations() {
        let s = sample(1_000, 10 * MS, 1 * MS);
        assert_eq!(s.rtt(), 10 * MS);
        assert_eq!(s.offset(), 1 * MS);
        assert_eq!(s.uncertainty(), 5 * MS);
    }

    #[test]
    fn admission_boundary_at_the_ceiling() {
        let mut calc = SyncCalculator::new(SyncMode::Full);
        let ceiling = SyncMode::Full.rtt_ceiling_nanos();
        assert!(calc.add_sample(sample(0, ceiling, 0)));
        assert!(!calc.add_sample(sample(0, ceiling + 1, 0)));
        assert!(!calc.add_sample(SyncSample {
            t1: 100,
            t2: 0,
            t3: 0,
            t4: 50, // negative rtt
        }));
        assert_eq!(calc.admitted(), 1);
    }

    #[test]
    fn exactly_min_valid_samples_succeeds_one_fewer_fails() {
        let mut calc = SyncCalculator::new(SyncMode::Full);
        for i in 0..MIN_VALID_SAMPLES - 1 {
            calc.add_sample(sample(i as i64 * MS, 10 * MS, MS));
        }
        assert!(calc.calculate().is_none());
        calc.add_sample(sample(99 * MS, 10 * MS, MS));
        let result = calc.calculate().expect("exactly MIN_VALID_SAMPLES");
        assert_eq!(result.samples_used, MIN_VALID_SAMPLES);
        assert_eq!(result.offset_nanos, MS);
    }

    #[test]
    fn keeps_the_lowest_fifteen_percent() {
        let mut calc = SyncCalculator::new(SyncMode::Full);
        // 100 samples: 15 clean short-RTT ones with the true offset, 85
        // noisy long-RTT ones with a skewed offset.
        for i in 0..15 {
            calc.add_sample(sample(i * MS, 8 * MS + i * 1000, MS));
        }
        for i in 0..85 {
            calc.add_sample(sample((20 + i) * MS, 80 * MS + i * 1000, 9 * MS));
        }
        let result = calc.calculate().unwrap();
        assert_eq!(result.samples_total, 100);
        assert_eq!(result.samples_used, 15);
        assert_eq!(result.offset_nanos, MS);
        // Uncertainty comes from the kept samples only
        assert!(result.uncertainty_nanos <= (8 * MS + 14_000) / 2 + 1);
        // p95 reflects the whole admitted population
        assert!(result.rtt_p95_nanos > 80 * MS);
    }

    #[test]
    fn median_takes_lower_middle_for_even_counts() {
        let mut calc = SyncCalculator::new(SyncMode::Full);
        for i in 0..10 {
            // Offsets 0..9 ms, identical RTTs
            calc.add_sample(sample(i * MS, 10 * MS, i * MS));
        }
        let result = calc.calculate().unwrap();
        // Lower of the two middle values (4 ms, 5 ms)
        assert_eq!(result.offset_nanos, 4 * MS);
    }

    #[test]
    fn precision_mode_gate() {
        let mut calc = SyncCalculator::new(SyncMode::Full);
        for i in 0..20 {
            calc.add_sample(sample(i * MS, 8 * MS, MS));
        }
        let r = calc.calculate().unwrap();
        assert!(r.is_precision_mode_valid());
        assert_eq!(r.jitter_nanos(), 0);

        let mut calc = SyncCalculator::new(SyncMode::Full);
        // Bimodal RTTs: clean floor, but p95 − p50 = 15 ms of jitter
        for i in 0..50 {
            calc.add_sample(sample(i * MS, 10 * MS, MS));
        }
        for i in 50..100 {
            calc.add_sample(sample(i * MS, 25 * MS, MS));
        }
        let r = calc.calculate().unwrap();
        assert!(r.is_acceptable());
        assert_eq!(r.jitter_nanos(), 15 * MS);
        assert!(!r.is_precision_mode_valid());
    }

    #[test]
    fn offset_is_zero_until_first_sync() {
        let engine = SyncEngine::new(Arc::new(SystemClock::new()));
        assert_eq!(engine.offset_nanos(), 0);
        assert_eq!(engine.to_remote_time(42), 42);
    }

    #[test]
    fn conversion_round_trip_and_monotonicity() {
        let engine = SyncEngine::new(Arc::new(SystemClock::new()));
        engine.adopt_peer_offset(1_500_000);
        for t in [i64::MIN / 2, -1, 0, 1, 7_777_777, i64::MAX / 2] {
            assert_eq!(engine.to_local_time(engine.to_remote_time(t)), t);
        }
        assert!(engine.to_remote_time(100) < engine.to_remote_time(101));
    }

    struct OffsetClock {
        base: SystemClock,
        offset: i64,
    }

    impl MonotonicClock for OffsetClock {
        fn now_nanos(&self) -> i64 {
            self.base.now_nanos() + self.offset
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_sync_run_converges_on_the_true_offset() {
        const TRUE_OFFSET: i64 = 1_000_000;

        let base = SystemClock::new();
        let client_clock = Arc::new(base);
        let server_clock = Arc::new(OffsetClock {
            base,
            offset: TRUE_OFFSET,
        });

        let engine = Arc::new(SyncEngine::new(client_clock));
        let server = SyncEngine::new(server_clock.clone());

        let (ping_tx, mut ping_rx) = mpsc::channel::<MessagePayload>(64);
        let (pong_tx, pong_rx) = mpsc::channel::<PongEnvelope>(64);
        let responder_clock = engine.clock().clone();

        // Loopback server: answers every ping immediately.
        tokio::spawn(async move {
            while let Some(msg) = ping_rx.recv().await {
                if let MessagePayload::SyncPing { ping_id, t1 } = msg {
                    let t2 = server_clock.now_nanos();
                    let pong = server.on_sync_ping(&ping_id, t1, t2);
                    if let MessagePayload::SyncPong {
                        ping_id,
                        t1_echo,
                        t2,
                        t3,
                    } = pong
                    {
                        let t4 = responder_clock.now_nanos();
                        let _ = pong_tx
                            .send(PongEnvelope {
                                ping_id,
                                t1_echo,
                                t2,
                                t3,
                                t4,
                            })
                            .await;
                    }
                }
            }
        });

        let mut channel = SyncChannel {
            outbound: ping_tx,
            pongs: pong_rx,
        };
        let cancel = AtomicBool::new(false);
        let result = engine
            .start_full_sync(&mut channel, &cancel)
            .await
            .expect("sync should succeed on a clean loopback");

        assert!(result.is_acceptable());
        assert_eq!(result.samples_used, 15);
        assert_eq!(result.samples_total, 100);
        assert!(
            (result.offset_nanos - TRUE_OFFSET).abs() < 2 * MS,
            "offset {} not near {}",
            result.offset_nanos,
            TRUE_OFFSET
        );
        assert_eq!(engine.offset_nanos(), result.offset_nanos);
        // Sanity bound from the published invariants
        assert!(result.offset_nanos.abs() < 100_000 * MS);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_propagates_and_preserves_state() {
        let engine = SyncEngine::new(Arc::new(SystemClock::new()));
        engine.adopt_peer_offset(777);

        let (ping_tx, _ping_rx) = mpsc::channel::<MessagePayload>(64);
        let (_pong_tx, pong_rx) = mpsc::channel::<PongEnvelope>(64);
        let mut channel = SyncChannel {
            outbound: ping_tx,
            pongs: pong_rx,
        };
        let cancel = AtomicBool::new(true);
        let err = engine
            .start_full_sync(&mut channel, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TimingError::SyncCancelled));
        // The previously established offset survives a failed run
        assert_eq!(engine.offset_nanos(), 777);
    }
}
