//! # split
//!
//! Cross-device split computation. The start device translates its trigger
//! into the finish device's time frame and ships it as a StartEvent; the
//! finish device subtracts the stored start from its own trigger. The first
//! StartEvent to arrive for a run wins, whichever path carried it (link or
//! cloud relay); later copies for the same run are ignored.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use timing_types::{MessagePayload, SessionConfig};

use crate::events::RaceResult;
use crate::sync::SyncEngine;

const NANOS_PER_SEC: f64 = 1e9;

/// Combined measurement uncertainty: the sync estimate plus one half-frame
/// of quantization error per detector, √(sync² + 2·half_frame²).
pub fn combined_uncertainty_secs(sync_uncertainty_nanos: i64, frame_duration_nanos: i64) -> f64 {
    let sync = sync_uncertainty_nanos as f64 / NANOS_PER_SEC;
    let half_frame = frame_duration_nanos as f64 / (2.0 * NANOS_PER_SEC);
    (sync * sync + 2.0 * half_frame * half_frame).sqrt()
}

/// Build the StartEvent for a local start-gate trigger, translated into the
/// peer's time frame via the current offset.
pub fn start_event_payload(
    engine: &SyncEngine,
    run_id: &str,
    trigger_local_nanos: i64,
    uncertainty_nanos: i64,
) -> MessagePayload {
    MessagePayload::StartEvent {
        run_id: run_id.to_string(),
        start_time_nanos: engine.to_remote_time(trigger_local_nanos),
        uncertainty_nanos,
    }
}

struct RunState {
    run_id: String,
    start_time_nanos: Option<i64>,
    start_uncertainty_nanos: i64,
}

/// Finish-side split bookkeeping for one session. One run is active at a
/// time; run state persists until the user starts a new race.
pub struct SplitCalculator {
    config: SessionConfig,
    frame_duration_nanos: i64,
    current: Option<RunState>,
    finished_runs: HashSet<String>,
}

impl SplitCalculator {
    pub fn new(config: SessionConfig, fps: f64) -> Self {
        Self {
            config,
            frame_duration_nanos: (NANOS_PER_SEC / fps) as i64,
            current: None,
            finished_runs: HashSet::new(),
        }
    }

    pub fn begin_run(&mut self, run_id: &str) {
        debug!(run_id, "run started");
        self.current = Some(RunState {
            run_id: run_id.to_string(),
            start_time_nanos: None,
            start_uncertainty_nanos: 0,
        });
    }

    pub fn cancel_run(&mut self, run_id: &str) -> bool {
        match &self.current {
            Some(run) if run.run_id == run_id => {
                info!(run_id, "run cancelled");
                self.current = None;
                true
            }
            _ => false,
        }
    }

    pub fn current_run_id(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.run_id.as_str())
    }

    /// Record the start time (already in our local frame). Returns false for
    /// duplicates and finished runs — the first-arriving copy wins.
    pub fn observe_start(
        &mut self,
        run_id: &str,
        start_time_local_nanos: i64,
        uncertainty_nanos: i64,
    ) -> bool {
        if self.finished_runs.contains(run_id) {
            debug!(run_id, "start event for an already finished run, ignoring");
            return false;
        }
        match &mut self.current {
            Some(run) if run.run_id == run_id => {
                if run.start_time_nanos.is_some() {
                    debug!(run_id, "duplicate start event ignored");
                    return false;
                }
                run.start_time_nanos = Some(start_time_local_nanos);
                run.start_uncertainty_nanos = uncertainty_nanos;
                true
            }
            Some(run) => {
                warn!(
                    run_id,
                    current = %run.run_id,
                    "start event for a different run, ignoring"
                );
                false
            }
            None => {
                // A relayed start can outrun the NewRun message
                debug!(run_id, "start event opened a new run");
                self.current = Some(RunState {
                    run_id: run_id.to_string(),
                    start_time_nanos: Some(start_time_local_nanos),
                    start_uncertainty_nanos: uncertainty_nanos,
                });
                true
            }
        }
    }

    /// Our own finish-gate trigger. Produces the result once both ends of
    /// the run are known.
    pub fn observe_finish(&mut self, finish_time_local_nanos: i64) -> Option<RaceResult> {
        let run = self.current.as_ref()?;
        let start = run.start_time_nanos?;
        if finish_time_local_nanos <= start {
            warn!(
                run_id = %run.run_id,
                "finish before start, ignoring trigger"
            );
            return None;
        }
        let split_secs = (finish_time_local_nanos - start) as f64 / NANOS_PER_SEC;
        let uncertainty_secs =
            combined_uncertainty_secs(run.start_uncertainty_nanos, self.frame_duration_nanos);
        let result = RaceResult {
            run_id: run.run_id.clone(),
            distance_m: self.config.distance_m,
            start_type: self.config.start_type,
            split_secs,
            uncertainty_secs,
        };
        info!(
            run_id = %result.run_id,
            split_secs = format!("{split_secs:.3}"),
            "split computed"
        );
        self.finished_runs.insert(run.run_id.clone());
        self.current = None;
        Some(result)
    }
}
