//! frames.rs — Synthetic gate camera
//!
//! Renders monochrome frames of an athlete-stand-in: a bright vertical bar
//! with a trailing luminance fade, moving at a constant speed across the
//! field of view. Rendering is rolling-shutter aware (each row is drawn at
//! its own exposure instant), row padding is honoured, and the generator
//! knows the exact ground-truth instant the leading edge crosses any column,
//! so detector output can be scored against truth.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

// ── Camera geometry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CameraSpec {
    pub width: usize,
    pub height: usize,
    /// ≥ width; hardware alignment padding.
    pub row_stride: usize,
    pub fps: f64,
    /// Time to read the sensor top-to-bottom. 0 disables rolling shutter.
    pub readout_nanos: i64,
}

impl CameraSpec {
    pub fn rear(fps: f64, readout_nanos: i64) -> Self {
        Self {
            width: 320,
            height: 568,
            row_stride: 384,
            fps,
            readout_nanos,
        }
    }

    pub fn frame_duration_nanos(&self) -> i64 {
        (1e9 / self.fps) as i64
    }
}

// ── Generator ────────────────────────────────────────────────────────────────

const BACKGROUND: u8 = 20;
const BAR_PEAK: u8 = 200;
/// Trailing fade length in capture pixels; makes frame differencing see one
/// solid moving region rather than two disjoint edge strips.
const RAMP_PX: i32 = 120;

#[derive(Debug)]
pub struct SyntheticGate {
    pub spec: CameraSpec,
    /// Leading-edge position at `start_t_nanos`, capture pixels.
    pub start_x_px: f64,
    /// Leading-edge speed, capture pixels per second (positive = rightward).
    pub velocity_px_s: f64,
    /// The bar is absent before this instant.
    pub start_t_nanos: i64,
    pub noise_sigma: f64,
    rng: StdRng,
}

impl SyntheticGate {
    pub fn new(
        spec: CameraSpec,
        start_x_px: f64,
        velocity_px_s: f64,
        start_t_nanos: i64,
        noise_sigma: f64,
        seed: u64,
    ) -> Self {
        Self {
            spec,
            start_x_px,
            velocity_px_s,
            start_t_nanos,
            noise_sigma,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Ground truth: when the leading edge reaches `column_px`.
    pub fn true_crossing_time_nanos(&self, column_px: f64) -> i64 {
        let secs = (column_px - self.start_x_px) / self.velocity_px_s;
        self.start_t_nanos + (secs * 1e9) as i64
    }

    fn lead_x_at(&self, t_nanos: i64) -> Option<f64> {
        if t_nanos < self.start_t_nanos {
            return None;
        }
        let secs = (t_nanos - self.start_t_nanos) as f64 / 1e9;
        Some(self.start_x_px + self.velocity_px_s * secs)
    }

    /// Render the frame whose presentation timestamp is `pts_nanos` into a
    /// reusable buffer. Row y is drawn at its exposure instant
    /// `pts + readout · y / height`.
    pub fn render_into(&mut self, pts_nanos: i64, buf: &mut Vec<u8>) {
        let spec = self.spec;
        buf.clear();
        buf.resize(spec.row_stride * spec.height, BACKGROUND);

        let noise = (self.noise_sigma > 0.0)
            .then(|| Normal::new(0.0, self.noise_sigma).unwrap());

        for y in 0..spec.height {
            let row_time = pts_nanos
                + ((spec.readout_nanos as f64) * (y as f64 / spec.height as f64)) as i64;
            let lead = self.lead_x_at(row_time);
            let row = y * spec.row_stride;
            if let Some(lead) = lead {
                let u_lead = lead as i32;
                let from = (u_lead - RAMP_PX).max(0);
                let to = u_lead.min(spec.width as i32);
                for u in from..to {
                    let dist = u_lead - u; // 1..=RAMP_PX
                    let v = BAR_PEAK as i32 - (dist - 1) * 180 / RAMP_PX;
                    buf[row + u as usize] = v as u8;
                }
            }
            if let Some(noise) = noise {
                for u in 0..spec.width {
                    let n = noise.sample(&mut self.rng);
                    let v = buf[row + u] as f64 + n;
                    buf[row + u] = v.clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
}
