//! Noise-floor calibration against a stretch of room silence.

use serde::{Deserialize, Serialize};

use crate::config::{NUM_BANDS, NUM_CHROMA};
use crate::{AudioPipelineTuning, AudioTime};

pub const DEFAULT_DURATION_MS: u32 = 3000;
pub const DEFAULT_SAFETY_MULTIPLIER: f32 = 1.2;
/// Pre-gain RMS above which the room is clearly not silent.
pub const DEFAULT_MAX_ALLOWED_RMS: f32 = 0.15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    #[default]
    Idle,
    Requested,
    Measuring,
    Complete,
    Failed,
}

impl CalibrationState {
    pub fn is_running(self) -> bool {
        matches!(self, CalibrationState::Requested | CalibrationState::Measuring)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseCalibrationResult {
    pub band_floors: [f32; NUM_BANDS],
    pub chroma_floors: [f32; NUM_CHROMA],
    /// Mean pre-gain RMS times the safety multiplier.
    pub overall_rms: f32,
    pub peak_rms: f32,
    pub sample_count: u32,
    pub valid: bool,
}

/// What control surfaces see of a calibration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub state: CalibrationState,
    pub progress01: f32,
    pub result: NoiseCalibrationResult,
}

#[derive(Debug, Clone)]
pub struct NoiseCalibration {
    state: CalibrationState,
    duration_ms: u32,
    safety_multiplier: f32,
    max_allowed_rms: f32,
    started: Option<AudioTime>,
    progress01: f32,

    rms_sum: f64,
    peak_rms: f32,
    band_sums: [f64; NUM_BANDS],
    chroma_sums: [f64; NUM_CHROMA],
    sample_count: u32,

    result: NoiseCalibrationResult,
}

impl Default for NoiseCalibration {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ALLOWED_RMS)
    }
}

impl NoiseCalibration {
    pub fn new(max_allowed_rms: f32) -> Self {
        Self {
            state: CalibrationState::Idle,
            duration_ms: DEFAULT_DURATION_MS,
            safety_multiplier: DEFAULT_SAFETY_MULTIPLIER,
            max_allowed_rms,
            started: None,
            progress01: 0.0,
            rms_sum: 0.0,
            peak_rms: 0.0,
            band_sums: [0.0; NUM_BANDS],
            chroma_sums: [0.0; NUM_CHROMA],
            sample_count: 0,
            result: NoiseCalibrationResult::default(),
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn result(&self) -> &NoiseCalibrationResult {
        &self.result
    }

    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            state: self.state,
            progress01: self.progress01,
            result: self.result,
        }
    }

    /// Requests a run. Refused while one is already requested or measuring.
    pub fn start(&mut self, duration_ms: u32, safety_multiplier: f32) -> bool {
        if self.state.is_running() {
            tracing::warn!("noise calibration already in progress");
            return false;
        }
        *self = Self::new(self.max_allowed_rms);
        self.duration_ms = duration_ms;
        self.safety_multiplier = if safety_multiplier.is_finite() && safety_multiplier > 0.0 {
            safety_multiplier
        } else {
            DEFAULT_SAFETY_MULTIPLIER
        };
        self.state = CalibrationState::Requested;
        tracing::info!(duration_ms, safety_multiplier = self.safety_multiplier, "noise calibration requested");
        true
    }

    /// Drops any run or result and returns to idle.
    pub fn cancel(&mut self) {
        if self.state != CalibrationState::Idle {
            tracing::info!("noise calibration cancelled");
            *self = Self::new(self.max_allowed_rms);
        }
    }

    /// Feeds one hop. `rms_pre_gain` is linear; `bands` and `chroma` are the
    /// mapped values before any per-band floor gate.
    pub fn update(
        &mut self,
        now: AudioTime,
        rms_pre_gain: f32,
        bands: &[f32; NUM_BANDS],
        chroma: &[f32; NUM_CHROMA],
    ) {
        let started = match self.state {
            CalibrationState::Idle | CalibrationState::Complete | CalibrationState::Failed => return,
            CalibrationState::Requested => {
                self.state = CalibrationState::Measuring;
                self.started = Some(now);
                tracing::info!(duration_ms = self.duration_ms, "noise calibration measuring");
                now
            }
            CalibrationState::Measuring => *self.started.get_or_insert(now),
        };

        let elapsed_ms = started.seconds_until(&now).max(0.0) * 1000.0;
        if elapsed_ms >= self.duration_ms as f32 {
            self.finish();
            return;
        }
        self.progress01 = if self.duration_ms == 0 {
            1.0
        } else {
            (elapsed_ms / self.duration_ms as f32).clamp(0.0, 1.0)
        };

        if rms_pre_gain > self.max_allowed_rms {
            tracing::warn!(rms = rms_pre_gain, max = self.max_allowed_rms, "noise calibration aborted: input not silent");
            self.state = CalibrationState::Failed;
            return;
        }

        self.rms_sum += f64::from(rms_pre_gain);
        self.peak_rms = self.peak_rms.max(rms_pre_gain);
        for (sum, band) in self.band_sums.iter_mut().zip(bands) {
            *sum += f64::from(*band);
        }
        for (sum, bin) in self.chroma_sums.iter_mut().zip(chroma) {
            *sum += f64::from(*bin);
        }
        self.sample_count += 1;
    }

    fn finish(&mut self) {
        self.progress01 = 1.0;
        if self.sample_count == 0 {
            tracing::error!("noise calibration failed: no hops collected");
            self.state = CalibrationState::Failed;
            return;
        }

        let n = f64::from(self.sample_count);
        let safety = f64::from(self.safety_multiplier);
        let scaled = |sum: f64| (sum / n * safety) as f32;
        self.result = NoiseCalibrationResult {
            band_floors: self.band_sums.map(scaled),
            chroma_floors: self.chroma_sums.map(scaled),
            overall_rms: scaled(self.rms_sum),
            peak_rms: self.peak_rms,
            sample_count: self.sample_count,
            valid: true,
        };
        self.state = CalibrationState::Complete;
        tracing::info!(
            overall_rms = self.result.overall_rms,
            peak_rms = self.result.peak_rms,
            hops = self.sample_count,
            "noise calibration complete"
        );
    }

    /// Writes a valid result into `tuning`: per-band floors on, global floor
    /// minimum raised to the measured level. Returns false without a result.
    pub fn apply_results(&self, tuning: &mut AudioPipelineTuning) -> bool {
        if !self.result.valid {
            tracing::warn!("no valid calibration result to apply");
            return false;
        }
        tuning.per_band_noise_floors = self.result.band_floors;
        tuning.use_per_band_noise_floor = true;
        tuning.noise_floor_min = self.result.overall_rms;
        *tuning = tuning.clamped();
        tracing::info!(noise_floor_min = tuning.noise_floor_min, "calibration applied");
        true
    }
}
