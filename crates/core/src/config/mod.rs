use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BeatlightError, Result};

pub const NUM_BANDS: usize = 8;
pub const NUM_CHROMA: usize = 12;
/// Hard tempo bounds for every published BPM.
pub const BPM_LIMIT_MIN: f32 = 30.0;
pub const BPM_LIMIT_MAX: f32 = 300.0;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub pipeline: AudioPipelineTuning,
    pub detector: BeatDetectorTuning,
    pub grid: MusicalGridTuning,
}

impl AppConfig {
    /// Defaults with the pipeline tuning taken from `preset`.
    pub fn with_preset(preset: AudioPreset) -> Self {
        Self {
            pipeline: AudioPipelineTuning::preset(preset),
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validated()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Validates structural settings and clamps every tuning value into its
    /// safe range.
    pub fn validated(mut self) -> Result<Self> {
        self.audio.validate()?;
        self.pipeline = self.pipeline.clamped();
        self.detector = self.detector.clamped();
        self.grid = self.grid.clamped();
        Ok(self)
    }
}

/// Which band-energy estimator feeds the 8 bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectralMode {
    /// One Goertzel filter per band centre.
    #[default]
    Goertzel8,
    /// 64 semitone-spaced bins from an FFT, folded to 8 bands by max.
    Fft64,
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate_hz: u32,
    /// Samples per hop; the hop lane runs at `sample_rate_hz / hop_size`.
    pub hop_size: usize,
    /// Length of the sliding spectral analysis window.
    pub window_size: usize,
    /// Run spectral analysis and beat detection every N hops.
    pub analysis_interval_hops: u32,
    pub spectral_mode: SpectralMode,
    pub control_queue_depth: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            hop_size: 128,
            window_size: 512,
            analysis_interval_hops: 2,
            spectral_mode: SpectralMode::Goertzel8,
            control_queue_depth: 16,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(BeatlightError::InvalidConfig("sample_rate_hz must be non-zero"));
        }
        if self.hop_size == 0 {
            return Err(BeatlightError::InvalidConfig("hop_size must be non-zero"));
        }
        if self.window_size < self.hop_size {
            return Err(BeatlightError::InvalidConfig(
                "window_size must be at least one hop",
            ));
        }
        if self.analysis_interval_hops == 0 {
            return Err(BeatlightError::InvalidConfig(
                "analysis_interval_hops must be non-zero",
            ));
        }
        if self.control_queue_depth == 0 {
            return Err(BeatlightError::InvalidConfig(
                "control_queue_depth must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn hop_rate_hz(&self) -> f32 {
        self.sample_rate_hz as f32 / self.hop_size.max(1) as f32
    }

    /// Seconds between two beat-lane updates.
    pub fn analysis_period_s(&self) -> f32 {
        self.analysis_interval_hops as f32 / self.hop_rate_hz()
    }
}

/// Named starting points for [`AudioPipelineTuning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPreset {
    /// Balanced 4:1 attack/release AGC.
    #[default]
    Lightwave,
    /// Fast attack, very slow release.
    SensoryBridge,
    /// Heavy compression for material with consistent levels.
    AggressiveAgc,
    /// Light compression for wide dynamics.
    ConservativeAgc,
    /// Slow smoothing with per-band gains and floors enabled.
    LgpSmooth,
    Custom,
}

impl AudioPreset {
    pub const ALL: [AudioPreset; 6] = [
        AudioPreset::Lightwave,
        AudioPreset::SensoryBridge,
        AudioPreset::AggressiveAgc,
        AudioPreset::ConservativeAgc,
        AudioPreset::LgpSmooth,
        AudioPreset::Custom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AudioPreset::Lightwave => "Lightwave",
            AudioPreset::SensoryBridge => "Sensory Bridge",
            AudioPreset::AggressiveAgc => "Aggressive AGC",
            AudioPreset::ConservativeAgc => "Conservative AGC",
            AudioPreset::LgpSmooth => "LGP Smooth",
            AudioPreset::Custom => "Custom",
        }
    }
}

/// DSP tuning read by every stage of the hop routine.
///
/// Written rarely through the pipeline's control handle and read every hop,
/// so it lives behind a [`SeqLock`](crate::sync::SeqLock).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioPipelineTuning {
    /// Leak coefficient of the one-pole DC estimator.
    pub dc_alpha: f32,

    pub agc_target_rms: f32,
    pub agc_min_gain: f32,
    pub agc_max_gain: f32,
    pub agc_attack: f32,
    pub agc_release: f32,
    /// Gain multiplier applied on any hop that clipped.
    pub agc_clip_reduce: f32,
    /// Rate at which gain relaxes toward unity while the gate is closed.
    pub agc_idle_return_rate: f32,

    pub noise_floor_min: f32,
    pub noise_floor_rise: f32,
    pub noise_floor_fall: f32,
    pub gate_start_factor: f32,
    pub gate_range_factor: f32,
    pub gate_range_min: f32,

    pub rms_db_floor: f32,
    pub rms_db_ceil: f32,
    pub band_db_floor: f32,
    pub band_db_ceil: f32,
    pub chroma_db_floor: f32,
    pub chroma_db_ceil: f32,

    pub flux_scale: f32,

    pub control_bus_alpha_fast: f32,
    pub control_bus_alpha_slow: f32,
    pub band_attack: f32,
    pub band_release: f32,
    pub heavy_band_attack: f32,
    pub heavy_band_release: f32,

    /// Replace single-frame band and chroma spikes, at the cost of two hops
    /// of latency on both.
    pub lookahead_enabled: bool,
    /// Normalise each pair of bands by its own running peak.
    pub zone_agc_enabled: bool,
    pub zone_agc_attack: f32,
    pub zone_agc_release: f32,
    /// Lowest running peak a zone may divide by.
    pub zone_min_floor: f32,
    /// Normalise each group of three chroma bins by its own running peak.
    pub chroma_zone_agc_enabled: bool,
    pub chroma_zone_agc_attack: f32,
    pub chroma_zone_agc_release: f32,

    pub per_band_gains: [f32; NUM_BANDS],
    pub per_band_noise_floors: [f32; NUM_BANDS],
    pub use_per_band_noise_floor: bool,

    /// Time below `silence_threshold` before the silence fade starts. Zero
    /// disables silence detection.
    pub silence_hysteresis_ms: f32,
    pub silence_threshold: f32,
}

impl Default for AudioPipelineTuning {
    fn default() -> Self {
        Self {
            dc_alpha: 0.001,
            agc_target_rms: 0.25,
            agc_min_gain: 1.0,
            agc_max_gain: 40.0,
            agc_attack: 0.03,
            agc_release: 0.015,
            agc_clip_reduce: 0.90,
            agc_idle_return_rate: 0.01,
            noise_floor_min: 0.0004,
            noise_floor_rise: 0.0005,
            noise_floor_fall: 0.01,
            gate_start_factor: 1.0,
            gate_range_factor: 1.5,
            gate_range_min: 0.0005,
            rms_db_floor: -65.0,
            rms_db_ceil: -12.0,
            band_db_floor: -65.0,
            band_db_ceil: -12.0,
            chroma_db_floor: -65.0,
            chroma_db_ceil: -12.0,
            flux_scale: 1.0,
            control_bus_alpha_fast: 0.35,
            control_bus_alpha_slow: 0.12,
            band_attack: 0.15,
            band_release: 0.03,
            heavy_band_attack: 0.08,
            heavy_band_release: 0.015,
            lookahead_enabled: false,
            zone_agc_enabled: false,
            zone_agc_attack: 0.05,
            zone_agc_release: 0.05,
            zone_min_floor: 0.01,
            chroma_zone_agc_enabled: false,
            chroma_zone_agc_attack: 0.05,
            chroma_zone_agc_release: 0.05,
            per_band_gains: [0.8, 0.85, 1.0, 1.2, 1.5, 1.8, 2.0, 2.2],
            per_band_noise_floors: [0.0008, 0.0012, 0.0006, 0.0005, 0.0008, 0.0010, 0.0012, 0.0006],
            use_per_band_noise_floor: false,
            silence_hysteresis_ms: 5000.0,
            silence_threshold: 0.01,
        }
    }
}

impl AudioPipelineTuning {
    pub fn preset(preset: AudioPreset) -> Self {
        let mut t = Self::default();
        match preset {
            AudioPreset::Lightwave => {
                t.agc_attack = 0.08;
                t.agc_release = 0.02;
                t.silence_hysteresis_ms = 10_000.0;
            }
            AudioPreset::SensoryBridge => {
                t.agc_attack = 0.25;
                t.agc_release = 0.005;
                t.control_bus_alpha_fast = 0.45;
                t.control_bus_alpha_slow = 0.225;
                t.silence_hysteresis_ms = 10_000.0;
                t.silence_threshold = 0.005;
                t.noise_floor_min = 0.0006;
                t.lookahead_enabled = true;
                t.zone_agc_enabled = true;
                t.chroma_zone_agc_enabled = true;
            }
            AudioPreset::AggressiveAgc => {
                t.agc_attack = 0.35;
                t.agc_release = 0.001;
                t.agc_max_gain = 200.0;
                t.control_bus_alpha_fast = 0.5;
                t.control_bus_alpha_slow = 0.3;
                t.silence_hysteresis_ms = 5000.0;
            }
            AudioPreset::ConservativeAgc => {
                t.agc_attack = 0.03;
                t.agc_release = 0.05;
                t.agc_max_gain = 50.0;
                t.control_bus_alpha_fast = 0.25;
                t.control_bus_alpha_slow = 0.08;
                t.silence_hysteresis_ms = 15_000.0;
                t.silence_threshold = 0.02;
            }
            AudioPreset::LgpSmooth => {
                t.agc_attack = 0.06;
                t.agc_release = 0.015;
                t.control_bus_alpha_fast = 0.20;
                t.control_bus_alpha_slow = 0.06;
                t.band_attack = 0.12;
                t.band_release = 0.025;
                t.heavy_band_attack = 0.06;
                t.heavy_band_release = 0.012;
                t.use_per_band_noise_floor = true;
                t.silence_hysteresis_ms = 8000.0;
            }
            AudioPreset::Custom => {}
        }
        t.clamped()
    }

    /// Sets every control-bus smoothing rate from one knob. 0 is punchy:
    /// fast attack, slow release, light rms smoothing. 255 is dreamy: slow
    /// attack, quicker release, heavier rms smoothing.
    pub fn with_mood(mut self, mood: u8) -> Self {
        let m = f32::from(mood) / 255.0;
        self.control_bus_alpha_fast = 0.25 + 0.20 * m;
        self.control_bus_alpha_slow = 0.08 + 0.10 * m;
        self.band_attack = 0.25 - 0.17 * m;
        self.band_release = 0.02 + 0.04 * m;
        self.heavy_band_attack = 0.12 - 0.08 * m;
        self.heavy_band_release = 0.01 + 0.02 * m;
        self.clamped()
    }

    /// Returns a copy with every field forced into its safe range.
    pub fn clamped(&self) -> Self {
        let mut out = *self;

        out.dc_alpha = clampf(out.dc_alpha, 0.000_001, 0.1);

        out.agc_target_rms = clampf(out.agc_target_rms, 0.01, 1.0);
        out.agc_min_gain = clampf(out.agc_min_gain, 0.1, 50.0);
        out.agc_max_gain = clampf(out.agc_max_gain, 1.0, 500.0);
        if out.agc_max_gain < out.agc_min_gain {
            out.agc_max_gain = out.agc_min_gain;
        }
        out.agc_attack = clampf(out.agc_attack, 0.0, 1.0);
        out.agc_release = clampf(out.agc_release, 0.0, 1.0);
        out.agc_clip_reduce = clampf(out.agc_clip_reduce, 0.1, 1.0);
        out.agc_idle_return_rate = clampf(out.agc_idle_return_rate, 0.0, 1.0);

        out.noise_floor_min = clampf(out.noise_floor_min, 0.0, 0.1);
        out.noise_floor_rise = clampf(out.noise_floor_rise, 0.0, 1.0);
        out.noise_floor_fall = clampf(out.noise_floor_fall, 0.0, 1.0);
        out.gate_start_factor = clampf(out.gate_start_factor, 0.0, 10.0);
        out.gate_range_factor = clampf(out.gate_range_factor, 0.0, 10.0);
        out.gate_range_min = clampf(out.gate_range_min, 0.0, 0.1);

        (out.rms_db_floor, out.rms_db_ceil) = clamp_db_range(out.rms_db_floor, out.rms_db_ceil);
        (out.band_db_floor, out.band_db_ceil) =
            clamp_db_range(out.band_db_floor, out.band_db_ceil);
        (out.chroma_db_floor, out.chroma_db_ceil) =
            clamp_db_range(out.chroma_db_floor, out.chroma_db_ceil);

        out.flux_scale = clampf(out.flux_scale, 0.0, 10.0);

        out.control_bus_alpha_fast = clampf(out.control_bus_alpha_fast, 0.0, 1.0);
        out.control_bus_alpha_slow = clampf(out.control_bus_alpha_slow, 0.0, 1.0);
        out.band_attack = clampf(out.band_attack, 0.0, 1.0);
        out.band_release = clampf(out.band_release, 0.0, 1.0);
        out.heavy_band_attack = clampf(out.heavy_band_attack, 0.0, 1.0);
        out.heavy_band_release = clampf(out.heavy_band_release, 0.0, 1.0);

        out.zone_agc_attack = clampf(out.zone_agc_attack, 0.0, 1.0);
        out.zone_agc_release = clampf(out.zone_agc_release, 0.0, 1.0);
        out.zone_min_floor = clampf(out.zone_min_floor, 0.0001, 1.0);
        out.chroma_zone_agc_attack = clampf(out.chroma_zone_agc_attack, 0.0, 1.0);
        out.chroma_zone_agc_release = clampf(out.chroma_zone_agc_release, 0.0, 1.0);

        for gain in &mut out.per_band_gains {
            *gain = clampf(*gain, 0.1, 10.0);
        }
        for floor in &mut out.per_band_noise_floors {
            *floor = clampf(*floor, 0.0, 0.1);
        }

        out.silence_hysteresis_ms = clampf(out.silence_hysteresis_ms, 0.0, 60_000.0);
        out.silence_threshold = clampf(out.silence_threshold, 0.0, 1.0);
        out
    }
}

/// Onset detector settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatDetectorTuning {
    /// Depth of the rolling mean/std history, in beat-lane frames.
    pub history_len: usize,

    pub flux_k: f32,
    pub flux_min_threshold: f32,
    pub use_bass: bool,
    pub bass_k: f32,
    pub bass_min_threshold: f32,
    pub use_snare: bool,
    pub snare_k: f32,
    pub snare_min_threshold: f32,
    pub use_hihat: bool,
    pub hihat_k: f32,
    pub hihat_min_threshold: f32,

    /// Refractory period as a fraction of the current beat interval.
    pub cooldown_fraction: f32,
    pub min_cooldown_s: f32,
    pub max_cooldown_s: f32,

    pub bpm_alpha: f32,
    pub bpm_min_preferred: f32,
    pub bpm_max_preferred: f32,

    pub confidence_boost: f32,
    pub confidence_mismatch_decay: f32,
    /// Multiplier applied to confidence on every beat-lane frame.
    pub confidence_passive_decay: f32,
    /// Tolerance for a beat to count as on time, as a fraction of the interval.
    pub match_tolerance: f32,
    pub tempo_valid_confidence: f32,
    pub beats_per_bar: u8,
}

impl Default for BeatDetectorTuning {
    fn default() -> Self {
        Self {
            history_len: 43,
            flux_k: 1.5,
            flux_min_threshold: 0.02,
            use_bass: true,
            bass_k: 1.5,
            bass_min_threshold: 0.05,
            use_snare: true,
            snare_k: 2.0,
            snare_min_threshold: 0.05,
            use_hihat: false,
            hihat_k: 2.0,
            hihat_min_threshold: 0.05,
            cooldown_fraction: 0.6,
            min_cooldown_s: 0.12,
            max_cooldown_s: 0.5,
            bpm_alpha: 0.2,
            bpm_min_preferred: 90.0,
            bpm_max_preferred: 180.0,
            confidence_boost: 0.2,
            confidence_mismatch_decay: 0.8,
            confidence_passive_decay: 0.995,
            match_tolerance: 0.15,
            tempo_valid_confidence: 0.3,
            beats_per_bar: 4,
        }
    }
}

impl BeatDetectorTuning {
    pub fn clamped(&self) -> Self {
        let mut out = *self;
        out.history_len = out.history_len.clamp(4, 512);
        out.flux_k = clampf(out.flux_k, 0.0, 10.0);
        out.bass_k = clampf(out.bass_k, 0.0, 10.0);
        out.snare_k = clampf(out.snare_k, 0.0, 10.0);
        out.hihat_k = clampf(out.hihat_k, 0.0, 10.0);
        out.flux_min_threshold = clampf(out.flux_min_threshold, 0.0, 1.0);
        out.bass_min_threshold = clampf(out.bass_min_threshold, 0.0, 1.0);
        out.snare_min_threshold = clampf(out.snare_min_threshold, 0.0, 1.0);
        out.hihat_min_threshold = clampf(out.hihat_min_threshold, 0.0, 1.0);
        out.cooldown_fraction = clampf(out.cooldown_fraction, 0.1, 1.0);
        out.min_cooldown_s = clampf(out.min_cooldown_s, 0.02, 2.0);
        out.max_cooldown_s = clampf(out.max_cooldown_s, out.min_cooldown_s, 2.0);
        out.bpm_alpha = clampf(out.bpm_alpha, 0.01, 1.0);
        out.bpm_min_preferred = clampf(out.bpm_min_preferred, 30.0, 300.0);
        out.bpm_max_preferred = clampf(out.bpm_max_preferred, 30.0, 300.0);
        // Folding needs the preferred window to span at least one octave.
        if out.bpm_max_preferred < out.bpm_min_preferred * 2.0 {
            out.bpm_max_preferred = (out.bpm_min_preferred * 2.0).min(300.0);
            out.bpm_min_preferred = out.bpm_max_preferred / 2.0;
        }
        out.confidence_boost = clampf(out.confidence_boost, 0.0, 1.0);
        out.confidence_mismatch_decay = clampf(out.confidence_mismatch_decay, 0.0, 1.0);
        out.confidence_passive_decay = clampf(out.confidence_passive_decay, 0.0, 1.0);
        out.match_tolerance = clampf(out.match_tolerance, 0.01, 0.5);
        out.tempo_valid_confidence = clampf(out.tempo_valid_confidence, 0.0, 1.0);
        if out.beats_per_bar == 0 {
            out.beats_per_bar = 4;
        }
        out.beats_per_bar = out.beats_per_bar.min(12);
        out
    }
}

/// Render-domain tempo/phase PLL settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicalGridTuning {
    pub bpm_min: f32,
    pub bpm_max: f32,
    /// Time constant of the BPM smoother, seconds.
    pub bpm_tau: f32,
    /// Time constant of the confidence decay, seconds.
    pub confidence_tau: f32,
    pub phase_correction_gain: f32,
    pub bar_correction_gain: f32,
    pub beat_strength_tau: f32,
    pub beats_per_bar: u8,
    pub beat_unit: u8,
}

impl Default for MusicalGridTuning {
    fn default() -> Self {
        Self {
            bpm_min: 30.0,
            bpm_max: 300.0,
            bpm_tau: 0.5,
            confidence_tau: 1.0,
            phase_correction_gain: 0.35,
            bar_correction_gain: 0.20,
            beat_strength_tau: 0.15,
            beats_per_bar: 4,
            beat_unit: 4,
        }
    }
}

impl MusicalGridTuning {
    pub fn clamped(&self) -> Self {
        let mut out = *self;
        out.bpm_min = clampf(out.bpm_min, BPM_LIMIT_MIN, BPM_LIMIT_MAX);
        out.bpm_max = clampf(out.bpm_max, BPM_LIMIT_MIN, BPM_LIMIT_MAX).max(out.bpm_min);
        out.bpm_tau = clampf(out.bpm_tau, 0.01, 10.0);
        out.confidence_tau = clampf(out.confidence_tau, 0.01, 10.0);
        out.phase_correction_gain = clampf(out.phase_correction_gain, 0.0, 1.0);
        out.bar_correction_gain = clampf(out.bar_correction_gain, 0.0, 1.0);
        out.beat_strength_tau = clampf(out.beat_strength_tau, 0.01, 10.0);
        (out.beats_per_bar, out.beat_unit) = clamp_time_signature(out.beats_per_bar, out.beat_unit);
        out
    }
}

/// Zero means "unspecified" and falls back to 4.
pub fn clamp_time_signature(beats_per_bar: u8, beat_unit: u8) -> (u8, u8) {
    let bpb = if beats_per_bar == 0 { 4 } else { beats_per_bar.min(12) };
    let unit = if beat_unit == 0 { 4 } else { beat_unit.min(16) };
    (bpb, unit)
}

/// NaN-safe clamp: non-finite input collapses to the low bound.
pub(crate) fn clampf(value: f32, lo: f32, hi: f32) -> f32 {
    if value.is_nan() {
        return lo;
    }
    value.clamp(lo, hi)
}

fn clamp_db_range(floor: f32, ceil: f32) -> (f32, f32) {
    let floor = clampf(floor, -120.0, 0.0);
    let mut ceil = clampf(ceil, -120.0, 0.0);
    if ceil <= floor + 1.0 {
        ceil = floor + 1.0;
    }
    (floor, ceil)
}
