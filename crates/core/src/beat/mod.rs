//! Onset detection and tempo estimation on the beat lane.

use serde::{Deserialize, Serialize};

use crate::config::{BPM_LIMIT_MAX, BPM_LIMIT_MIN, NUM_BANDS};
use crate::grid::GridObserver;
use crate::{AudioTime, BeatDetectorTuning};

const DEFAULT_BPM: f32 = 120.0;

/// One beat-lane observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatObsFrame {
    /// Acoustic time of the event, not the time it was detected.
    pub t_obs: AudioTime,
    pub beat_pulse: bool,
    pub beat_strength: f32,
    pub downbeat_pulse: bool,
    pub tempo_valid: bool,
    pub bpm_est: f32,
    pub tempo_conf: f32,
}

impl Default for BeatObsFrame {
    fn default() -> Self {
        Self {
            t_obs: AudioTime::default(),
            beat_pulse: false,
            beat_strength: 0.0,
            downbeat_pulse: false,
            tempo_valid: false,
            bpm_est: DEFAULT_BPM,
            tempo_conf: 0.0,
        }
    }
}

/// Fixed-depth circular history with running mean and standard deviation.
#[derive(Debug, Clone)]
pub struct RollingStats {
    values: Vec<f32>,
    next: usize,
    len: usize,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: vec![0.0; capacity.max(1)],
            next: 0,
            len: 0,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        let value = if value.is_finite() { value } else { 0.0 };
        if self.len == self.values.len() {
            let old = f64::from(self.values[self.next]);
            self.sum -= old;
            self.sum_sq -= old * old;
        } else {
            self.len += 1;
        }
        self.values[self.next] = value;
        self.sum += f64::from(value);
        self.sum_sq += f64::from(value) * f64::from(value);
        self.next = (self.next + 1) % self.values.len();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mean(&self) -> f32 {
        if self.len == 0 {
            return 0.0;
        }
        (self.sum / self.len as f64) as f32
    }

    pub fn std_dev(&self) -> f32 {
        if self.len < 2 {
            return 0.0;
        }
        let n = self.len as f64;
        let mean = self.sum / n;
        ((self.sum_sq / n - mean * mean).max(0.0)).sqrt() as f32
    }

    /// `mean + k * std`, never below `min`.
    pub fn threshold(&self, k: f32, min: f32) -> f32 {
        (self.mean() + k * self.std_dev()).max(min)
    }

    pub fn clear(&mut self) {
        self.values.fill(0.0);
        self.next = 0;
        self.len = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

/// Folds `bpm` by octaves into `[min_preferred, max_preferred]`: doubled
/// while below the window, halved while above it.
pub fn fold_octave(bpm: f32, min_preferred: f32, max_preferred: f32) -> f32 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return bpm;
    }
    let mut folded = bpm;
    for _ in 0..8 {
        if folded < min_preferred {
            folded *= 2.0;
        } else if folded > max_preferred {
            folded /= 2.0;
        } else {
            break;
        }
    }
    folded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeakShape {
    /// `prev > prev_prev && prev > current`.
    ThreePoint,
    /// `prev > current`.
    FallingEdge,
}

#[derive(Debug, Clone)]
struct OnsetChannel {
    shape: PeakShape,
    stats: RollingStats,
    prev: f32,
    prev_prev: f32,
}

impl OnsetChannel {
    fn new(shape: PeakShape, history: usize) -> Self {
        Self {
            shape,
            stats: RollingStats::new(history),
            prev: 0.0,
            prev_prev: 0.0,
        }
    }

    /// Feeds one value; returns the strength of a peak at the previous frame
    /// if it cleared the adaptive threshold.
    fn update(&mut self, value: f32, k: f32, min_threshold: f32) -> Option<f32> {
        let threshold = self.stats.threshold(k, min_threshold);
        let is_peak = match self.shape {
            PeakShape::ThreePoint => self.prev > self.prev_prev && self.prev > value,
            PeakShape::FallingEdge => self.prev > value,
        };
        let fired = is_peak && self.prev > threshold;
        let strength = (0.5 + 0.5 * (self.prev - threshold) / threshold.max(1e-6)).clamp(0.0, 1.0);

        self.stats.push(value);
        self.prev_prev = self.prev;
        self.prev = value;
        fired.then_some(strength)
    }

    fn reset(&mut self) {
        self.stats.clear();
        self.prev = 0.0;
        self.prev_prev = 0.0;
    }
}

/// Adaptive-threshold onset detector and tempo estimator.
///
/// Runs once per beat-lane frame. Beats and tempo estimates are pushed to the
/// musical grid through the [`GridObserver`] passed in at construction.
#[derive(Debug)]
pub struct BeatDetector {
    tuning: BeatDetectorTuning,
    /// Samples between consecutive lane frames; a peak is reported one frame
    /// after it happened.
    lane_samples: u64,
    flux: OnsetChannel,
    bass: OnsetChannel,
    snare: OnsetChannel,
    hihat: OnsetChannel,

    last_beat: Option<AudioTime>,
    bpm: f32,
    has_tempo: bool,
    confidence: f32,
    beat_count: u64,
    observer: GridObserver,
}

impl BeatDetector {
    pub fn new(tuning: BeatDetectorTuning, lane_samples: u64, observer: GridObserver) -> Self {
        let tuning = tuning.clamped();
        let history = tuning.history_len;
        Self {
            tuning,
            lane_samples,
            flux: OnsetChannel::new(PeakShape::ThreePoint, history),
            bass: OnsetChannel::new(PeakShape::FallingEdge, history),
            snare: OnsetChannel::new(PeakShape::FallingEdge, history),
            hihat: OnsetChannel::new(PeakShape::FallingEdge, history),
            last_beat: None,
            bpm: DEFAULT_BPM,
            has_tempo: false,
            confidence: 0.0,
            beat_count: 0,
            observer,
        }
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn tempo_valid(&self) -> bool {
        self.has_tempo && self.confidence >= self.tuning.tempo_valid_confidence
    }

    pub fn reset(&mut self) {
        self.flux.reset();
        self.bass.reset();
        self.snare.reset();
        self.hihat.reset();
        self.last_beat = None;
        self.bpm = DEFAULT_BPM;
        self.has_tempo = false;
        self.confidence = 0.0;
        self.beat_count = 0;
    }

    fn beat_interval_s(&self) -> f32 {
        60.0 / self.bpm
    }

    /// Processes one beat-lane frame of gated bands and flux taken at `now`.
    pub fn process(&mut self, now: AudioTime, bands: &[f32; NUM_BANDS], flux: f32) -> BeatObsFrame {
        let t = &self.tuning;
        let (flux_k, flux_min) = (t.flux_k, t.flux_min_threshold);
        let (bass_k, bass_min, use_bass) = (t.bass_k, t.bass_min_threshold, t.use_bass);
        let (snare_k, snare_min, use_snare) = (t.snare_k, t.snare_min_threshold, t.use_snare);
        let (hihat_k, hihat_min, use_hihat) = (t.hihat_k, t.hihat_min_threshold, t.use_hihat);

        // Every channel keeps its history current, enabled or not.
        let mut strength: Option<f32> = self.flux.update(flux, flux_k, flux_min);
        let bass = self.bass.update((bands[0] + bands[1]) * 0.5, bass_k, bass_min);
        let snare = self.snare.update(bands[2], snare_k, snare_min);
        let hihat = self.hihat.update((bands[6] + bands[7]) * 0.5, hihat_k, hihat_min);
        for (enabled, channel) in [(use_bass, bass), (use_snare, snare), (use_hihat, hihat)] {
            if let (true, Some(s)) = (enabled, channel) {
                strength = Some(strength.map_or(s, |best| best.max(s)));
            }
        }

        let t_obs = now.offset_samples(-(self.lane_samples as i64));
        let Some(strength) = strength.filter(|_| self.cooldown_elapsed(t_obs)) else {
            self.confidence *= self.tuning.confidence_passive_decay;
            return BeatObsFrame {
                t_obs,
                beat_pulse: false,
                beat_strength: 0.0,
                downbeat_pulse: false,
                tempo_valid: self.tempo_valid(),
                bpm_est: self.bpm,
                tempo_conf: self.confidence,
            };
        };

        self.register_beat(t_obs);
        let downbeat = self.beat_count % u64::from(self.tuning.beats_per_bar) == 0;
        self.beat_count += 1;

        self.observer.on_beat_observation(t_obs, strength, downbeat);
        if self.has_tempo {
            self.observer.on_tempo_estimate(t_obs, self.bpm, self.confidence);
        }

        let frame = BeatObsFrame {
            t_obs,
            beat_pulse: true,
            beat_strength: strength,
            downbeat_pulse: downbeat,
            tempo_valid: self.tempo_valid(),
            bpm_est: self.bpm,
            tempo_conf: self.confidence,
        };
        tracing::trace!(
            at = t_obs.sample_index,
            bpm = self.bpm,
            confidence = self.confidence,
            downbeat,
            "beat"
        );
        frame
    }

    /// Refractory period after a beat: a fixed fraction of the current beat
    /// interval, clamped to the configured bounds.
    fn cooldown_s(&self) -> f32 {
        (self.beat_interval_s() * self.tuning.cooldown_fraction)
            .clamp(self.tuning.min_cooldown_s, self.tuning.max_cooldown_s)
    }

    fn cooldown_elapsed(&self, t_obs: AudioTime) -> bool {
        let Some(last) = self.last_beat else {
            return true;
        };
        last.seconds_until(&t_obs) >= self.cooldown_s()
    }

    /// Updates tempo and confidence from the interval to the previous beat.
    fn register_beat(&mut self, t_obs: AudioTime) {
        let previous = self.last_beat.replace(t_obs);
        let Some(previous) = previous else {
            return;
        };

        let ioi = previous.seconds_until(&t_obs);
        if ioi <= 0.0 {
            return;
        }

        let interval = self.beat_interval_s();
        let beats_elapsed = (ioi / interval).round().max(1.0);
        let error = (ioi - beats_elapsed * interval).abs();
        if self.has_tempo && error <= self.tuning.match_tolerance * interval {
            self.confidence += self.tuning.confidence_boost * (1.0 - self.confidence);
        } else {
            self.confidence *= self.tuning.confidence_mismatch_decay;
        }

        let raw_bpm = 60.0 / ioi;
        if !(BPM_LIMIT_MIN..=BPM_LIMIT_MAX).contains(&raw_bpm) {
            return;
        }
        let (lo, hi) = (self.tuning.bpm_min_preferred, self.tuning.bpm_max_preferred);
        let candidate = fold_octave(raw_bpm, lo, hi);
        if self.has_tempo {
            self.bpm += self.tuning.bpm_alpha * (candidate - self.bpm);
        } else {
            self.bpm = candidate;
            self.has_tempo = true;
        }
        self.bpm = fold_octave(self.bpm, lo, hi).clamp(BPM_LIMIT_MIN, BPM_LIMIT_MAX);
        self.confidence = self.confidence.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MusicalGrid;
    use crate::MusicalGridTuning;

    const SR: u32 = 16_000;
    const LANE: u64 = 256;

    fn detector() -> (BeatDetector, MusicalGrid) {
        let (grid, observer) = MusicalGrid::new(MusicalGridTuning::default());
        (BeatDetector::new(BeatDetectorTuning::default(), LANE, observer), grid)
    }

    fn at(sample_index: u64) -> AudioTime {
        AudioTime::new(sample_index, SR, sample_index * 1_000_000 / u64::from(SR))
    }

    /// Feeds lane frames `frames`, spiking the flux wherever `spike` says so.
    fn run_spikes(
        det: &mut BeatDetector,
        frames: std::ops::Range<u64>,
        spike: impl Fn(u64) -> bool,
    ) -> Vec<BeatObsFrame> {
        let bands = [0.0; NUM_BANDS];
        frames
            .map(|f| det.process(at(f * LANE), &bands, if spike(f) { 0.6 } else { 0.01 }))
            .collect()
    }

    /// Feeds a flux train with one spike every `period_frames` lane frames.
    fn run_pulses(det: &mut BeatDetector, period_frames: u64, frames: u64) -> Vec<BeatObsFrame> {
        let bands = [0.0; NUM_BANDS];
        (0..frames)
            .map(|f| {
                let flux = if f % period_frames == 0 { 0.6 } else { 0.01 };
                det.process(at(f * LANE), &bands, flux)
            })
            .filter(|frame| frame.beat_pulse)
            .collect()
    }

    #[test]
    fn rolling_stats_track_window() {
        let mut stats = RollingStats::new(4);
        for v in [1.0, 1.0, 3.0, 3.0] {
            stats.push(v);
        }
        assert_eq!(stats.mean(), 2.0);
        assert!((stats.std_dev() - 1.0).abs() < 1e-6);
        stats.push(3.0);
        stats.push(3.0);
        assert_eq!(stats.len(), 4);
        assert_eq!(stats.mean(), 3.0);
        assert_eq!(stats.threshold(1.5, 5.0), 5.0);
    }

    #[test]
    fn folds_octave_errors() {
        assert!((fold_octave(58.0, 90.0, 180.0) - 116.0).abs() < 1e-3);
        assert!((fold_octave(280.0, 90.0, 180.0) - 140.0).abs() < 1e-3);
        assert_eq!(fold_octave(128.0, 90.0, 180.0), 128.0);
        assert!((fold_octave(40.0, 90.0, 180.0) - 160.0).abs() < 1e-3);
    }

    #[test]
    fn silence_never_fires() {
        let (mut det, _grid) = detector();
        let bands = [0.0; NUM_BANDS];
        for f in 0..500 {
            let frame = det.process(at(f * LANE), &bands, 0.0);
            assert!(!frame.beat_pulse);
        }
        assert!(!det.tempo_valid());
    }

    #[test]
    fn periodic_flux_yields_tempo() {
        let (mut det, _grid) = detector();
        // 31.25 frames per beat at 120 BPM; 31 frames is ~121 BPM.
        let beats = run_pulses(&mut det, 31, 31 * 20);
        assert!(beats.len() >= 18);
        let last = beats.last().unwrap();
        assert!((last.bpm_est - 120.97).abs() < 1.0, "bpm {}", last.bpm_est);
        assert!(last.tempo_valid);
        assert!(last.tempo_conf > 0.5);
    }

    #[test]
    fn beat_time_is_one_lane_frame_back() {
        let (mut det, _grid) = detector();
        let beats = run_pulses(&mut det, 31, 40);
        // The spike at frame 31 is confirmed on frame 32.
        assert_eq!(beats[0].t_obs.sample_index, 31 * LANE);
    }

    #[test]
    fn downbeat_every_fourth_beat() {
        let (mut det, _grid) = detector();
        let beats = run_pulses(&mut det, 31, 31 * 9);
        let pattern: Vec<bool> = beats.iter().map(|b| b.downbeat_pulse).collect();
        assert_eq!(&pattern[..8], &[true, false, false, false, true, false, false, false]);
    }

    #[test]
    fn half_tempo_input_is_folded_up() {
        let (mut det, _grid) = detector();
        // ~60.5 BPM pulses read as ~121 BPM.
        let beats = run_pulses(&mut det, 62, 62 * 8);
        let last = beats.last().unwrap();
        assert!((last.bpm_est - 120.97).abs() < 1.0, "bpm {}", last.bpm_est);
    }

    #[test]
    fn cooldown_suppresses_double_triggers() {
        let (mut det, _grid) = detector();
        let bands = [0.0; NUM_BANDS];
        let mut fired = 0;
        // Two spikes 3 frames (48 ms) apart.
        for f in 0..40_u64 {
            let flux = if f == 31 || f == 34 { 0.6 } else { 0.01 };
            fired += det.process(at(f * LANE), &bands, flux).beat_pulse as u32;
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn beats_reach_the_grid() {
        let (mut det, mut grid) = detector();
        run_pulses(&mut det, 31, 40);
        grid.tick(at(0));
        let snap = grid.tick(at(40 * LANE));
        assert!(snap.beat_strength > 0.0);
    }

    #[test]
    fn off_grid_onset_costs_confidence() {
        let (mut det, _grid) = detector();
        // Regular spikes every 31 frames up to 589, then one 20 frames later.
        let spike = |f: u64| (f % 31 == 0 && f < 620) || f == 609;
        run_spikes(&mut det, 0..590, spike);

        let before_on_grid = det.confidence();
        let on_grid = run_spikes(&mut det, 590..591, spike)[0];
        assert!(on_grid.beat_pulse);
        assert!(on_grid.tempo_conf > before_on_grid);

        run_spikes(&mut det, 591..610, spike);
        let before_off_grid = det.confidence();
        assert!(before_off_grid > 0.5);
        let off_grid = run_spikes(&mut det, 610..611, spike)[0];
        assert!(off_grid.beat_pulse);
        let expected = before_off_grid * BeatDetectorTuning::default().confidence_mismatch_decay;
        assert!((off_grid.tempo_conf - expected).abs() < 1e-6, "{} vs {expected}", off_grid.tempo_conf);
    }

    #[test]
    fn confidence_decays_only_on_frames_without_a_beat() {
        let (mut det, _grid) = detector();
        let spike = |f: u64| f % 31 == 0;
        run_spikes(&mut det, 0..31 * 10, spike);
        let quiet = det.confidence();
        let frame = run_spikes(&mut det, 31 * 10..31 * 10 + 1, spike)[0];
        assert!(!frame.beat_pulse);
        let decay = BeatDetectorTuning::default().confidence_passive_decay;
        assert!((frame.tempo_conf - quiet * decay).abs() < 1e-6);
    }

    #[test]
    fn intervals_slower_than_thirty_bpm_are_ignored() {
        let (mut det, _grid) = detector();
        // 150 frames is 2.4 s, or 25 BPM.
        let spike = |f: u64| f == 10 || f == 160 || f == 191;
        let frames = run_spikes(&mut det, 0..170, spike);
        let beats: Vec<_> = frames.iter().filter(|f| f.beat_pulse).collect();
        assert_eq!(beats.len(), 2);
        assert_eq!(det.bpm(), 120.0);
        assert!(!det.has_tempo);

        // The next 31-frame interval is in range and sets the tempo.
        run_spikes(&mut det, 170..200, spike);
        assert!(det.has_tempo);
        assert!((det.bpm() - 120.97).abs() < 0.1, "bpm {}", det.bpm());
    }

    #[test]
    fn cooldown_follows_tempo_within_bounds() {
        let (mut det, _grid) = detector();
        assert!((det.cooldown_s() - 0.3).abs() < 1e-6);
        det.bpm = 178.0;
        assert!((det.cooldown_s() - 0.6 * 60.0 / 178.0).abs() < 1e-6);
        det.bpm = 30.0;
        assert_eq!(det.cooldown_s(), 0.5);
        det.bpm = 400.0;
        assert_eq!(det.cooldown_s(), 0.12);
    }

    #[test]
    fn faster_tempo_allows_closer_onsets() {
        // 14 frames is 224 ms: inside the ~298 ms cooldown at 121 BPM, outside
        // the ~202 ms cooldown at 179 BPM.
        let (mut slow, _g1) = detector();
        let spike = |f: u64| (f % 31 == 0 && f < 372) || f == 341 + 14;
        let frames = run_spikes(&mut slow, 0..372, spike);
        assert!(!frames[356].beat_pulse);

        let (mut fast, _g2) = detector();
        let spike = |f: u64| (f % 21 == 0 && f < 252) || f == 231 + 14;
        run_spikes(&mut fast, 0..246, spike);
        assert!((fast.bpm() - 178.57).abs() < 1.0, "bpm {}", fast.bpm());
        assert!(run_spikes(&mut fast, 246..247, spike)[0].beat_pulse);
    }
}
