//! Render-domain musical clock.
//!
//! [`MusicalGrid::new`] hands back two halves. The [`GridObserver`] goes to the
//! audio context, which can only record tempo and beat evidence. The
//! [`MusicalGrid`] stays with the renderer, which advances the clock once per
//! frame with [`MusicalGrid::tick`]. Evidence crosses over through a
//! [`SnapshotBuffer`], so neither side ever waits for the other.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::{clamp_time_signature, clampf};
use crate::sync::{SnapshotBuffer, SnapshotReader, SnapshotWriter};
use crate::{AudioTime, MusicalGridTuning};

const DEFAULT_BPM: f32 = 120.0;
/// Beat observations kept in flight between the two contexts.
const BEAT_BACKLOG: usize = 4;

/// Musical timing state read by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MusicalGridSnapshot {
    pub t: AudioTime,
    pub bpm_smoothed: f32,
    pub tempo_confidence: f32,
    pub beat_phase01: f32,
    pub bar_phase01: f32,
    /// True on the frame where the beat counter crossed an integer.
    pub beat_tick: bool,
    /// True on the frame where a beat tick landed on beat 0 of the bar.
    pub downbeat_tick: bool,
    pub beat_index: u64,
    pub bar_index: u64,
    pub beats_per_bar: u8,
    pub beat_unit: u8,
    pub beat_in_bar: u8,
    /// Strength of the most recent beat observation, decaying between beats.
    pub beat_strength: f32,
}

impl Default for MusicalGridSnapshot {
    fn default() -> Self {
        Self {
            t: AudioTime::default(),
            bpm_smoothed: DEFAULT_BPM,
            tempo_confidence: 0.0,
            beat_phase01: 0.0,
            bar_phase01: 0.0,
            beat_tick: false,
            downbeat_tick: false,
            beat_index: 0,
            bar_index: 0,
            beats_per_bar: 4,
            beat_unit: 4,
            beat_in_bar: 0,
            beat_strength: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TempoEvidence {
    t: AudioTime,
    bpm: f32,
    confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BeatEvidence {
    t: AudioTime,
    strength: f32,
    is_downbeat: bool,
}

/// Latest evidence from the audio side. Each kind carries its own counter so
/// the grid can tell new evidence from a re-read. The last few beats are kept
/// in a ring indexed by `beat_seq`, so beats published between two render
/// ticks are not lost.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct GridEvidence {
    tempo: Option<TempoEvidence>,
    tempo_seq: u32,
    beats: [Option<BeatEvidence>; BEAT_BACKLOG],
    beat_seq: u32,
}

impl GridEvidence {
    fn beat_slot(seq: u32) -> usize {
        seq as usize % BEAT_BACKLOG
    }
}

/// Audio-domain handle onto a [`MusicalGrid`]. Records evidence only; it
/// never advances the clock.
#[derive(Debug)]
pub struct GridObserver {
    evidence: GridEvidence,
    writer: SnapshotWriter<GridEvidence>,
}

impl GridObserver {
    /// Records a tempo estimate taken at `t`.
    pub fn on_tempo_estimate(&mut self, t: AudioTime, bpm: f32, confidence: f32) {
        if !bpm.is_finite() {
            return;
        }
        self.evidence.tempo = Some(TempoEvidence {
            t,
            bpm,
            confidence: clampf(confidence, 0.0, 1.0),
        });
        self.evidence.tempo_seq = self.evidence.tempo_seq.wrapping_add(1);
        self.writer.publish(self.evidence);
    }

    /// Records a beat heard at acoustic time `t`.
    pub fn on_beat_observation(&mut self, t: AudioTime, strength: f32, is_downbeat: bool) {
        let seq = self.evidence.beat_seq.wrapping_add(1);
        self.evidence.beats[GridEvidence::beat_slot(seq)] = Some(BeatEvidence {
            t,
            strength: clampf(strength, 0.0, 1.0),
            is_downbeat,
        });
        self.evidence.beat_seq = seq;
        self.writer.publish(self.evidence);
    }
}

/// Tempo/phase PLL owned by the render context.
#[derive(Debug)]
pub struct MusicalGrid {
    tuning: MusicalGridTuning,
    evidence: SnapshotReader<GridEvidence>,
    seen_tempo_seq: u32,
    seen_beat_seq: u32,
    /// Observations not yet due, oldest first. Never grows past
    /// `BEAT_BACKLOG`.
    pending_beats: VecDeque<BeatEvidence>,

    target_bpm: f32,
    bpm: f32,
    confidence: f32,
    beat_strength: f32,
    /// Continuous beat counter; the integer part is the beat index.
    beat_float: f64,
    last_beat_index: i64,
    last_tick: Option<AudioTime>,

    snapshot: MusicalGridSnapshot,
    writer: SnapshotWriter<MusicalGridSnapshot>,
}

impl MusicalGrid {
    pub fn new(tuning: MusicalGridTuning) -> (MusicalGrid, GridObserver) {
        let tuning = tuning.clamped();
        let (evidence_writer, evidence_reader) = SnapshotBuffer::new(GridEvidence::default()).split();
        let initial = MusicalGridSnapshot {
            beats_per_bar: tuning.beats_per_bar,
            beat_unit: tuning.beat_unit,
            ..MusicalGridSnapshot::default()
        };
        let (writer, _) = SnapshotBuffer::new(initial).split();

        let grid = MusicalGrid {
            tuning,
            evidence: evidence_reader,
            seen_tempo_seq: 0,
            seen_beat_seq: 0,
            pending_beats: VecDeque::with_capacity(BEAT_BACKLOG),
            target_bpm: DEFAULT_BPM,
            bpm: DEFAULT_BPM,
            confidence: 0.0,
            beat_strength: 0.0,
            beat_float: 0.0,
            last_beat_index: 0,
            last_tick: None,
            snapshot: initial,
            writer,
        };
        let observer = GridObserver {
            evidence: GridEvidence::default(),
            writer: evidence_writer,
        };
        (grid, observer)
    }

    /// Reader for other consumers of the published snapshot.
    pub fn reader(&self) -> SnapshotReader<MusicalGridSnapshot> {
        self.writer.reader()
    }

    pub fn snapshot(&self) -> MusicalGridSnapshot {
        self.snapshot
    }

    pub fn tuning(&self) -> &MusicalGridTuning {
        &self.tuning
    }

    /// Back to 120 BPM in 4/4, zero confidence and zero phase. Evidence
    /// recorded before the reset is discarded.
    pub fn reset(&mut self) {
        let (latest, _) = self.evidence.read_latest();
        self.seen_tempo_seq = latest.tempo_seq;
        self.seen_beat_seq = latest.beat_seq;
        self.pending_beats.clear();
        (self.tuning.beats_per_bar, self.tuning.beat_unit) = clamp_time_signature(0, 0);
        self.target_bpm = DEFAULT_BPM;
        self.bpm = DEFAULT_BPM;
        self.confidence = 0.0;
        self.beat_strength = 0.0;
        self.beat_float = 0.0;
        self.last_beat_index = 0;
        self.last_tick = None;
        self.snapshot = MusicalGridSnapshot {
            t: self.snapshot.t,
            beats_per_bar: self.tuning.beats_per_bar,
            beat_unit: self.tuning.beat_unit,
            ..MusicalGridSnapshot::default()
        };
        self.writer.publish(self.snapshot);
        tracing::debug!("musical grid reset");
    }

    /// Zero for either field means 4.
    pub fn set_time_signature(&mut self, beats_per_bar: u8, beat_unit: u8) {
        let (bpb, unit) = clamp_time_signature(beats_per_bar, beat_unit);
        self.tuning.beats_per_bar = bpb;
        self.tuning.beat_unit = unit;
    }

    /// Advances the clock to `now`. Call once per render frame.
    pub fn tick(&mut self, now: AudioTime) -> MusicalGridSnapshot {
        self.ingest_evidence();

        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            self.publish(now, false);
            return self.snapshot;
        };

        if now.sample_index < last.sample_index {
            // Clock regression: republish the previous state untouched.
            self.snapshot.beat_tick = false;
            self.snapshot.downbeat_tick = false;
            self.writer.publish(self.snapshot);
            return self.snapshot;
        }

        let dt = last.seconds_until(&now).max(0.0);
        self.last_tick = Some(now);

        if dt > 0.0 {
            let bpm_alpha = 1.0 - (-dt / self.tuning.bpm_tau).exp();
            self.bpm += bpm_alpha * (self.target_bpm - self.bpm);
            self.bpm = self.bpm.clamp(self.tuning.bpm_min, self.tuning.bpm_max);
            self.confidence *= (-dt / self.tuning.confidence_tau).exp();
            self.beat_strength *= (-dt / self.tuning.beat_strength_tau).exp();
            self.beat_float += f64::from(dt) * f64::from(self.bpm) / 60.0;
        }

        while let Some(obs) = self.pending_beats.front().copied() {
            if obs.t.sample_index > now.sample_index {
                break;
            }
            self.pending_beats.pop_front();
            self.apply_beat(now, obs);
        }

        let beat_index = self.beat_float.floor() as i64;
        let crossed = beat_index > self.last_beat_index;
        if crossed {
            self.last_beat_index = beat_index;
        }
        self.publish(now, crossed);
        self.snapshot
    }

    fn ingest_evidence(&mut self) {
        let (evidence, _) = self.evidence.read_latest();

        if evidence.tempo_seq != self.seen_tempo_seq {
            self.seen_tempo_seq = evidence.tempo_seq;
            if let Some(tempo) = evidence.tempo {
                self.target_bpm = tempo.bpm.clamp(self.tuning.bpm_min, self.tuning.bpm_max);
                self.confidence = self.confidence.max(tempo.confidence);
                tracing::trace!(bpm = tempo.bpm, at = tempo.t.sample_index, "tempo evidence");
            }
        }

        let fresh = evidence.beat_seq.wrapping_sub(self.seen_beat_seq) as usize;
        for back in (0..fresh.min(BEAT_BACKLOG)).rev() {
            let seq = evidence.beat_seq.wrapping_sub(back as u32);
            if let Some(obs) = evidence.beats[GridEvidence::beat_slot(seq)] {
                if self.pending_beats.len() == BEAT_BACKLOG {
                    self.pending_beats.pop_front();
                }
                self.pending_beats.push_back(obs);
            }
        }
        self.seen_beat_seq = evidence.beat_seq;
    }

    /// Phase-locked correction toward a beat heard at `obs.t`.
    fn apply_beat(&mut self, now: AudioTime, obs: BeatEvidence) {
        let samples_back = obs.t.samples_until(&now).max(0) as f64;
        let sample_rate = f64::from(now.sample_rate_hz.max(1));
        let samples_per_beat = sample_rate * 60.0 / f64::from(self.bpm);
        let strength = f64::from(obs.strength);

        let beat_at_obs = self.beat_float - samples_back / samples_per_beat;
        let phase_err = wrap_half(beat_at_obs);
        let phase_step = phase_err * f64::from(self.tuning.phase_correction_gain) * strength;
        self.beat_float -= phase_step;

        if obs.is_downbeat {
            let bpb = f64::from(self.tuning.beats_per_bar);
            let bar_at_obs = (beat_at_obs - phase_step) / bpb;
            let bar_err = wrap_half(bar_at_obs);
            self.beat_float -= bar_err * bpb * f64::from(self.tuning.bar_correction_gain) * strength;
        }

        self.confidence = self.confidence.max(obs.strength);
        self.beat_strength = self.beat_strength.max(obs.strength);
    }

    fn publish(&mut self, now: AudioTime, beat_tick: bool) {
        let bpb = i64::from(self.tuning.beats_per_bar.max(1));
        let beat_index = self.beat_float.floor() as i64;
        let mut beat_phase = (self.beat_float - beat_index as f64) as f32;
        if !(0.0..1.0).contains(&beat_phase) {
            beat_phase = 0.0;
        }
        let beat_in_bar = beat_index.rem_euclid(bpb);
        let bar_index = beat_index.div_euclid(bpb);
        let mut bar_phase = (beat_in_bar as f32 + beat_phase) / bpb as f32;
        if !(0.0..1.0).contains(&bar_phase) {
            bar_phase = 0.0;
        }

        self.snapshot = MusicalGridSnapshot {
            t: now,
            bpm_smoothed: self.bpm,
            tempo_confidence: self.confidence.clamp(0.0, 1.0),
            beat_phase01: beat_phase,
            bar_phase01: bar_phase,
            beat_tick,
            downbeat_tick: beat_tick && beat_in_bar == 0,
            beat_index: beat_index.max(0) as u64,
            bar_index: bar_index.max(0) as u64,
            beats_per_bar: self.tuning.beats_per_bar,
            beat_unit: self.tuning.beat_unit,
            beat_in_bar: beat_in_bar as u8,
            beat_strength: self.beat_strength,
        };
        self.writer.publish(self.snapshot);
    }
}

/// Signed distance from `x` to the nearest integer, in [-0.5, 0.5).
fn wrap_half(x: f64) -> f64 {
    let frac = x - x.floor();
    if frac >= 0.5 {
        frac - 1.0
    } else {
        frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SR: u32 = 16_000;
    /// One render frame at 120 FPS, in samples.
    const FRAME: u64 = SR as u64 / 120;

    fn at(sample_index: u64) -> AudioTime {
        AudioTime::new(sample_index, SR, sample_index * 1_000_000 / SR as u64)
    }

    #[test]
    fn first_tick_only_seeds_timing() {
        let (mut grid, _observer) = MusicalGrid::new(MusicalGridTuning::default());
        let snap = grid.tick(at(1000));
        assert_eq!(snap.bpm_smoothed, 120.0);
        assert_eq!(snap.beat_phase01, 0.0);
        assert!(!snap.beat_tick);
    }

    #[test]
    fn free_runs_at_smoothed_tempo() {
        let (mut grid, _observer) = MusicalGrid::new(MusicalGridTuning::default());
        let mut ticks = Vec::new();
        let mut sample = 0;
        for _ in 0..(120 * 3) {
            let snap = grid.tick(at(sample));
            if snap.beat_tick {
                ticks.push(sample);
            }
            sample += FRAME;
        }
        // 120 BPM for three seconds.
        assert_eq!(ticks.len(), 5);
        for pair in ticks.windows(2) {
            assert!((pair[1] - pair[0]).abs_diff(8000) <= FRAME);
        }
    }

    #[test]
    fn clock_regression_is_a_no_op() {
        let (mut grid, _observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.tick(at(0));
        let before = grid.tick(at(4000));
        let stale = grid.tick(at(2000));
        assert_eq!(stale.beat_phase01, before.beat_phase01);
        assert_eq!(stale.t, before.t);
        let after = grid.tick(at(4000 + FRAME));
        assert!(after.beat_phase01 > before.beat_phase01);
    }

    #[test]
    fn tempo_estimate_is_smoothed_and_clamped() {
        let (mut grid, mut observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.tick(at(0));
        observer.on_tempo_estimate(at(0), 1000.0, 0.9);
        let mut snap = grid.tick(at(FRAME));
        assert!(snap.bpm_smoothed > 120.0 && snap.bpm_smoothed < 300.0);
        assert!((snap.tempo_confidence - 0.9).abs() < 0.01);
        for i in 2..(120 * 5) {
            snap = grid.tick(at(i * FRAME));
        }
        assert!((snap.bpm_smoothed - 300.0).abs() < 0.5);
        assert!(snap.tempo_confidence < 0.01);
    }

    #[test]
    fn beat_observation_waits_until_due() {
        let (mut grid, mut observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.tick(at(0));
        observer.on_beat_observation(at(10 * FRAME), 1.0, false);
        let early = grid.tick(at(FRAME));
        assert_eq!(early.beat_strength, 0.0);
        let mut snap = early;
        for i in 2..=10 {
            snap = grid.tick(at(i * FRAME));
        }
        assert!(snap.beat_strength > 0.99);
        assert!(snap.tempo_confidence > 0.99);
    }

    #[test]
    fn beats_queued_before_they_are_due_all_apply() {
        let (mut grid, mut observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.tick(at(0));
        observer.on_beat_observation(at(10 * FRAME), 0.6, false);
        observer.on_beat_observation(at(20 * FRAME), 1.0, false);

        let mut strengths = Vec::new();
        for i in 1..=20 {
            strengths.push(grid.tick(at(i * FRAME)).beat_strength);
        }
        assert_eq!(strengths[8], 0.0);
        assert!((strengths[9] - 0.6).abs() < 1e-6, "{}", strengths[9]);
        assert!(strengths[19] > 0.99);
    }

    #[test]
    fn wild_tempo_range_still_holds_bpm_in_bounds() {
        let tuning = MusicalGridTuning {
            bpm_min: 20.0,
            bpm_max: 400.0,
            ..MusicalGridTuning::default()
        };
        let (mut grid, mut observer) = MusicalGrid::new(tuning);
        assert_eq!(grid.tuning().bpm_min, 30.0);
        assert_eq!(grid.tuning().bpm_max, 300.0);

        grid.tick(at(0));
        let mut frame = 1;
        for bpm in [1000.0, 1.0] {
            observer.on_tempo_estimate(at(frame * FRAME), bpm, 1.0);
            for _ in 0..(120 * 5) {
                let snap = grid.tick(at(frame * FRAME));
                assert!((30.0..=300.0).contains(&snap.bpm_smoothed), "bpm {}", snap.bpm_smoothed);
                frame += 1;
            }
        }
        assert!((grid.snapshot().bpm_smoothed - 30.0).abs() < 0.5);
    }

    #[test]
    fn locks_phase_to_periodic_beats() {
        let (mut grid, mut observer) = MusicalGrid::new(MusicalGridTuning::default());
        // Beats every 0.5 s, offset a third of a beat from the free-running clock.
        let interval = 8000_u64;
        let offset = 2667_u64;
        let mut next_beat = offset;
        let mut ticks = Vec::new();
        let mut conf_at_obs = Vec::new();
        let mut conf_input = 0.3_f32;

        for frame in 0..(120 * 12) {
            let now = frame * FRAME;
            let observed = now >= next_beat;
            if observed {
                observer.on_tempo_estimate(at(next_beat), 120.0, conf_input);
                observer.on_beat_observation(at(next_beat), 0.8, false);
                conf_input = (conf_input + 0.05).min(0.95);
                next_beat += interval;
            }
            let snap = grid.tick(at(now));
            if observed {
                conf_at_obs.push(snap.tempo_confidence);
            }
            if snap.beat_tick {
                ticks.push(now);
            }
        }

        // Once locked, ticks line up with the observed beats within a frame
        // or two and repeat at the observed period.
        let late: Vec<u64> = ticks.iter().copied().filter(|t| *t > 16_000 * 8).collect();
        assert!(late.len() >= 6);
        for tick in &late {
            let phase = (tick + interval - offset) % interval;
            let dist = phase.min(interval - phase);
            assert!(dist <= 3 * FRAME, "tick {tick} is {dist} samples off the beat grid");
        }
        for pair in late.windows(2) {
            assert!((pair[1] - pair[0]).abs_diff(interval) <= 2 * FRAME);
        }
        for pair in conf_at_obs.windows(2) {
            assert!(pair[1] + 1e-6 >= pair[0], "confidence fell: {pair:?}");
        }
        assert!(conf_at_obs.last().copied().unwrap_or(0.0) > 0.9);
    }

    #[test]
    fn downbeats_follow_time_signature() {
        let (mut grid, _observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.set_time_signature(3, 4);
        let mut downbeats = 0;
        let mut beats = 0;
        for frame in 0..(120 * 6) {
            let snap = grid.tick(at(frame * FRAME));
            assert!(snap.beat_in_bar < 3);
            assert!((0.0..1.0).contains(&snap.bar_phase01));
            beats += snap.beat_tick as u32;
            downbeats += snap.downbeat_tick as u32;
        }
        assert_eq!(beats, 11);
        assert_eq!(downbeats, 3);
    }

    #[test]
    fn reset_restores_defaults() {
        let (mut grid, mut observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.tick(at(0));
        observer.on_tempo_estimate(at(0), 90.0, 1.0);
        for i in 1..240 {
            grid.tick(at(i * FRAME));
        }
        grid.reset();
        let snap = grid.snapshot();
        assert_eq!(snap.bpm_smoothed, 120.0);
        assert_eq!(snap.tempo_confidence, 0.0);
        assert_eq!(snap.beat_phase01, 0.0);
        // Evidence from before the reset is not replayed.
        let next = grid.tick(at(240 * FRAME));
        assert_eq!(next.tempo_confidence, 0.0);
    }

    #[test]
    fn reset_returns_to_four_four() {
        let (mut grid, _observer) = MusicalGrid::new(MusicalGridTuning::default());
        grid.set_time_signature(7, 8);
        grid.reset();
        let snap = grid.snapshot();
        assert_eq!((snap.beats_per_bar, snap.beat_unit), (4, 4));
        assert_eq!(grid.tuning().beats_per_bar, 4);
    }

    #[test]
    fn reader_sees_published_snapshot() {
        let (mut grid, _observer) = MusicalGrid::new(MusicalGridTuning::default());
        let mut reader = grid.reader();
        grid.tick(at(0));
        let snap = grid.tick(at(FRAME));
        assert_eq!(reader.read_latest().0, snap);
    }

    proptest! {
        #[test]
        fn bpm_and_phases_stay_in_range(
            estimates in proptest::collection::vec((-1000.0_f32..5000.0, 0.0_f32..1.5), 1..40),
            steps in proptest::collection::vec(0_u64..4000, 1..40),
            bpm_min in -50.0_f32..500.0,
            bpm_max in -50.0_f32..600.0,
        ) {
            let tuning = MusicalGridTuning { bpm_min, bpm_max, ..MusicalGridTuning::default() };
            let (mut grid, mut observer) = MusicalGrid::new(tuning);
            let mut sample = 0_u64;
            for (i, (bpm, conf)) in estimates.iter().enumerate() {
                observer.on_tempo_estimate(at(sample), *bpm, *conf);
                if i % 3 == 0 {
                    observer.on_beat_observation(at(sample), *conf, i % 6 == 0);
                }
                sample += steps[i % steps.len()];
                let snap = grid.tick(at(sample));
                prop_assert!((30.0..=300.0).contains(&snap.bpm_smoothed));
                prop_assert!((0.0..=1.0).contains(&snap.tempo_confidence));
                prop_assert!((0.0..1.0).contains(&snap.beat_phase01));
                prop_assert!((0.0..1.0).contains(&snap.bar_phase01));
            }
        }
    }
}
