//! Smoothing and publication of per-hop analysis results.

use serde::{Deserialize, Serialize};

use crate::config::{NUM_BANDS, NUM_CHROMA};
use crate::frontend::WAVEFORM_POINTS;
use crate::sync::{SnapshotBuffer, SnapshotReader, SnapshotWriter};
use crate::{AudioPipelineTuning, AudioTime};

/// Triad energy share that counts as a perfectly clean chord.
const CLEAN_TRIAD_SHARE: f32 = 0.4;
const MIN_CHORD_CONFIDENCE: f32 = 0.3;
const MIN_CHROMA_ENERGY: f32 = 0.01;

const LOOKAHEAD_FRAMES: usize = 3;
/// Bins below this on all three lookahead frames are left alone.
const SPIKE_NOISE_FLOOR: f32 = 0.005;
const SPIKE_RELATIVE_DEVIATION: f32 = 0.15;
const SPIKE_MIN_DEVIATION: f32 = 0.02;
const NUM_ZONES: usize = 4;

/// Raw measurements for one hop, before smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlBusRawInput {
    /// dB-mapped, gate-scaled RMS.
    pub rms: f32,
    /// Linear pre-gain RMS; drives silence detection so the gate cannot
    /// force quiet but real audio into silence.
    pub rms_ungated: f32,
    pub flux: f32,
    pub bands: [f32; NUM_BANDS],
    pub chroma: [f32; NUM_CHROMA],
    pub waveform: [i16; WAVEFORM_POINTS],
}

impl Default for ControlBusRawInput {
    fn default() -> Self {
        Self {
            rms: 0.0,
            rms_ungated: 0.0,
            flux: 0.0,
            bands: [0.0; NUM_BANDS],
            chroma: [0.0; NUM_CHROMA],
            waveform: [0; WAVEFORM_POINTS],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordKind {
    #[default]
    None,
    Major,
    Minor,
    Diminished,
    Augmented,
}

/// Triad estimate from the smoothed chromagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChordState {
    /// Pitch class of the root, 0 = C.
    pub root: u8,
    pub kind: ChordKind,
    pub confidence: f32,
    pub root_strength: f32,
    pub third_strength: f32,
    pub fifth_strength: f32,
}

impl ChordState {
    pub fn detect(chroma: &[f32; NUM_CHROMA]) -> Self {
        let mut root = 0;
        for (i, value) in chroma.iter().enumerate() {
            if *value > chroma[root] {
                root = i;
            }
        }
        let total: f32 = chroma.iter().sum();
        let at = |interval: usize| chroma[(root + interval) % NUM_CHROMA];

        let (minor_third, major_third) = (at(3), at(4));
        let (dim_fifth, perfect_fifth, aug_fifth) = (at(6), at(7), at(8));
        let minor = minor_third > major_third;
        let third_strength = if minor { minor_third } else { major_third };

        let (fifth_strength, mut kind) =
            if perfect_fifth >= dim_fifth && perfect_fifth >= aug_fifth {
                let kind = if minor { ChordKind::Minor } else { ChordKind::Major };
                (perfect_fifth, kind)
            } else if dim_fifth > aug_fifth {
                (dim_fifth, ChordKind::Diminished)
            } else {
                (aug_fifth, ChordKind::Augmented)
            };

        let root_strength = chroma[root];
        let triad = root_strength + third_strength + fifth_strength;
        let confidence = if total > MIN_CHROMA_ENERGY {
            (triad / total / CLEAN_TRIAD_SHARE).clamp(0.0, 1.0)
        } else {
            0.0
        };
        if total <= MIN_CHROMA_ENERGY || confidence < MIN_CHORD_CONFIDENCE {
            kind = ChordKind::None;
        }

        Self {
            root: root as u8,
            kind,
            confidence,
            root_strength,
            third_strength,
            fifth_strength,
        }
    }
}

/// Smoothed analysis snapshot published once per hop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlBusFrame {
    pub t: AudioTime,
    pub hop_seq: u32,
    pub rms: f32,
    pub flux: f32,
    /// This hop's clamped RMS, unsmoothed.
    pub fast_rms: f32,
    pub fast_flux: f32,
    pub bands: [f32; NUM_BANDS],
    /// Bands with extra-slow attack and release.
    pub heavy_bands: [f32; NUM_BANDS],
    pub chroma: [f32; NUM_CHROMA],
    pub waveform: [i16; WAVEFORM_POINTS],
    pub chord: ChordState,
    /// Fades to 0 after sustained silence, back to 1 when audio returns.
    pub silent_scale: f32,
    pub is_silent: bool,
}

impl Default for ControlBusFrame {
    fn default() -> Self {
        Self {
            t: AudioTime::default(),
            hop_seq: 0,
            rms: 0.0,
            flux: 0.0,
            fast_rms: 0.0,
            fast_flux: 0.0,
            bands: [0.0; NUM_BANDS],
            heavy_bands: [0.0; NUM_BANDS],
            chroma: [0.0; NUM_CHROMA],
            waveform: [0; WAVEFORM_POINTS],
            chord: ChordState::default(),
            silent_scale: 1.0,
            is_silent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SilenceTracker {
    since_us: Option<u64>,
    triggered: bool,
    scale: f32,
}

impl SilenceTracker {
    fn new() -> Self {
        Self {
            scale: 1.0,
            ..Self::default()
        }
    }

    fn update(&mut self, now_us: u64, level: f32, tuning: &AudioPipelineTuning) -> (f32, bool) {
        if tuning.silence_hysteresis_ms <= 0.0 {
            *self = Self::new();
            return (1.0, false);
        }

        if level.clamp(0.0, 1.0) < tuning.silence_threshold {
            if !self.triggered {
                let since = *self.since_us.get_or_insert(now_us);
                let elapsed_ms = now_us.saturating_sub(since) as f32 / 1000.0;
                if elapsed_ms >= tuning.silence_hysteresis_ms {
                    self.triggered = true;
                    tracing::debug!("silence detected");
                }
            }
        } else {
            self.since_us = None;
            self.triggered = false;
        }

        let target = if self.triggered { 0.0 } else { 1.0 };
        self.scale = target * 0.1 + self.scale * 0.9;
        (self.scale, self.triggered)
    }
}

/// Running count of single-frame spikes seen and replaced by the lookahead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpikeStats {
    pub detected_bands: u64,
    pub detected_chroma: u64,
    pub corrected: u64,
}

/// Three-frame history that flattens single-frame reversals to the mean of
/// their neighbours. Output trails input by two frames and is zero until
/// the history is full.
#[derive(Debug, Clone, Copy)]
struct Lookahead<const N: usize> {
    history: [[f32; N]; LOOKAHEAD_FRAMES],
    newest: usize,
    filled: usize,
}

impl<const N: usize> Lookahead<N> {
    fn new() -> Self {
        Self {
            history: [[0.0; N]; LOOKAHEAD_FRAMES],
            newest: 0,
            filled: 0,
        }
    }

    /// Pushes `input`, despikes in place and returns `(detected, corrected)`.
    fn process(&mut self, values: &mut [f32; N]) -> (u64, u64) {
        let newest = self.newest;
        let middle = (newest + LOOKAHEAD_FRAMES - 1) % LOOKAHEAD_FRAMES;
        let oldest = (newest + LOOKAHEAD_FRAMES - 2) % LOOKAHEAD_FRAMES;
        self.history[newest] = *values;
        self.newest = (newest + 1) % LOOKAHEAD_FRAMES;

        if self.filled < LOOKAHEAD_FRAMES {
            self.filled += 1;
            *values = [0.0; N];
            return (0, 0);
        }

        let (mut detected, mut corrected) = (0, 0);
        for i in 0..N {
            let old = self.history[oldest][i];
            let mid = self.history[middle][i];
            let new = self.history[newest][i];
            if old.max(mid).max(new) < SPIKE_NOISE_FLOOR {
                continue;
            }
            if (mid > old) == (new > mid) {
                continue;
            }
            detected += 1;
            let expected = (old + new) * 0.5;
            let threshold = (expected * SPIKE_RELATIVE_DEVIATION).max(SPIKE_MIN_DEVIATION);
            if (mid - expected).abs() > threshold {
                self.history[middle][i] = expected;
                corrected += 1;
            }
        }
        *values = self.history[oldest];
        (detected, corrected)
    }
}

/// Per-zone peak followers; each zone is normalised by its own running peak
/// so loud bass cannot flatten everything above it.
#[derive(Debug, Clone, Copy)]
struct ZoneAgc {
    followers: [f32; NUM_ZONES],
}

impl ZoneAgc {
    fn new() -> Self {
        Self {
            followers: [1.0; NUM_ZONES],
        }
    }

    fn normalize(&mut self, values: &mut [f32], attack: f32, release: f32, min_floor: f32) {
        let width = values.len() / NUM_ZONES;
        for (zone, follower) in values.chunks_mut(width).zip(&mut self.followers) {
            let peak = zone.iter().copied().fold(0.0, f32::max);
            *follower = follow(*follower, peak, attack, release).max(min_floor);
            for value in zone {
                *value = (*value / *follower).clamp(0.0, 1.0);
            }
        }
    }
}

/// One-pole smoothing of every analysis output, published through a
/// [`SnapshotBuffer`].
///
/// Bands and chroma pass clamp, optional despike and optional zone AGC
/// before the attack/release followers.
#[derive(Debug)]
pub struct ControlBus {
    frame: ControlBusFrame,
    silence: SilenceTracker,
    band_lookahead: Lookahead<NUM_BANDS>,
    chroma_lookahead: Lookahead<NUM_CHROMA>,
    band_zones: ZoneAgc,
    chroma_zones: ZoneAgc,
    spikes: SpikeStats,
    writer: SnapshotWriter<ControlBusFrame>,
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBus {
    pub fn new() -> Self {
        let (writer, _) = SnapshotBuffer::new(ControlBusFrame::default()).split();
        Self {
            frame: ControlBusFrame::default(),
            silence: SilenceTracker::new(),
            band_lookahead: Lookahead::new(),
            chroma_lookahead: Lookahead::new(),
            band_zones: ZoneAgc::new(),
            chroma_zones: ZoneAgc::new(),
            spikes: SpikeStats::default(),
            writer,
        }
    }

    pub fn reader(&self) -> SnapshotReader<ControlBusFrame> {
        self.writer.reader()
    }

    /// Last frame built, as published.
    pub fn frame(&self) -> &ControlBusFrame {
        &self.frame
    }

    pub fn spike_stats(&self) -> SpikeStats {
        self.spikes
    }

    /// Clears the smoothing state. `hop_seq` keeps counting so readers never
    /// see it go backwards.
    pub fn reset(&mut self) {
        self.frame = ControlBusFrame {
            t: self.frame.t,
            hop_seq: self.frame.hop_seq,
            ..ControlBusFrame::default()
        };
        self.silence = SilenceTracker::new();
        self.band_lookahead = Lookahead::new();
        self.chroma_lookahead = Lookahead::new();
        self.band_zones = ZoneAgc::new();
        self.chroma_zones = ZoneAgc::new();
        self.spikes = SpikeStats::default();
    }

    /// Smooths one hop of raw input into the frame and publishes it.
    pub fn update_from_hop(
        &mut self,
        now: AudioTime,
        raw: &ControlBusRawInput,
        tuning: &AudioPipelineTuning,
    ) -> &ControlBusFrame {
        let mut bands = raw.bands.map(|v| v.clamp(0.0, 1.0));
        let mut chroma = raw.chroma.map(|v| v.clamp(0.0, 1.0));
        self.despike(&mut bands, &mut chroma, tuning.lookahead_enabled);
        if tuning.zone_agc_enabled {
            self.band_zones.normalize(
                &mut bands,
                tuning.zone_agc_attack,
                tuning.zone_agc_release,
                tuning.zone_min_floor,
            );
        }
        if tuning.chroma_zone_agc_enabled {
            self.chroma_zones.normalize(
                &mut chroma,
                tuning.chroma_zone_agc_attack,
                tuning.chroma_zone_agc_release,
                tuning.zone_min_floor,
            );
        }

        let f = &mut self.frame;
        f.t = now;
        f.hop_seq = f.hop_seq.wrapping_add(1);

        f.fast_rms = raw.rms.clamp(0.0, 1.0);
        f.rms = lerp(f.rms, f.fast_rms, tuning.control_bus_alpha_fast);
        f.fast_flux = raw.flux.clamp(0.0, 1.0);
        f.flux = lerp(f.flux, f.fast_flux, tuning.control_bus_alpha_slow);

        for i in 0..NUM_BANDS {
            let target = bands[i];
            f.bands[i] = follow(f.bands[i], target, tuning.band_attack, tuning.band_release);
            f.heavy_bands[i] = follow(
                f.heavy_bands[i],
                target,
                tuning.heavy_band_attack,
                tuning.heavy_band_release,
            );
        }
        for i in 0..NUM_CHROMA {
            let target = chroma[i];
            f.chroma[i] = follow(f.chroma[i], target, tuning.band_attack, tuning.band_release);
        }
        f.chord = ChordState::detect(&f.chroma);
        f.waveform = raw.waveform;

        (f.silent_scale, f.is_silent) = self.silence.update(now.monotonic_us, raw.rms_ungated, tuning);

        self.writer.publish(self.frame);
        &self.frame
    }

    fn despike(&mut self, bands: &mut [f32; NUM_BANDS], chroma: &mut [f32; NUM_CHROMA], enabled: bool) {
        if !enabled {
            if self.band_lookahead.filled > 0 {
                self.band_lookahead = Lookahead::new();
                self.chroma_lookahead = Lookahead::new();
            }
            return;
        }
        let (band_hits, band_fixes) = self.band_lookahead.process(bands);
        let (chroma_hits, chroma_fixes) = self.chroma_lookahead.process(chroma);
        self.spikes.detected_bands += band_hits;
        self.spikes.detected_chroma += chroma_hits;
        self.spikes.corrected += band_fixes + chroma_fixes;
        if band_fixes + chroma_fixes > 0 {
            tracing::trace!(bands = band_fixes, chroma = chroma_fixes, "spikes replaced");
        }
    }
}

fn lerp(from: f32, to: f32, alpha: f32) -> f32 {
    from + (to - from) * alpha
}

/// Asymmetric follower: `attack` when rising, `release` when falling.
fn follow(current: f32, target: f32, attack: f32, release: f32) -> f32 {
    let alpha = if target > current { attack } else { release };
    lerp(current, target, alpha)
}
