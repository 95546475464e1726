use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::config::{NUM_BANDS, NUM_CHROMA};
use crate::{AudioConfig, AudioPipelineTuning, Result, SpectralMode};

/// Centre frequencies of the 8 Goertzel bands.
pub const BAND_CENTERS_HZ: [f32; NUM_BANDS] =
    [60.0, 120.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 7800.0];

/// Bass-heavy weighting used by the spectral flux so kicks dominate and
/// treble transients contribute less.
pub const PERCEPTUAL_BAND_WEIGHTS: [f32; NUM_BANDS] = [1.4, 1.3, 1.0, 0.9, 0.8, 0.6, 0.4, 0.3];
const PERCEPTUAL_BAND_WEIGHT_SUM: f32 = 6.7;
/// Decreases count toward flux at a reduced weight so AGC wobble does not
/// read as onsets.
const NEGATIVE_FLUX_WEIGHT: f32 = 0.6;

const HIRES_BINS: usize = 64;
const HIRES_LOW_HZ: f32 = 55.0;
const HIRES_HIGH_HZ: f32 = 7800.0;

/// Lowest chroma note (C3) and the number of octaves summed per pitch class.
const CHROMA_BASE_HZ: f32 = 130.812_78;
const CHROMA_OCTAVES: usize = 4;

const DB_EPS: f32 = 1e-6;

/// Maps a linear magnitude to [0, 1] between `db_floor` and `db_ceil`.
pub fn map_level_db(x: f32, db_floor: f32, db_ceil: f32) -> f32 {
    if db_ceil <= db_floor + 1e-3 {
        return 0.0;
    }
    let db = 20.0 * (x.max(0.0) + DB_EPS).log10();
    ((db - db_floor) / (db_ceil - db_floor)).clamp(0.0, 1.0)
}

/// dB-maps raw band magnitudes and applies per-band gain and the optional
/// per-band floor gate. The result is not yet scaled by gate activity.
pub fn normalize_bands(raw: &[f32; NUM_BANDS], tuning: &AudioPipelineTuning) -> [f32; NUM_BANDS] {
    let mut out = [0.0; NUM_BANDS];
    for (i, value) in out.iter_mut().enumerate() {
        let mapped = map_level_db(raw[i], tuning.band_db_floor, tuning.band_db_ceil);
        let mut band = (mapped * tuning.per_band_gains[i]).min(1.0);
        if tuning.use_per_band_noise_floor && band < tuning.per_band_noise_floors[i] {
            band = 0.0;
        }
        *value = band;
    }
    out
}

pub fn normalize_chroma(raw: &[f32; NUM_CHROMA], tuning: &AudioPipelineTuning) -> [f32; NUM_CHROMA] {
    (*raw).map(|x| map_level_db(x, tuning.chroma_db_floor, tuning.chroma_db_ceil))
}

/// Perceptually weighted spectral flux between two band frames, in [0, 1].
pub fn band_flux(prev: &[f32; NUM_BANDS], current: &[f32; NUM_BANDS], flux_scale: f32) -> f32 {
    let mut flux = 0.0;
    for i in 0..NUM_BANDS {
        let delta = current[i] - prev[i];
        let weight = PERCEPTUAL_BAND_WEIGHTS[i];
        flux += if delta > 0.0 {
            delta * weight
        } else {
            -delta * NEGATIVE_FLUX_WEIGHT * weight
        };
    }
    (flux / PERCEPTUAL_BAND_WEIGHT_SUM * flux_scale).clamp(0.0, 1.0)
}

/// Ring of the most recent `size` samples, normalised to [-1, 1).
///
/// Reports a fresh window once it is full and then every `interval_hops`
/// pushes, so analysis can run slower than the hop rate.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    ring: Vec<f32>,
    write: usize,
    filled: usize,
    interval_hops: u32,
    hops_since_ready: u32,
}

impl SlidingWindow {
    pub fn new(size: usize, interval_hops: u32) -> Self {
        Self {
            ring: vec![0.0; size.max(1)],
            write: 0,
            filled: 0,
            interval_hops: interval_hops.max(1),
            hops_since_ready: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.write = 0;
        self.filled = 0;
        self.hops_since_ready = 0;
    }

    /// Appends one hop; returns true when a fresh window should be analysed.
    pub fn push(&mut self, hop: &[i16]) -> bool {
        let size = self.ring.len();
        for &sample in hop {
            self.ring[self.write] = f32::from(sample) / 32768.0;
            self.write = (self.write + 1) % size;
        }
        self.filled = (self.filled + hop.len()).min(size);
        self.hops_since_ready = self.hops_since_ready.saturating_add(1);

        if self.filled < size || self.hops_since_ready < self.interval_hops {
            return false;
        }
        self.hops_since_ready = 0;
        true
    }

    /// Copies the window oldest-first into `out`, multiplied by `taper`.
    fn copy_tapered(&self, taper: &[f32], out: &mut [f32]) {
        let size = self.ring.len();
        for (i, (dst, w)) in out.iter_mut().zip(taper).enumerate() {
            *dst = self.ring[(self.write + i) % size] * w;
        }
    }
}

/// Band energy estimator over a sliding window.
///
/// [`analyze_hop`](Self::analyze_hop) returns `None` on hops where no fresh
/// window is ready; callers keep their previous values.
pub struct SpectralAnalyzer {
    mode: SpectralMode,
    window: SlidingWindow,
    hann: Vec<f32>,
    tapered: Vec<f32>,
    coefficients: [f32; NUM_BANDS],
    fft: Option<FftResources>,
    hires: [f32; HIRES_BINS],
}

impl SpectralAnalyzer {
    pub fn new(config: &AudioConfig) -> Self {
        let size = config.window_size.max(2);
        let fft = match config.spectral_mode {
            SpectralMode::Goertzel8 => None,
            SpectralMode::Fft64 => Some(FftResources::new(size, config.sample_rate_hz)),
        };
        Self {
            mode: config.spectral_mode,
            window: SlidingWindow::new(size, config.analysis_interval_hops),
            hann: hann_window(size),
            tapered: vec![0.0; size],
            coefficients: BAND_CENTERS_HZ
                .map(|freq| goertzel_coefficient(freq, config.sample_rate_hz)),
            fft,
            hires: [0.0; HIRES_BINS],
        }
    }

    pub fn mode(&self) -> SpectralMode {
        self.mode
    }

    pub fn reset(&mut self) {
        self.window.reset();
        self.hires = [0.0; HIRES_BINS];
    }

    /// Pushes one centred hop. When a fresh window is ready, returns linear
    /// band magnitudes where a full-scale sine at a band centre reads ~1.0.
    pub fn analyze_hop(&mut self, hop: &[i16]) -> Result<Option<[f32; NUM_BANDS]>> {
        if !self.window.push(hop) {
            return Ok(None);
        }
        self.window.copy_tapered(&self.hann, &mut self.tapered);
        let norm = amplitude_norm(self.tapered.len());

        let mut bands = [0.0; NUM_BANDS];
        match self.fft.as_mut() {
            None => {
                for (band, coeff) in bands.iter_mut().zip(self.coefficients) {
                    *band = (goertzel_magnitude(&self.tapered, coeff) * norm).min(1.0);
                }
            }
            Some(fft) => {
                fft.input.copy_from_slice(&self.tapered);
                fft.plan
                    .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;
                for (bin, (lo, hi)) in self.hires.iter_mut().zip(&fft.bin_ranges) {
                    let peak = fft.spectrum[*lo..=*hi]
                        .iter()
                        .map(|c| c.norm())
                        .fold(0.0_f32, f32::max);
                    *bin = (peak * norm).min(1.0);
                }
                let group = HIRES_BINS / NUM_BANDS;
                for (band, bins) in bands.iter_mut().zip(self.hires.chunks(group)) {
                    *band = bins.iter().copied().fold(0.0, f32::max);
                }
            }
        }
        Ok(Some(bands))
    }

    /// Latest 64-bin magnitudes. All zero unless running in `Fft64` mode.
    pub fn hires_bins(&self) -> &[f32; HIRES_BINS] {
        &self.hires
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("mode", &self.mode)
            .field("window", &self.window.len())
            .field("fft", &self.fft)
            .finish()
    }
}

/// Pitch-class energy over the same window cadence as the band analyzer.
#[derive(Debug, Clone)]
pub struct ChromaAnalyzer {
    window: SlidingWindow,
    hann: Vec<f32>,
    tapered: Vec<f32>,
    /// Goertzel coefficient per note, lowest octave first.
    coefficients: Vec<f32>,
}

impl ChromaAnalyzer {
    pub fn new(config: &AudioConfig) -> Self {
        let size = config.window_size.max(2);
        let coefficients = (0..NUM_CHROMA * CHROMA_OCTAVES)
            .map(|note| {
                let freq = CHROMA_BASE_HZ * 2f32.powf(note as f32 / 12.0);
                goertzel_coefficient(freq, config.sample_rate_hz)
            })
            .collect();
        Self {
            window: SlidingWindow::new(size, config.analysis_interval_hops),
            hann: hann_window(size),
            tapered: vec![0.0; size],
            coefficients,
        }
    }

    pub fn reset(&mut self) {
        self.window.reset();
    }

    /// Pushes one centred hop; returns summed per-pitch-class magnitudes
    /// when a fresh window is ready.
    pub fn analyze_hop(&mut self, hop: &[i16]) -> Option<[f32; NUM_CHROMA]> {
        if !self.window.push(hop) {
            return None;
        }
        self.window.copy_tapered(&self.hann, &mut self.tapered);
        let norm = amplitude_norm(self.tapered.len());

        let mut chroma = [0.0; NUM_CHROMA];
        for (note, coeff) in self.coefficients.iter().enumerate() {
            chroma[note % NUM_CHROMA] += goertzel_magnitude(&self.tapered, *coeff) * norm;
        }
        Some(chroma.map(|c| c.min(1.0)))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    /// Inclusive FFT bin range covered by each high-resolution bin.
    bin_ranges: Vec<(usize, usize)>,
}

impl FftResources {
    fn new(size: usize, sample_rate_hz: u32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();

        let resolution = sample_rate_hz.max(1) as f32 / size as f32;
        let last_bin = spectrum.len().saturating_sub(2).max(1);
        let ratio = (HIRES_HIGH_HZ / HIRES_LOW_HZ).powf(1.0 / (HIRES_BINS - 1) as f32);
        let half_step = ratio.sqrt();
        let to_bin = |hz: f32| ((hz / resolution).round() as usize).clamp(1, last_bin);
        let bin_ranges = (0..HIRES_BINS)
            .map(|b| {
                let centre = HIRES_LOW_HZ * ratio.powi(b as i32);
                let lo = to_bin(centre / half_step);
                let hi = to_bin(centre * half_step).max(lo);
                (lo, hi)
            })
            .collect();

        Self {
            size,
            plan,
            scratch,
            spectrum,
            input,
            bin_ranges,
        }
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn goertzel_coefficient(freq_hz: f32, sample_rate_hz: u32) -> f32 {
    let omega = 2.0 * PI * freq_hz / sample_rate_hz.max(1) as f32;
    2.0 * omega.cos()
}

fn goertzel_magnitude(samples: &[f32], coeff: f32) -> f32 {
    let mut s1 = 0.0_f32;
    let mut s2 = 0.0_f32;
    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0).sqrt()
}

/// Single-sided amplitude scale for a Hann-tapered window (coherent gain 0.5).
fn amplitude_norm(len: usize) -> f32 {
    4.0 / len.max(1) as f32
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len).map(|i| hann_value(i, len)).collect()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
