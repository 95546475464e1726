//! Boundary to the sample producer.
//!
//! The hardware capture driver lives outside this crate; the pipeline only
//! sees [`CaptureSource`]. [`SyntheticSource`] implements it with generated
//! signals so the pipeline can be driven deterministically.

use std::collections::VecDeque;
use std::f32::consts::TAU;

/// Failure modes reported by a capture driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture driver not initialised")]
    NotInitialized,
    #[error("DMA read timed out")]
    DmaTimeout,
    #[error("capture read error")]
    ReadError,
    #[error("capture buffer overflow")]
    BufferOverflow,
}

impl CaptureError {
    /// Only an uninitialised driver stops the pipeline; everything else skips
    /// one hop.
    pub fn is_fatal(self) -> bool {
        matches!(self, CaptureError::NotInitialized)
    }
}

/// Producer of fixed-size hops of signed 16-bit samples.
pub trait CaptureSource: Send {
    /// Fills `hop` with the next block of samples. May block for up to one
    /// hop period.
    fn capture_hop(&mut self, hop: &mut [i16]) -> Result<(), CaptureError>;
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn capture_hop(&mut self, hop: &mut [i16]) -> Result<(), CaptureError> {
        (**self).capture_hop(hop)
    }
}

/// Converts dBFS to a linear peak amplitude in sample units.
pub fn dbfs_to_amplitude(dbfs: f32) -> f32 {
    32767.0 * 10f32.powf(dbfs / 20.0)
}

/// One piece of a synthetic programme.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    /// Sine at `freq_hz`, peak level in dBFS.
    Tone { freq_hz: f32, dbfs: f32 },
    /// Decaying noise bursts on every beat at `bpm`, over an optional bed of
    /// low-level noise. Accented bursts every `accent_every` beats.
    Clicks {
        bpm: f32,
        dbfs: f32,
        bed_dbfs: Option<f32>,
        accent_every: u32,
    },
    /// White noise at a peak level in dBFS.
    Noise { dbfs: f32 },
    /// Constant offset, for exercising DC removal.
    Dc { level: i16 },
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    signal: Signal,
    remaining: Option<u64>,
}

/// Deterministic [`CaptureSource`] built from a queue of [`Signal`] segments.
///
/// When the queue runs out the last segment repeats forever. Errors can be
/// injected to exercise the pipeline's capture failure handling.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    sample_rate_hz: u32,
    segments: VecDeque<Segment>,
    current: Segment,
    position: u64,
    segment_position: u64,
    rng: u32,
    pending_errors: VecDeque<CaptureError>,
}

impl SyntheticSource {
    pub fn new(sample_rate_hz: u32, signal: Signal) -> Self {
        Self {
            sample_rate_hz: sample_rate_hz.max(1),
            segments: VecDeque::new(),
            current: Segment {
                signal,
                remaining: None,
            },
            position: 0,
            segment_position: 0,
            rng: 0x9E37_79B9,
            pending_errors: VecDeque::new(),
        }
    }

    pub fn silence(sample_rate_hz: u32) -> Self {
        Self::new(sample_rate_hz, Signal::Silence)
    }

    /// Plays each `(signal, seconds)` pair in order; the last one repeats.
    pub fn scripted(sample_rate_hz: u32, script: &[(Signal, f32)]) -> Self {
        let mut source = Self::silence(sample_rate_hz);
        source.segments.clear();
        for (signal, seconds) in script {
            let samples = (seconds * sample_rate_hz as f32).round().max(0.0) as u64;
            source.segments.push_back(Segment {
                signal: *signal,
                remaining: Some(samples),
            });
        }
        if let Some(first) = source.segments.pop_front() {
            source.current = first;
        }
        source
    }

    pub fn then(mut self, signal: Signal, seconds: f32) -> Self {
        let samples = (seconds * self.sample_rate_hz as f32).round().max(0.0) as u64;
        self.segments.push_back(Segment {
            signal,
            remaining: Some(samples),
        });
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.rng = seed.max(1);
        self
    }

    /// Queues an error to be returned by the next `capture_hop` call instead
    /// of samples.
    pub fn inject_error(&mut self, error: CaptureError) {
        self.pending_errors.push_back(error);
    }

    /// Samples generated so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn advance_segment(&mut self) {
        while self.current.remaining == Some(0) {
            match self.segments.pop_front() {
                Some(next) => {
                    self.current = next;
                    self.segment_position = 0;
                }
                None => self.current.remaining = None,
            }
        }
    }

    fn next_noise(&mut self) -> f32 {
        // xorshift32
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }

    fn next_sample(&mut self) -> i16 {
        self.advance_segment();
        let sr = self.sample_rate_hz as f32;
        let t = self.segment_position as f32 / sr;
        let value = match self.current.signal {
            Signal::Silence => 0.0,
            Signal::Tone { freq_hz, dbfs } => {
                let phase = (self.position as f64 * freq_hz as f64 / sr as f64).fract() as f32;
                dbfs_to_amplitude(dbfs) * (TAU * phase).sin()
            }
            Signal::Clicks {
                bpm,
                dbfs,
                bed_dbfs,
                accent_every,
            } => {
                let period = 60.0 / bpm.max(1.0);
                let beat = (t / period).floor();
                let since = t - beat * period;
                let accent = accent_every > 0 && (beat as u32) % accent_every == 0;
                let level = if accent { dbfs + 4.0 } else { dbfs };
                let envelope = (-since / 0.015).exp();
                let noise = self.next_noise();
                let burst = if since < 0.08 {
                    dbfs_to_amplitude(level) * envelope * noise
                } else {
                    0.0
                };
                let bed = bed_dbfs
                    .map(|db| dbfs_to_amplitude(db) * self.next_noise())
                    .unwrap_or(0.0);
                burst + bed
            }
            Signal::Noise { dbfs } => dbfs_to_amplitude(dbfs) * self.next_noise(),
            Signal::Dc { level } => level as f32,
        };

        self.position += 1;
        self.segment_position += 1;
        if let Some(remaining) = self.current.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        value.round().clamp(-32768.0, 32767.0) as i16
    }
}

impl CaptureSource for SyntheticSource {
    fn capture_hop(&mut self, hop: &mut [i16]) -> Result<(), CaptureError> {
        if let Some(error) = self.pending_errors.pop_front() {
            return Err(error);
        }
        for sample in hop.iter_mut() {
            *sample = self.next_sample();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(samples: &[i16]) -> f32 {
        let sum: f64 = samples.iter().map(|s| (*s as f64).powi(2)).sum();
        ((sum / samples.len() as f64).sqrt() / 32768.0) as f32
    }

    #[test]
    fn tone_has_expected_level() {
        let mut source = SyntheticSource::new(16_000, Signal::Tone { freq_hz: 1000.0, dbfs: -20.0 });
        let mut hop = [0_i16; 1600];
        source.capture_hop(&mut hop).unwrap();
        // Sine RMS is peak / sqrt(2).
        assert!((rms(&hop) - 0.1 / 2f32.sqrt()).abs() < 0.002);
    }

    #[test]
    fn scripted_segments_play_in_order() {
        let mut source = SyntheticSource::scripted(
            1000,
            &[(Signal::Silence, 0.1), (Signal::Dc { level: 500 }, 0.1)],
        );
        let mut hop = [0_i16; 100];
        source.capture_hop(&mut hop).unwrap();
        assert!(hop.iter().all(|s| *s == 0));
        source.capture_hop(&mut hop).unwrap();
        assert!(hop.iter().all(|s| *s == 500));
        // Last segment repeats.
        source.capture_hop(&mut hop).unwrap();
        assert!(hop.iter().all(|s| *s == 500));
        assert_eq!(source.position(), 300);
    }

    #[test]
    fn injected_errors_come_first() {
        let mut source = SyntheticSource::silence(16_000);
        source.inject_error(CaptureError::DmaTimeout);
        let mut hop = [1_i16; 8];
        assert_eq!(source.capture_hop(&mut hop), Err(CaptureError::DmaTimeout));
        assert_eq!(hop, [1; 8]);
        assert!(source.capture_hop(&mut hop).is_ok());
        assert!(!CaptureError::DmaTimeout.is_fatal());
        assert!(CaptureError::NotInitialized.is_fatal());
    }

    #[test]
    fn clicks_are_periodic() {
        let mut source = SyntheticSource::new(
            16_000,
            Signal::Clicks {
                bpm: 120.0,
                dbfs: -10.0,
                bed_dbfs: None,
                accent_every: 0,
            },
        );
        let mut block = vec![0_i16; 8000];
        source.capture_hop(&mut block).unwrap();
        assert!(rms(&block[..800]) > 0.01);
        assert!(rms(&block[2000..7000]) < 1e-4);
    }
}
