//! Per-hop sample conditioning: DC removal, automatic gain control and the
//! noise-floor gate.

use serde::{Deserialize, Serialize};

use crate::analysis::map_level_db;
use crate::AudioPipelineTuning;

pub const WAVEFORM_POINTS: usize = 128;

/// Diagnostic snapshot of the front end, published once per hop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioDspState {
    /// Post-gain RMS of the centred hop, linear in [0, 1].
    pub rms_raw: f32,
    pub rms_mapped: f32,
    /// Pre-gain RMS of the DC-removed hop, linear in [0, 1].
    pub rms_pre_gain: f32,
    pub flux_mapped: f32,
    pub agc_gain: f32,
    pub dc_estimate: f32,
    pub noise_floor: f32,
    pub activity: f32,
    pub min_sample: i16,
    pub max_sample: i16,
    pub peak_centered: i16,
    pub mean_sample: f32,
    pub clip_count: u16,
}

impl Default for AudioDspState {
    fn default() -> Self {
        Self {
            rms_raw: 0.0,
            rms_mapped: 0.0,
            rms_pre_gain: 0.0,
            flux_mapped: 0.0,
            agc_gain: 1.0,
            dc_estimate: 0.0,
            noise_floor: 0.0,
            activity: 0.0,
            min_sample: 0,
            max_sample: 0,
            peak_centered: 0,
            mean_sample: 0.0,
            clip_count: 0,
        }
    }
}

/// Level measurements for one processed hop.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HopLevels {
    pub rms_pre_gain: f32,
    pub rms_raw: f32,
    /// dB-mapped post-gain RMS, already scaled by `activity`.
    pub rms_mapped: f32,
    /// Gate opening in [0, 1]; everything downstream is scaled by it.
    pub activity: f32,
    /// Gain applied to this hop's samples.
    pub applied_gain: f32,
    /// Gain after this hop's control update, used for the next hop.
    pub agc_gain: f32,
    pub noise_floor: f32,
    pub gate_start: f32,
    pub clip_count: u16,
}

/// DC/AGC/gate stage. Owns a centred copy of the most recent hop; samples
/// past `hop_size` are ignored so the copy never reallocates.
#[derive(Debug, Clone)]
pub struct SampleFrontEnd {
    hop_size: usize,
    dc_estimate: f32,
    agc_gain: f32,
    noise_floor: f32,
    centered: Vec<i16>,
    state: AudioDspState,
}

impl SampleFrontEnd {
    pub fn new(hop_size: usize, tuning: &AudioPipelineTuning) -> Self {
        Self {
            hop_size,
            dc_estimate: 0.0,
            agc_gain: 1.0,
            noise_floor: tuning.noise_floor_min,
            centered: Vec::with_capacity(hop_size),
            state: AudioDspState {
                noise_floor: tuning.noise_floor_min,
                ..AudioDspState::default()
            },
        }
    }

    pub fn reset(&mut self, tuning: &AudioPipelineTuning) {
        self.dc_estimate = 0.0;
        self.agc_gain = 1.0;
        self.noise_floor = tuning.noise_floor_min;
        self.centered.clear();
        self.state = AudioDspState {
            noise_floor: self.noise_floor,
            ..AudioDspState::default()
        };
    }

    pub fn agc_gain(&self) -> f32 {
        self.agc_gain
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// DC-removed, gain-corrected, clipped samples of the last hop.
    pub fn centered(&self) -> &[i16] {
        &self.centered
    }

    /// Diagnostics of the last hop. `flux_mapped` is filled in by the caller.
    pub fn dsp_state(&self) -> AudioDspState {
        self.state
    }

    pub fn set_flux(&mut self, flux: f32) {
        self.state.flux_mapped = flux;
    }

    /// Runs one hop through DC removal, gain and the gate, then updates the
    /// noise floor and AGC for the next hop.
    pub fn process(&mut self, hop: &[i16], tuning: &AudioPipelineTuning) -> HopLevels {
        self.centered.clear();
        let hop = &hop[..hop.len().min(self.hop_size)];
        if hop.is_empty() {
            return HopLevels {
                applied_gain: self.agc_gain,
                agc_gain: self.agc_gain,
                noise_floor: self.noise_floor,
                ..HopLevels::default()
            };
        }

        let applied_gain = self.agc_gain;
        let mut sum_raw = 0_i64;
        let mut sum_sq_pre = 0_i64;
        let mut clip_count = 0_u16;
        let mut min_c = i32::from(i16::MAX);
        let mut max_c = i32::from(i16::MIN);
        let mut peak_c = 0_i32;

        for &sample in hop {
            sum_raw += i64::from(sample);
            let x = f32::from(sample);
            self.dc_estimate += tuning.dc_alpha * (x - self.dc_estimate);
            let dc_removed = x - self.dc_estimate;

            let pre = (dc_removed.round() as i32).clamp(-32768, 32767);
            sum_sq_pre += i64::from(pre) * i64::from(pre);

            let gained = (dc_removed * applied_gain).round() as i32;
            let clipped = gained.clamp(-32768, 32767);
            if clipped != gained {
                clip_count = clip_count.saturating_add(1);
            }
            self.centered.push(clipped as i16);
            min_c = min_c.min(clipped);
            max_c = max_c.max(clipped);
            peak_c = peak_c.max(clipped.abs().min(32767));
        }

        let n = hop.len() as f32;
        let rms_pre_gain = ((sum_sq_pre as f32 / n).sqrt() / 32768.0).min(1.0);

        let floor_min = tuning.noise_floor_min;
        self.noise_floor = self.noise_floor.max(floor_min);
        let rate = if rms_pre_gain < self.noise_floor {
            tuning.noise_floor_fall
        } else {
            tuning.noise_floor_rise
        };
        self.noise_floor += rate * (rms_pre_gain - self.noise_floor);
        self.noise_floor = self.noise_floor.max(floor_min);

        let gate_start = self.noise_floor * tuning.gate_start_factor;
        let gate_range = tuning
            .gate_range_min
            .max(self.noise_floor * tuning.gate_range_factor);
        let activity = if gate_range > 0.0 {
            ((rms_pre_gain - gate_start) / gate_range).clamp(0.0, 1.0)
        } else if rms_pre_gain > gate_start {
            1.0
        } else {
            0.0
        };

        if clip_count > 0 {
            self.agc_gain *= tuning.agc_clip_reduce;
        } else if rms_pre_gain <= gate_start {
            self.agc_gain += tuning.agc_idle_return_rate * (1.0 - self.agc_gain);
        } else {
            let desired = (tuning.agc_target_rms / (rms_pre_gain + 1e-6))
                .clamp(tuning.agc_min_gain, tuning.agc_max_gain);
            let rate = if desired > self.agc_gain {
                tuning.agc_attack
            } else {
                tuning.agc_release
            };
            self.agc_gain += rate * (desired - self.agc_gain);
        }
        self.agc_gain = self.agc_gain.clamp(tuning.agc_min_gain, tuning.agc_max_gain);

        let rms_raw = rms_i16(&self.centered);
        let rms_mapped = map_level_db(rms_raw, tuning.rms_db_floor, tuning.rms_db_ceil) * activity;

        self.state = AudioDspState {
            rms_raw,
            rms_mapped,
            rms_pre_gain,
            flux_mapped: self.state.flux_mapped,
            agc_gain: self.agc_gain,
            dc_estimate: self.dc_estimate,
            noise_floor: self.noise_floor,
            activity,
            min_sample: min_c as i16,
            max_sample: max_c as i16,
            peak_centered: peak_c as i16,
            mean_sample: sum_raw as f32 / n,
            clip_count,
        };

        HopLevels {
            rms_pre_gain,
            rms_raw,
            rms_mapped,
            activity,
            applied_gain,
            agc_gain: self.agc_gain,
            noise_floor: self.noise_floor,
            gate_start,
            clip_count,
        }
    }

    /// Downsamples the centred hop to display points, keeping the signed
    /// sample with the largest magnitude in each group, scaled by `activity`.
    pub fn waveform(&self, activity: f32, out: &mut [i16; WAVEFORM_POINTS]) {
        out.fill(0);
        let per_point = (self.centered.len() / WAVEFORM_POINTS).max(1);
        for (point, chunk) in out.iter_mut().zip(self.centered.chunks(per_point)) {
            let peak = chunk
                .iter()
                .copied()
                .max_by_key(|s| i32::from(*s).abs())
                .unwrap_or(0);
            *point = if activity < 1.0 {
                (f32::from(peak) * activity).round() as i16
            } else {
                peak
            };
        }
    }
}

/// RMS of signed 16-bit samples, normalised to [0, 1].
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| f64::from(*s).powi(2)).sum();
    ((sum / samples.len() as f64).sqrt() / 32768.0).min(1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSource, Signal, SyntheticSource};

    fn run(front: &mut SampleFrontEnd, source: &mut SyntheticSource, hops: usize) -> HopLevels {
        let tuning = AudioPipelineTuning::default();
        let mut hop = [0_i16; 128];
        let mut levels = HopLevels::default();
        for _ in 0..hops {
            source.capture_hop(&mut hop).unwrap();
            levels = front.process(&hop, &tuning);
        }
        levels
    }

    #[test]
    fn removes_dc_offset() {
        let tuning = AudioPipelineTuning::default();
        let mut front = SampleFrontEnd::new(128, &tuning);
        let mut source = SyntheticSource::new(16_000, Signal::Dc { level: 2000 });
        // Time constant is 1000 samples; give it ~10 of them.
        let levels = run(&mut front, &mut source, 80);
        assert!(front.dsp_state().dc_estimate > 1990.0);
        assert!(levels.rms_pre_gain < 0.001);
        assert!((front.dsp_state().mean_sample - 2000.0).abs() < f32::EPSILON);
    }

    #[test]
    fn silence_keeps_gate_closed_and_gain_at_unity() {
        let tuning = AudioPipelineTuning::default();
        let mut front = SampleFrontEnd::new(128, &tuning);
        let mut source = SyntheticSource::silence(16_000);
        let levels = run(&mut front, &mut source, 50);
        assert_eq!(levels.activity, 0.0);
        assert_eq!(levels.rms_mapped, 0.0);
        assert_eq!(levels.agc_gain, 1.0);
        assert_eq!(front.noise_floor(), tuning.noise_floor_min);
    }

    #[test]
    fn gain_rises_toward_target_for_quiet_tone() {
        let tuning = AudioPipelineTuning::default();
        let mut front = SampleFrontEnd::new(128, &tuning);
        let mut source = SyntheticSource::new(16_000, Signal::Tone { freq_hz: 1000.0, dbfs: -20.0 });
        let levels = run(&mut front, &mut source, 250);
        let expected = tuning.agc_target_rms / (0.1 / 2f32.sqrt());
        assert!((levels.agc_gain - expected).abs() / expected < 0.05, "gain {}", levels.agc_gain);
        assert_eq!(levels.activity, 1.0);
        assert_eq!(levels.clip_count, 0);
    }

    #[test]
    fn clipping_pulls_gain_down() {
        let tuning = AudioPipelineTuning::default();
        let mut front = SampleFrontEnd::new(128, &tuning);
        front.agc_gain = 20.0;
        let hop: Vec<i16> = (0..128).map(|i| if i % 2 == 0 { 20_000 } else { -20_000 }).collect();
        let levels = front.process(&hop, &tuning);
        assert!(levels.clip_count > 0);
        assert!((levels.agc_gain - 18.0).abs() < 1e-3);
        assert!(front.centered().iter().all(|s| s.unsigned_abs() >= 32767));
    }

    #[test]
    fn oversized_hop_is_cut_to_hop_size() {
        let tuning = AudioPipelineTuning::default();
        let mut front = SampleFrontEnd::new(128, &tuning);
        let capacity = front.centered.capacity();
        let hop: Vec<i16> = (0..256).map(|i| if i < 128 { 100 } else { 30_000 }).collect();
        let levels = front.process(&hop, &tuning);
        assert_eq!(front.centered().len(), 128);
        assert_eq!(front.centered.capacity(), capacity);
        assert_eq!(levels.clip_count, 0);
        assert_eq!(front.dsp_state().mean_sample, 100.0);
    }

    #[test]
    fn waveform_keeps_signed_peaks() {
        let tuning = AudioPipelineTuning::default();
        let mut front = SampleFrontEnd::new(256, &tuning);
        front.centered = (0..256)
            .map(|i| if i % 2 == 0 { 10 } else { -(i as i16) })
            .collect();
        let mut out = [0_i16; WAVEFORM_POINTS];
        front.waveform(1.0, &mut out);
        assert_eq!(out[0], 10);
        assert_eq!(out[10], -21);

        front.waveform(0.5, &mut out);
        assert_eq!(out[10], -11);
    }
}
