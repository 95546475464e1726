use serde::{Deserialize, Serialize};

/// Monotonic, sample-indexed point in time.
///
/// The sample index is the authority for "when" in both execution contexts.
/// `monotonic_us` is carried along so the render side can extrapolate between
/// published hops, but elapsed time is always derived from sample deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioTime {
    pub sample_index: u64,
    pub sample_rate_hz: u32,
    pub monotonic_us: u64,
}

impl AudioTime {
    pub const fn new(sample_index: u64, sample_rate_hz: u32, monotonic_us: u64) -> Self {
        Self {
            sample_index,
            sample_rate_hz,
            monotonic_us,
        }
    }

    /// Signed sample distance from `self` to `later`.
    pub fn samples_until(&self, later: &AudioTime) -> i64 {
        later.sample_index as i64 - self.sample_index as i64
    }

    /// Signed seconds from `self` to `later`, using `self`'s sample rate.
    pub fn seconds_until(&self, later: &AudioTime) -> f32 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.samples_until(later) as f32 / self.sample_rate_hz as f32
    }

    /// Returns a copy shifted by `delta` samples. The sample index saturates
    /// at zero and the monotonic stamp is moved by the equivalent duration.
    pub fn offset_samples(&self, delta: i64) -> AudioTime {
        let sample_index = if delta >= 0 {
            self.sample_index.saturating_add(delta as u64)
        } else {
            self.sample_index.saturating_sub(delta.unsigned_abs())
        };
        let delta_us = if self.sample_rate_hz == 0 {
            0
        } else {
            delta * 1_000_000 / self.sample_rate_hz as i64
        };
        let monotonic_us = if delta_us >= 0 {
            self.monotonic_us.saturating_add(delta_us as u64)
        } else {
            self.monotonic_us.saturating_sub(delta_us.unsigned_abs())
        };
        AudioTime {
            sample_index,
            sample_rate_hz: self.sample_rate_hz,
            monotonic_us,
        }
    }

    pub fn as_seconds(&self) -> f64 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.sample_index as f64 / self.sample_rate_hz as f64
    }
}

/// Render-side clock that turns the latest published [`AudioTime`] into a
/// "now" for the current frame.
///
/// Between hops the sample index is extrapolated from the monotonic clock,
/// capped at `max_extrapolation_us` so a stalled capture does not let the
/// render clock run away. The returned index never goes backwards.
#[derive(Debug, Clone)]
pub struct RenderClock {
    last: Option<AudioTime>,
    max_extrapolation_us: u64,
}

impl Default for RenderClock {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl RenderClock {
    pub fn new(max_extrapolation_us: u64) -> Self {
        Self {
            last: None,
            max_extrapolation_us,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Computes the render-domain time for a frame observed at `monotonic_us`.
    pub fn now(&mut self, anchor: AudioTime, monotonic_us: u64) -> AudioTime {
        let ahead_us = monotonic_us
            .saturating_sub(anchor.monotonic_us)
            .min(self.max_extrapolation_us);
        let ahead_samples = ahead_us * anchor.sample_rate_hz as u64 / 1_000_000;

        let mut now = AudioTime {
            sample_index: anchor.sample_index + ahead_samples,
            sample_rate_hz: anchor.sample_rate_hz,
            monotonic_us: monotonic_us.max(anchor.monotonic_us),
        };

        if let Some(last) = self.last {
            if now.sample_index < last.sample_index {
                now.sample_index = last.sample_index;
            }
            now.monotonic_us = now.monotonic_us.max(last.monotonic_us);
        }

        self.last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_follow_sample_delta() {
        let a = AudioTime::new(16_000, 16_000, 0);
        let b = AudioTime::new(24_000, 16_000, 999);
        assert_eq!(a.samples_until(&b), 8_000);
        assert!((a.seconds_until(&b) - 0.5).abs() < 1e-6);
        assert!((b.seconds_until(&a) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn offset_saturates_at_zero() {
        let t = AudioTime::new(100, 16_000, 10_000);
        let back = t.offset_samples(-256);
        assert_eq!(back.sample_index, 0);
        assert_eq!(back.monotonic_us, 0);

        let forward = t.offset_samples(160);
        assert_eq!(forward.sample_index, 260);
        assert_eq!(forward.monotonic_us, 20_000);
    }

    #[test]
    fn render_clock_extrapolates_and_never_regresses() {
        let mut clock = RenderClock::new(50_000);
        let anchor = AudioTime::new(1_000, 16_000, 1_000_000);

        let t1 = clock.now(anchor, 1_010_000);
        assert_eq!(t1.sample_index, 1_000 + 160);

        let capped = clock.now(anchor, 2_000_000);
        assert_eq!(capped.sample_index, 1_000 + 800);

        // A fresh anchor that lands behind the extrapolated value holds steady.
        let late = AudioTime::new(1_128, 16_000, 1_008_000);
        let t2 = clock.now(late, 1_008_000);
        assert_eq!(t2.sample_index, capped.sample_index);
    }
}
