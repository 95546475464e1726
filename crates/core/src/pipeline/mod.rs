//! Per-hop composition root for the capture/DSP context.
//!
//! [`AudioPipeline`] owns every audio-domain stage and runs them in order
//! once per captured hop. Control surfaces talk to it through a
//! [`ControlHandle`]; the renderer reads its output through snapshot readers.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::analysis::{band_flux, normalize_bands, normalize_chroma, ChromaAnalyzer, SpectralAnalyzer};
use crate::beat::{BeatDetector, BeatObsFrame};
use crate::calibration::{CalibrationStatus, NoiseCalibration};
use crate::capture::{CaptureError, CaptureSource};
use crate::config::{NUM_BANDS, NUM_CHROMA};
use crate::control_bus::{ControlBus, ControlBusFrame, ControlBusRawInput};
use crate::frontend::{AudioDspState, SampleFrontEnd, WAVEFORM_POINTS};
use crate::grid::{GridObserver, MusicalGrid};
use crate::sync::{SeqLock, SnapshotBuffer, SnapshotReader, SnapshotWriter};
use crate::{AppConfig, AudioConfig, AudioPipelineTuning, AudioTime, BeatlightError, Result};

/// Hops between periodic status lines, about ten seconds at 125 Hz.
const STATUS_LOG_EVERY: u64 = 1250;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Initializing,
    Running,
    Paused,
    /// A fatal capture error occurred; no further hops are processed.
    Error,
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub hops_processed: u64,
    pub analysis_frames: u64,
    pub beats_emitted: u64,
    pub capture_ok: u64,
    pub dma_timeouts: u64,
    pub read_errors: u64,
    pub buffer_overflows: u64,
    pub fatal_errors: u64,
    pub clipped_hops: u64,
}

impl PipelineStats {
    pub fn capture_failures(&self) -> u64 {
        self.dma_timeouts + self.read_errors + self.buffer_overflows + self.fatal_errors
    }

    fn record_capture_error(&mut self, error: CaptureError) {
        match error {
            CaptureError::NotInitialized => self.fatal_errors += 1,
            CaptureError::DmaTimeout => self.dma_timeouts += 1,
            CaptureError::ReadError => self.read_errors += 1,
            CaptureError::BufferOverflow => self.buffer_overflows += 1,
        }
    }
}

/// Result of one [`AudioPipeline::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Processed,
    /// Transient capture error; the hop was skipped.
    Skipped(CaptureError),
    Paused,
    /// The pipeline is in [`PipelineState::Error`].
    Halted,
}

/// Requests from control surfaces, applied at the start of the next hop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    StartCalibration { duration_ms: u32, safety_multiplier: f32 },
    CancelCalibration,
    ApplyCalibration,
    ResetDspState,
}

/// Thread-safe control surface onto a running [`AudioPipeline`].
///
/// Tuning and diagnostics are shared through sequence locks; everything that
/// mutates pipeline-owned state goes through a bounded command queue.
#[derive(Clone)]
pub struct ControlHandle {
    tuning: Arc<SeqLock<AudioPipelineTuning>>,
    dsp: Arc<SeqLock<AudioDspState>>,
    calibration: Arc<SeqLock<CalibrationStatus>>,
    commands: Sender<ControlCommand>,
}

impl ControlHandle {
    pub fn pipeline_tuning(&self) -> AudioPipelineTuning {
        self.tuning.read()
    }

    /// Stores `tuning` with every field clamped into range. Takes effect on
    /// the next hop.
    pub fn set_pipeline_tuning(&self, tuning: AudioPipelineTuning) {
        self.tuning.write(tuning.clamped());
    }

    pub fn dsp_state(&self) -> AudioDspState {
        self.dsp.read()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.calibration.read()
    }

    pub fn reset_dsp_state(&self) -> Result<()> {
        self.send(ControlCommand::ResetDspState)
    }

    pub fn start_noise_calibration(&self, duration_ms: u32, safety_multiplier: f32) -> Result<()> {
        self.send(ControlCommand::StartCalibration {
            duration_ms,
            safety_multiplier,
        })
    }

    pub fn cancel_noise_calibration(&self) -> Result<()> {
        self.send(ControlCommand::CancelCalibration)
    }

    pub fn apply_calibration_results(&self) -> Result<()> {
        self.send(ControlCommand::ApplyCalibration)
    }

    fn send(&self, command: ControlCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => BeatlightError::ControlChannelFull,
            TrySendError::Disconnected(_) => BeatlightError::ControlChannelClosed,
        })
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("tuning_version", &self.tuning.version())
            .field("pending_commands", &self.commands.len())
            .finish()
    }
}

/// Values held between analysis frames so outputs never drop to zero on
/// hops without a fresh window.
#[derive(Debug, Clone, Copy)]
struct HeldAnalysis {
    bands: [f32; NUM_BANDS],
    chroma: [f32; NUM_CHROMA],
    flux: f32,
    /// Mapped values before the floor gate and activity, for calibration.
    ungated_bands: [f32; NUM_BANDS],
    ungated_chroma: [f32; NUM_CHROMA],
}

impl Default for HeldAnalysis {
    fn default() -> Self {
        Self {
            bands: [0.0; NUM_BANDS],
            chroma: [0.0; NUM_CHROMA],
            flux: 0.0,
            ungated_bands: [0.0; NUM_BANDS],
            ungated_chroma: [0.0; NUM_CHROMA],
        }
    }
}

/// Audio-domain pipeline: front end, analyzers, beat detector, control bus
/// and noise calibration, run once per hop.
#[derive(Debug)]
pub struct AudioPipeline {
    audio: AudioConfig,
    state: PipelineState,
    stats: PipelineStats,
    sample_index: u64,
    hop: Vec<i16>,

    tuning: Arc<SeqLock<AudioPipelineTuning>>,
    dsp: Arc<SeqLock<AudioDspState>>,
    calibration_status: Arc<SeqLock<CalibrationStatus>>,
    command_tx: Sender<ControlCommand>,
    commands: Receiver<ControlCommand>,
    reset_pending: bool,

    frontend: SampleFrontEnd,
    spectral: SpectralAnalyzer,
    chroma: ChromaAnalyzer,
    detector: BeatDetector,
    control_bus: ControlBus,
    calibration: NoiseCalibration,
    held: HeldAnalysis,
    waveform: [i16; WAVEFORM_POINTS],
    beat_writer: SnapshotWriter<BeatObsFrame>,
}

impl AudioPipeline {
    /// Builds a pipeline that reports beats and tempo to the grid behind
    /// `observer`.
    pub fn new(config: &AppConfig, observer: GridObserver) -> Result<Self> {
        config.audio.validate()?;
        let audio = config.audio.clone();
        let tuning = config.pipeline.clamped();
        let lane_samples = (audio.hop_size * audio.analysis_interval_hops as usize) as u64;
        let (command_tx, commands) = crossbeam_channel::bounded(audio.control_queue_depth.max(1));
        let (beat_writer, _) = SnapshotBuffer::new(BeatObsFrame::default()).split();

        tracing::debug!(
            sample_rate_hz = audio.sample_rate_hz,
            hop_size = audio.hop_size,
            window_size = audio.window_size,
            mode = ?audio.spectral_mode,
            "audio pipeline created"
        );

        Ok(Self {
            state: PipelineState::Initializing,
            stats: PipelineStats::default(),
            sample_index: 0,
            hop: vec![0; audio.hop_size],
            tuning: Arc::new(SeqLock::new(tuning)),
            dsp: Arc::new(SeqLock::new(AudioDspState::default())),
            calibration_status: Arc::new(SeqLock::new(CalibrationStatus::default())),
            command_tx,
            commands,
            reset_pending: false,
            frontend: SampleFrontEnd::new(audio.hop_size, &tuning),
            spectral: SpectralAnalyzer::new(&audio),
            chroma: ChromaAnalyzer::new(&audio),
            detector: BeatDetector::new(config.detector, lane_samples, observer),
            control_bus: ControlBus::new(),
            calibration: NoiseCalibration::default(),
            held: HeldAnalysis::default(),
            waveform: [0; WAVEFORM_POINTS],
            beat_writer,
            audio,
        })
    }

    /// Builds a pipeline together with the grid it feeds.
    pub fn with_grid(config: &AppConfig) -> Result<(Self, MusicalGrid)> {
        let (grid, observer) = MusicalGrid::new(config.grid);
        Ok((Self::new(config, observer)?, grid))
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            tuning: Arc::clone(&self.tuning),
            dsp: Arc::clone(&self.dsp),
            calibration: Arc::clone(&self.calibration_status),
            commands: self.command_tx.clone(),
        }
    }

    pub fn control_bus_reader(&self) -> SnapshotReader<ControlBusFrame> {
        self.control_bus.reader()
    }

    pub fn beat_reader(&self) -> SnapshotReader<BeatObsFrame> {
        self.beat_writer.reader()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn config(&self) -> &AudioConfig {
        &self.audio
    }

    /// Time at the end of the last processed hop.
    pub fn now(&self) -> AudioTime {
        self.control_bus.frame().t
    }

    pub fn pause(&mut self) {
        if self.state != PipelineState::Error {
            self.state = PipelineState::Paused;
            tracing::info!("audio pipeline paused");
        }
    }

    pub fn resume(&mut self) {
        if self.state == PipelineState::Paused {
            self.state = PipelineState::Running;
            tracing::info!("audio pipeline resumed");
        }
    }

    /// Captures one hop from `source` and processes it. `monotonic_us` is the
    /// caller's monotonic clock at capture time.
    pub fn tick<S>(&mut self, source: &mut S, monotonic_us: u64) -> Result<TickOutcome>
    where
        S: CaptureSource + ?Sized,
    {
        match self.state {
            PipelineState::Error => return Ok(TickOutcome::Halted),
            PipelineState::Paused => return Ok(TickOutcome::Paused),
            PipelineState::Initializing | PipelineState::Running => {}
        }

        let mut hop = std::mem::take(&mut self.hop);
        let captured = source.capture_hop(&mut hop);
        let outcome = match captured {
            Ok(()) => {
                self.stats.capture_ok += 1;
                self.process_hop(&hop, monotonic_us).map(|()| TickOutcome::Processed)
            }
            Err(error) => {
                self.stats.record_capture_error(error);
                if error.is_fatal() {
                    tracing::error!(%error, "fatal capture error, halting audio pipeline");
                    self.state = PipelineState::Error;
                    Ok(TickOutcome::Halted)
                } else {
                    let failures = self.stats.capture_failures();
                    if failures.is_power_of_two() {
                        tracing::warn!(%error, failures, "capture error, skipping hop");
                    }
                    Ok(TickOutcome::Skipped(error))
                }
            }
        };
        self.hop = hop;
        outcome
    }

    /// Runs one already-captured hop through every stage and publishes the
    /// results.
    pub fn process_hop(&mut self, hop: &[i16], monotonic_us: u64) -> Result<()> {
        if self.state == PipelineState::Error {
            return Err(BeatlightError::PipelineHalted);
        }
        if self.state == PipelineState::Initializing {
            self.state = PipelineState::Running;
            tracing::info!("audio pipeline running");
        }

        self.drain_commands();
        let tuning = self.tuning.read();
        if self.reset_pending {
            self.reset_dsp(&tuning);
        }

        let levels = self.frontend.process(hop, &tuning);
        self.sample_index += hop.len() as u64;
        let now = AudioTime::new(self.sample_index, self.audio.sample_rate_hz, monotonic_us);
        if levels.clip_count > 0 {
            self.stats.clipped_hops += 1;
        }

        let centered = self.frontend.centered();
        let fresh_bands = self.spectral.analyze_hop(centered)?;
        let fresh_chroma = self.chroma.analyze_hop(centered);

        if let Some(raw) = fresh_bands {
            self.stats.analysis_frames += 1;
            let ungated = AudioPipelineTuning {
                use_per_band_noise_floor: false,
                ..tuning
            };
            self.held.ungated_bands = normalize_bands(&raw, &ungated);
            let bands = normalize_bands(&raw, &tuning).map(|b| b * levels.activity);
            self.held.flux = band_flux(&self.held.bands, &bands, tuning.flux_scale);
            self.held.bands = bands;

            let obs = self.detector.process(now, &self.held.bands, self.held.flux);
            if obs.beat_pulse {
                self.stats.beats_emitted += 1;
            }
            self.beat_writer.publish(obs);
        }
        if let Some(raw) = fresh_chroma {
            let chroma = normalize_chroma(&raw, &tuning);
            self.held.ungated_chroma = chroma;
            self.held.chroma = chroma.map(|c| c * levels.activity);
        }

        self.frontend.waveform(levels.activity, &mut self.waveform);
        self.frontend.set_flux(self.held.flux);
        self.dsp.write(self.frontend.dsp_state());

        self.update_calibration(now, levels.rms_pre_gain);

        let raw = ControlBusRawInput {
            rms: levels.rms_mapped,
            rms_ungated: levels.rms_pre_gain,
            flux: self.held.flux,
            bands: self.held.bands,
            chroma: self.held.chroma,
            waveform: self.waveform,
        };
        self.control_bus.update_from_hop(now, &raw, &tuning);

        self.stats.hops_processed += 1;
        if self.stats.hops_processed % STATUS_LOG_EVERY == 0 {
            tracing::debug!(
                hops = self.stats.hops_processed,
                gain = levels.agc_gain,
                noise_floor = levels.noise_floor,
                bpm = self.detector.bpm(),
                confidence = self.detector.confidence(),
                "audio pipeline status"
            );
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ControlCommand::StartCalibration {
                    duration_ms,
                    safety_multiplier,
                } => {
                    self.calibration.start(duration_ms, safety_multiplier);
                }
                ControlCommand::CancelCalibration => self.calibration.cancel(),
                ControlCommand::ApplyCalibration => {
                    let calibration = &self.calibration;
                    self.tuning.update(|tuning| calibration.apply_results(tuning));
                }
                ControlCommand::ResetDspState => self.reset_pending = true,
            }
        }
        self.publish_calibration_status();
    }

    fn update_calibration(&mut self, now: AudioTime, rms_pre_gain: f32) {
        if !self.calibration.state().is_running() {
            return;
        }
        self.calibration
            .update(now, rms_pre_gain, &self.held.ungated_bands, &self.held.ungated_chroma);
        self.publish_calibration_status();
    }

    fn publish_calibration_status(&mut self) {
        let status = self.calibration.status();
        if self.calibration_status.read() != status {
            self.calibration_status.write(status);
        }
    }

    fn reset_dsp(&mut self, tuning: &AudioPipelineTuning) {
        self.reset_pending = false;
        self.frontend.reset(tuning);
        self.spectral.reset();
        self.chroma.reset();
        self.detector.reset();
        self.control_bus.reset();
        self.held = HeldAnalysis::default();
        self.waveform = [0; WAVEFORM_POINTS];
        self.dsp.write(self.frontend.dsp_state());
        tracing::info!("dsp state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Signal, SyntheticSource};

    fn pipeline() -> (AudioPipeline, MusicalGrid) {
        AudioPipeline::with_grid(&AppConfig::default()).unwrap()
    }

    fn hop_us(i: u64) -> u64 {
        i * 8000
    }

    #[test]
    fn advances_time_by_hop_size() {
        let (mut pipeline, _grid) = pipeline();
        let mut source = SyntheticSource::silence(16_000);
        for i in 0..3 {
            assert_eq!(pipeline.tick(&mut source, hop_us(i)).unwrap(), TickOutcome::Processed);
        }
        assert_eq!(pipeline.now().sample_index, 384);
        assert_eq!(pipeline.now().monotonic_us, hop_us(2));
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert_eq!(pipeline.control_bus_reader().read_latest().0.hop_seq, 3);
    }

    #[test]
    fn analysis_runs_every_second_hop_once_warm() {
        let (mut pipeline, _grid) = pipeline();
        let mut source = SyntheticSource::silence(16_000);
        for i in 0..20 {
            pipeline.tick(&mut source, hop_us(i)).unwrap();
        }
        // The 512-sample window is full after 4 hops, then every 2 hops.
        assert_eq!(pipeline.stats().analysis_frames, 9);
    }

    #[test]
    fn bands_hold_between_analysis_frames() {
        let (mut pipeline, _grid) = pipeline();
        let mut reader = pipeline.control_bus_reader();
        let mut source = SyntheticSource::new(16_000, Signal::Tone { freq_hz: 250.0, dbfs: -12.0 });
        let mut last = 0.0;
        for i in 0..200 {
            pipeline.tick(&mut source, hop_us(i)).unwrap();
            let band = reader.read_latest().0.bands[2];
            if i > 100 {
                assert!(band >= last * 0.95, "band dropped from {last} to {band}");
            }
            last = band;
        }
        assert!(last > 0.3);
    }

    #[test]
    fn transient_errors_skip_and_fatal_errors_halt() {
        let (mut pipeline, _grid) = pipeline();
        let mut source = SyntheticSource::silence(16_000);
        source.inject_error(CaptureError::DmaTimeout);
        source.inject_error(CaptureError::BufferOverflow);
        assert_eq!(
            pipeline.tick(&mut source, 0).unwrap(),
            TickOutcome::Skipped(CaptureError::DmaTimeout)
        );
        assert_eq!(
            pipeline.tick(&mut source, 1).unwrap(),
            TickOutcome::Skipped(CaptureError::BufferOverflow)
        );
        assert_eq!(pipeline.tick(&mut source, 2).unwrap(), TickOutcome::Processed);
        assert_eq!(pipeline.now().sample_index, 128);

        source.inject_error(CaptureError::NotInitialized);
        assert_eq!(pipeline.tick(&mut source, 3).unwrap(), TickOutcome::Halted);
        assert_eq!(pipeline.state(), PipelineState::Error);
        assert_eq!(pipeline.tick(&mut source, 4).unwrap(), TickOutcome::Halted);
        assert!(matches!(
            pipeline.process_hop(&[0; 128], 5),
            Err(BeatlightError::PipelineHalted)
        ));

        let stats = pipeline.stats();
        assert_eq!(stats.dma_timeouts, 1);
        assert_eq!(stats.buffer_overflows, 1);
        assert_eq!(stats.fatal_errors, 1);
        assert_eq!(stats.hops_processed, 1);
    }

    #[test]
    fn pause_skips_capture() {
        let (mut pipeline, _grid) = pipeline();
        let mut source = SyntheticSource::silence(16_000);
        pipeline.tick(&mut source, 0).unwrap();
        pipeline.pause();
        assert_eq!(pipeline.tick(&mut source, 1).unwrap(), TickOutcome::Paused);
        assert_eq!(source.position(), 128);
        pipeline.resume();
        assert_eq!(pipeline.tick(&mut source, 2).unwrap(), TickOutcome::Processed);
    }

    #[test]
    fn tuning_set_through_handle_is_clamped() {
        let (pipeline, _grid) = pipeline();
        let handle = pipeline.control_handle();
        let mut tuning = handle.pipeline_tuning();
        tuning.agc_max_gain = 10_000.0;
        tuning.agc_target_rms = -1.0;
        handle.set_pipeline_tuning(tuning);
        let stored = handle.pipeline_tuning();
        assert_eq!(stored.agc_max_gain, 500.0);
        assert_eq!(stored.agc_target_rms, 0.01);
    }

    #[test]
    fn reset_command_restores_unity_gain() {
        let (mut pipeline, _grid) = pipeline();
        let handle = pipeline.control_handle();
        let mut source = SyntheticSource::new(16_000, Signal::Tone { freq_hz: 1000.0, dbfs: -40.0 });
        for i in 0..100 {
            pipeline.tick(&mut source, hop_us(i)).unwrap();
        }
        assert!(handle.dsp_state().agc_gain > 10.0);
        assert!(handle.dsp_state().rms_raw > 0.1);
        handle.reset_dsp_state().unwrap();
        pipeline.tick(&mut source, hop_us(100)).unwrap();
        // The first hop after the reset runs at unity gain.
        let state = handle.dsp_state();
        assert!(state.rms_raw < 0.01, "rms after reset {}", state.rms_raw);
        assert!(state.agc_gain < 10.0);
    }

    #[test]
    fn full_command_queue_is_reported() {
        let config = AppConfig {
            audio: AudioConfig {
                control_queue_depth: 1,
                ..AudioConfig::default()
            },
            ..AppConfig::default()
        };
        let (pipeline, _grid) = AudioPipeline::with_grid(&config).unwrap();
        let handle = pipeline.control_handle();
        handle.cancel_noise_calibration().unwrap();
        assert!(matches!(
            handle.cancel_noise_calibration(),
            Err(BeatlightError::ControlChannelFull)
        ));
        drop(pipeline);
        assert!(matches!(
            handle.reset_dsp_state(),
            Err(BeatlightError::ControlChannelClosed)
        ));
    }

    #[test]
    fn calibration_runs_through_handle() {
        let (mut pipeline, _grid) = pipeline();
        let handle = pipeline.control_handle();
        let mut source = SyntheticSource::new(16_000, Signal::Noise { dbfs: -50.0 });
        handle.start_noise_calibration(200, 1.2).unwrap();
        for i in 0..40 {
            pipeline.tick(&mut source, hop_us(i)).unwrap();
        }
        let status = handle.calibration_status();
        assert_eq!(status.state, crate::calibration::CalibrationState::Complete);
        assert!(status.result.valid);

        handle.apply_calibration_results().unwrap();
        pipeline.tick(&mut source, hop_us(40)).unwrap();
        let tuning = handle.pipeline_tuning();
        assert!(tuning.use_per_band_noise_floor);
        assert!((tuning.noise_floor_min - status.result.overall_rms).abs() < 1e-6);
    }
}
