use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use beatlight_core::{
    AppConfig, AudioPipeline, AudioPreset, CalibrationState, RenderClock, Signal, SyntheticSource,
    TickOutcome,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

fn main() -> beatlight_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            preset,
            mood,
            bpm,
            dbfs,
            seconds,
            fps,
        } => {
            let mut config = load_config(config.as_deref(), preset)?;
            if let Some(mood) = mood {
                config.pipeline = config.pipeline.with_mood(mood);
            }
            run_simulation(&config, bpm, dbfs, seconds, fps)
        }
        Commands::DumpConfig { preset, output } => dump_config(preset, output.as_deref()),
        Commands::Calibrate {
            noise_dbfs,
            duration_ms,
            safety,
        } => run_calibration(noise_dbfs, duration_ms, safety),
    }
}

fn load_config(path: Option<&Path>, preset: Option<PresetArg>) -> beatlight_core::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(preset) = preset {
        config.pipeline = beatlight_core::AudioPipelineTuning::preset(preset.into());
    }
    Ok(config)
}

/// Runs the capture/DSP context and the render context on two threads
/// against a synthetic click track, logging the musical clock once a second.
fn run_simulation(
    config: &AppConfig,
    bpm: f32,
    dbfs: f32,
    seconds: f32,
    fps: u32,
) -> beatlight_core::Result<()> {
    tracing::info!(bpm, dbfs, seconds, fps, "starting simulation");

    let (mut pipeline, mut grid) = AudioPipeline::with_grid(config)?;
    let mut frames = pipeline.control_bus_reader();
    let handle = pipeline.control_handle();
    let mut source = SyntheticSource::new(
        config.audio.sample_rate_hz,
        Signal::Clicks {
            bpm,
            dbfs,
            bed_dbfs: Some(dbfs - 40.0),
            accent_every: u32::from(config.detector.beats_per_bar),
        },
    );

    let origin = Instant::now();
    let monotonic_us = move || origin.elapsed().as_micros() as u64;
    let running = Arc::new(AtomicBool::new(true));
    let hop_period = Duration::from_secs_f32(1.0 / config.audio.hop_rate_hz());
    let frame_period = Duration::from_secs_f32(1.0 / fps.max(1) as f32);

    let audio_running = Arc::clone(&running);
    let audio = thread::spawn(move || -> beatlight_core::Result<()> {
        let mut next = Instant::now();
        while audio_running.load(Ordering::Relaxed) {
            match pipeline.tick(&mut source, monotonic_us())? {
                TickOutcome::Halted => break,
                TickOutcome::Processed | TickOutcome::Skipped(_) | TickOutcome::Paused => {}
            }
            next += hop_period;
            thread::sleep(next.saturating_duration_since(Instant::now()));
        }
        tracing::info!(stats = ?pipeline.stats(), "audio thread finished");
        Ok(())
    });

    let render_running = Arc::clone(&running);
    let render = thread::spawn(move || {
        let mut clock = RenderClock::default();
        let mut next = Instant::now();
        let mut next_report = Duration::from_secs(1);
        let mut ticks = 0_u32;
        while render_running.load(Ordering::Relaxed) {
            let (frame, _) = frames.read_latest();
            let now = clock.now(frame.t, monotonic_us());
            let snap = grid.tick(now);
            ticks += u32::from(snap.beat_tick);

            if origin.elapsed() >= next_report {
                next_report += Duration::from_secs(1);
                tracing::info!(
                    bpm = snap.bpm_smoothed,
                    confidence = snap.tempo_confidence,
                    beat = snap.beat_index,
                    bar = snap.bar_index,
                    beat_in_bar = snap.beat_in_bar,
                    phase = snap.beat_phase01,
                    rms = frame.rms,
                    chord = ?frame.chord.kind,
                    ticks,
                    "musical clock"
                );
                ticks = 0;
            }

            next += frame_period;
            thread::sleep(next.saturating_duration_since(Instant::now()));
        }
    });

    thread::sleep(Duration::from_secs_f32(seconds.max(0.0)));
    running.store(false, Ordering::Relaxed);

    let audio_result = audio
        .join()
        .map_err(|_| beatlight_core::BeatlightError::msg("audio thread panicked"))?;
    render
        .join()
        .map_err(|_| beatlight_core::BeatlightError::msg("render thread panicked"))?;
    audio_result?;

    let dsp = handle.dsp_state();
    tracing::info!(gain = dsp.agc_gain, noise_floor = dsp.noise_floor, "simulation finished");
    Ok(())
}

fn dump_config(preset: PresetArg, output: Option<&Path>) -> beatlight_core::Result<()> {
    let preset: AudioPreset = preset.into();
    let config = AppConfig::with_preset(preset);
    match output {
        Some(path) => {
            config.save(path)?;
            tracing::info!(preset = preset.name(), ?path, "wrote configuration");
        }
        None => println!("{}", config.to_json_pretty()?),
    }
    Ok(())
}

/// Runs noise calibration against synthetic room noise as fast as the
/// pipeline can go and prints the result as JSON.
fn run_calibration(noise_dbfs: f32, duration_ms: u32, safety: f32) -> beatlight_core::Result<()> {
    let config = AppConfig::default();
    let (mut pipeline, _grid) = AudioPipeline::with_grid(&config)?;
    let handle = pipeline.control_handle();
    let mut source = SyntheticSource::new(config.audio.sample_rate_hz, Signal::Noise { dbfs: noise_dbfs });

    handle.start_noise_calibration(duration_ms, safety)?;
    let hop_us = (1_000_000.0 / config.audio.hop_rate_hz()) as u64;
    let max_hops = (u64::from(duration_ms) * 1000 / hop_us.max(1)) + 16;
    for hop in 0..max_hops {
        pipeline.tick(&mut source, hop * hop_us)?;
        let state = handle.calibration_status().state;
        if matches!(state, CalibrationState::Complete | CalibrationState::Failed) {
            break;
        }
    }

    let status = handle.calibration_status();
    tracing::info!(state = ?status.state, "calibration finished");
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio analysis and beat tracking for LED controllers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the audio and render contexts against a synthetic click track.
    Simulate {
        /// JSON configuration file to start from.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Replace the pipeline tuning with a preset.
        #[arg(short, long, value_enum)]
        preset: Option<PresetArg>,
        /// Control-bus smoothing from 0 (punchy) to 255 (dreamy).
        #[arg(long)]
        mood: Option<u8>,
        #[arg(long, default_value_t = 120.0)]
        bpm: f32,
        /// Click level in dBFS.
        #[arg(long, default_value_t = -12.0, allow_hyphen_values = true)]
        dbfs: f32,
        #[arg(long, default_value_t = 10.0)]
        seconds: f32,
        /// Render frame rate.
        #[arg(long, default_value_t = 120)]
        fps: u32,
    },
    /// Print or write a configuration file for a preset.
    DumpConfig {
        #[arg(short, long, value_enum, default_value_t = PresetArg::Lightwave)]
        preset: PresetArg,
        /// Output path; prints to stdout when omitted.
        output: Option<PathBuf>,
    },
    /// Measure the noise floor of synthetic room noise.
    Calibrate {
        #[arg(long, default_value_t = -60.0, allow_hyphen_values = true)]
        noise_dbfs: f32,
        #[arg(long, default_value_t = 3000)]
        duration_ms: u32,
        #[arg(long, default_value_t = 1.2)]
        safety: f32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    Lightwave,
    SensoryBridge,
    AggressiveAgc,
    ConservativeAgc,
    LgpSmooth,
    Custom,
}

impl From<PresetArg> for AudioPreset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Lightwave => AudioPreset::Lightwave,
            PresetArg::SensoryBridge => AudioPreset::SensoryBridge,
            PresetArg::AggressiveAgc => AudioPreset::AggressiveAgc,
            PresetArg::ConservativeAgc => AudioPreset::ConservativeAgc,
            PresetArg::LgpSmooth => AudioPreset::LgpSmooth,
            PresetArg::Custom => AudioPreset::Custom,
        }
    }
}
