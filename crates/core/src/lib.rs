//! Core library for the Beatlight audio-reactive LED controller.
//!
//! The crate turns a stream of captured sample hops into two published
//! views of the music: a smoothed [`ControlBusFrame`] per hop and a
//! continuously ticking [`MusicalGridSnapshot`]. Audio-domain stages live
//! behind [`AudioPipeline`]; the render domain owns the [`MusicalGrid`].
//! The two sides only meet through the lock-free primitives in [`sync`].

pub mod analysis;
pub mod beat;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod control_bus;
pub mod error;
pub mod frontend;
pub mod grid;
pub mod pipeline;
pub mod sync;
pub mod timeline;

pub use analysis::{ChromaAnalyzer, SpectralAnalyzer};
pub use beat::{BeatDetector, BeatObsFrame};
pub use calibration::{CalibrationState, CalibrationStatus, NoiseCalibration, NoiseCalibrationResult};
pub use capture::{CaptureError, CaptureSource, Signal, SyntheticSource};
pub use config::{
    AppConfig, AudioConfig, AudioPipelineTuning, AudioPreset, BeatDetectorTuning,
    MusicalGridTuning, SpectralMode,
};
pub use control_bus::{
    ChordKind, ChordState, ControlBus, ControlBusFrame, ControlBusRawInput, SpikeStats,
};
pub use error::{BeatlightError, Result};
pub use frontend::{AudioDspState, SampleFrontEnd};
pub use grid::{GridObserver, MusicalGrid, MusicalGridSnapshot};
pub use pipeline::{AudioPipeline, ControlHandle, PipelineState, PipelineStats, TickOutcome};
pub use sync::{SeqLock, SnapshotBuffer, SnapshotReader, SnapshotWriter};
pub use timeline::{AudioTime, RenderClock};
