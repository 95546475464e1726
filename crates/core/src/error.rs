use crate::capture::CaptureError;

/// Result alias that carries the custom [`BeatlightError`] type.
pub type Result<T> = std::result::Result<T, BeatlightError>;

/// Common error type for the core crate.
///
/// Nothing on the per-hop path returns this type for recoverable conditions;
/// those become state transitions and counters. It is reserved for
/// construction, configuration and the few calls that cannot make progress.
#[derive(Debug, thiserror::Error)]
pub enum BeatlightError {
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Wrapper around capture driver failures.
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    /// The pipeline hit a fatal capture error and will not process more hops.
    #[error("audio pipeline is halted")]
    PipelineHalted,
    /// The pipeline owning the control queue has been dropped.
    #[error("control channel closed")]
    ControlChannelClosed,
    /// The control queue is full; the command was not delivered.
    #[error("control channel full")]
    ControlChannelFull,
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BeatlightError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for BeatlightError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatlightError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
