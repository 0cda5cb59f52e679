/// Result alias that carries the custom [`BeatLightsError`] type.
pub type Result<T> = std::result::Result<T, BeatLightsError>;

/// Common error type for the core crate.
///
/// Configuration variants are returned synchronously by setters and
/// constructors so that callers can reject bad input before a session starts.
/// Device variants end the capture loop of a running session.
#[derive(Debug, thiserror::Error)]
pub enum BeatLightsError {
    /// Sensitivity was negative, not a number, or a percentage above 100.
    #[error("invalid sensitivity {0}")]
    InvalidSensitivity(f32),
    /// Manual frequency range outside `0..sub_bands` or inverted.
    #[error("invalid frequency range {low}..={high} for {sub_bands} sub-bands")]
    InvalidFrequencyRange {
        low: i64,
        high: i64,
        sub_bands: usize,
    },
    /// Emission delay outside of the accepted `[20, 5000]` millisecond window.
    #[error("delay of {0} ms is out of range (20..=5000)")]
    InvalidDelay(u32),
    /// Brightness above the light protocol maximum of 254.
    #[error("brightness {0} is out of range (0..=254)")]
    InvalidBrightness(u32),
    /// Any other inconsistent configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A block or spectrum handed to a stage does not match its configured shape.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The capture device could not be opened or failed while reading.
    #[error("capture device error: {0}")]
    Device(String),
    /// The FFT backend rejected its buffers.
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
    /// Shared state was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be parsed.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatLightsError {
    /// Creates a configuration error from a readable message.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates a device error from a readable message.
    pub fn device<T: Into<String>>(msg: T) -> Self {
        Self::Device(msg.into())
    }

    /// Returns true for errors caused by rejected configuration values.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidSensitivity(_)
                | Self::InvalidFrequencyRange { .. }
                | Self::InvalidDelay(_)
                | Self::InvalidBrightness(_)
                | Self::InvalidConfig(_)
        )
    }
}
