//! Core library for the beat-reactive light controller.
//!
//! Audio blocks flow from a capture device through a real FFT into a sub-band
//! beat detector, and detected beats (or the raw spectrum) drive a palette
//! based colour renderer whose frames are written to light sinks. Each module
//! owns one stage; [`pipeline::PipelineManager`] composes them and owns the
//! session lifecycle.

pub mod audio;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod modes;
pub mod pipeline;
pub mod render;
pub mod sink;
pub mod spectrum;

#[cfg(feature = "cpal")]
pub use audio::CpalDevice;
pub use audio::{AudioCapture, BlockHandler, BlockReader, CaptureDevice, Signal, SyntheticDevice};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, AudioConfig, DetectorConfig, RendererConfig, Settings, VisualizationKind,
};
pub use detector::{sensitivity_from_percent, BeatDetector, BeatEvent, BeatKind, FrequencyRange};
pub use error::{BeatLightsError, Result};
pub use modes::{Mode, ModeProfile, ModeTable, Rgb};
pub use pipeline::{PipelineEvent, PipelineHandle, PipelineManager, SUBSCRIBER_CAPACITY};
pub use render::{ColorFrame, ColorRenderer, LightColor, RenderUpdate};
pub use sink::{scale_brightness, LightSink};
pub use spectrum::{Spectrum, SpectrumTransform};
