use std::fmt;

use crate::{modes::Rgb, render::ColorFrame};

/// Light-control endpoint such as a bridge client.
///
/// Writes are best effort: implementations handle their own failures and never
/// report them back into the pipeline.
pub trait LightSink: Send {
    fn set_color(&mut self, light: &str, color: Rgb);

    /// `brightness` is in `0..=254`.
    fn set_brightness(&mut self, light: &str, brightness: u8);
}

/// Scales a `0..=255` frame alpha to the `0..=max` sink range.
pub fn scale_brightness(alpha: u8, max: u8) -> u8 {
    (u32::from(alpha) * u32::from(max) / 255) as u8
}

/// A sink together with the lights it drives.
pub(crate) struct SinkBinding {
    sink: Box<dyn LightSink>,
    lights: Vec<String>,
}

impl SinkBinding {
    pub(crate) fn new(sink: Box<dyn LightSink>, lights: Vec<String>) -> Self {
        Self { sink, lights }
    }

    /// Light `j` shows frame slot `j mod slots`.
    pub(crate) fn apply(&mut self, frame: &ColorFrame, max_brightness: u8) {
        if frame.lights.is_empty() {
            return;
        }
        for (index, light) in self.lights.iter().enumerate() {
            let slot = frame.lights[index % frame.lights.len()];
            self.sink.set_color(light, slot.color);
            self.sink
                .set_brightness(light, scale_brightness(slot.brightness, max_brightness));
        }
    }
}

impl fmt::Debug for SinkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkBinding")
            .field("lights", &self.lights)
            .finish()
    }
}
