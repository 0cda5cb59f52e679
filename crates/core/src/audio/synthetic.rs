use std::{
    f32::consts::TAU,
    thread,
    time::{Duration, Instant},
};

use super::{BlockReader, CaptureDevice};
use crate::{config::AudioConfig, BeatLightsError, Result};

/// Generated test signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    /// Continuous sine tone.
    Tone { frequency: f32, amplitude: f32 },
    /// Sine bursts of `length_ms` starting every `period_ms`, like a kick drum pattern.
    Pulse {
        frequency: f32,
        amplitude: f32,
        period_ms: u64,
        length_ms: u64,
    },
}

impl Signal {
    /// Value of the signal at sample `index`.
    pub fn sample(&self, index: u64, sample_rate: u32) -> f32 {
        let sample_rate = sample_rate.max(1);
        let t = index as f32 / sample_rate as f32;
        match *self {
            Signal::Silence => 0.0,
            Signal::Tone {
                frequency,
                amplitude,
            } => amplitude * (TAU * frequency * t).sin(),
            Signal::Pulse {
                frequency,
                amplitude,
                period_ms,
                length_ms,
            } => {
                let ms = index * 1_000 / u64::from(sample_rate);
                if period_ms > 0 && ms % period_ms < length_ms {
                    amplitude * (TAU * frequency * t).sin()
                } else {
                    0.0
                }
            }
        }
    }
}

/// Capture device rendering a [`Signal`], optionally paced at the block rate.
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    signal: Signal,
    realtime: bool,
    block_limit: Option<u64>,
}

impl SyntheticDevice {
    /// Unpaced device: blocks are produced as fast as they are read.
    pub fn new(signal: Signal) -> Self {
        Self {
            signal,
            realtime: false,
            block_limit: None,
        }
    }

    /// Delivers one block per `block_size / sample_rate` of wall time.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Fails with a device error after `blocks` blocks, like an unplugged microphone.
    pub fn with_block_limit(mut self, blocks: u64) -> Self {
        self.block_limit = Some(blocks);
        self
    }
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> String {
        format!("synthetic ({:?})", self.signal)
    }

    fn open(&mut self, config: &AudioConfig) -> Result<Box<dyn BlockReader>> {
        let block_period = Duration::from_secs_f64(config.block_duration_ms() / 1_000.0);
        Ok(Box::new(SyntheticReader {
            signal: self.signal,
            sample_rate: config.sample_rate,
            position: 0,
            blocks: 0,
            block_limit: self.block_limit,
            pacing: self.realtime.then(|| (Instant::now(), block_period)),
        }))
    }
}

struct SyntheticReader {
    signal: Signal,
    sample_rate: u32,
    position: u64,
    blocks: u64,
    block_limit: Option<u64>,
    pacing: Option<(Instant, Duration)>,
}

impl BlockReader for SyntheticReader {
    fn read_block(&mut self, block: &mut [f32]) -> Result<bool> {
        if self.block_limit.is_some_and(|limit| self.blocks >= limit) {
            return Err(BeatLightsError::device("synthetic signal exhausted"));
        }

        if let Some((origin, period)) = self.pacing {
            let due = origin + period * (self.blocks as u32 + 1);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }

        for sample in block.iter_mut() {
            *sample = self.signal.sample(self.position, self.sample_rate);
            self.position += 1;
        }
        self.blocks += 1;
        Ok(true)
    }
}
