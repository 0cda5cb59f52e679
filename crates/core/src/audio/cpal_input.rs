use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, InputCallbackInfo, Sample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, StreamError,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use super::{BlockReader, CaptureDevice};
use crate::{config::AudioConfig, BeatLightsError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default system input device via `cpal`, mixed down to mono.
#[derive(Debug, Default, Clone)]
pub struct CpalDevice {
    preferred: Option<String>,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the first input device whose name contains `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            preferred: Some(name.into()),
        }
    }

    fn select(&self) -> Result<Device> {
        let host = cpal::default_host();
        match &self.preferred {
            Some(wanted) => host
                .input_devices()
                .map_err(|err| BeatLightsError::device(err.to_string()))?
                .find(|device| {
                    device
                        .name()
                        .map(|name| name.contains(wanted.as_str()))
                        .unwrap_or(false)
                })
                .ok_or_else(|| BeatLightsError::device(format!("no input device `{wanted}`"))),
            None => host
                .default_input_device()
                .ok_or_else(|| BeatLightsError::device("no default input device")),
        }
    }
}

impl CaptureDevice for CpalDevice {
    fn name(&self) -> String {
        self.preferred
            .clone()
            .unwrap_or_else(|| "default input".to_string())
    }

    fn open(&mut self, config: &AudioConfig) -> Result<Box<dyn BlockReader>> {
        let device = self.select()?;
        let supported = device
            .default_input_config()
            .map_err(|err| BeatLightsError::device(err.to_string()))?;

        let stream_config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = stream_config.channels as usize;

        let (tx_frames, rx_frames) = bounded::<Vec<f32>>(32);
        let (tx_errors, rx_errors) = bounded::<String>(1);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_input_stream::<f32>(&device, &stream_config, channels, tx_frames, tx_errors)
            }
            SampleFormat::I16 => {
                build_input_stream::<i16>(&device, &stream_config, channels, tx_frames, tx_errors)
            }
            SampleFormat::U16 => {
                build_input_stream::<u16>(&device, &stream_config, channels, tx_frames, tx_errors)
            }
            other => Err(BeatLightsError::device(format!(
                "unsupported sample format {other:?}"
            ))),
        }?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            channels,
            sample_rate = config.sample_rate,
            "microphone opened"
        );

        Ok(Box::new(CpalReader {
            _stream: stream,
            frames: rx_frames,
            errors: rx_errors,
            pending: Vec::with_capacity(config.block_size * 2),
        }))
    }
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    tx_frames: Sender<Vec<f32>>,
    tx_errors: Sender<String>,
) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_callback = move |err: StreamError| {
        let _ = tx_errors.try_send(err.to_string());
    };

    let input_callback = move |data: &[T], _info: &InputCallbackInfo| {
        let mono: Vec<f32> = data
            .chunks(channels.max(1))
            .map(|frame| {
                frame.iter().map(|s| (*s).to_sample::<f32>()).sum::<f32>() / frame.len() as f32
            })
            .collect();
        if tx_frames.try_send(mono).is_err() {
            warn!("capture consumer is behind, dropping microphone frames");
        }
    };

    let stream = device
        .build_input_stream(config, input_callback, err_callback, None)
        .map_err(|err| BeatLightsError::device(err.to_string()))?;
    stream
        .play()
        .map_err(|err| BeatLightsError::device(err.to_string()))?;
    Ok(stream)
}

struct CpalReader {
    _stream: Stream,
    frames: Receiver<Vec<f32>>,
    errors: Receiver<String>,
    pending: Vec<f32>,
}

impl BlockReader for CpalReader {
    fn read_block(&mut self, block: &mut [f32]) -> Result<bool> {
        while self.pending.len() < block.len() {
            if let Ok(err) = self.errors.try_recv() {
                return Err(BeatLightsError::device(err));
            }
            match self.frames.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BeatLightsError::device("input stream closed"))
                }
            }
        }

        block.copy_from_slice(&self.pending[..block.len()]);
        self.pending.drain(..block.len());
        Ok(true)
    }
}
