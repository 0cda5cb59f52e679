//! Continuous block capture on a dedicated thread.
//!
//! A [`CaptureDevice`] is opened on the capture thread and yields fixed-size
//! mono blocks through a [`BlockReader`]. Every block is pushed to a
//! [`BlockHandler`] in order. Cancellation is cooperative: the stop flag is
//! checked once per loop iteration and [`AudioCapture::stop`] joins the thread.

#[cfg(feature = "cpal")]
mod cpal_input;
mod synthetic;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info};

use crate::{config::AudioConfig, BeatLightsError, Result};

#[cfg(feature = "cpal")]
pub use cpal_input::CpalDevice;
pub use synthetic::{Signal, SyntheticDevice};

/// Source of audio blocks. Opened on the capture thread, so the reader it
/// returns does not need to be `Send`.
pub trait CaptureDevice: Send + 'static {
    /// Human readable device name for logs.
    fn name(&self) -> String;

    /// Acquires the device. Failure ends the session without retry.
    fn open(&mut self, config: &AudioConfig) -> Result<Box<dyn BlockReader>>;
}

/// An opened capture device. Dropping it releases the device.
pub trait BlockReader {
    /// Fills `block` with normalised samples in `[-1, 1]`.
    ///
    /// Returns `Ok(false)` when no full block was available yet; the capture
    /// loop then re-checks its stop flag before reading again.
    fn read_block(&mut self, block: &mut [f32]) -> Result<bool>;
}

/// Consumer of captured blocks, running on the capture thread.
pub trait BlockHandler: Send + 'static {
    fn on_block(&mut self, block: &[f32]);

    /// Called once when the device cannot be opened or a read fails.
    fn on_error(&mut self, _error: &BeatLightsError) {}
}

impl<F> BlockHandler for F
where
    F: FnMut(&[f32]) + Send + 'static,
{
    fn on_block(&mut self, block: &[f32]) {
        self(block)
    }
}

/// Runs a [`CaptureDevice`] on its own thread.
pub struct AudioCapture {
    config: AudioConfig,
    device: Option<Box<dyn CaptureDevice>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Box<dyn CaptureDevice>>>,
}

impl AudioCapture {
    pub fn new(config: AudioConfig, device: Box<dyn CaptureDevice>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Some(device),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// True while the capture loop is acquiring blocks.
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Spawns the capture thread and starts delivering blocks to `handler`.
    pub fn start<H: BlockHandler>(&mut self, handler: H) -> Result<()> {
        if self.is_running() {
            return Err(BeatLightsError::config("capture is already running"));
        }
        // A loop that ended on a device error still owns the device.
        self.reclaim()?;

        let mut device = self
            .device
            .take()
            .ok_or_else(|| BeatLightsError::device("capture device is unavailable"))?;
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        info!(
            device = %device.name(),
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "starting audio capture"
        );

        let worker = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_loop(device.as_mut(), &config, &running, handler);
                running.store(false, Ordering::Release);
                device
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Requests termination and waits for the capture thread to finish.
    /// No block is delivered after this returns.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.reclaim()
    }

    fn reclaim(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            let device = worker
                .join()
                .map_err(|_| BeatLightsError::Poisoned("audio capture thread"))?;
            self.device = Some(device);
            debug!("audio capture thread joined");
        }
        Ok(())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioCapture")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

fn capture_loop<H: BlockHandler>(
    device: &mut dyn CaptureDevice,
    config: &AudioConfig,
    running: &AtomicBool,
    mut handler: H,
) {
    let mut reader = match device.open(config) {
        Ok(reader) => reader,
        Err(err) => {
            error!(%err, "failed to open capture device");
            handler.on_error(&err);
            return;
        }
    };

    let mut block = vec![0.0_f32; config.block_size];
    while running.load(Ordering::Acquire) {
        match reader.read_block(&mut block) {
            Ok(true) => handler.on_block(&block),
            Ok(false) => continue,
            Err(err) => {
                error!(%err, "capture loop terminated");
                handler.on_error(&err);
                break;
            }
        }
    }
    debug!("capture loop finished");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Mutex},
        time::Duration,
    };

    use super::*;

    fn small_config() -> AudioConfig {
        AudioConfig {
            sample_rate: 8_000,
            block_size: 64,
        }
    }

    struct BrokenDevice;

    impl CaptureDevice for BrokenDevice {
        fn name(&self) -> String {
            "broken".into()
        }

        fn open(&mut self, _config: &AudioConfig) -> Result<Box<dyn BlockReader>> {
            Err(BeatLightsError::device("no microphone"))
        }
    }

    struct ErrorCounter {
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl BlockHandler for ErrorCounter {
        fn on_block(&mut self, _block: &[f32]) {}

        fn on_error(&mut self, error: &BeatLightsError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn delivers_blocks_until_stopped() {
        let device = SyntheticDevice::new(Signal::Tone {
            frequency: 440.0,
            amplitude: 0.5,
        });
        let mut capture = AudioCapture::new(small_config(), Box::new(device)).unwrap();
        let (tx, rx) = mpsc::channel();

        capture
            .start(move |block: &[f32]| {
                let _ = tx.send(block.len());
            })
            .unwrap();
        assert!(capture.is_running());

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, 64);

        capture.stop().unwrap();
        assert!(!capture.is_running());
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn can_restart_after_stop() {
        let device = SyntheticDevice::new(Signal::Silence);
        let mut capture = AudioCapture::new(small_config(), Box::new(device)).unwrap();

        for _ in 0..2 {
            let (tx, rx) = mpsc::channel();
            capture
                .start(move |_: &[f32]| {
                    let _ = tx.send(());
                })
                .unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
            capture.stop().unwrap();
        }
    }

    #[test]
    fn reports_open_failure_once() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut capture = AudioCapture::new(small_config(), Box::new(BrokenDevice)).unwrap();
        capture
            .start(ErrorCounter {
                errors: Arc::clone(&errors),
            })
            .unwrap();
        capture.stop().unwrap();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no microphone"));
        assert!(!capture.is_running());
    }

    #[test]
    fn read_failure_ends_the_loop() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let device = SyntheticDevice::new(Signal::Silence).with_block_limit(3);
        let mut capture = AudioCapture::new(small_config(), Box::new(device)).unwrap();
        capture
            .start(ErrorCounter {
                errors: Arc::clone(&errors),
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while capture.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!capture.is_running());
        capture.stop().unwrap();
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
