//! Composition of capture, transform, detection and rendering.
//!
//! Two threads run while a session is active. The capture thread reads a block,
//! transforms it and hands the spectrum to the processing thread through a
//! single-slot channel. When the slot is still occupied the older spectrum is
//! dropped, so at most one block is ever in flight and the capture thread
//! never waits on the processor. The processing thread owns every detector and
//! renderer update; setters reach the same state through a mutex and therefore
//! take effect between two cycles.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{AudioCapture, BlockHandler, CaptureDevice},
    clock::{Clock, SystemClock},
    config::{AppConfig, AudioConfig, Settings, VisualizationKind, MAX_BRIGHTNESS},
    detector::{sensitivity_from_percent, BeatDetector, BeatEvent, FrequencyRange},
    modes::Mode,
    render::{ColorFrame, ColorRenderer},
    sink::{LightSink, SinkBinding},
    spectrum::{Spectrum, SpectrumTransform},
    BeatLightsError, Result,
};

/// Message published to subscribers, in processing order.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Magnitude per bin of the latest block.
    Spectrum(Vec<f32>),
    /// Beats accepted in the latest detection pass, possibly none.
    Beats(Vec<BeatEvent>),
    /// Colour frame that passed emission gating.
    Colors(ColorFrame),
    /// Active mode changed, explicitly or by auto-mode.
    ModeChanged(Mode),
    /// The capture loop ended on a device error.
    CaptureFailed(String),
    /// The session stopped; emitted once after the final all-off frame.
    Stopped,
}

/// Events a subscriber may leave unread before newer ones are dropped for it.
pub const SUBSCRIBER_CAPACITY: usize = 4096;

struct Subscriber {
    tx: Sender<PipelineEvent>,
    lagging: bool,
}

impl Subscriber {
    /// Returns false once the receiving side is gone.
    fn deliver(&mut self, event: &PipelineEvent) -> bool {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {
                self.lagging = false;
                true
            }
            Err(TrySendError::Full(_)) => {
                if !self.lagging {
                    warn!("subscriber is not reading, dropping events");
                    self.lagging = true;
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

enum Handoff {
    Spectrum(Spectrum),
    Failed(String),
}

/// State touched once per cycle by the processing thread.
struct Processor {
    detector: BeatDetector,
    renderer: ColorRenderer,
    visualization: VisualizationKind,
    brightness: u8,
    sinks: Vec<SinkBinding>,
    subscribers: Vec<Subscriber>,
}

impl Processor {
    fn consume(&mut self, spectrum: &Spectrum, now_ms: u64) -> Result<()> {
        if !self.subscribers.is_empty() {
            self.publish(PipelineEvent::Spectrum(spectrum.magnitudes()));
        }

        let update = match self.visualization {
            VisualizationKind::Beat => {
                let events = self.detector.process(spectrum, now_ms)?;
                if !events.is_empty() {
                    debug!(?events, "beats detected");
                }
                let update = self.renderer.update_beats(&events, now_ms);
                self.publish(PipelineEvent::Beats(events));
                update
            }
            VisualizationKind::Frequency => self.renderer.update_frequency(spectrum, now_ms),
        };

        if let Some(mode) = update.auto_mode {
            self.publish(PipelineEvent::ModeChanged(mode));
        }
        if let Some(frame) = update.frame {
            self.emit_frame(frame);
        }
        Ok(())
    }

    fn emit_frame(&mut self, frame: ColorFrame) {
        for binding in &mut self.sinks {
            binding.apply(&frame, self.brightness);
        }
        self.publish(PipelineEvent::Colors(frame));
    }

    fn publish(&mut self, event: PipelineEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers
            .retain_mut(|subscriber| subscriber.deliver(&event));
    }

    fn shutdown(&mut self) {
        let frame = self.renderer.stop();
        self.emit_frame(frame);
        self.publish(PipelineEvent::Stopped);
    }
}

/// Cloneable control surface of a [`PipelineManager`].
///
/// Every setter validates its input before touching shared state, so a
/// rejected value leaves the running session unchanged.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Mutex<Processor>>,
}

impl PipelineHandle {
    /// Registers a new subscriber for every subsequent event.
    ///
    /// The channel holds [`SUBSCRIBER_CAPACITY`] events; while it is full new
    /// events are dropped for this subscriber only and processing continues.
    pub fn subscribe(&self) -> Result<Receiver<PipelineEvent>> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        self.lock()?.subscribers.push(Subscriber { tx, lagging: false });
        Ok(rx)
    }

    /// Attaches a light sink; light `j` follows frame slot `j mod light_count`.
    pub fn attach_sink(&self, sink: Box<dyn LightSink>, lights: Vec<String>) -> Result<()> {
        self.lock()?.sinks.push(SinkBinding::new(sink, lights));
        Ok(())
    }

    pub fn mode(&self) -> Result<Mode> {
        Ok(self.lock()?.renderer.mode())
    }

    /// Selects a mode explicitly: palette, interval and detector sensitivity.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut processor = self.lock()?;
        let sensitivity = processor.renderer.profile_for(mode).sensitivity;
        processor.detector.set_sensitivity(sensitivity)?;
        processor.renderer.set_mode(mode);
        info!(%mode, sensitivity, "mode selected");
        processor.publish(PipelineEvent::ModeChanged(mode));
        Ok(())
    }

    /// Beats counted so far in the current auto-mode window.
    pub fn beat_count(&self) -> Result<u32> {
        Ok(self.lock()?.renderer.beat_count())
    }

    pub fn sensitivity(&self) -> Result<f32> {
        Ok(self.lock()?.detector.sensitivity())
    }

    pub fn set_sensitivity(&self, sensitivity: f32) -> Result<()> {
        self.lock()?.detector.set_sensitivity(sensitivity)
    }

    pub fn set_sensitivity_percent(&self, percent: f32) -> Result<()> {
        self.lock()?.detector.set_sensitivity_percent(percent)
    }

    pub fn set_min_beat_interval_ms(&self, interval_ms: u64) -> Result<()> {
        self.lock()?.detector.set_min_beat_interval_ms(interval_ms);
        Ok(())
    }

    /// Switches the detector to manual mode on sub-bands `low..=high`.
    pub fn set_manual_range(&self, low: i64, high: i64) -> Result<FrequencyRange> {
        self.lock()?.detector.set_manual_range(low, high)
    }

    pub fn set_manual_percent(&self, low: f32, high: f32) -> Result<FrequencyRange> {
        self.lock()?.detector.set_manual_percent(low, high)
    }

    pub fn clear_manual_range(&self) -> Result<()> {
        self.lock()?.detector.clear_manual_range();
        Ok(())
    }

    pub fn set_delay(&self, delay_ms: u32) -> Result<()> {
        self.lock()?.renderer.set_delay(delay_ms)
    }

    pub fn set_auto_mode(&self, enabled: bool) -> Result<()> {
        self.lock()?.renderer.set_auto_mode(enabled);
        Ok(())
    }

    /// Sets the maximum brightness written to sinks, `0..=254`.
    pub fn set_brightness(&self, brightness: u32) -> Result<()> {
        if brightness > MAX_BRIGHTNESS {
            return Err(BeatLightsError::InvalidBrightness(brightness));
        }
        self.lock()?.brightness = brightness as u8;
        Ok(())
    }

    pub fn set_visualization(&self, kind: VisualizationKind) -> Result<()> {
        self.lock()?.visualization = kind;
        Ok(())
    }

    /// Applies all four settings-store values, or none of them if any is invalid.
    pub fn apply_settings(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        let sensitivity = settings
            .sensitivity
            .map(|percent| sensitivity_from_percent(percent as f32))
            .transpose()?;

        let mut processor = self.lock()?;
        if let Some(sensitivity) = sensitivity {
            processor.detector.set_sensitivity(sensitivity)?;
        }
        processor.renderer.set_delay(settings.delay_ms)?;
        processor.renderer.set_auto_mode(settings.mode_switch);
        processor.brightness = settings.brightness as u8;
        debug!(?settings, "settings applied");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Processor>> {
        self.shared
            .lock()
            .map_err(|_| BeatLightsError::Poisoned("pipeline state"))
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle").finish()
    }
}

/// Capture-thread half of the pipeline: transform, then single-slot handoff.
struct Producer {
    transform: SpectrumTransform,
    slot: Sender<Handoff>,
    evict: Receiver<Handoff>,
}

impl Producer {
    fn hand_off(&mut self, message: Handoff) {
        match self.slot.try_send(message) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(message)) => {
                if self.evict.try_recv().is_ok() {
                    warn!("processor is behind, dropped the oldest block");
                }
                let _ = self.slot.try_send(message);
            }
        }
    }
}

impl BlockHandler for Producer {
    fn on_block(&mut self, block: &[f32]) {
        match self.transform.process(block) {
            Ok(spectrum) => self.hand_off(Handoff::Spectrum(spectrum)),
            Err(err) => error!(%err, "spectrum transform failed"),
        }
    }

    fn on_error(&mut self, error: &BeatLightsError) {
        self.hand_off(Handoff::Failed(error.to_string()));
    }
}

/// Owns one capture session and the state shared with its subscribers.
pub struct PipelineManager {
    audio: AudioConfig,
    clock: Arc<dyn Clock>,
    handle: PipelineHandle,
    capture: AudioCapture,
    transform: SpectrumTransform,
    processor: Option<JoinHandle<()>>,
}

impl PipelineManager {
    /// Builds a pipeline driven by the wall clock.
    pub fn new(config: &AppConfig, device: Box<dyn CaptureDevice>) -> Result<Self> {
        Self::with_clock(config, device, Arc::new(SystemClock::start()))
    }

    /// Builds a pipeline; `config.settings` is applied on top of the component configs.
    pub fn with_clock(
        config: &AppConfig,
        device: Box<dyn CaptureDevice>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let processor = Processor {
            detector: BeatDetector::new(&config.audio, &config.detector)?,
            renderer: ColorRenderer::new(&config.renderer, config.modes.clone())?,
            visualization: config.renderer.visualization,
            brightness: MAX_BRIGHTNESS as u8,
            sinks: Vec::new(),
            subscribers: Vec::new(),
        };
        let handle = PipelineHandle {
            shared: Arc::new(Mutex::new(processor)),
        };
        handle.apply_settings(&config.settings)?;

        Ok(Self {
            audio: config.audio.clone(),
            clock,
            handle,
            capture: AudioCapture::new(config.audio.clone(), device)?,
            transform: SpectrumTransform::new(config.audio.block_size)?,
            processor: None,
        })
    }

    /// Control surface that can be moved to other threads.
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> Result<Receiver<PipelineEvent>> {
        self.handle.subscribe()
    }

    /// Applies settings-store values; they take effect on the next cycle.
    pub fn apply_settings(&self, settings: &Settings) -> Result<()> {
        self.handle.apply_settings(settings)
    }

    /// True while the capture loop is delivering blocks.
    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    /// Starts capture and processing threads.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(BeatLightsError::config("pipeline is already running"));
        }
        // A session that ended on a device error is closed before a new one starts.
        self.stop()?;

        let (slot, inbox) = bounded::<Handoff>(1);
        let producer = Producer {
            transform: SpectrumTransform::new(self.audio.block_size)?,
            slot,
            evict: inbox.clone(),
        };

        let shared = Arc::clone(&self.handle.shared);
        let clock = Arc::clone(&self.clock);
        let processor = thread::Builder::new()
            .name("beat-processor".into())
            .spawn(move || process_loop(&inbox, &shared, clock.as_ref()))?;
        self.processor = Some(processor);

        if let Err(err) = self.capture.start(producer) {
            // The producer was dropped, so the processing loop ends on its own.
            self.join_processor()?;
            return Err(err);
        }
        info!(
            sample_rate = self.audio.sample_rate,
            block_size = self.audio.block_size,
            "pipeline started"
        );
        Ok(())
    }

    /// Stops capture, drains processing, and publishes the all-off frame once.
    pub fn stop(&mut self) -> Result<()> {
        if self.processor.is_none() {
            return Ok(());
        }

        self.capture.stop()?;
        self.join_processor()?;
        self.handle.lock()?.shutdown();
        info!("pipeline stopped");
        Ok(())
    }

    /// Processes one block synchronously on the caller's thread.
    pub fn feed_block(&mut self, samples: &[f32]) -> Result<()> {
        let spectrum = self.transform.process(samples)?;
        let now_ms = self.clock.now_ms();
        self.handle.lock()?.consume(&spectrum, now_ms)
    }

    /// Publishes the all-off frame and `Stopped` without a capture session.
    pub fn finish(&mut self) -> Result<()> {
        self.handle.lock()?.shutdown();
        Ok(())
    }

    fn join_processor(&mut self) -> Result<()> {
        if let Some(processor) = self.processor.take() {
            processor
                .join()
                .map_err(|_| BeatLightsError::Poisoned("beat processor thread"))?;
        }
        Ok(())
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(%err, "failed to stop pipeline");
        }
    }
}

impl fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineManager")
            .field("audio", &self.audio)
            .field("running", &self.is_running())
            .finish()
    }
}

fn process_loop(inbox: &Receiver<Handoff>, shared: &Mutex<Processor>, clock: &dyn Clock) {
    for message in inbox.iter() {
        let mut processor = match shared.lock() {
            Ok(processor) => processor,
            Err(_) => {
                error!("pipeline state poisoned, processing halted");
                return;
            }
        };
        match message {
            Handoff::Spectrum(spectrum) => {
                if let Err(err) = processor.consume(&spectrum, clock.now_ms()) {
                    error!(%err, "failed to process block");
                }
            }
            Handoff::Failed(reason) => processor.publish(PipelineEvent::CaptureFailed(reason)),
        }
    }
    debug!("processing loop finished");
}
