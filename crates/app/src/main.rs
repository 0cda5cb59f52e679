use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use beat_lights_core::{
    AppConfig, CaptureDevice, LightSink, Mode, PipelineEvent, PipelineManager, Rgb, Signal,
    SyntheticDevice, VisualizationKind,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

fn main() -> beat_lights_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            signal,
            tone_hz,
            seconds,
            pipeline,
        } => run_simulate(signal, tone_hz, seconds, &pipeline),
        #[cfg(feature = "device")]
        Commands::Live {
            device,
            seconds,
            pipeline,
        } => run_live(device, seconds, &pipeline),
    }
}

fn run_simulate(
    signal: SignalKind,
    tone_hz: f32,
    seconds: u64,
    options: &PipelineOptions,
) -> beat_lights_core::Result<()> {
    let signal = match signal {
        SignalKind::Silence => Signal::Silence,
        SignalKind::Tone => Signal::Tone {
            frequency: tone_hz,
            amplitude: 0.5,
        },
        SignalKind::Pulse => Signal::Pulse {
            frequency: tone_hz,
            amplitude: 0.8,
            period_ms: 500,
            length_ms: 60,
        },
    };
    tracing::info!(?signal, seconds, "starting simulation");

    let device = SyntheticDevice::new(signal).realtime();
    run_session(Box::new(device), Some(seconds), options)
}

#[cfg(feature = "device")]
fn run_live(
    device: Option<String>,
    seconds: Option<u64>,
    options: &PipelineOptions,
) -> beat_lights_core::Result<()> {
    tracing::info!(?device, "starting live mode");

    let device = match device {
        Some(name) => beat_lights_core::CpalDevice::named(name),
        None => beat_lights_core::CpalDevice::new(),
    };
    run_session(Box::new(device), seconds, options)
}

fn run_session(
    device: Box<dyn CaptureDevice>,
    seconds: Option<u64>,
    options: &PipelineOptions,
) -> beat_lights_core::Result<()> {
    let config = options.load_config()?;
    let mut pipeline = PipelineManager::new(&config, device)?;
    options.apply(&pipeline)?;

    let lights = (1..=options.lights).map(|id| id.to_string()).collect();
    pipeline.handle().attach_sink(Box::new(LogSink), lights)?;
    let events = pipeline.subscribe()?;

    pipeline.start()?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(PipelineEvent::CaptureFailed(reason)) => {
                tracing::error!(%reason, "capture failed, ending session");
                break;
            }
            Ok(event) => report(&event),
            Err(err) if err.is_timeout() => continue,
            Err(_) => break,
        }
    }
    pipeline.stop()?;

    for event in events.try_iter() {
        report(&event);
    }
    Ok(())
}

fn report(event: &PipelineEvent) {
    match event {
        PipelineEvent::Spectrum(magnitudes) => {
            let peak = magnitudes.iter().copied().fold(0.0_f32, f32::max);
            tracing::trace!(bins = magnitudes.len(), peak, "spectrum");
        }
        PipelineEvent::Beats(beats) if beats.is_empty() => {}
        PipelineEvent::Beats(beats) => {
            let kinds: Vec<String> = beats.iter().map(|beat| beat.kind.to_string()).collect();
            tracing::info!(beats = ?kinds, "beat");
        }
        PipelineEvent::Colors(frame) => {
            let slots: Vec<String> = frame
                .lights
                .iter()
                .map(|light| format!("{}@{}", light.color, light.brightness))
                .collect();
            tracing::debug!(?slots, "colours");
        }
        PipelineEvent::ModeChanged(mode) => tracing::info!(%mode, "mode"),
        PipelineEvent::CaptureFailed(reason) => tracing::error!(%reason, "capture failed"),
        PipelineEvent::Stopped => tracing::info!("session stopped"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Stand-in for a bridge client: logs every light command.
struct LogSink;

impl LightSink for LogSink {
    fn set_color(&mut self, light: &str, color: Rgb) {
        tracing::debug!(light, %color, "set colour");
    }

    fn set_brightness(&mut self, light: &str, brightness: u8) {
        tracing::debug!(light, brightness, "set brightness");
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives coloured lights from live beat detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline on a generated signal instead of a microphone.
    Simulate {
        #[arg(long, value_enum, default_value_t = SignalKind::Pulse)]
        signal: SignalKind,
        /// Frequency of the tone or pulse in Hz.
        #[arg(long, default_value_t = 60.0)]
        tone_hz: f32,
        /// How long to run before stopping.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[command(flatten)]
        pipeline: PipelineOptions,
    },
    /// Listen to the default (or named) microphone.
    #[cfg(feature = "device")]
    Live {
        /// Substring of the input device name to use.
        #[arg(long)]
        device: Option<String>,
        /// Stop after this many seconds; runs until the device fails otherwise.
        #[arg(long)]
        seconds: Option<u64>,
        #[command(flatten)]
        pipeline: PipelineOptions,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SignalKind {
    Silence,
    Tone,
    Pulse,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Visualization {
    Beat,
    Frequency,
}

#[derive(Args, Debug)]
struct PipelineOptions {
    /// JSON configuration file; missing sections use defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Start in a fixed mode; `automatic` leaves auto-mode in charge.
    #[arg(long)]
    mode: Option<Mode>,
    /// Beat sensitivity in percent, 0-100.
    #[arg(long)]
    sensitivity: Option<f32>,
    /// Minimum delay between light updates in milliseconds.
    #[arg(long)]
    delay: Option<u32>,
    /// Restrict detection to sub-bands `low:high`.
    #[arg(long, value_parser = parse_range)]
    manual_range: Option<(i64, i64)>,
    #[arg(long, value_enum)]
    visualization: Option<Visualization>,
    /// Number of lights attached to the logging sink.
    #[arg(long, default_value_t = 3)]
    lights: usize,
}

impl PipelineOptions {
    fn load_config(&self) -> beat_lights_core::Result<AppConfig> {
        match &self.config {
            Some(path) => AppConfig::from_path(path),
            None => Ok(AppConfig::live_defaults()),
        }
    }

    fn apply(&self, pipeline: &PipelineManager) -> beat_lights_core::Result<()> {
        let handle = pipeline.handle();
        if let Some(mode) = self.mode {
            handle.set_mode(mode)?;
        }
        if let Some(percent) = self.sensitivity {
            handle.set_sensitivity_percent(percent)?;
        }
        if let Some(delay) = self.delay {
            handle.set_delay(delay)?;
        }
        if let Some((low, high)) = self.manual_range {
            handle.set_manual_range(low, high)?;
        }
        if let Some(kind) = self.visualization {
            handle.set_visualization(match kind {
                Visualization::Beat => VisualizationKind::Beat,
                Visualization::Frequency => VisualizationKind::Frequency,
            })?;
        }
        Ok(())
    }
}

fn parse_range(value: &str) -> Result<(i64, i64), String> {
    let (low, high) = value
        .split_once(':')
        .ok_or_else(|| format!("expected `low:high`, got `{value}`"))?;
    let low = low.trim().parse().map_err(|err| format!("{err}"))?;
    let high = high.trim().parse().map_err(|err| format!("{err}"))?;
    Ok((low, high))
}
