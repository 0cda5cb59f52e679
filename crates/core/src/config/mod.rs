use std::{ops::RangeInclusive, path::Path};

use serde::{Deserialize, Serialize};

use crate::{modes::ModeTable, BeatLightsError, Result};

/// Accepted emission delay in milliseconds.
pub const DELAY_RANGE_MS: RangeInclusive<u32> = 20..=5_000;

/// Highest brightness value understood by the light sink.
pub const MAX_BRIGHTNESS: u32 = 254;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub detector: DetectorConfig,
    pub renderer: RendererConfig,
    pub settings: Settings,
    pub modes: ModeTable,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file. Missing sections fall back to defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.detector.validate(&self.audio)?;
        self.renderer.validate()?;
        self.settings.validate()
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            block_size: 512,
        }
    }
}

impl AudioConfig {
    /// Number of spectrum bins produced per block.
    pub fn bins(&self) -> usize {
        self.block_size / 2
    }

    /// Blocks per second, which is also the energy history length.
    pub fn history_len(&self) -> usize {
        self.sample_rate as usize / self.block_size.max(1)
    }

    /// Wall-clock duration of one block in milliseconds.
    pub fn block_duration_ms(&self) -> f64 {
        self.block_size as f64 * 1_000.0 / self.sample_rate.max(1) as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size < 2 || self.block_size % 2 != 0 {
            return Err(BeatLightsError::config(format!(
                "block size {} must be even and at least 2",
                self.block_size
            )));
        }
        if self.history_len() == 0 {
            return Err(BeatLightsError::config(format!(
                "sample rate {} is lower than the block size {}",
                self.sample_rate, self.block_size
            )));
        }
        Ok(())
    }
}

/// Beat detector tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of sub-bands the spectrum is divided into.
    pub sub_bands: usize,
    /// Fixed energy floor a band must exceed to count as beating.
    pub threshold: f32,
    /// Minimum gap between two accepted detection passes.
    pub min_beat_interval_ms: u64,
    /// Adaptive threshold weight.
    pub sensitivity: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sub_bands: 64,
            threshold: 0.05,
            min_beat_interval_ms: 0,
            sensitivity: 1.35,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self, audio: &AudioConfig) -> Result<()> {
        let bins = audio.bins();
        if self.sub_bands == 0 || bins % self.sub_bands != 0 {
            return Err(BeatLightsError::config(format!(
                "{} sub-bands do not evenly divide {} bins",
                self.sub_bands, bins
            )));
        }
        if self.sensitivity.is_nan() || self.sensitivity < 0.0 {
            return Err(BeatLightsError::InvalidSensitivity(self.sensitivity));
        }
        if self.threshold.is_nan() || self.threshold < 0.0 {
            return Err(BeatLightsError::config(format!(
                "energy threshold {} must not be negative",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Which renderer input drives the lights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizationKind {
    /// Lights react to detected beat events.
    #[default]
    Beat,
    /// Lights follow the energy of three frequency thirds; the detector is bypassed.
    Frequency,
}

/// Colour renderer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub light_count: usize,
    pub delay_ms: u32,
    pub auto_mode: bool,
    pub auto_mode_window_ms: u64,
    pub max_db_window_ms: u64,
    pub visualization: VisualizationKind,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            light_count: 3,
            delay_ms: 50,
            auto_mode: true,
            auto_mode_window_ms: 15_000,
            max_db_window_ms: 5_000,
            visualization: VisualizationKind::Beat,
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        if self.light_count == 0 {
            return Err(BeatLightsError::config("at least one light slot is required"));
        }
        if !DELAY_RANGE_MS.contains(&self.delay_ms) {
            return Err(BeatLightsError::InvalidDelay(self.delay_ms));
        }
        if self.auto_mode_window_ms == 0 {
            return Err(BeatLightsError::config(
                "auto-mode window must be longer than zero",
            ));
        }
        Ok(())
    }
}

/// The user-facing knobs persisted by the settings store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Beat sensitivity as a percentage, 0..=100. `null` keeps `detector.sensitivity`.
    pub sensitivity: Option<u32>,
    /// Minimum delay between two light updates, 20..=5000 ms.
    pub delay_ms: u32,
    /// Whether the mode is picked automatically from beat density.
    pub mode_switch: bool,
    /// Maximum light brightness, 0..=254.
    pub brightness: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sensitivity: Some(40),
            delay_ms: 200,
            mode_switch: true,
            brightness: 150,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if let Some(percent) = self.sensitivity.filter(|percent| *percent > 100) {
            return Err(BeatLightsError::InvalidSensitivity(percent as f32));
        }
        if !DELAY_RANGE_MS.contains(&self.delay_ms) {
            return Err(BeatLightsError::InvalidDelay(self.delay_ms));
        }
        if self.brightness > MAX_BRIGHTNESS {
            return Err(BeatLightsError::InvalidBrightness(self.brightness));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.history_len(), 43);
        assert_eq!(config.audio.bins(), 256);
    }

    #[test]
    fn rejects_sub_bands_that_do_not_divide_bins() {
        let mut config = AppConfig::default();
        config.detector.sub_bands = 60;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn rejects_odd_block_sizes() {
        let mut config = AppConfig::default();
        config.audio.block_size = 511;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_settings() {
        let mut settings = Settings::default();
        settings.delay_ms = 10;
        assert!(matches!(
            settings.validate(),
            Err(BeatLightsError::InvalidDelay(10))
        ));

        let mut settings = Settings::default();
        settings.brightness = 255;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.sensitivity = Some(101);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "audio": { "block_size": 1024 }, "settings": { "brightness": 200 } }"#)
                .unwrap();
        assert_eq!(config.audio.block_size, 1024);
        assert_eq!(config.audio.sample_rate, 22_050);
        assert_eq!(config.settings.brightness, 200);
        assert_eq!(config.settings.delay_ms, 200);
        assert_eq!(config.renderer.visualization, VisualizationKind::Beat);
        config.validate().unwrap();
    }

    #[test]
    fn null_settings_sensitivity_defers_to_detector() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "detector": { "sensitivity": 1.8 }, "settings": { "sensitivity": null } }"#,
        )
        .unwrap();
        assert_eq!(config.settings.sensitivity, None);
        assert_eq!(config.detector.sensitivity, 1.8);
        config.validate().unwrap();
    }
}
