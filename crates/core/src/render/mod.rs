//! Palette-driven colour state machine.
//!
//! The renderer cycles the active mode's palette on the mode interval and
//! modulates per-slot brightness from beat events or from the energy of three
//! frequency thirds. Updates are only emitted when the delay has elapsed and the
//! frame actually changed.

use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::{
    config::{RendererConfig, DELAY_RANGE_MS},
    detector::{BeatEvent, BeatKind},
    modes::{Mode, ModeProfile, ModeTable, Rgb},
    spectrum::Spectrum,
    BeatLightsError, Result,
};

/// Added to the log-power of a frequency third before it is scaled.
const DB_OFFSET: f32 = 20.0;
/// Level the adaptive dB maximum falls back to when it goes stale.
const MAX_DB_FLOOR: f32 = 30.0;
/// Beat brightness is `energy * BEAT_GAIN + BEAT_BASE`, clamped to a byte.
const BEAT_GAIN: f32 = 110.0;
const BEAT_BASE: f32 = 80.0;

/// Colour and brightness of one light slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightColor {
    pub color: Rgb,
    /// Alpha in `0..=255`; sinks rescale it to their own brightness range.
    pub brightness: u8,
}

/// Colours for every light slot, in slot order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorFrame {
    pub lights: Vec<LightColor>,
}

impl ColorFrame {
    pub fn is_dark(&self) -> bool {
        self.lights.iter().all(|light| light.brightness == 0)
    }
}

/// What a single renderer update produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderUpdate {
    /// Frame to forward to subscribers, if emission gating let it through.
    pub frame: Option<ColorFrame>,
    /// Mode picked by auto-mode when its evaluation window expired.
    pub auto_mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ColorState {
    palette_index: usize,
    color: Rgb,
}

#[derive(Debug)]
pub struct ColorRenderer {
    modes: ModeTable,
    mode: Mode,
    slots: Vec<ColorState>,
    last_color_change: Option<u64>,
    delay_ms: u32,
    last_emit_ms: Option<u64>,
    last_frame: Option<ColorFrame>,
    /// Permission from the settings store to switch modes automatically.
    mode_switch: bool,
    /// The user picked [`Mode::Automatic`]; any other explicit choice pins the mode.
    auto_selected: bool,
    auto_window_ms: u64,
    window_start: Option<u64>,
    beat_count: u32,
    max_db: f32,
    max_db_at: u64,
    max_db_window_ms: u64,
}

impl ColorRenderer {
    pub fn new(config: &RendererConfig, modes: ModeTable) -> Result<Self> {
        config.validate()?;

        let mode = Mode::default();
        let slots = initial_slots(modes.profile(mode), config.light_count);

        Ok(Self {
            modes,
            mode,
            slots,
            last_color_change: None,
            delay_ms: config.delay_ms,
            last_emit_ms: None,
            last_frame: None,
            mode_switch: config.auto_mode,
            auto_selected: true,
            auto_window_ms: config.auto_mode_window_ms,
            window_start: None,
            beat_count: 0,
            max_db: MAX_DB_FLOOR,
            max_db_at: 0,
            max_db_window_ms: config.max_db_window_ms,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn profile(&self) -> &ModeProfile {
        self.modes.profile(self.mode)
    }

    pub fn profile_for(&self, mode: Mode) -> &ModeProfile {
        self.modes.profile(mode)
    }

    pub fn light_count(&self) -> usize {
        self.slots.len()
    }

    /// Selects a mode explicitly and restarts the auto-mode window.
    ///
    /// Only [`Mode::Automatic`] lets auto-mode run, and then only while mode
    /// switching is enabled; any other mode stays until changed again.
    pub fn set_mode(&mut self, mode: Mode) {
        self.auto_selected = mode == Mode::Automatic;
        self.apply_mode(mode);
        self.restart_window();
    }

    /// True when beat density currently drives the mode.
    pub fn auto_mode(&self) -> bool {
        self.mode_switch && self.auto_selected
    }

    /// Enables or disables automatic mode switching.
    pub fn set_auto_mode(&mut self, enabled: bool) {
        self.mode_switch = enabled;
        self.restart_window();
    }

    /// Beats counted in the current auto-mode window.
    pub fn beat_count(&self) -> u32 {
        self.beat_count
    }

    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    pub fn set_delay(&mut self, delay_ms: u32) -> Result<()> {
        if !DELAY_RANGE_MS.contains(&delay_ms) {
            return Err(BeatLightsError::InvalidDelay(delay_ms));
        }
        self.delay_ms = delay_ms;
        Ok(())
    }

    /// Last frame that passed emission gating.
    pub fn last_emitted(&self) -> Option<&ColorFrame> {
        self.last_frame.as_ref()
    }

    /// Renders one detection pass. Slots 0, 1 and 2 follow kick, snare and hat;
    /// slots without a beat this pass drop to the mode's off brightness.
    pub fn update_beats(&mut self, events: &[BeatEvent], now_ms: u64) -> RenderUpdate {
        let auto_mode = self.evaluate_auto_mode(now_ms);
        self.beat_count = self.beat_count.saturating_add(events.len() as u32);

        let colors = self.advance_colors(now_ms);
        let off = self.profile().off_brightness;
        let mut lights: Vec<LightColor> = colors
            .into_iter()
            .map(|color| LightColor {
                color,
                brightness: off,
            })
            .collect();

        for event in events {
            let (slot, brightness) = match event.kind {
                BeatKind::Kick => (0, beat_brightness(event.energy)),
                BeatKind::Snare => (1, beat_brightness(event.energy)),
                BeatKind::Hat => (2, beat_brightness(event.energy)),
                BeatKind::Manual => (0, u8::MAX),
            };
            if let Some(light) = lights.get_mut(slot) {
                light.brightness = brightness;
            }
        }

        RenderUpdate {
            frame: self.gate(ColorFrame { lights }, now_ms),
            auto_mode,
        }
    }

    /// Renders the raw spectrum: slot `i` shows the log-power of frequency third `i % 3`.
    ///
    /// No beats are counted on this path, so auto-mode is suspended; its window
    /// starts afresh once beat rendering resumes.
    pub fn update_frequency(&mut self, spectrum: &Spectrum, now_ms: u64) -> RenderUpdate {
        self.restart_window();

        let levels = third_levels(spectrum);
        let loudest = levels.iter().copied().fold(0.0_f32, f32::max);
        if loudest > self.max_db {
            self.max_db = loudest;
            self.max_db_at = now_ms;
        } else if now_ms.saturating_sub(self.max_db_at) > self.max_db_window_ms {
            self.max_db = MAX_DB_FLOOR;
            self.max_db_at = now_ms;
        }

        let max_db = self.max_db;
        let colors = self.advance_colors(now_ms);
        let lights = colors
            .into_iter()
            .enumerate()
            .map(|(slot, color)| LightColor {
                color,
                brightness: (levels[slot % 3] / max_db * 255.0).clamp(0.0, 255.0) as u8,
            })
            .collect();

        RenderUpdate {
            frame: self.gate(ColorFrame { lights }, now_ms),
            auto_mode: None,
        }
    }

    /// Turns every slot off and returns the frame to publish once.
    pub fn stop(&mut self) -> ColorFrame {
        let off_color = self.profile().off_color;
        let frame = ColorFrame {
            lights: vec![
                LightColor {
                    color: off_color,
                    brightness: 0,
                };
                self.slots.len()
            ],
        };

        self.restart_window();
        self.last_color_change = None;
        self.last_emit_ms = None;
        self.last_frame = Some(frame.clone());
        frame
    }

    fn apply_mode(&mut self, mode: Mode) {
        if mode == self.mode {
            return;
        }
        info!(from = %self.mode, to = %mode, "colour mode changed");
        self.mode = mode;
        self.slots = initial_slots(self.modes.profile(mode), self.slots.len());
        self.last_color_change = None;
    }

    fn restart_window(&mut self) {
        self.window_start = None;
        self.beat_count = 0;
    }

    fn evaluate_auto_mode(&mut self, now_ms: u64) -> Option<Mode> {
        if !self.auto_mode() {
            return None;
        }

        let start = *self.window_start.get_or_insert(now_ms);
        if now_ms.saturating_sub(start) <= self.auto_window_ms {
            return None;
        }

        let mode = Mode::from_beat_count(self.beat_count);
        info!(beats = self.beat_count, %mode, "auto-mode window evaluated");
        self.apply_mode(mode);
        self.beat_count = 0;
        self.window_start = Some(now_ms);
        Some(mode)
    }

    /// Moves every slot to the next palette entry once the mode interval has passed.
    fn advance_colors(&mut self, now_ms: u64) -> Vec<Rgb> {
        let interval = self.modes.profile(self.mode).interval_ms;
        match self.last_color_change {
            None => self.last_color_change = Some(now_ms),
            Some(last) if now_ms.saturating_sub(last) > interval => {
                let palette = &self.modes.profile(self.mode).palette;
                for slot in &mut self.slots {
                    slot.palette_index = (slot.palette_index + 1) % palette.len();
                    slot.color = palette[slot.palette_index];
                }
                self.last_color_change = Some(now_ms);
            }
            Some(_) => {}
        }
        self.slots.iter().map(|slot| slot.color).collect()
    }

    fn gate(&mut self, frame: ColorFrame, now_ms: u64) -> Option<ColorFrame> {
        let delay_elapsed = self
            .last_emit_ms
            .map(|last| now_ms.saturating_sub(last) >= u64::from(self.delay_ms))
            .unwrap_or(true);
        if !delay_elapsed || self.last_frame.as_ref() == Some(&frame) {
            return None;
        }

        trace!(?frame, "colour frame emitted");
        self.last_emit_ms = Some(now_ms);
        self.last_frame = Some(frame.clone());
        Some(frame)
    }
}

/// Slot `s` starts at palette entry `s mod P` so that lights show different colours.
fn initial_slots(profile: &ModeProfile, count: usize) -> Vec<ColorState> {
    (0..count)
        .map(|slot| {
            let palette_index = slot % profile.palette.len();
            ColorState {
                palette_index,
                color: profile.palette[palette_index],
            }
        })
        .collect()
}

fn beat_brightness(energy: f32) -> u8 {
    (energy * BEAT_GAIN + BEAT_BASE).clamp(0.0, 255.0) as u8
}

/// Offset log-power of the low, mid and high third of the spectrum, floored at zero.
fn third_levels(spectrum: &Spectrum) -> [f32; 3] {
    let len = spectrum.len();
    let third = len / 3;
    if third == 0 {
        return [0.0; 3];
    }

    let mut levels = [0.0; 3];
    for (index, level) in levels.iter_mut().enumerate() {
        let start = index * third;
        let end = if index == 2 { len } else { start + third };
        let power = (start..end).map(|bin| spectrum.power(bin)).sum::<f32>() / (end - start) as f32;
        *level = (10.0 * power.log10() + DB_OFFSET).max(0.0);
    }
    levels
}
