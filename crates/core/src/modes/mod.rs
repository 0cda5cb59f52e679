//! Visualisation modes and their colour profiles.
//!
//! The association between a [`Mode`] and its palette, interval and detector
//! sensitivity lives in a [`ModeTable`] keyed by the mode itself. The table is
//! configuration data and can be replaced wholesale from a config file.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{BeatLightsError, Result};

/// Plain 8-bit RGB colour. Serialised as `"#RRGGBB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Builds a colour from a packed `0xRRGGBB` value.
    pub const fn from_u32(packed: u32) -> Self {
        Self {
            r: (packed >> 16) as u8,
            g: (packed >> 8) as u8,
            b: packed as u8,
        }
    }

    /// Parses `#RRGGBB` or `RRGGBB`.
    pub fn from_hex(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BeatLightsError::config(format!(
                "colour `{value}` must have six hex digits"
            )));
        }
        let packed = u32::from_str_radix(digits, 16)
            .map_err(|_| BeatLightsError::config(format!("colour `{value}` is not hex")))?;
        Ok(Self::from_u32(packed))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl TryFrom<String> for Rgb {
    type Error = BeatLightsError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

/// Musical style the colour renderer is tuned for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Automatic,
    Pop,
    Rap,
    Rock,
    Dance,
    Electro,
    Romantic,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Automatic,
        Mode::Pop,
        Mode::Rap,
        Mode::Rock,
        Mode::Dance,
        Mode::Electro,
        Mode::Romantic,
    ];

    /// Picks a mode from the number of beats counted in one auto-mode window.
    pub fn from_beat_count(beats: u32) -> Self {
        match beats {
            0..=29 => Mode::Romantic,
            30..=39 => Mode::Rap,
            40..=49 => Mode::Rock,
            50..=59 => Mode::Dance,
            60..=69 => Mode::Pop,
            70..=79 => Mode::Electro,
            _ => Mode::Automatic,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Automatic => "automatic",
            Mode::Pop => "pop",
            Mode::Rap => "rap",
            Mode::Rock => "rock",
            Mode::Dance => "dance",
            Mode::Electro => "electro",
            Mode::Romantic => "romantic",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = BeatLightsError;

    fn from_str(value: &str) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "automatic" | "auto" => Ok(Mode::Automatic),
            "pop" => Ok(Mode::Pop),
            "rap" => Ok(Mode::Rap),
            "rock" => Ok(Mode::Rock),
            "dance" => Ok(Mode::Dance),
            "electro" => Ok(Mode::Electro),
            "romantic" => Ok(Mode::Romantic),
            _ => Err(BeatLightsError::config(format!("unknown mode `{value}`"))),
        }
    }
}

/// Colours, pacing and detector weight associated with one [`Mode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeProfile {
    pub palette: Vec<Rgb>,
    pub off_color: Rgb,
    #[serde(default)]
    pub off_brightness: u8,
    pub interval_ms: u64,
    pub sensitivity: f32,
}

impl ModeProfile {
    fn builtin(palette: &[u32], off_color: u32, sensitivity: f32) -> Self {
        Self {
            palette: palette.iter().copied().map(Rgb::from_u32).collect(),
            off_color: Rgb::from_u32(off_color),
            off_brightness: 0,
            interval_ms: 2_000,
            sensitivity,
        }
    }

    fn validate(&self, mode: Mode) -> Result<()> {
        if self.palette.is_empty() {
            return Err(BeatLightsError::config(format!(
                "mode `{mode}` has an empty palette"
            )));
        }
        if self.interval_ms == 0 {
            return Err(BeatLightsError::config(format!(
                "mode `{mode}` needs a positive colour interval"
            )));
        }
        if self.sensitivity.is_nan() || self.sensitivity < 0.0 {
            return Err(BeatLightsError::InvalidSensitivity(self.sensitivity));
        }
        Ok(())
    }
}

/// Complete mapping from every [`Mode`] to its [`ModeProfile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<Mode, ModeProfile>",
    into = "BTreeMap<Mode, ModeProfile>"
)]
pub struct ModeTable {
    profiles: BTreeMap<Mode, ModeProfile>,
}

impl ModeTable {
    /// Validates that every mode has a usable profile.
    pub fn new(profiles: BTreeMap<Mode, ModeProfile>) -> Result<Self> {
        for mode in Mode::ALL {
            match profiles.get(&mode) {
                Some(profile) => profile.validate(mode)?,
                None => {
                    return Err(BeatLightsError::config(format!(
                        "mode table is missing `{mode}`"
                    )))
                }
            }
        }
        Ok(Self { profiles })
    }

    pub fn profile(&self, mode: Mode) -> &ModeProfile {
        // `new` guarantees every mode is present.
        &self.profiles[&mode]
    }

    /// Replaces one profile after validating it.
    pub fn set_profile(&mut self, mode: Mode, profile: ModeProfile) -> Result<()> {
        profile.validate(mode)?;
        self.profiles.insert(mode, profile);
        Ok(())
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        let profiles = BTreeMap::from([
            (
                Mode::Automatic,
                ModeProfile::builtin(&[0xC40D00, 0xBAA702, 0x0078C4, 0x00AD1D], 0xFFFFFF, 1.35),
            ),
            (
                Mode::Pop,
                ModeProfile::builtin(&[0xC40D00, 0xBAA702, 0x0078C4, 0x00AD1D], 0xFFDC00, 1.35),
            ),
            (
                Mode::Rap,
                ModeProfile::builtin(&[0xBA9F02, 0xC41C0A, 0xAAAAAA], 0xFF9B0C, 1.6),
            ),
            (
                Mode::Rock,
                ModeProfile::builtin(&[0xBA9C02, 0xC48C0A, 0xC44D0A, 0xBA2509], 0xFF6E4D, 1.5),
            ),
            (
                Mode::Dance,
                ModeProfile::builtin(&[0xBA0276, 0x04B1BA, 0x0A59C4], 0x396FFF, 1.42),
            ),
            (
                Mode::Electro,
                ModeProfile::builtin(&[0x0039AD, 0x8C03BA, 0x0AAAC4, 0x04BA5A], 0x3799FF, 1.2),
            ),
            (
                Mode::Romantic,
                ModeProfile::builtin(&[0xFF24DB, 0xE8680C, 0xFF4839, 0xF3FF97], 0xE8478A, 1.6),
            ),
        ]);
        Self { profiles }
    }
}

impl TryFrom<BTreeMap<Mode, ModeProfile>> for ModeTable {
    type Error = BeatLightsError;

    fn try_from(value: BTreeMap<Mode, ModeProfile>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ModeTable> for BTreeMap<Mode, ModeProfile> {
    fn from(value: ModeTable) -> Self {
        value.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_count_ladder_uses_exact_breakpoints() {
        assert_eq!(Mode::from_beat_count(0), Mode::Romantic);
        assert_eq!(Mode::from_beat_count(29), Mode::Romantic);
        assert_eq!(Mode::from_beat_count(30), Mode::Rap);
        assert_eq!(Mode::from_beat_count(40), Mode::Rock);
        assert_eq!(Mode::from_beat_count(45), Mode::Rock);
        assert_eq!(Mode::from_beat_count(49), Mode::Rock);
        assert_eq!(Mode::from_beat_count(50), Mode::Dance);
        assert_eq!(Mode::from_beat_count(60), Mode::Pop);
        assert_eq!(Mode::from_beat_count(79), Mode::Electro);
        assert_eq!(Mode::from_beat_count(80), Mode::Automatic);
    }

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!("ROCK".parse::<Mode>().unwrap(), Mode::Rock);
        assert_eq!("auto".parse::<Mode>().unwrap(), Mode::Automatic);
        assert!("polka".parse::<Mode>().unwrap_err().is_config());
    }

    #[test]
    fn default_table_matches_builtin_profiles() {
        let table = ModeTable::default();
        assert_eq!(table.profile(Mode::Rap).palette.len(), 3);
        assert_eq!(table.profile(Mode::Dance).sensitivity, 1.42);
        assert_eq!(table.profile(Mode::Electro).off_color, Rgb::from_u32(0x3799FF));
        assert!(Mode::ALL
            .iter()
            .all(|mode| table.profile(*mode).interval_ms == 2_000));
    }

    #[test]
    fn rejects_incomplete_tables() {
        let mut profiles: BTreeMap<Mode, ModeProfile> = ModeTable::default().into();
        profiles.remove(&Mode::Pop);
        let err = ModeTable::new(profiles).unwrap_err();
        assert!(format!("{err}").contains("pop"));
    }

    #[test]
    fn rejects_empty_palettes() {
        let mut table = ModeTable::default();
        let mut profile = table.profile(Mode::Rock).clone();
        profile.palette.clear();
        assert!(table.set_profile(Mode::Rock, profile).is_err());
    }

    #[test]
    fn colours_round_trip_through_json() {
        let table = ModeTable::default();
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.contains("\"#C40D00\""));
        let parsed: ModeTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn parses_hex_colours() {
        assert_eq!(Rgb::from_hex("#0078C4").unwrap(), Rgb::new(0x00, 0x78, 0xC4));
        assert_eq!(Rgb::from_hex("ff24db").unwrap(), Rgb::new(0xFF, 0x24, 0xDB));
        assert!(Rgb::from_hex("#12345").is_err());
        assert!(Rgb::from_hex("#zzzzzz").is_err());
        // from_str_radix alone would take a sign.
        assert!(Rgb::from_hex("+12345").is_err());
        assert!(Rgb::from_hex("#-12345").is_err());
        assert!(Rgb::from_hex("##12345").is_err());
    }
}
