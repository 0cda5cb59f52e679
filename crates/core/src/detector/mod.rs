//! Sub-band energy beat detection.
//!
//! Each spectrum is folded into `K` contiguous sub-bands. A band is "beating"
//! when its energy rises above both a fixed floor and its own recent average
//! weighted by the sensitivity. Kick, snare and hat are read from fixed band
//! ranges; a manual range replaces all three with a single event type.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{AudioConfig, DetectorConfig},
    spectrum::Spectrum,
    BeatLightsError, Result,
};

/// Weight of the newest magnitude in the per-bin running average.
const MAGNITUDE_BLEND: f32 = 0.09;

/// Empirical factor tightening the threshold multiplier for noisy bands.
const VARIANCE_WEIGHT: f32 = 0.002_571_4;

const MIN_SENSITIVITY: f32 = 1.0;
const MAX_SENSITIVITY: f32 = 2.0;

/// Class of a detected beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeatKind {
    Kick,
    Snare,
    Hat,
    Manual,
}

impl fmt::Display for BeatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BeatKind::Kick => "kick",
            BeatKind::Snare => "snare",
            BeatKind::Hat => "hat",
            BeatKind::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// A beat accepted during one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub kind: BeatKind,
    /// Strength in `[0, 1]`: how far the beating bands rose above their threshold.
    pub energy: f32,
}

/// Maps a 0..=100 sensitivity percentage to a threshold weight in `[1, 2]`.
///
/// Higher percentages yield lower weights, i.e. a more permissive detector.
pub fn sensitivity_from_percent(percent: f32) -> Result<f32> {
    if percent.is_nan() || !(0.0..=100.0).contains(&percent) {
        return Err(BeatLightsError::InvalidSensitivity(percent));
    }
    let inverted = (100.0 - percent) / 100.0;
    Ok(MIN_SENSITIVITY + (MAX_SENSITIVITY - MIN_SENSITIVITY) * inverted)
}

/// Inclusive range of sub-band indices evaluated in manual mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyRange {
    low: usize,
    high: usize,
}

impl FrequencyRange {
    /// Validates `0 <= low <= high < sub_bands`.
    pub fn new(low: i64, high: i64, sub_bands: usize) -> Result<Self> {
        if low < 0 || low > high || high >= sub_bands as i64 {
            return Err(BeatLightsError::InvalidFrequencyRange {
                low,
                high,
                sub_bands,
            });
        }
        Ok(Self {
            low: low as usize,
            high: high as usize,
        })
    }

    /// Builds a range from percentages of the band axis, as a slider would.
    pub fn from_percent(low: f32, high: f32, sub_bands: usize) -> Result<Self> {
        let span = sub_bands.saturating_sub(1) as f32;
        let to_band = |percent: f32| (percent / 100.0 * span).floor() as i64;
        if low.is_nan() || high.is_nan() || high > 100.0 {
            return Err(BeatLightsError::InvalidFrequencyRange {
                low: to_band(low),
                high: to_band(high),
                sub_bands,
            });
        }
        Self::new(to_band(low), to_band(high), sub_bands)
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    /// Number of bands in the range.
    pub fn width(&self) -> usize {
        self.high - self.low + 1
    }
}

/// Fixed-length ring of the most recent energies of one sub-band.
#[derive(Debug, Clone)]
struct EnergyRing {
    slots: Vec<f32>,
    cursor: usize,
}

impl EnergyRing {
    fn new(len: usize) -> Self {
        Self {
            slots: vec![0.0; len],
            cursor: 0,
        }
    }

    /// Overwrites the oldest slot.
    fn push(&mut self, energy: f32) {
        self.slots[self.cursor] = energy;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Mean over the whole ring, unfilled slots count as zero.
    fn mean(&self) -> f32 {
        self.slots.iter().sum::<f32>() / self.slots.len() as f32
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = 0.0);
        self.cursor = 0;
    }
}

/// Stateful beat classifier fed with one [`Spectrum`] per block.
pub struct BeatDetector {
    bins: usize,
    sub_bands: usize,
    band_width: usize,
    threshold: f32,
    sensitivity: f32,
    min_beat_interval_ms: u64,
    last_beat_ms: Option<u64>,
    manual: Option<FrequencyRange>,
    magnitude: Vec<f32>,
    avg_magnitude: Vec<f32>,
    energy: Vec<f32>,
    variance: Vec<f32>,
    beat_values: Vec<f32>,
    average_energy: Vec<f32>,
    history: Vec<EnergyRing>,
}

impl BeatDetector {
    pub fn new(audio: &AudioConfig, config: &DetectorConfig) -> Result<Self> {
        audio.validate()?;
        config.validate(audio)?;

        let bins = audio.bins();
        let sub_bands = config.sub_bands;
        let history_len = audio.history_len();

        debug!(
            bins,
            sub_bands,
            history_len,
            sensitivity = config.sensitivity,
            "beat detector created"
        );

        Ok(Self {
            bins,
            sub_bands,
            band_width: bins / sub_bands,
            threshold: config.threshold,
            sensitivity: config.sensitivity,
            min_beat_interval_ms: config.min_beat_interval_ms,
            last_beat_ms: None,
            manual: None,
            magnitude: vec![0.0; bins],
            avg_magnitude: vec![0.0; bins],
            energy: vec![0.0; sub_bands],
            variance: vec![0.0; sub_bands],
            beat_values: vec![0.0; sub_bands],
            average_energy: vec![0.0; sub_bands],
            history: (0..sub_bands).map(|_| EnergyRing::new(history_len)).collect(),
        })
    }

    pub fn sub_bands(&self) -> usize {
        self.sub_bands
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    /// Sets the adaptive threshold weight directly. Negative values are rejected.
    pub fn set_sensitivity(&mut self, sensitivity: f32) -> Result<()> {
        if sensitivity.is_nan() || sensitivity < 0.0 {
            return Err(BeatLightsError::InvalidSensitivity(sensitivity));
        }
        self.sensitivity = sensitivity;
        Ok(())
    }

    pub fn set_sensitivity_percent(&mut self, percent: f32) -> Result<()> {
        self.sensitivity = sensitivity_from_percent(percent)?;
        Ok(())
    }

    pub fn min_beat_interval_ms(&self) -> u64 {
        self.min_beat_interval_ms
    }

    pub fn set_min_beat_interval_ms(&mut self, interval_ms: u64) {
        self.min_beat_interval_ms = interval_ms;
    }

    pub fn manual_range(&self) -> Option<FrequencyRange> {
        self.manual
    }

    /// Restricts detection to `low..=high`; kick, snare and hat are disabled
    /// until [`BeatDetector::clear_manual_range`] is called.
    pub fn set_manual_range(&mut self, low: i64, high: i64) -> Result<FrequencyRange> {
        let range = FrequencyRange::new(low, high, self.sub_bands)?;
        self.manual = Some(range);
        Ok(range)
    }

    /// Same as [`BeatDetector::set_manual_range`] with percentages of the band axis.
    pub fn set_manual_percent(&mut self, low: f32, high: f32) -> Result<FrequencyRange> {
        let range = FrequencyRange::from_percent(low, high, self.sub_bands)?;
        self.manual = Some(range);
        Ok(range)
    }

    pub fn clear_manual_range(&mut self) {
        self.manual = None;
    }

    /// Forgets the energy history and debounce timestamp, keeping tuning.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(EnergyRing::clear);
        self.avg_magnitude.iter_mut().for_each(|m| *m = 0.0);
        self.last_beat_ms = None;
    }

    /// Latest per-band energies.
    pub fn energies(&self) -> &[f32] {
        &self.energy
    }

    pub fn variances(&self) -> &[f32] {
        &self.variance
    }

    /// Per-band threshold multipliers of the latest pass.
    pub fn beat_values(&self) -> &[f32] {
        &self.beat_values
    }

    /// Per-band history averages the latest energies were compared against.
    pub fn average_energies(&self) -> &[f32] {
        &self.average_energy
    }

    /// Smoothed per-bin magnitudes.
    pub fn average_magnitudes(&self) -> &[f32] {
        &self.avg_magnitude
    }

    /// Runs one detection pass.
    pub fn process(&mut self, spectrum: &Spectrum, now_ms: u64) -> Result<Vec<BeatEvent>> {
        if spectrum.len() != self.bins {
            return Err(BeatLightsError::InvalidInput(
                "spectrum bin count does not match the detector",
            ));
        }

        self.measure(spectrum);
        Ok(self.classify(now_ms))
    }

    fn measure(&mut self, spectrum: &Spectrum) {
        for (i, bin) in spectrum.bins().iter().enumerate() {
            let magnitude = (2.0 * bin.norm()).sqrt();
            self.magnitude[i] = magnitude;
            self.avg_magnitude[i] =
                magnitude * MAGNITUDE_BLEND + self.avg_magnitude[i] * (1.0 - MAGNITUDE_BLEND);
        }

        let width = self.band_width as f32;
        for band in 0..self.sub_bands {
            let start = band * self.band_width;
            let members = &self.magnitude[start..start + self.band_width];

            let energy = members.iter().sum::<f32>() / width;
            let variance = members
                .iter()
                .map(|m| (m - energy) * (m - energy))
                .sum::<f32>()
                / width;

            self.energy[band] = energy;
            self.variance[band] = variance;
            self.beat_values[band] = self.sensitivity - VARIANCE_WEIGHT * variance;

            // Compare against the history that precedes this block.
            self.average_energy[band] = self.history[band].mean();
            self.history[band].push(energy);
        }
    }

    fn classify(&mut self, now_ms: u64) -> Vec<BeatEvent> {
        let gate_open = self
            .last_beat_ms
            .map(|last| now_ms.saturating_sub(last) >= self.min_beat_interval_ms)
            .unwrap_or(true);
        if !gate_open {
            return Vec::new();
        }

        let mut events = Vec::new();
        match self.manual {
            Some(range) => {
                if let Some(energy) = self.range_strength(range.low, range.high) {
                    events.push(BeatEvent {
                        kind: BeatKind::Manual,
                        energy,
                    });
                }
            }
            None => {
                let k = self.sub_bands;
                let ranges = [
                    (BeatKind::Kick, 0, 0),
                    (BeatKind::Snare, 1, k / 3),
                    (BeatKind::Hat, k / 2, k - 1),
                ];
                for (kind, low, high) in ranges {
                    if let Some(energy) = self.range_strength(low, high) {
                        events.push(BeatEvent { kind, energy });
                    }
                }
            }
        }

        if !events.is_empty() {
            self.last_beat_ms = Some(now_ms);
        }
        events
    }

    fn is_beat(&self, band: usize) -> bool {
        let energy = self.energy[band];
        energy > self.average_energy[band] * self.beat_values[band] && energy > self.threshold
    }

    /// Returns the event strength when more than a third of the range's span is beating.
    fn range_strength(&self, low: usize, high: usize) -> Option<f32> {
        if low > high || high >= self.sub_bands {
            return None;
        }

        let required = (high - low) / 3;
        let mut beating = 0;
        let mut strength = 0.0;
        for band in low..=high {
            if self.is_beat(band) {
                let energy = self.energy[band];
                let reference = (self.average_energy[band] * self.beat_values[band])
                    .max(self.threshold);
                strength += 1.0 - reference / energy;
                beating += 1;
            }
        }

        (beating > required).then(|| (strength / beating as f32).clamp(0.0, 1.0))
    }
}

impl fmt::Debug for BeatDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatDetector")
            .field("bins", &self.bins)
            .field("sub_bands", &self.sub_bands)
            .field("sensitivity", &self.sensitivity)
            .field("min_beat_interval_ms", &self.min_beat_interval_ms)
            .field("manual", &self.manual)
            .field("last_beat_ms", &self.last_beat_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use realfft::num_complex::Complex32;

    use super::*;

    fn build_detector() -> BeatDetector {
        BeatDetector::new(&AudioConfig::default(), &DetectorConfig::default()).unwrap()
    }

    /// Spectrum of 256 bins where the bins of `bands` (width 4) carry `value`.
    fn banded_spectrum(bands: std::ops::RangeInclusive<usize>, value: f32) -> Spectrum {
        let mut bins = vec![Complex32::new(0.0, 0.0); 256];
        for band in bands {
            for bin in &mut bins[band * 4..band * 4 + 4] {
                *bin = Complex32::new(value, 0.0);
            }
        }
        Spectrum::from_bins(bins)
    }

    #[test]
    fn sensitivity_percent_is_monotonic_and_bounded() {
        let mut previous = f32::INFINITY;
        for percent in 0..=100 {
            let value = sensitivity_from_percent(percent as f32).unwrap();
            assert!((1.0..=2.0).contains(&value));
            assert!(value <= previous);
            previous = value;
        }
        assert_eq!(sensitivity_from_percent(0.0).unwrap(), 2.0);
        assert_eq!(sensitivity_from_percent(100.0).unwrap(), 1.0);
        assert!(sensitivity_from_percent(-1.0).unwrap_err().is_config());
    }

    #[test]
    fn negative_sensitivity_is_rejected_not_clamped() {
        let mut detector = build_detector();
        assert!(detector.set_sensitivity(-0.1).is_err());
        assert_eq!(detector.sensitivity(), 1.35);
        detector.set_sensitivity(0.0).unwrap();
        assert_eq!(detector.sensitivity(), 0.0);
    }

    #[test]
    fn validates_frequency_ranges() {
        for low in 0..64 {
            for high in low..64 {
                assert!(FrequencyRange::new(low, high, 64).is_ok());
            }
        }
        assert!(FrequencyRange::new(5, 4, 64).is_err());
        assert!(FrequencyRange::new(-1, 4, 64).is_err());
        assert!(FrequencyRange::new(0, 64, 64).is_err());

        let range = FrequencyRange::from_percent(0.0, 100.0, 64).unwrap();
        assert_eq!((range.low(), range.high()), (0, 63));
        assert_eq!(FrequencyRange::from_percent(50.0, 50.0, 64).unwrap().low(), 31);
        assert!(FrequencyRange::from_percent(60.0, 40.0, 64).is_err());
    }

    #[test]
    fn silence_never_beats() {
        let mut detector = build_detector();
        let silence = Spectrum::zeroed(256);
        for cycle in 0..100 {
            assert!(detector.process(&silence, cycle * 23).unwrap().is_empty());
        }
    }

    #[test]
    fn band_energy_is_mean_magnitude() {
        let mut detector = build_detector();
        // |X| = 8 -> sqrt(2 * 8) = 4 per bin.
        detector.process(&banded_spectrum(3..=3, 8.0), 0).unwrap();
        assert!((detector.energies()[3] - 4.0).abs() < 1e-5);
        assert_eq!(detector.variances()[3], 0.0);
        assert!((detector.beat_values()[3] - 1.35).abs() < 1e-6);
        assert_eq!(detector.energies()[4], 0.0);
        assert!((detector.average_magnitudes()[12] - 0.36).abs() < 1e-5);
    }

    #[test]
    fn variance_tightens_the_multiplier() {
        let mut detector = build_detector();
        let mut bins = vec![Complex32::new(0.0, 0.0); 256];
        // magnitudes 0, 0, 10, 10 -> energy 5, variance 25.
        bins[2] = Complex32::new(50.0, 0.0);
        bins[3] = Complex32::new(50.0, 0.0);
        detector.process(&Spectrum::from_bins(bins), 0).unwrap();

        assert!((detector.energies()[0] - 5.0).abs() < 1e-4);
        assert!((detector.variances()[0] - 25.0).abs() < 1e-3);
        let expected = 1.35 - 0.002_571_4 * 25.0;
        assert!((detector.beat_values()[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn classifies_low_mid_and_high_ranges() {
        let mut detector = build_detector();
        let kick = detector.process(&banded_spectrum(0..=0, 50.0), 0).unwrap();
        assert_eq!(kick.len(), 1);
        assert_eq!(kick[0].kind, BeatKind::Kick);
        assert!((0.0..=1.0).contains(&kick[0].energy));

        let mut detector = build_detector();
        let snare = detector.process(&banded_spectrum(1..=21, 50.0), 0).unwrap();
        assert_eq!(snare.iter().map(|e| e.kind).collect::<Vec<_>>(), [BeatKind::Snare]);

        let mut detector = build_detector();
        let hat = detector.process(&banded_spectrum(32..=63, 50.0), 0).unwrap();
        assert_eq!(hat.iter().map(|e| e.kind).collect::<Vec<_>>(), [BeatKind::Hat]);

        let mut detector = build_detector();
        let all = detector.process(&banded_spectrum(0..=63, 50.0), 0).unwrap();
        assert_eq!(
            all.iter().map(|e| e.kind).collect::<Vec<_>>(),
            [BeatKind::Kick, BeatKind::Snare, BeatKind::Hat]
        );
    }

    #[test]
    fn snare_needs_more_than_a_third_of_its_span() {
        let mut detector = build_detector();
        // Span 1..=21 requires more than 6 beating bands.
        assert!(detector
            .process(&banded_spectrum(1..=6, 50.0), 0)
            .unwrap()
            .is_empty());

        let mut detector = build_detector();
        let events = detector.process(&banded_spectrum(1..=7, 50.0), 0).unwrap();
        assert_eq!(events[0].kind, BeatKind::Snare);
    }

    #[test]
    fn energy_floor_suppresses_faint_bands() {
        let mut detector = build_detector();
        // sqrt(2 * 0.001) ~= 0.045 stays below the 0.05 floor.
        assert!(detector
            .process(&banded_spectrum(0..=63, 0.001), 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn steady_signal_stops_beating_once_history_fills() {
        let mut detector = build_detector();
        let steady = banded_spectrum(0..=63, 20.0);

        let first = detector.process(&steady, 0).unwrap();
        assert!(!first.is_empty());

        let mut last = Vec::new();
        for cycle in 1..=100 {
            last = detector.process(&steady, cycle * 23).unwrap();
        }
        assert!(last.is_empty());
        assert!((detector.average_energies()[0] - detector.energies()[0]).abs() < 1e-4);
    }

    #[test]
    fn manual_range_only_emits_manual_events() {
        let mut detector = build_detector();
        detector.set_manual_range(10, 12).unwrap();

        let events = detector.process(&banded_spectrum(0..=63, 50.0), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BeatKind::Manual);

        let mut detector = build_detector();
        detector.set_manual_range(10, 12).unwrap();
        assert!(detector
            .process(&banded_spectrum(0..=0, 50.0), 0)
            .unwrap()
            .is_empty());

        detector.clear_manual_range();
        let events = detector.process(&banded_spectrum(0..=0, 500.0), 10).unwrap();
        assert_eq!(events[0].kind, BeatKind::Kick);
    }

    #[test]
    fn invalid_manual_ranges_leave_detector_untouched() {
        let mut detector = build_detector();
        assert!(detector.set_manual_range(3, 2).is_err());
        assert!(detector.set_manual_range(0, 64).is_err());
        assert!(detector.manual_range().is_none());
    }

    #[test]
    fn debounce_gates_all_ranges() {
        let mut detector = build_detector();
        detector.set_sensitivity(0.0).unwrap();
        detector.set_min_beat_interval_ms(100);
        let loud = banded_spectrum(0..=0, 50.0);

        let mut accepted = Vec::new();
        for cycle in 0..200u64 {
            let now = cycle * 10;
            if !detector.process(&loud, now).unwrap().is_empty() {
                accepted.push(now);
            }
        }

        assert_eq!(accepted.first(), Some(&0));
        for window_start in (0..2_000).step_by(10) {
            let in_window = accepted
                .iter()
                .filter(|t| **t >= window_start && **t < window_start + 500)
                .count();
            assert!(in_window <= 5);
        }
        assert!(accepted.windows(2).all(|pair| pair[1] - pair[0] >= 100));
    }

    #[test]
    fn rejects_mismatched_spectra() {
        let mut detector = build_detector();
        assert!(detector.process(&Spectrum::zeroed(128), 0).is_err());
    }

    #[test]
    fn reset_clears_history() {
        let mut detector = build_detector();
        let steady = banded_spectrum(0..=0, 20.0);
        for cycle in 0..50 {
            detector.process(&steady, cycle).unwrap();
        }
        detector.reset();
        let events = detector.process(&steady, 100).unwrap();
        assert_eq!(events[0].kind, BeatKind::Kick);
        assert_eq!(detector.average_energies()[0], 0.0);
    }
}
