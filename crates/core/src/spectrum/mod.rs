use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use tracing::debug;

use crate::{BeatLightsError, Result};

/// Unnormalised frequency-domain view of one audio block.
///
/// Holds the first `N/2` complex bins of a real FFT of `N` samples; the
/// Nyquist bin is dropped so that the bin count divides evenly into sub-bands.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Spectrum {
    bins: Vec<Complex32>,
}

impl Spectrum {
    pub fn from_bins(bins: Vec<Complex32>) -> Self {
        Self { bins }
    }

    pub fn zeroed(len: usize) -> Self {
        Self {
            bins: vec![Complex32::new(0.0, 0.0); len],
        }
    }

    pub fn bins(&self) -> &[Complex32] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Squared magnitude `re² + im²` of bin `index`; callers keep `index < len()`.
    pub(crate) fn power(&self, index: usize) -> f32 {
        self.bins[index].norm_sqr()
    }

    /// Plain magnitude per bin, as republished on the spectrum stream.
    pub fn magnitudes(&self) -> Vec<f32> {
        self.bins.iter().map(|bin| bin.norm()).collect()
    }
}

/// Real-input FFT of fixed-size blocks.
///
/// Buffers are planned once; [`SpectrumTransform::process_into`] performs no
/// allocation.
pub struct SpectrumTransform {
    block_size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    output: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl SpectrumTransform {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size < 2 || block_size % 2 != 0 {
            return Err(BeatLightsError::config(format!(
                "block size {block_size} must be even and at least 2"
            )));
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(block_size);
        let input = plan.make_input_vec();
        let output = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();

        debug!(block_size, bins = block_size / 2, "spectrum transform planned");

        Ok(Self {
            block_size,
            plan,
            input,
            output,
            scratch,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of bins in every produced [`Spectrum`].
    pub fn bins(&self) -> usize {
        self.block_size / 2
    }

    pub fn process(&mut self, block: &[f32]) -> Result<Spectrum> {
        let mut spectrum = Spectrum::zeroed(self.bins());
        self.process_into(block, &mut spectrum)?;
        Ok(spectrum)
    }

    /// Transforms `block` into `out`, reusing `out`'s storage.
    pub fn process_into(&mut self, block: &[f32], out: &mut Spectrum) -> Result<()> {
        if block.len() != self.block_size {
            return Err(BeatLightsError::InvalidInput(
                "block length does not match the planned transform size",
            ));
        }

        self.input.copy_from_slice(block);
        self.plan
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)?;

        let bins = self.bins();
        out.bins.clear();
        out.bins.extend_from_slice(&self.output[..bins]);
        Ok(())
    }
}

impl fmt::Debug for SpectrumTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumTransform")
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn tone(block_size: usize, bin: usize, amplitude: f32) -> Vec<f32> {
        (0..block_size)
            .map(|n| amplitude * (2.0 * PI * bin as f32 * n as f32 / block_size as f32).sin())
            .collect()
    }

    #[test]
    fn produces_half_the_block_as_bins() {
        let mut transform = SpectrumTransform::new(512).unwrap();
        let spectrum = transform.process(&vec![0.0; 512]).unwrap();
        assert_eq!(spectrum.len(), 256);
        assert!(spectrum.magnitudes().iter().all(|m| *m == 0.0));
    }

    #[test]
    fn pure_tone_lands_in_its_bin_unnormalised() {
        let mut transform = SpectrumTransform::new(512).unwrap();
        let spectrum = transform.process(&tone(512, 8, 1.0)).unwrap();
        let magnitudes = spectrum.magnitudes();

        let (peak, value) = magnitudes
            .iter()
            .enumerate()
            .fold((0, 0.0_f32), |best, (i, m)| if *m > best.1 { (i, *m) } else { best });
        assert_eq!(peak, 8);
        assert!((value - 256.0).abs() < 0.5);
    }

    #[test]
    fn is_deterministic_and_reuses_output() {
        let mut transform = SpectrumTransform::new(64).unwrap();
        let block = tone(64, 3, 0.5);
        let first = transform.process(&block).unwrap();
        let mut second = Spectrum::default();
        transform.process_into(&block, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_mismatched_blocks() {
        let mut transform = SpectrumTransform::new(64).unwrap();
        assert!(matches!(
            transform.process(&[0.0; 32]),
            Err(BeatLightsError::InvalidInput(_))
        ));
        assert!(SpectrumTransform::new(63).unwrap_err().is_config());
    }
}
