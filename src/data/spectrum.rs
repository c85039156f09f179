//! Spectrum sample type.
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::error::{SpectroError, SpectroResult};

/// Leading bins discarded from every raw read.
///
/// The detector reports unreliable values in its first pixels.
pub const DEFAULT_ARTIFACT_BINS: usize = 30;

/// One acquired spectrum.
///
/// Immutable once built: processing produces a new sample that shares the
/// wavelength axis with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumSample {
    wavelengths: Arc<[f64]>,
    intensities: Arc<[f64]>,
    timestamp: DateTime<Local>,
}

impl SpectrumSample {
    /// Build a sample, checking that both axes have the same length.
    pub fn new(
        wavelengths: impl Into<Arc<[f64]>>,
        intensities: impl Into<Arc<[f64]>>,
        timestamp: DateTime<Local>,
    ) -> SpectroResult<Self> {
        let wavelengths = wavelengths.into();
        let intensities = intensities.into();
        if wavelengths.len() != intensities.len() {
            return Err(SpectroError::SpectrumShape {
                wavelengths: wavelengths.len(),
                intensities: intensities.len(),
            });
        }
        Ok(Self {
            wavelengths,
            intensities,
            timestamp,
        })
    }

    /// Build a sample from a raw instrument read, dropping `artifact_bins` leading bins.
    pub fn from_raw(
        mut wavelengths: Vec<f64>,
        mut intensities: Vec<f64>,
        artifact_bins: usize,
        timestamp: DateTime<Local>,
    ) -> SpectroResult<Self> {
        if wavelengths.len() != intensities.len() {
            return Err(SpectroError::SpectrumShape {
                wavelengths: wavelengths.len(),
                intensities: intensities.len(),
            });
        }
        let cut = artifact_bins.min(wavelengths.len());
        wavelengths.drain(..cut);
        intensities.drain(..cut);
        Self::new(wavelengths, intensities, timestamp)
    }

    /// New sample with the same wavelength axis and timestamp.
    pub fn with_intensities(&self, intensities: Vec<f64>) -> SpectroResult<Self> {
        Self::new(Arc::clone(&self.wavelengths), intensities, self.timestamp)
    }

    /// Wavelength axis in nanometres.
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// Intensity counts, one per wavelength.
    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    /// Shared handle to the wavelength axis.
    pub fn shared_wavelengths(&self) -> Arc<[f64]> {
        Arc::clone(&self.wavelengths)
    }

    /// Shared handle to the intensities.
    pub fn shared_intensities(&self) -> Arc<[f64]> {
        Arc::clone(&self.intensities)
    }

    /// Acquisition time.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Number of spectral bins.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// Whether the sample has no bins.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_drops_artifact_region_from_both_axes() {
        let wl: Vec<f64> = (0..40).map(f64::from).collect();
        let it: Vec<f64> = (100..140).map(f64::from).collect();
        let sample = SpectrumSample::from_raw(wl, it, DEFAULT_ARTIFACT_BINS, Local::now()).unwrap();
        assert_eq!(sample.len(), 10);
        assert_eq!(sample.wavelengths()[0], 30.0);
        assert_eq!(sample.intensities()[0], 130.0);
    }

    #[test]
    fn from_raw_shorter_than_artifact_region_is_empty() {
        let sample =
            SpectrumSample::from_raw(vec![1.0; 5], vec![2.0; 5], 30, Local::now()).unwrap();
        assert!(sample.is_empty());
        assert!(sample.wavelengths().is_empty());
    }

    #[test]
    fn rejects_mismatched_axes() {
        let err = SpectrumSample::new(vec![1.0, 2.0], vec![1.0], Local::now()).unwrap_err();
        assert!(matches!(
            err,
            SpectroError::SpectrumShape {
                wavelengths: 2,
                intensities: 1
            }
        ));
    }

    #[test]
    fn with_intensities_shares_axis_and_timestamp() {
        let sample = SpectrumSample::new(vec![500.0, 501.0], vec![1.0, 2.0], Local::now()).unwrap();
        let processed = sample.with_intensities(vec![3.0, 4.0]).unwrap();
        assert_eq!(processed.wavelengths(), sample.wavelengths());
        assert_eq!(processed.timestamp(), sample.timestamp());
        assert_eq!(sample.intensities(), &[1.0, 2.0]);
        assert!(processed.with_intensities(vec![1.0]).is_err());
    }
}
