//! Spectrum signal processing.
//!
//! Pure functions only: no hardware access, no file access, no hidden state.
//! The pipeline is background subtraction followed by a centered moving average.
use crate::data::spectrum::SpectrumSample;
use crate::error::{SpectroError, SpectroResult};
use crate::state::ProcessingConfig;

/// Run the processing pipeline on one intensity sequence.
///
/// Background subtraction is skipped when disabled or when no reference was
/// captured. Averaging uses `cfg.averaging_window`.
pub fn process(
    raw: &[f64],
    cfg: &ProcessingConfig,
    background: Option<&[f64]>,
) -> SpectroResult<Vec<f64>> {
    let subtracted = match background {
        Some(bg) if cfg.background_subtraction_enabled => subtract_background(raw, bg)?,
        _ => raw.to_vec(),
    };

    if cfg.averaging_enabled {
        Ok(moving_average(&subtracted, cfg.averaging_window))
    } else {
        Ok(subtracted)
    }
}

/// Run [`process`] on a sample and wrap the result in a new sample.
pub fn process_sample(
    sample: &SpectrumSample,
    cfg: &ProcessingConfig,
    background: Option<&[f64]>,
) -> SpectroResult<SpectrumSample> {
    let intensities = process(sample.intensities(), cfg, background)?;
    sample.with_intensities(intensities)
}

/// Elementwise `raw[i] - background[i]`.
pub fn subtract_background(raw: &[f64], background: &[f64]) -> SpectroResult<Vec<f64>> {
    if raw.len() != background.len() {
        return Err(SpectroError::LengthMismatch {
            spectrum: raw.len(),
            background: background.len(),
        });
    }
    Ok(raw.iter().zip(background).map(|(r, b)| r - b).collect())
}

/// Centered moving average with the output length of the input.
///
/// Bin `i` averages `values[i - window/2 ..= i + (window-1)/2]`, clipped to the
/// sequence. Boundary bins are divided by the number of bins actually covered,
/// never padded with zeros. A window of 0 behaves like 1.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let window = window.max(1);
    if window == 1 || n == 0 {
        return values.to_vec();
    }

    // summed per window, no running total
    let left = window / 2;
    let right = (window - 1) / 2;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(left);
            let hi = (i + right).min(n - 1);
            let span = &values[lo..=hi];
            span.iter().sum::<f64>() / span.len() as f64
        })
        .collect()
}
