//! Spectrum file recorder.
//!
//! Each call writes one tab-delimited `.dat` file:
//!
//! ```text
//! index	intensity	wavelength
//! 0	1021.5	341.2
//! 1	1019.0	341.5
//! ```
//!
//! File names are `<save_dir>/<file_prefix><timestamp>.dat` with the timestamp
//! formatted as `YYYY-MM-DDHH-MM-SS.ffffff`. Continuous recording therefore
//! produces one file per acquisition cycle, which is the intended behaviour.
//! The save directory is never created implicitly.
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::data::spectrum::SpectrumSample;
use crate::error::{SpectroError, SpectroResult};
use crate::state::ProcessingConfig;

/// Extension of recorded spectrum files.
pub const SPECTRUM_FILE_EXTENSION: &str = "dat";

/// Header row of recorded spectrum files.
pub const SPECTRUM_FILE_HEADER: [&str; 3] = ["index", "intensity", "wavelength"];

const MAX_NAME_COLLISIONS: u32 = 1000;

/// Writes spectra to tab-delimited text files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleRecorder;

impl SampleRecorder {
    /// Create a recorder.
    pub fn new() -> Self {
        Self
    }

    /// Write one file for a continuous-save cycle.
    pub fn record_continuous(
        &self,
        sample: &SpectrumSample,
        cfg: &ProcessingConfig,
    ) -> SpectroResult<PathBuf> {
        let path = self.write(sample, cfg)?;
        debug!(path = %path.display(), bins = sample.len(), "Recorded spectrum");
        Ok(path)
    }

    /// Write a single on-demand snapshot.
    pub fn record_snapshot(
        &self,
        sample: &SpectrumSample,
        cfg: &ProcessingConfig,
    ) -> SpectroResult<PathBuf> {
        let path = self.write(sample, cfg)?;
        info!(path = %path.display(), bins = sample.len(), "Saved spectrum snapshot");
        Ok(path)
    }

    fn write(&self, sample: &SpectrumSample, cfg: &ProcessingConfig) -> SpectroResult<PathBuf> {
        let (file, path) = create_unique(cfg, sample.timestamp())?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(file);
        let to_io = |err: csv::Error| SpectroError::io(&path, err.into());

        writer.write_record(SPECTRUM_FILE_HEADER).map_err(to_io)?;
        for (index, (intensity, wavelength)) in sample
            .intensities()
            .iter()
            .zip(sample.wavelengths())
            .enumerate()
        {
            writer
                .write_record(&[
                    index.to_string(),
                    intensity.to_string(),
                    wavelength.to_string(),
                ])
                .map_err(to_io)?;
        }
        writer
            .flush()
            .map_err(|err| SpectroError::io(&path, err))?;
        Ok(path)
    }
}

/// Timestamp part of a spectrum file name.
pub fn format_file_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format("%Y-%m-%d%H-%M-%S%.6f").to_string()
}

/// Path a sample with this timestamp is written to, ignoring name collisions.
pub fn spectrum_file_path(cfg: &ProcessingConfig, timestamp: &DateTime<Local>) -> PathBuf {
    cfg.save_dir.join(format!(
        "{}{}.{}",
        cfg.file_prefix,
        format_file_timestamp(timestamp),
        SPECTRUM_FILE_EXTENSION
    ))
}

fn create_unique(
    cfg: &ProcessingConfig,
    timestamp: DateTime<Local>,
) -> SpectroResult<(File, PathBuf)> {
    let stem = format!("{}{}", cfg.file_prefix, format_file_timestamp(&timestamp));
    for attempt in 0..MAX_NAME_COLLISIONS {
        let name = if attempt == 0 {
            format!("{stem}.{SPECTRUM_FILE_EXTENSION}")
        } else {
            format!("{stem}_{attempt}.{SPECTRUM_FILE_EXTENSION}")
        };
        let path = cfg.save_dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(SpectroError::io(path, err)),
        }
    }
    Err(SpectroError::io(
        cfg.save_dir.join(format!("{stem}.{SPECTRUM_FILE_EXTENSION}")),
        std::io::Error::new(ErrorKind::AlreadyExists, "too many files with the same timestamp"),
    ))
}

/// Spectrum read back from a recorded file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpectrum {
    /// Intensity column
    pub intensities: Vec<f64>,
    /// Wavelength column
    pub wavelengths: Vec<f64>,
}

impl RecordedSpectrum {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// Whether the file had no data rows.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}

/// Parse a file written by [`SampleRecorder`].
pub fn read_spectrum_file(path: &Path) -> SpectroResult<RecordedSpectrum> {
    let format_err = |message: String| SpectroError::Format {
        path: path.to_path_buf(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|err| SpectroError::io(path, err.into()))?;

    let headers = reader
        .headers()
        .map_err(|err| format_err(err.to_string()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| format_err(format!("missing '{name}' column")))
    };
    let intensity_col = column("intensity")?;
    let wavelength_col = column("wavelength")?;

    let mut spectrum = RecordedSpectrum {
        intensities: Vec::new(),
        wavelengths: Vec::new(),
    };
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|err| format_err(err.to_string()))?;
        let field = |col: usize| -> SpectroResult<f64> {
            record
                .get(col)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| format_err(format!("row {row}: bad value in column {col}")))
        };
        spectrum.intensities.push(field(intensity_col)?);
        spectrum.wavelengths.push(field(wavelength_col)?);
    }
    Ok(spectrum)
}
