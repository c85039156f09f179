//! Custom error types for the application.
//!
//! This module defines the primary error type, `SpectroError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while talking to a spectrometer, processing its
//! spectra and writing them to disk.
//!
//! ## Error Hierarchy
//!
//! - **Instrument lifecycle**: `DeviceUnavailable`, `DeviceBusy`, `InvalidState` and
//!   `Driver` are raised by the device catalog and the instrument session.
//! - **Acquisition**: `ReadError` is transient and retried by the acquisition loop;
//!   `DeviceLost` is what a run of failed reads escalates to and ends the session.
//! - **Processing**: `LengthMismatch` and `SpectrumShape` guard the array invariants.
//! - **Storage**: `Io` and `Format` cover recorded spectrum files.
//! - **Configuration**: `Configuration` for semantic validation, `Config` for
//!   file/environment loading through `figment`.
//!
//! Every instrument-related variant carries the instrument identifier and the
//! operation that failed so that a user-visible message identifies both.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::hardware::session::SessionState;

/// Convenience alias for results using the crate error type.
pub type SpectroResult<T> = std::result::Result<T, SpectroError>;

/// Errors produced by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum SpectroError {
    /// The identifier is not part of the current device catalog snapshot.
    #[error("Spectrometer '{identifier}' is not attached (refresh the device list)")]
    DeviceUnavailable {
        /// Requested instrument identifier
        identifier: String,
    },

    /// A handle for the identifier is already open.
    #[error("Spectrometer '{identifier}' is already open in another session")]
    DeviceBusy {
        /// Requested instrument identifier
        identifier: String,
    },

    /// The operation is not valid in the current session state.
    #[error("Cannot {operation} spectrometer '{identifier}': session is {state}")]
    InvalidState {
        /// Instrument identifier, or `<none>` when no instrument was ever opened
        identifier: String,
        /// Operation that was attempted
        operation: &'static str,
        /// State the session was in
        state: SessionState,
    },

    /// Non-read driver failure (open, configure, close).
    #[error("Failed to {operation} spectrometer '{identifier}': {message}")]
    Driver {
        /// Instrument identifier
        identifier: String,
        /// Operation that failed
        operation: &'static str,
        /// Driver message
        message: String,
    },

    /// A single hardware read failed. Retryable.
    #[error("Failed to {operation} spectrometer '{identifier}': {message}")]
    ReadError {
        /// Instrument identifier
        identifier: String,
        /// Operation that failed
        operation: &'static str,
        /// Driver message
        message: String,
    },

    /// Too many consecutive read failures. Terminal for the session.
    #[error(
        "Lost spectrometer '{identifier}' after {attempts} consecutive failed reads: {message}"
    )]
    DeviceLost {
        /// Instrument identifier
        identifier: String,
        /// Number of consecutive failed reads
        attempts: u32,
        /// Last driver message
        message: String,
    },

    /// Background reference does not match the spectrum.
    #[error("Background reference has {background} bins but spectrum has {spectrum}")]
    LengthMismatch {
        /// Bin count of the spectrum being processed
        spectrum: usize,
        /// Bin count of the background reference
        background: usize,
    },

    /// Wavelength and intensity arrays differ in length.
    #[error("Spectrum has {wavelengths} wavelengths but {intensities} intensities")]
    SpectrumShape {
        /// Number of wavelength values
        wavelengths: usize,
        /// Number of intensity values
        intensities: usize,
    },

    /// File I/O failure while reading or writing a spectrum file.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A recorded spectrum file could not be parsed.
    #[error("Malformed spectrum file '{}': {message}", path.display())]
    Format {
        /// File involved
        path: PathBuf,
        /// Parse failure description
        message: String,
    },

    /// Semantic configuration error (value out of range, inverted bounds, ...).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The backend failed to enumerate attached devices.
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    /// No spectrum has been acquired yet.
    #[error("No spectrum acquired yet; cannot {operation}")]
    NoSampleAvailable {
        /// Operation that needed a spectrum
        operation: &'static str,
    },

    /// The acquisition worker did not confirm termination in time.
    #[error("Acquisition on '{identifier}' did not stop within {waited:?}")]
    StopTimeout {
        /// Instrument identifier
        identifier: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The acquisition worker panicked.
    #[error("Acquisition worker for '{identifier}' panicked")]
    WorkerPanicked {
        /// Instrument identifier
        identifier: String,
    },
}

impl SpectroError {
    /// Wrap an I/O error with the file it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the acquisition loop should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadError { .. })
    }

    /// Instrument identifier the error refers to, if any.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Self::DeviceUnavailable { identifier }
            | Self::DeviceBusy { identifier }
            | Self::InvalidState { identifier, .. }
            | Self::Driver { identifier, .. }
            | Self::ReadError { identifier, .. }
            | Self::DeviceLost { identifier, .. }
            | Self::StopTimeout { identifier, .. }
            | Self::WorkerPanicked { identifier } => Some(identifier),
            _ => None,
        }
    }
}

impl From<figment::Error> for SpectroError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
