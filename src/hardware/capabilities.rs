//! Spectrometer Driver Capabilities
//!
//! This module defines the traits a spectrometer backend implements. A backend
//! (vendor SDK binding, simulator) provides two things:
//!
//! - [`SpectrometerBackend`]: enumerates attached instruments and opens them
//! - [`Spectrometer`]: one open instrument handle
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is blocking: vendor spectrometer SDKs expose synchronous calls, and the
//!   acquisition loop runs them on a dedicated thread
//! - Uses `anyhow::Result` for errors; the instrument session converts them into
//!   typed [`SpectroError`](crate::error::SpectroError) variants carrying the
//!   instrument identifier and operation
//! - Knows nothing about processing, storage or presentation
//!
//! # Example
//!
//! ```rust,ignore
//! struct UsbSpectrometer { /* SDK handle */ }
//!
//! impl Spectrometer for UsbSpectrometer {
//!     fn serial_number(&self) -> &str { "USB4C01234" }
//!     fn model(&self) -> &str { "USB4000" }
//!     fn min_integration_time_micros(&self) -> u32 { 10 }
//!     fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> { /* ... */ Ok(()) }
//!     fn set_integration_time_micros(&mut self, micros: u32) -> Result<()> { Ok(()) }
//!     fn wavelengths(&mut self) -> Result<Vec<f64>> { Ok(vec![]) }
//!     fn intensities(&mut self) -> Result<Vec<f64>> { Ok(vec![]) }
//!     fn close(&mut self) -> Result<()> { Ok(()) }
//! }
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::state::TriggerMode;

/// Identity of an attached instrument as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique identifier (serial number)
    pub identifier: String,
    /// Model name, informational only
    pub model: String,
}

impl DeviceDescriptor {
    /// Create a descriptor.
    pub fn new(identifier: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            model: model.into(),
        }
    }
}

/// Capability: Spectrum Acquisition
///
/// One open instrument connection.
///
/// # Contract
/// - Methods are only called while the handle is open; `close` is called once
/// - Calls are never issued concurrently (`&mut self`)
/// - `wavelengths` and `intensities` return arrays of equal length for the same
///   configuration
/// - The hardware needs a settle interval between `set_integration_time_micros`
///   and the next read; the caller enforces it
pub trait Spectrometer: Send {
    /// Serial number of the instrument.
    fn serial_number(&self) -> &str;

    /// Model name of the instrument.
    fn model(&self) -> &str;

    /// Smallest integration time the detector accepts, in microseconds.
    fn min_integration_time_micros(&self) -> u32;

    /// Select the acquisition-start condition.
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()>;

    /// Set the integration time in microseconds.
    fn set_integration_time_micros(&mut self, micros: u32) -> Result<()>;

    /// Wavelength of every detector pixel in nanometres.
    fn wavelengths(&mut self) -> Result<Vec<f64>>;

    /// Intensity of every detector pixel for one integration.
    ///
    /// Blocks for roughly the integration time.
    fn intensities(&mut self) -> Result<Vec<f64>>;

    /// Release the connection.
    fn close(&mut self) -> Result<()>;
}

/// Capability: Device Enumeration
///
/// Entry point of a spectrometer backend.
///
/// # Contract
/// - `list_devices` returns descriptors in a stable order
/// - `open` is only called with a descriptor from the latest enumeration, and
///   never twice for the same identifier without an intervening `close`
pub trait SpectrometerBackend: Send + Sync {
    /// Enumerate attached instruments.
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open an instrument.
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Spectrometer>>;
}
