//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/spectro_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `SPECTRO_DAQ_`, with `__` separating
//!    nesting levels
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use spectro_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // SPECTRO_DAQ_PROCESSING__AVERAGING_WINDOW=5 overrides processing.averaging_window
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::LoopSettings;
use crate::data::spectrum::DEFAULT_ARTIFACT_BINS;
use crate::error::{SpectroError, SpectroResult};
use crate::hardware::mock::SimulatedDeviceSpec;
use crate::hardware::session::SessionSettings;
use crate::state::ProcessingConfig;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/spectro_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SPECTRO_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition timing and retry policy
    pub acquisition: AcquisitionSettings,
    /// Startup processing configuration
    pub processing: ProcessingConfig,
    /// Simulated instruments
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Spectro DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Acquisition loop and session timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Wait between setting the integration time and reading
    #[serde(with = "humantime_serde")]
    pub settle_interval: Duration,
    /// Minimum time between two reads
    #[serde(with = "humantime_serde")]
    pub min_cycle_interval: Duration,
    /// Consecutive failed reads before the device is considered lost
    pub max_consecutive_failures: u32,
    /// First retry backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Retry backoff ceiling
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// How long a stop waits for the worker
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Leading bins dropped from every read
    pub artifact_bins: usize,
    /// Pending events the presentation channel holds
    pub display_channel_capacity: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        let session = SessionSettings::default();
        let looping = LoopSettings::default();
        Self {
            settle_interval: session.settle_interval,
            min_cycle_interval: looping.min_cycle_interval,
            max_consecutive_failures: looping.max_consecutive_failures,
            initial_backoff: looping.initial_backoff,
            max_backoff: looping.max_backoff,
            stop_timeout: looping.stop_timeout,
            artifact_bins: DEFAULT_ARTIFACT_BINS,
            display_channel_capacity: 8,
        }
    }
}

impl AcquisitionSettings {
    /// Settings for instrument sessions.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            settle_interval: self.settle_interval,
            artifact_bins: self.artifact_bins,
        }
    }

    /// Settings for acquisition loops.
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            min_cycle_interval: self.min_cycle_interval,
            max_consecutive_failures: self.max_consecutive_failures,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            stop_timeout: self.stop_timeout,
        }
    }
}

/// Simulated spectrometers exposed by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Serial numbers, one simulated device each
    pub serials: Vec<String>,
    /// Detector pixels per device
    pub pixels: usize,
    /// First pixel wavelength (nm)
    pub wavelength_start_nm: f64,
    /// Last pixel wavelength (nm)
    pub wavelength_end_nm: f64,
    /// Minimum integration time (µs)
    pub min_integration_time_micros: u32,
    /// Noise seed; each device uses `seed + index`
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let device = SimulatedDeviceSpec::default();
        Self {
            serials: vec!["SIM0001".to_string(), "SIM0002".to_string()],
            pixels: device.pixels,
            wavelength_start_nm: device.wavelength_start_nm,
            wavelength_end_nm: device.wavelength_end_nm,
            min_integration_time_micros: device.min_integration_time_micros,
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// One device spec per configured serial.
    pub fn device_specs(&self) -> Vec<SimulatedDeviceSpec> {
        self.serials
            .iter()
            .enumerate()
            .map(|(i, serial)| SimulatedDeviceSpec {
                serial: serial.clone(),
                pixels: self.pixels,
                wavelength_start_nm: self.wavelength_start_nm,
                wavelength_end_nm: self.wavelength_end_nm,
                min_integration_time_micros: self.min_integration_time_micros,
                seed: self.seed.map(|s| s.wrapping_add(i as u64)),
                ..SimulatedDeviceSpec::default()
            })
            .collect()
    }
}

impl AppConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables
    ///
    /// Example: `SPECTRO_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// Provider chain used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SpectroResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SpectroError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.processing.validate()?;

        let acq = &self.acquisition;
        if acq.max_consecutive_failures == 0 {
            return Err(SpectroError::Configuration(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if acq.initial_backoff > acq.max_backoff {
            return Err(SpectroError::Configuration(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                acq.initial_backoff, acq.max_backoff
            )));
        }
        if acq.stop_timeout.is_zero() {
            return Err(SpectroError::Configuration(
                "stop_timeout must be greater than zero".to_string(),
            ));
        }
        if acq.display_channel_capacity == 0 {
            return Err(SpectroError::Configuration(
                "display_channel_capacity must be at least 1".to_string(),
            ));
        }

        let sim = &self.simulation;
        if sim.pixels <= acq.artifact_bins {
            return Err(SpectroError::Configuration(format!(
                "simulated pixel count {} leaves no bins after dropping {} artifact bins",
                sim.pixels, acq.artifact_bins
            )));
        }
        if sim.wavelength_start_nm.is_nan()
            || sim.wavelength_end_nm.is_nan()
            || sim.wavelength_start_nm >= sim.wavelength_end_nm
        {
            return Err(SpectroError::Configuration(format!(
                "simulated wavelength range {}..{} nm is empty",
                sim.wavelength_start_nm, sim.wavelength_end_nm
            )));
        }
        let mut serials = HashSet::new();
        for serial in &sim.serials {
            if !serials.insert(serial) {
                return Err(SpectroError::Configuration(format!(
                    "Duplicate simulated serial: {serial}"
                )));
            }
        }

        Ok(())
    }
}
