//! Instrument session.
//!
//! An [`InstrumentSession`] owns at most one open spectrometer handle and moves
//! through `Closed -> Open -> Closed`. The device catalog claim taken on open is
//! held for as long as the handle exists, so no second session can open the
//! same identifier. Dropping an open session closes the handle.

use std::fmt;
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::data::spectrum::{SpectrumSample, DEFAULT_ARTIFACT_BINS};
use crate::error::{SpectroError, SpectroResult};
use crate::hardware::capabilities::Spectrometer;
use crate::hardware::catalog::{DeviceCatalog, HandleClaim};
use crate::state::TriggerMode;

const NO_INSTRUMENT: &str = "<none>";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handle held
    Closed,
    /// Handle open and usable
    Open,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => f.write_str("closed"),
            SessionState::Open => f.write_str("open"),
        }
    }
}

/// Timing and truncation applied to every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Wait between setting the integration time and reading
    pub settle_interval: Duration,
    /// Leading bins dropped from every read
    pub artifact_bins: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            settle_interval: Duration::from_millis(50),
            artifact_bins: DEFAULT_ARTIFACT_BINS,
        }
    }
}

struct OpenHandle {
    device: Box<dyn Spectrometer>,
    claim: HandleClaim,
    min_integration_time_micros: u32,
    trigger_mode: Option<TriggerMode>,
}

impl OpenHandle {
    fn identifier(&self) -> &str {
        &self.claim.descriptor().identifier
    }
}

/// Lifecycle owner of one spectrometer connection.
pub struct InstrumentSession {
    catalog: DeviceCatalog,
    settings: SessionSettings,
    handle: Option<OpenHandle>,
    last_identifier: Option<String>,
}

impl fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("identifier", &self.identifier())
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish()
    }
}

impl InstrumentSession {
    /// Closed session drawing instruments from `catalog`.
    pub fn new(catalog: DeviceCatalog, settings: SessionSettings) -> Self {
        Self {
            catalog,
            settings,
            handle: None,
            last_identifier: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        if self.handle.is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Identifier of the open instrument, or of the last one if closed.
    ///
    /// `<none>` if the session never opened anything.
    pub fn identifier(&self) -> &str {
        match (&self.handle, &self.last_identifier) {
            (Some(handle), _) => handle.identifier(),
            (None, Some(last)) => last,
            (None, None) => NO_INSTRUMENT,
        }
    }

    /// Smallest integration time the open instrument accepts.
    pub fn min_integration_time_micros(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.min_integration_time_micros)
    }

    /// Trigger mode last applied to the open instrument.
    pub fn trigger_mode(&self) -> Option<TriggerMode> {
        self.handle.as_ref().and_then(|h| h.trigger_mode)
    }

    /// Settings this session reads with.
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Open the instrument with the given identifier.
    pub fn open(&mut self, identifier: &str) -> SpectroResult<()> {
        if self.handle.is_some() {
            if self.catalog.is_open(identifier) {
                return Err(SpectroError::DeviceBusy {
                    identifier: identifier.to_string(),
                });
            }
            return Err(SpectroError::InvalidState {
                identifier: self.identifier().to_string(),
                operation: "open another",
                state: SessionState::Open,
            });
        }

        let claim = self.catalog.claim(identifier)?;
        let device = self
            .catalog
            .open_device(&claim)
            .map_err(|err| SpectroError::Driver {
                identifier: identifier.to_string(),
                operation: "open",
                message: err.to_string(),
            })?;

        let min_integration_time_micros = device.min_integration_time_micros();
        info!(
            identifier,
            model = device.model(),
            min_integration_time_micros,
            "Opened spectrometer"
        );
        self.last_identifier = Some(identifier.to_string());
        self.handle = Some(OpenHandle {
            device,
            claim,
            min_integration_time_micros,
            trigger_mode: None,
        });
        Ok(())
    }

    /// Apply a trigger mode.
    pub fn configure(&mut self, trigger_mode: TriggerMode) -> SpectroResult<()> {
        let handle = self.open_handle("configure")?;
        handle
            .device
            .set_trigger_mode(trigger_mode)
            .map_err(|err| SpectroError::Driver {
                identifier: handle.identifier().to_string(),
                operation: "configure trigger mode of",
                message: err.to_string(),
            })?;
        handle.trigger_mode = Some(trigger_mode);
        debug!(identifier = handle.identifier(), %trigger_mode, "Applied trigger mode");
        Ok(())
    }

    /// Acquire one spectrum.
    ///
    /// Sets the integration time, waits the settle interval and reads both axes.
    /// The artifact region is dropped before the sample is returned.
    pub fn read_sample(&mut self, integration_time_micros: u32) -> SpectroResult<SpectrumSample> {
        let settings = self.settings;
        let handle = self.open_handle("read a sample from")?;
        let identifier = handle.identifier().to_string();
        let read_error = |operation: &'static str, err: anyhow::Error| SpectroError::ReadError {
            identifier: identifier.clone(),
            operation,
            message: err.to_string(),
        };

        handle
            .device
            .set_integration_time_micros(integration_time_micros)
            .map_err(|err| read_error("set integration time on", err))?;
        if !settings.settle_interval.is_zero() {
            thread::sleep(settings.settle_interval);
        }

        let wavelengths = handle
            .device
            .wavelengths()
            .map_err(|err| read_error("read wavelengths from", err))?;
        let intensities = handle
            .device
            .intensities()
            .map_err(|err| read_error("read intensities from", err))?;

        SpectrumSample::from_raw(wavelengths, intensities, settings.artifact_bins, Local::now())
    }

    /// Release the handle. No-op when already closed.
    pub fn close(&mut self) -> SpectroResult<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        let identifier = handle.identifier().to_string();
        let result = handle.device.close();
        // claim is released here whatever the driver reported
        drop(handle);
        match result {
            Ok(()) => {
                info!(identifier = %identifier, "Closed spectrometer");
                Ok(())
            }
            Err(err) => Err(SpectroError::Driver {
                identifier,
                operation: "close",
                message: err.to_string(),
            }),
        }
    }

    fn open_handle(&mut self, operation: &'static str) -> SpectroResult<&mut OpenHandle> {
        match &mut self.handle {
            Some(handle) => Ok(handle),
            None => Err(SpectroError::InvalidState {
                identifier: self
                    .last_identifier
                    .clone()
                    .unwrap_or_else(|| NO_INSTRUMENT.to_string()),
                operation,
                state: SessionState::Closed,
            }),
        }
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let identifier = self.identifier().to_string();
            debug!(identifier = %identifier, "Closing spectrometer on drop");
            if let Err(err) = self.close() {
                warn!(identifier = %identifier, error = %err, "Error closing spectrometer on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedBackend, SimulatedDeviceSpec};
    use std::sync::Arc;

    fn fast() -> SessionSettings {
        SessionSettings {
            settle_interval: Duration::ZERO,
            artifact_bins: DEFAULT_ARTIFACT_BINS,
        }
    }

    fn setup(serials: &[&str]) -> (DeviceCatalog, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new(serials.iter().map(|s| {
            SimulatedDeviceSpec {
                pixels: 128,
                seed: Some(1),
                ..SimulatedDeviceSpec::with_serial(*s)
            }
        })));
        let catalog = DeviceCatalog::new(backend.clone());
        catalog.refresh().unwrap();
        (catalog, backend)
    }

    #[test]
    fn read_on_closed_session_is_invalid_state() {
        let (catalog, _) = setup(&["A"]);
        let mut session = InstrumentSession::new(catalog, fast());
        let err = session.read_sample(1000).unwrap_err();
        assert!(matches!(
            err,
            SpectroError::InvalidState {
                state: SessionState::Closed,
                ..
            }
        ));
        assert_eq!(session.identifier(), "<none>");
        assert!(session.configure(TriggerMode::Software).is_err());
    }

    #[test]
    fn read_drops_artifact_region() {
        let (catalog, backend) = setup(&["A"]);
        let mut session = InstrumentSession::new(catalog, fast());
        session.open("A").unwrap();
        let sample = session.read_sample(2000).unwrap();
        assert_eq!(sample.len(), 128 - DEFAULT_ARTIFACT_BINS);
        assert_eq!(backend.probe("A").unwrap().integration_time_micros(), 2000);
    }

    #[test]
    fn read_waits_settle_interval_after_integration_change() {
        let (catalog, backend) = setup(&["A"]);
        let device = backend.probe("A").unwrap();
        let settle = Duration::from_millis(30);
        let mut session = InstrumentSession::new(
            catalog,
            SessionSettings {
                settle_interval: settle,
                ..fast()
            },
        );
        session.open("A").unwrap();
        session.read_sample(1000).unwrap();
        device.fail_next_reads(1);
        assert!(session.read_sample(1500).is_err());

        let gaps = device.settle_gaps();
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|gap| *gap >= settle), "gaps {gaps:?}");
    }

    #[test]
    fn second_session_on_same_identifier_is_busy() {
        let (catalog, _) = setup(&["A"]);
        let mut first = InstrumentSession::new(catalog.clone(), fast());
        let mut second = InstrumentSession::new(catalog, fast());
        first.open("A").unwrap();
        assert!(matches!(
            second.open("A").unwrap_err(),
            SpectroError::DeviceBusy { .. }
        ));
        assert!(matches!(
            first.open("A").unwrap_err(),
            SpectroError::DeviceBusy { .. }
        ));
        first.close().unwrap();
        second.open("A").unwrap();
    }

    #[test]
    fn open_while_open_on_other_identifier_is_invalid_state() {
        let (catalog, _) = setup(&["A", "B"]);
        let mut session = InstrumentSession::new(catalog, fast());
        session.open("A").unwrap();
        assert!(matches!(
            session.open("B").unwrap_err(),
            SpectroError::InvalidState { .. }
        ));
    }

    #[test]
    fn failed_open_releases_claim() {
        let (catalog, backend) = setup(&["A"]);
        backend.probe("A").unwrap().fail_next_open();
        let mut session = InstrumentSession::new(catalog.clone(), fast());
        assert!(matches!(
            session.open("A").unwrap_err(),
            SpectroError::Driver { .. }
        ));
        assert!(!catalog.is_open("A"));
        session.open("A").unwrap();
    }

    #[test]
    fn hardware_failure_is_transient_read_error() {
        let (catalog, backend) = setup(&["A"]);
        let mut session = InstrumentSession::new(catalog, fast());
        session.open("A").unwrap();
        backend.probe("A").unwrap().fail_next_reads(1);
        let err = session.read_sample(1000).unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("'A'"));
    }

    #[test]
    fn close_is_idempotent_and_drop_closes() {
        let (catalog, backend) = setup(&["A"]);
        let probe = backend.probe("A").unwrap();
        {
            let mut session = InstrumentSession::new(catalog.clone(), fast());
            session.open("A").unwrap();
            session.close().unwrap();
            session.close().unwrap();
            assert_eq!(session.identifier(), "A");
            session.open("A").unwrap();
        }
        assert_eq!(probe.closes(), 2);
        assert!(!catalog.is_open("A"));
    }
}
