//! GUI-independent spectrometer controller.
//!
//! [`SpectrometerController`] is what a front end talks to. It owns the device
//! catalog, the shared acquisition context and at most one running
//! [`AcquisitionLoop`], and implements the user actions:
//!
//! - instrument selection and switching (stop, close, open, configure, start)
//! - configuration edits, validated before they take effect
//! - background capture, reload and clear
//! - snapshot save of the latest processed spectrum

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::acquisition::{
    AcquisitionContext, AcquisitionLoop, ExitReason, LatestSpectra, LoopSettings, LoopStats,
};
use crate::data::spectrum::SpectrumSample;
use crate::data::storage::read_spectrum_file;
use crate::error::{SpectroError, SpectroResult};
use crate::hardware::capabilities::{DeviceDescriptor, SpectrometerBackend};
use crate::hardware::catalog::DeviceCatalog;
use crate::hardware::session::{InstrumentSession, SessionSettings};
use crate::sink::{DisplayEvent, SinkSender};
use crate::state::{BackgroundReference, ConfigState, ProcessingConfig, TriggerMode};

/// Outcome of a stopped acquisition.
#[derive(Debug)]
pub struct AcquisitionSummary {
    /// Instrument that was read
    pub identifier: String,
    /// Why the loop ended
    pub reason: ExitReason,
    /// Final counters
    pub stats: LoopStats,
}

struct ActiveInstrument {
    acquisition: AcquisitionLoop,
    min_integration_time_micros: u32,
}

/// Orchestrates catalog, session, loop and shared state.
pub struct SpectrometerController {
    catalog: DeviceCatalog,
    context: AcquisitionContext,
    session_settings: SessionSettings,
    loop_settings: LoopSettings,
    active: Option<ActiveInstrument>,
}

impl std::fmt::Debug for SpectrometerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrometerController")
            .field("catalog", &self.catalog)
            .field("active", &self.active_instrument())
            .finish()
    }
}

impl SpectrometerController {
    /// Controller over a backend.
    pub fn new(
        backend: Arc<dyn SpectrometerBackend>,
        config: ConfigState,
        sink: SinkSender,
        session_settings: SessionSettings,
        loop_settings: LoopSettings,
    ) -> Self {
        Self {
            catalog: DeviceCatalog::new(backend),
            context: AcquisitionContext::new(config, sink),
            session_settings,
            loop_settings,
            active: None,
        }
    }

    /// Device catalog.
    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    /// Live configuration.
    pub fn config(&self) -> &ConfigState {
        &self.context.config
    }

    /// Background reference.
    pub fn background(&self) -> &BackgroundReference {
        &self.context.background
    }

    /// Latest acquired spectra.
    pub fn latest(&self) -> &LatestSpectra {
        &self.context.latest
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Re-enumerate attached instruments.
    pub fn refresh_devices(&self) -> SpectroResult<Vec<DeviceDescriptor>> {
        self.catalog.refresh()
    }

    /// Switch acquisition to the instrument with `identifier`.
    ///
    /// Any running acquisition is stopped and its session closed first. If the
    /// old worker does not confirm termination the switch is aborted with
    /// [`SpectroError::StopTimeout`]. The background reference is cleared, and
    /// the presentation layer receives the current display bounds once the new
    /// acquisition runs.
    pub fn select_instrument(&mut self, identifier: &str) -> SpectroResult<()> {
        if let Some(summary) = self.stop_acquisition()? {
            info!(
                from = %summary.identifier,
                to = identifier,
                "Switching spectrometer"
            );
        }
        self.context.latest.clear();
        if self.context.background.is_set() {
            // a reference only applies to the instrument it was taken on
            self.context.background.clear();
            info!(identifier, "Cleared background reference on instrument selection");
        }

        let mut session = InstrumentSession::new(self.catalog.clone(), self.session_settings);
        session.open(identifier)?;

        let min_integration_time_micros = session.min_integration_time_micros().unwrap_or(1);
        let cfg = self.context.config.snapshot();
        if cfg.integration_time_micros < min_integration_time_micros {
            warn!(
                identifier,
                requested = cfg.integration_time_micros,
                minimum = min_integration_time_micros,
                "Integration time below device minimum; raising it"
            );
            self.context
                .config
                .update(|c| c.integration_time_micros = min_integration_time_micros)?;
        }
        session.configure(cfg.trigger_mode)?;

        let acquisition =
            AcquisitionLoop::start(session, self.context.clone(), self.loop_settings)?;
        self.active = Some(ActiveInstrument {
            acquisition,
            min_integration_time_micros,
        });

        let (lower, upper) = self.context.config.snapshot().display_bounds();
        self.context
            .sink
            .send(DisplayEvent::DisplayBounds { lower, upper });
        Ok(())
    }

    /// Stop the running acquisition and close its instrument.
    ///
    /// Returns `None` when nothing was running.
    pub fn stop_acquisition(&mut self) -> SpectroResult<Option<AcquisitionSummary>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let identifier = active.acquisition.identifier().to_string();
        let stopped = active.acquisition.stop()?;
        let mut session = stopped.session;
        session.close()?;
        Ok(Some(AcquisitionSummary {
            identifier,
            reason: stopped.reason,
            stats: stopped.stats,
        }))
    }

    /// Stop everything before exit.
    pub fn shutdown(&mut self) -> SpectroResult<Option<AcquisitionSummary>> {
        let summary = self.stop_acquisition()?;
        info!("Spectrometer controller shut down");
        Ok(summary)
    }

    /// Identifier of the instrument acquisition was started on.
    pub fn active_instrument(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.acquisition.identifier())
    }

    /// Whether the acquisition worker is still cycling.
    pub fn is_acquiring(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.acquisition.is_running())
    }

    /// Counters of the running acquisition.
    pub fn acquisition_stats(&self) -> Option<LoopStats> {
        self.active.as_ref().map(|a| a.acquisition.stats())
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Apply an arbitrary configuration edit.
    ///
    /// The edit is rejected as a whole if the result is invalid or the
    /// integration time is below the active instrument's minimum.
    pub fn update_config<F>(&self, edit: F) -> SpectroResult<ProcessingConfig>
    where
        F: FnOnce(&mut ProcessingConfig),
    {
        let active = self
            .active
            .as_ref()
            .map(|a| (a.acquisition.identifier(), a.min_integration_time_micros));
        self.context.config.try_update(|cfg| {
            edit(cfg);
            match active {
                Some((identifier, minimum)) if cfg.integration_time_micros < minimum => {
                    Err(SpectroError::Configuration(format!(
                        "integration time {} µs is below the minimum of {minimum} µs for '{identifier}'",
                        cfg.integration_time_micros
                    )))
                }
                _ => Ok(()),
            }
        })
    }

    /// Set the integration time in microseconds.
    pub fn set_integration_time(&self, micros: u32) -> SpectroResult<()> {
        self.update_config(|cfg| cfg.integration_time_micros = micros)?;
        Ok(())
    }

    /// Set the trigger mode; the worker applies it on its next cycle.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> SpectroResult<()> {
        self.update_config(|cfg| cfg.trigger_mode = mode)?;
        Ok(())
    }

    /// Set the trigger mode from its vendor index.
    pub fn set_trigger_index(&self, index: usize) -> SpectroResult<()> {
        let mode = TriggerMode::from_index(index).ok_or_else(|| {
            SpectroError::Configuration(format!("unknown trigger mode index {index}"))
        })?;
        self.set_trigger_mode(mode)
    }

    /// Enable or disable the moving average and set its window.
    pub fn set_averaging(&self, enabled: bool, window: usize) -> SpectroResult<()> {
        self.update_config(|cfg| {
            cfg.averaging_enabled = enabled;
            cfg.averaging_window = window;
        })?;
        Ok(())
    }

    /// Enable or disable background subtraction.
    pub fn set_background_subtraction(&self, enabled: bool) -> SpectroResult<()> {
        self.update_config(|cfg| cfg.background_subtraction_enabled = enabled)?;
        Ok(())
    }

    /// Enable or disable continuous save.
    pub fn set_continuous_save(&self, enabled: bool) -> SpectroResult<()> {
        self.update_config(|cfg| cfg.continuous_save_enabled = enabled)?;
        Ok(())
    }

    /// Directory spectrum files are written to.
    pub fn set_save_dir(&self, dir: impl Into<PathBuf>) -> SpectroResult<()> {
        let dir = dir.into();
        self.update_config(|cfg| cfg.save_dir = dir)?;
        Ok(())
    }

    /// File name prefix of spectrum files.
    pub fn set_file_prefix(&self, prefix: impl Into<String>) -> SpectroResult<()> {
        let prefix = prefix.into();
        self.update_config(|cfg| cfg.file_prefix = prefix)?;
        Ok(())
    }

    /// Set the displayed wavelength range and notify the presentation layer.
    pub fn set_display_bounds(&self, lower: f64, upper: f64) -> SpectroResult<()> {
        let cfg = self.update_config(|cfg| {
            cfg.display_lower_bound = lower;
            cfg.display_upper_bound = upper;
        })?;
        let (lower, upper) = cfg.display_bounds();
        self.context
            .sink
            .send(DisplayEvent::DisplayBounds { lower, upper });
        Ok(())
    }

    // =========================================================================
    // Data actions
    // =========================================================================

    /// Store the latest raw spectrum as background reference.
    ///
    /// Returns the number of bins captured.
    pub fn save_background(&self) -> SpectroResult<usize> {
        let raw = self
            .context
            .latest
            .raw()
            .ok_or(SpectroError::NoSampleAvailable {
                operation: "save a background",
            })?;
        self.context.background.set(raw.shared_intensities());
        info!(bins = raw.len(), "Captured background reference");
        Ok(raw.len())
    }

    /// Load a background reference from a recorded spectrum file.
    ///
    /// Selecting an instrument afterwards clears it again.
    pub fn load_background(&self, path: &Path) -> SpectroResult<usize> {
        let recorded = read_spectrum_file(path)?;
        let bins = recorded.len();
        self.context.background.set(recorded.intensities.into());
        info!(path = %path.display(), bins, "Loaded background reference");
        Ok(bins)
    }

    /// Forget the background reference.
    pub fn clear_background(&self) {
        self.context.background.clear();
        info!("Cleared background reference");
    }

    /// Write the latest processed spectrum to a snapshot file.
    pub fn save_snapshot(&self) -> SpectroResult<PathBuf> {
        let sample = self
            .context
            .latest
            .processed()
            .ok_or(SpectroError::NoSampleAvailable {
                operation: "save a snapshot",
            })?;
        let cfg = self.context.config.snapshot();
        self.context.recorder.record_snapshot(&sample, &cfg)
    }

    /// Latest processed spectrum.
    pub fn latest_processed(&self) -> Option<SpectrumSample> {
        self.context.latest.processed()
    }
}

impl Drop for SpectrometerController {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(err) = self.stop_acquisition() {
                warn!(error = %err, "Error stopping acquisition on drop");
            }
        }
    }
}
