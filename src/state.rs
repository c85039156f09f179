//! Shared acquisition and processing state.
//!
//! [`ConfigState`] owns the live [`ProcessingConfig`]. User edits go through
//! [`ConfigState::update`], which validates the edited copy and swaps it in under
//! a write lock; the acquisition worker calls [`ConfigState::snapshot`] once per
//! cycle. Neither side holds the lock for longer than a clone, so a reader can
//! never observe a half-applied edit and the lock is never held across a
//! hardware read.
//!
//! [`BackgroundReference`] follows the same pattern for the optional background
//! spectrum: it is replaced wholesale and read as an immutable `Arc<[f64]>`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{SpectroError, SpectroResult};

/// Acquisition-start condition of the instrument.
///
/// Variants map to the vendor's enumerated trigger index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free-running acquisition (index 0)
    #[default]
    FreeRunning,
    /// Software triggered (index 1)
    Software,
    /// External hardware level trigger (index 2)
    ExternalLevel,
    /// External synchronization (index 3)
    ExternalSynchronized,
    /// External hardware edge trigger (index 4)
    ExternalEdge,
}

impl TriggerMode {
    /// All modes in index order.
    pub const ALL: [TriggerMode; 5] = [
        TriggerMode::FreeRunning,
        TriggerMode::Software,
        TriggerMode::ExternalLevel,
        TriggerMode::ExternalSynchronized,
        TriggerMode::ExternalEdge,
    ];

    /// Resolve a trigger index as exposed by selection widgets.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Vendor trigger index.
    pub fn index(self) -> usize {
        match self {
            TriggerMode::FreeRunning => 0,
            TriggerMode::Software => 1,
            TriggerMode::ExternalLevel => 2,
            TriggerMode::ExternalSynchronized => 3,
            TriggerMode::ExternalEdge => 4,
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerMode::FreeRunning => "free-running",
            TriggerMode::Software => "software",
            TriggerMode::ExternalLevel => "external level",
            TriggerMode::ExternalSynchronized => "external synchronized",
            TriggerMode::ExternalEdge => "external edge",
        };
        f.write_str(name)
    }
}

/// Acquisition and processing parameters edited by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Photon accumulation time per sample in microseconds
    pub integration_time_micros: u32,
    /// Instrument trigger mode
    pub trigger_mode: TriggerMode,
    /// Apply the moving average
    pub averaging_enabled: bool,
    /// Moving average window in bins (>= 1)
    pub averaging_window: usize,
    /// Subtract the background reference when one is captured
    pub background_subtraction_enabled: bool,
    /// Write every processed sample to disk
    pub continuous_save_enabled: bool,
    /// Directory receiving spectrum files
    pub save_dir: PathBuf,
    /// File name prefix for spectrum files
    pub file_prefix: String,
    /// Lower wavelength shown by the presentation layer
    pub display_lower_bound: f64,
    /// Upper wavelength shown by the presentation layer
    pub display_upper_bound: f64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            integration_time_micros: 1000,
            trigger_mode: TriggerMode::FreeRunning,
            averaging_enabled: false,
            averaging_window: 10,
            background_subtraction_enabled: false,
            continuous_save_enabled: false,
            save_dir: PathBuf::from("."),
            file_prefix: "spectrum_".to_string(),
            display_lower_bound: 200.0,
            display_upper_bound: 1100.0,
        }
    }
}

impl ProcessingConfig {
    /// Check value ranges that do not depend on the attached instrument.
    pub fn validate(&self) -> SpectroResult<()> {
        if self.integration_time_micros == 0 {
            return Err(SpectroError::Configuration(
                "integration time must be at least 1 µs".to_string(),
            ));
        }
        if self.averaging_window == 0 {
            return Err(SpectroError::Configuration(
                "averaging window must be at least 1 bin".to_string(),
            ));
        }
        if !self.display_lower_bound.is_finite() || !self.display_upper_bound.is_finite() {
            return Err(SpectroError::Configuration(
                "display bounds must be finite".to_string(),
            ));
        }
        if self.display_lower_bound >= self.display_upper_bound {
            return Err(SpectroError::Configuration(format!(
                "display lower bound {} must be below upper bound {}",
                self.display_lower_bound, self.display_upper_bound
            )));
        }
        Ok(())
    }

    /// Display range as `(lower, upper)`.
    pub fn display_bounds(&self) -> (f64, f64) {
        (self.display_lower_bound, self.display_upper_bound)
    }
}

/// Owner of the live [`ProcessingConfig`].
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct ConfigState {
    inner: Arc<RwLock<ProcessingConfig>>,
}

impl ConfigState {
    /// Create the state from a validated initial configuration.
    pub fn new(initial: ProcessingConfig) -> SpectroResult<Self> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(initial)),
        })
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> ProcessingConfig {
        self.inner.read().clone()
    }

    /// Apply an edit atomically.
    ///
    /// The closure edits a copy; the copy replaces the live configuration only if
    /// it validates. Returns the configuration now in effect.
    pub fn update<F>(&self, edit: F) -> SpectroResult<ProcessingConfig>
    where
        F: FnOnce(&mut ProcessingConfig),
    {
        self.try_update(|cfg| {
            edit(cfg);
            Ok(())
        })
    }

    /// Like [`update`](Self::update), but the edit itself may reject the change.
    pub fn try_update<F>(&self, edit: F) -> SpectroResult<ProcessingConfig>
    where
        F: FnOnce(&mut ProcessingConfig) -> SpectroResult<()>,
    {
        let mut guard = self.inner.write();
        let mut next = guard.clone();
        edit(&mut next)?;
        next.validate()?;
        *guard = next.clone();
        Ok(next)
    }
}

/// Optional background spectrum shared between the controller and the worker.
#[derive(Debug, Clone, Default)]
pub struct BackgroundReference {
    inner: Arc<RwLock<Option<Arc<[f64]>>>>,
}

impl BackgroundReference {
    /// Empty reference (subtraction is a no-op).
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored reference.
    pub fn set(&self, intensities: Arc<[f64]>) {
        *self.inner.write() = Some(intensities);
    }

    /// Forget the stored reference.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Immutable snapshot of the current reference.
    pub fn snapshot(&self) -> Option<Arc<[f64]>> {
        self.inner.read().clone()
    }

    /// Whether a reference has been captured.
    pub fn is_set(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_index_round_trips() {
        for (i, mode) in TriggerMode::ALL.iter().enumerate() {
            assert_eq!(mode.index(), i);
            assert_eq!(TriggerMode::from_index(i), Some(*mode));
        }
        assert_eq!(TriggerMode::from_index(5), None);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ProcessingConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let state = ConfigState::new(ProcessingConfig::default()).unwrap();
        let err = state
            .update(|cfg| {
                cfg.display_lower_bound = 900.0;
                cfg.display_upper_bound = 400.0;
            })
            .unwrap_err();
        assert!(matches!(err, SpectroError::Configuration(_)));

        // rejected edit leaves the previous configuration untouched
        assert_eq!(state.snapshot().display_bounds(), (200.0, 1100.0));
    }

    #[test]
    fn rejects_zero_window_and_integration() {
        let state = ConfigState::default();
        assert!(state.update(|cfg| cfg.averaging_window = 0).is_err());
        assert!(state.update(|cfg| cfg.integration_time_micros = 0).is_err());
        assert_eq!(state.snapshot(), ProcessingConfig::default());
    }

    #[test]
    fn rejected_try_update_keeps_previous_config() {
        let state = ConfigState::default();
        let err = state
            .try_update(|cfg| {
                cfg.averaging_window = 3;
                Err(SpectroError::Configuration("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SpectroError::Configuration(_)));
        assert_eq!(state.snapshot().averaging_window, 10);
    }

    #[test]
    fn snapshot_is_detached_from_later_edits() {
        let state = ConfigState::default();
        let before = state.snapshot();
        let after = state
            .update(|cfg| {
                cfg.averaging_enabled = true;
                cfg.averaging_window = 5;
            })
            .unwrap();
        assert!(!before.averaging_enabled);
        assert!(after.averaging_enabled);
        assert_eq!(state.snapshot().averaging_window, 5);
    }

    #[test]
    fn concurrent_edits_are_never_torn() {
        let state = ConfigState::default();
        let writer = {
            let state = state.clone();
            std::thread::spawn(move || {
                for i in 1..500u32 {
                    state
                        .update(|cfg| {
                            cfg.integration_time_micros = i;
                            cfg.averaging_window = i as usize;
                        })
                        .unwrap();
                }
            })
        };
        for _ in 0..500 {
            let snap = state.snapshot();
            if snap.integration_time_micros != 1000 {
                assert_eq!(snap.integration_time_micros as usize, snap.averaging_window);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn background_reference_set_and_clear() {
        let bg = BackgroundReference::new();
        assert!(bg.snapshot().is_none());
        bg.set(Arc::from(vec![1.0, 2.0]));
        let snap = bg.snapshot().unwrap();
        bg.clear();
        assert!(!bg.is_set());
        // snapshot taken before clear stays valid
        assert_eq!(&*snap, &[1.0, 2.0]);
    }
}
