//! Simulated Spectrometer Backend
//!
//! Provides simulated spectrometers for running the acquisition pipeline
//! without physical hardware.
//!
//! # Simulation Model
//!
//! - Linear wavelength axis over the configured range
//! - Dark baseline of ~1000 counts with seeded uniform noise
//! - Mercury-argon style emission lines whose height scales with integration time,
//!   clipped at the 16-bit detector saturation level
//! - Garbage values in the leading [`DEFAULT_ARTIFACT_BINS`] pixels, like the
//!   real detector
//! - Each intensity read blocks for the integration time
//!
//! # Fault Injection
//!
//! Every simulated device has a shared [`SimulatedProbe`] that tests use to
//! count reads, inject transient or permanent read failures, fail the next
//! open, or slow reads down. It also keeps a short timeline of integration
//! time writes and read starts for pacing checks.
//!
//! ```rust,ignore
//! let backend = SimulatedBackend::with_serials(&["SIM0001"]);
//! let probe = backend.probe("SIM0001").unwrap();
//! probe.fail_next_reads(2);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::spectrum::DEFAULT_ARTIFACT_BINS;
use crate::hardware::capabilities::{DeviceDescriptor, Spectrometer, SpectrometerBackend};
use crate::state::TriggerMode;

const DARK_COUNTS: f64 = 1000.0;
const SATURATION_COUNTS: f64 = 65535.0;
const NOISE_COUNTS: f64 = 6.0;

/// Emission lines as `(centre nm, width nm, counts per millisecond of integration)`.
const EMISSION_LINES: [(f64, f64, f64); 5] = [
    (435.8, 0.8, 900.0),
    (546.1, 0.8, 1500.0),
    (696.5, 1.0, 400.0),
    (763.5, 1.0, 700.0),
    (811.5, 1.2, 550.0),
];

// =============================================================================
// Device specification
// =============================================================================

/// Static description of one simulated instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDeviceSpec {
    /// Serial number reported by enumeration
    pub serial: String,
    /// Model name
    pub model: String,
    /// Number of detector pixels, artifact region included
    pub pixels: usize,
    /// Wavelength of the first pixel (nm)
    pub wavelength_start_nm: f64,
    /// Wavelength of the last pixel (nm)
    pub wavelength_end_nm: f64,
    /// Minimum integration time (µs)
    pub min_integration_time_micros: u32,
    /// Noise seed; `None` draws one from the OS
    pub seed: Option<u64>,
}

impl Default for SimulatedDeviceSpec {
    fn default() -> Self {
        Self {
            serial: "SIM0001".to_string(),
            model: "Simulated USB2000".to_string(),
            pixels: 2048,
            wavelength_start_nm: 340.0,
            wavelength_end_nm: 1030.0,
            min_integration_time_micros: 10,
            seed: None,
        }
    }
}

impl SimulatedDeviceSpec {
    /// Default spec with the given serial number.
    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            ..Default::default()
        }
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(&self.serial, &self.model)
    }

    fn wavelength_axis(&self) -> Vec<f64> {
        if self.pixels < 2 {
            return vec![self.wavelength_start_nm; self.pixels];
        }
        let step = (self.wavelength_end_nm - self.wavelength_start_nm) / (self.pixels - 1) as f64;
        (0..self.pixels)
            .map(|i| self.wavelength_start_nm + step * i as f64)
            .collect()
    }
}

// =============================================================================
// SimulatedProbe - test instrumentation
// =============================================================================

const NO_TRIGGER_MODE: usize = usize::MAX;

/// Timeline entries kept per device; older ones are discarded.
const TIMELINE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Timeline {
    last_integration_set: Option<Instant>,
    integration_sets: VecDeque<Instant>,
    settle_gaps: VecDeque<Duration>,
}

fn push_bounded<T>(entries: &mut VecDeque<T>, value: T) {
    if entries.len() == TIMELINE_CAPACITY {
        entries.pop_front();
    }
    entries.push_back(value);
}

/// Shared counters and fault switches for one simulated device.
#[derive(Debug)]
pub struct SimulatedProbe {
    reads: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    reading: AtomicBool,
    closed_during_read: AtomicBool,
    pending_read_failures: AtomicU32,
    disconnected: AtomicBool,
    fail_next_open: AtomicBool,
    trigger_mode: AtomicUsize,
    integration_micros: AtomicU32,
    extra_read_delay_micros: AtomicU64,
    timeline: Mutex<Timeline>,
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self {
            reads: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            reading: AtomicBool::new(false),
            closed_during_read: AtomicBool::new(false),
            pending_read_failures: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            fail_next_open: AtomicBool::new(false),
            trigger_mode: AtomicUsize::new(NO_TRIGGER_MODE),
            integration_micros: AtomicU32::new(0),
            extra_read_delay_micros: AtomicU64::new(0),
            timeline: Mutex::new(Timeline::default()),
        }
    }
}

impl SimulatedProbe {
    /// Completed intensity reads across all handles of this device.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Successful opens.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Closes.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Whether an intensity read is currently in progress.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// Whether any handle was closed while a read on this device was in progress.
    pub fn closed_during_read(&self) -> bool {
        self.closed_during_read.load(Ordering::SeqCst)
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.pending_read_failures.store(count, Ordering::SeqCst);
    }

    /// Make every read fail until reconnected.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Make the next open fail.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Trigger mode last applied by a handle.
    pub fn trigger_mode(&self) -> Option<TriggerMode> {
        TriggerMode::from_index(self.trigger_mode.load(Ordering::SeqCst))
    }

    /// Integration time last applied by a handle (µs, 0 if never set).
    pub fn integration_time_micros(&self) -> u32 {
        self.integration_micros.load(Ordering::SeqCst)
    }

    /// Add a fixed delay to every intensity read.
    pub fn set_extra_read_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.extra_read_delay_micros.store(micros, Ordering::SeqCst);
    }

    /// When integration time was applied, oldest first.
    pub fn integration_set_times(&self) -> Vec<Instant> {
        self.timeline.lock().integration_sets.iter().copied().collect()
    }

    /// Time from the latest integration time write to the start of each
    /// intensity read, failed reads included.
    pub fn settle_gaps(&self) -> Vec<Duration> {
        self.timeline.lock().settle_gaps.iter().copied().collect()
    }

    fn record_integration_set(&self) {
        let now = Instant::now();
        let mut timeline = self.timeline.lock();
        timeline.last_integration_set = Some(now);
        push_bounded(&mut timeline.integration_sets, now);
    }

    fn record_read_start(&self) {
        let mut timeline = self.timeline.lock();
        if let Some(set_at) = timeline.last_integration_set {
            push_bounded(&mut timeline.settle_gaps, set_at.elapsed());
        }
    }

    fn check_read(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            bail!("USB transfer failed: device not responding");
        }
        let injected = self
            .pending_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("read timed out");
        }
        Ok(())
    }
}

/// Clears the probe's in-progress flag on every exit path.
struct ReadGuard<'a>(&'a SimulatedProbe);

impl<'a> ReadGuard<'a> {
    fn begin(probe: &'a SimulatedProbe) -> Self {
        probe.reading.store(true, Ordering::SeqCst);
        Self(probe)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.reading.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// SimulatedBackend
// =============================================================================

/// Backend exposing a configurable set of simulated spectrometers.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    devices: RwLock<Vec<(SimulatedDeviceSpec, Arc<SimulatedProbe>)>>,
}

impl SimulatedBackend {
    /// Backend with the given devices attached, in enumeration order.
    pub fn new(specs: impl IntoIterator<Item = SimulatedDeviceSpec>) -> Self {
        let backend = Self::default();
        for spec in specs {
            backend.attach(spec);
        }
        backend
    }

    /// Backend with default devices for each serial number.
    pub fn with_serials(serials: &[&str]) -> Self {
        Self::new(serials.iter().map(|s| SimulatedDeviceSpec::with_serial(*s)))
    }

    /// Plug in a device (replaces one with the same serial).
    pub fn attach(&self, spec: SimulatedDeviceSpec) -> Arc<SimulatedProbe> {
        let mut devices = self.devices.write();
        devices.retain(|(existing, _)| existing.serial != spec.serial);
        let probe = Arc::new(SimulatedProbe::default());
        devices.push((spec, Arc::clone(&probe)));
        probe
    }

    /// Unplug a device. Open handles keep working until they read.
    pub fn detach(&self, serial: &str) -> bool {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|(spec, probe)| {
            let keep = spec.serial != serial;
            if !keep {
                probe.set_disconnected(true);
            }
            keep
        });
        devices.len() != before
    }

    /// Instrumentation handle of a device.
    pub fn probe(&self, serial: &str) -> Option<Arc<SimulatedProbe>> {
        self.devices
            .read()
            .iter()
            .find(|(spec, _)| spec.serial == serial)
            .map(|(_, probe)| Arc::clone(probe))
    }
}

impl SpectrometerBackend for SimulatedBackend {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .devices
            .read()
            .iter()
            .map(|(spec, _)| spec.descriptor())
            .collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Spectrometer>> {
        let (spec, probe) = self
            .devices
            .read()
            .iter()
            .find(|(spec, _)| spec.serial == descriptor.identifier)
            .map(|(spec, probe)| (spec.clone(), Arc::clone(probe)))
            .ok_or_else(|| anyhow!("no simulated device '{}'", descriptor.identifier))?;

        if probe.fail_next_open.swap(false, Ordering::SeqCst) {
            bail!("USB claim interface failed");
        }

        probe.opens.fetch_add(1, Ordering::SeqCst);
        debug!(serial = %spec.serial, "Opened simulated spectrometer");
        Ok(Box::new(SimulatedSpectrometer::new(spec, probe)))
    }
}

// =============================================================================
// SimulatedSpectrometer
// =============================================================================

/// One open simulated instrument.
pub struct SimulatedSpectrometer {
    spec: SimulatedDeviceSpec,
    probe: Arc<SimulatedProbe>,
    rng: ChaCha8Rng,
    wavelengths: Vec<f64>,
    integration_micros: u32,
    trigger_mode: TriggerMode,
    closed: bool,
}

impl SimulatedSpectrometer {
    /// Open a simulated instrument directly, bypassing a backend.
    pub fn new(spec: SimulatedDeviceSpec, probe: Arc<SimulatedProbe>) -> Self {
        let rng = match spec.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let wavelengths = spec.wavelength_axis();
        Self {
            integration_micros: spec.min_integration_time_micros.max(1000),
            spec,
            probe,
            rng,
            wavelengths,
            trigger_mode: TriggerMode::FreeRunning,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            bail!("handle for '{}' is closed", self.spec.serial);
        }
        Ok(())
    }

    fn synthesize(&mut self) -> Vec<f64> {
        let gain = f64::from(self.integration_micros) / 1000.0;
        let artifact = DEFAULT_ARTIFACT_BINS.min(self.wavelengths.len());
        let mut counts = Vec::with_capacity(self.wavelengths.len());
        for (i, wl) in self.wavelengths.iter().enumerate() {
            if i < artifact {
                counts.push(if i % 2 == 0 { SATURATION_COUNTS } else { 0.0 });
                continue;
            }
            let signal: f64 = EMISSION_LINES
                .iter()
                .map(|(centre, width, height)| {
                    let x = (wl - centre) / width;
                    height * gain * (-0.5 * x * x).exp()
                })
                .sum();
            let noise = self.rng.gen_range(-NOISE_COUNTS..NOISE_COUNTS);
            counts.push((DARK_COUNTS + signal + noise).clamp(0.0, SATURATION_COUNTS));
        }
        counts
    }
}

impl Spectrometer for SimulatedSpectrometer {
    fn serial_number(&self) -> &str {
        &self.spec.serial
    }

    fn model(&self) -> &str {
        &self.spec.model
    }

    fn min_integration_time_micros(&self) -> u32 {
        self.spec.min_integration_time_micros
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.ensure_open()?;
        self.trigger_mode = mode;
        self.probe.trigger_mode.store(mode.index(), Ordering::SeqCst);
        Ok(())
    }

    fn set_integration_time_micros(&mut self, micros: u32) -> Result<()> {
        self.ensure_open()?;
        if micros < self.spec.min_integration_time_micros {
            bail!(
                "integration time {micros} µs below minimum {} µs",
                self.spec.min_integration_time_micros
            );
        }
        self.integration_micros = micros;
        self.probe.integration_micros.store(micros, Ordering::SeqCst);
        self.probe.record_integration_set();
        Ok(())
    }

    fn wavelengths(&mut self) -> Result<Vec<f64>> {
        self.ensure_open()?;
        if self.probe.disconnected.load(Ordering::SeqCst) {
            bail!("USB transfer failed: device not responding");
        }
        Ok(self.wavelengths.clone())
    }

    fn intensities(&mut self) -> Result<Vec<f64>> {
        self.ensure_open()?;
        let probe = Arc::clone(&self.probe);
        let _guard = ReadGuard::begin(&probe);
        probe.record_read_start();
        probe.check_read()?;

        let extra = Duration::from_micros(probe.extra_read_delay_micros.load(Ordering::SeqCst));
        thread::sleep(Duration::from_micros(u64::from(self.integration_micros)) + extra);

        let counts = self.synthesize();
        probe.reads.fetch_add(1, Ordering::SeqCst);
        Ok(counts)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.probe.is_reading() {
            self.probe.closed_during_read.store(true, Ordering::SeqCst);
        }
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        debug!(serial = %self.spec.serial, "Closed simulated spectrometer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(serial: &str) -> SimulatedDeviceSpec {
        SimulatedDeviceSpec {
            serial: serial.into(),
            pixels: 600,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn lists_devices_in_attach_order() {
        let backend = SimulatedBackend::with_serials(&["B", "A"]);
        let ids: Vec<_> = backend
            .list_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.identifier)
            .collect();
        assert_eq!(ids, vec!["B", "A"]);
    }

    #[test]
    fn read_has_matching_axes_and_artifact_region() {
        let backend = SimulatedBackend::new([seeded("S1")]);
        let mut dev = backend.open(&DeviceDescriptor::new("S1", "m")).unwrap();
        let wl = dev.wavelengths().unwrap();
        let it = dev.intensities().unwrap();
        assert_eq!(wl.len(), 600);
        assert_eq!(it.len(), 600);
        assert_eq!(it[0], SATURATION_COUNTS);
        assert!(it[DEFAULT_ARTIFACT_BINS..].iter().all(|v| *v > 900.0));
        assert_eq!(backend.probe("S1").unwrap().reads(), 1);
    }

    #[test]
    fn seeded_devices_are_reproducible() {
        let a = SimulatedSpectrometer::new(seeded("S"), Arc::default()).intensities().unwrap();
        let b = SimulatedSpectrometer::new(seeded("S"), Arc::default()).intensities().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn longer_integration_raises_lines() {
        let mut dev = SimulatedSpectrometer::new(seeded("S"), Arc::default());
        let short = dev.intensities().unwrap();
        dev.set_integration_time_micros(4000).unwrap();
        let long = dev.intensities().unwrap();
        let peak = |v: &[f64]| v[DEFAULT_ARTIFACT_BINS..].iter().cloned().fold(0.0, f64::max);
        assert!(peak(&long) > peak(&short));
    }

    #[test]
    fn injected_failures_are_consumed() {
        let backend = SimulatedBackend::new([seeded("S1")]);
        let probe = backend.probe("S1").unwrap();
        let mut dev = backend.open(&DeviceDescriptor::new("S1", "m")).unwrap();
        probe.fail_next_reads(2);
        assert!(dev.intensities().is_err());
        assert!(dev.intensities().is_err());
        assert!(dev.intensities().is_ok());
        assert!(!probe.is_reading());
    }

    #[test]
    fn timeline_records_settle_gaps_for_failed_reads_too() {
        let device = Arc::new(SimulatedProbe::default());
        let mut dev = SimulatedSpectrometer::new(seeded("S"), Arc::clone(&device));
        dev.intensities().unwrap();
        assert!(device.settle_gaps().is_empty());

        dev.set_integration_time_micros(1000).unwrap();
        thread::sleep(Duration::from_millis(5));
        device.fail_next_reads(1);
        assert!(dev.intensities().is_err());
        let gaps = device.settle_gaps();
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0] >= Duration::from_millis(5));
        assert_eq!(device.integration_set_times().len(), 1);
    }

    #[test]
    fn timeline_is_bounded() {
        let device = Arc::new(SimulatedProbe::default());
        let mut dev = SimulatedSpectrometer::new(seeded("S"), Arc::clone(&device));
        for _ in 0..TIMELINE_CAPACITY + 10 {
            dev.set_integration_time_micros(10).unwrap();
        }
        assert_eq!(device.integration_set_times().len(), TIMELINE_CAPACITY);
    }

    #[test]
    fn detach_disconnects_open_handles() {
        let backend = SimulatedBackend::new([seeded("S1")]);
        let mut dev = backend.open(&DeviceDescriptor::new("S1", "m")).unwrap();
        assert!(backend.detach("S1"));
        assert!(dev.intensities().is_err());
        assert!(backend.list_devices().unwrap().is_empty());
    }

    #[test]
    fn fail_next_open_only_once() {
        let backend = SimulatedBackend::new([seeded("S1")]);
        backend.probe("S1").unwrap().fail_next_open();
        let desc = DeviceDescriptor::new("S1", "m");
        assert!(backend.open(&desc).is_err());
        assert!(backend.open(&desc).is_ok());
    }

    #[test]
    fn rejects_integration_below_minimum_and_use_after_close() {
        let mut dev = SimulatedSpectrometer::new(
            SimulatedDeviceSpec {
                min_integration_time_micros: 100,
                ..seeded("S")
            },
            Arc::default(),
        );
        assert!(dev.set_integration_time_micros(50).is_err());
        dev.close().unwrap();
        assert!(dev.intensities().is_err());
    }
}
