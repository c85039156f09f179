//! Live acquisition loop.
//!
//! An [`AcquisitionLoop`] owns an open [`InstrumentSession`] and runs it on a
//! dedicated thread:
//!
//! ```text
//!   ┌──────────────────────────── worker thread ───────────────────────────┐
//!   │ snapshot config ─▶ read_sample ─▶ process ─▶ latest ─▶ record ─▶ emit │
//!   └──────────────────────────────────────────────────────────────────────┘
//!                                                                 │ try_send
//!                                                                 ▼
//!                                                        presentation channel
//! ```
//!
//! # Lifecycle
//!
//! [`AcquisitionLoop::start`] takes the session by value. [`AcquisitionLoop::stop`]
//! clears the running flag and waits, bounded by the stop timeout, for the worker
//! to confirm exit; only then is the session handed back. The flag is checked at
//! the top of every cycle and inside every backoff or pacing sleep, so the wait
//! is at most one in-flight read. If the timeout expires the worker is detached
//! and closes the session itself once the read returns.
//!
//! # Failures
//!
//! - Transient read errors are retried with exponential backoff, never sooner
//!   than `min_cycle_interval` after the failed attempt started; after
//!   `max_consecutive_failures` in a row the loop ends with `DeviceLost`.
//! - Non-transient errors end the loop immediately.
//! - Processing errors skip the cycle's sample and are reported once; the raw
//!   sample is still published as latest.
//! - Continuous-save errors never end the loop and are reported once until the
//!   next successful save.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::data::processor::process_sample;
use crate::data::spectrum::SpectrumSample;
use crate::data::storage::SampleRecorder;
use crate::error::{SpectroError, SpectroResult};
use crate::hardware::session::{InstrumentSession, SessionState};
use crate::sink::{AcquisitionStatus, DisplayEvent, SinkSender};
use crate::state::{BackgroundReference, ConfigState, ProcessingConfig, TriggerMode};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(5);
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Timing and retry policy of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Minimum time between the start of two cycles
    pub min_cycle_interval: Duration,
    /// Consecutive failed reads tolerated before the device is considered lost
    pub max_consecutive_failures: u32,
    /// Backoff after the first failed read
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// How long [`AcquisitionLoop::stop`] waits for the worker
    pub stop_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            min_cycle_interval: Duration::from_millis(50),
            max_consecutive_failures: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Latest {
    raw: Option<SpectrumSample>,
    processed: Option<SpectrumSample>,
}

/// Most recent raw and processed sample, shared with the controller.
#[derive(Debug, Clone, Default)]
pub struct LatestSpectra {
    inner: Arc<RwLock<Latest>>,
}

impl LatestSpectra {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both samples.
    pub fn publish(&self, raw: SpectrumSample, processed: SpectrumSample) {
        *self.inner.write() = Latest {
            raw: Some(raw),
            processed: Some(processed),
        };
    }

    /// Replace the raw sample of a cycle whose processing failed.
    ///
    /// The last processed sample is kept, so it may be older than the raw one.
    pub fn publish_raw(&self, raw: SpectrumSample) {
        self.inner.write().raw = Some(raw);
    }

    /// Latest sample as read (artifact region already dropped).
    pub fn raw(&self) -> Option<SpectrumSample> {
        self.inner.read().raw.clone()
    }

    /// Latest sample after processing.
    pub fn processed(&self) -> Option<SpectrumSample> {
        self.inner.read().processed.clone()
    }

    /// Forget the stored samples.
    pub fn clear(&self) {
        *self.inner.write() = Latest::default();
    }
}

/// Shared collaborators a loop reads from and writes to.
#[derive(Debug, Clone)]
pub struct AcquisitionContext {
    /// Live processing configuration, snapshotted every cycle
    pub config: ConfigState,
    /// Optional background reference, snapshotted every cycle
    pub background: BackgroundReference,
    /// Store for the latest samples
    pub latest: LatestSpectra,
    /// Presentation channel
    pub sink: SinkSender,
    /// Spectrum file writer
    pub recorder: SampleRecorder,
}

impl AcquisitionContext {
    /// Context with an empty background and latest-sample store.
    pub fn new(config: ConfigState, sink: SinkSender) -> Self {
        Self {
            config,
            background: BackgroundReference::new(),
            latest: LatestSpectra::new(),
            sink,
            recorder: SampleRecorder::new(),
        }
    }
}

/// Counters of one loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Cycles that produced a processed sample
    pub cycles: u64,
    /// Failed reads, retried or not
    pub read_failures: u64,
    /// Files written by continuous save
    pub saved: u64,
    /// Failed continuous saves
    pub save_failures: u64,
    /// Samples dropped because the presentation channel was full
    pub samples_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    read_failures: AtomicU64,
    saved: AtomicU64,
    save_failures: AtomicU64,
    samples_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LoopStats {
        LoopStats {
            cycles: self.cycles.load(Ordering::SeqCst),
            read_failures: self.read_failures.load(Ordering::SeqCst),
            saved: self.saved.load(Ordering::SeqCst),
            save_failures: self.save_failures.load(Ordering::SeqCst),
            samples_dropped: self.samples_dropped.load(Ordering::SeqCst),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Why the worker ended.
#[derive(Debug)]
pub enum ExitReason {
    /// The running flag was cleared
    Cancelled,
    /// The loop ended on its own
    Failed(SpectroError),
}

impl ExitReason {
    /// Error that ended the loop, if any.
    pub fn error(&self) -> Option<&SpectroError> {
        match self {
            ExitReason::Cancelled => None,
            ExitReason::Failed(err) => Some(err),
        }
    }

    /// Whether the loop ended because the device stopped answering.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, ExitReason::Failed(SpectroError::DeviceLost { .. }))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Cancelled => f.write_str("cancelled"),
            ExitReason::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Result of a confirmed stop.
#[derive(Debug)]
pub struct StoppedAcquisition {
    /// The session, still open
    pub session: InstrumentSession,
    /// Why the worker ended
    pub reason: ExitReason,
    /// Final counters
    pub stats: LoopStats,
}

struct WorkerExit {
    session: InstrumentSession,
    reason: ExitReason,
}

/// Handle to a running acquisition worker.
pub struct AcquisitionLoop {
    identifier: String,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker: Option<JoinHandle<WorkerExit>>,
    stop_timeout: Duration,
}

impl fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("identifier", &self.identifier)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl AcquisitionLoop {
    /// Start acquiring from an open session.
    pub fn start(
        session: InstrumentSession,
        context: AcquisitionContext,
        settings: LoopSettings,
    ) -> SpectroResult<Self> {
        if session.state() != SessionState::Open {
            return Err(SpectroError::InvalidState {
                identifier: session.identifier().to_string(),
                operation: "start acquisition on",
                state: session.state(),
            });
        }

        let identifier = session.identifier().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            applied_trigger: session.trigger_mode(),
            session,
            identifier: identifier.clone(),
            context,
            settings,
            running: Arc::clone(&running),
            counters: Arc::clone(&counters),
            consecutive_failures: 0,
            backoff: settings.initial_backoff,
            save_failing: false,
            processing_failing: false,
        };

        let handle = thread::Builder::new()
            .name(format!("spectro-acq-{identifier}"))
            .spawn(move || worker.run())
            .map_err(|err| SpectroError::Driver {
                identifier: identifier.clone(),
                operation: "start acquisition on",
                message: err.to_string(),
            })?;

        info!(identifier = %identifier, "Started acquisition");
        Ok(Self {
            identifier,
            running,
            counters,
            worker: Some(handle),
            stop_timeout: settings.stop_timeout,
        })
    }

    /// Identifier of the instrument being read.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether the worker is still cycling.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Current counters.
    pub fn stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    /// Stop the worker and take the session back.
    ///
    /// Returns [`SpectroError::StopTimeout`] if the worker does not confirm exit
    /// within the stop timeout. In that case the worker keeps the session and
    /// closes it when its in-flight read returns.
    pub fn stop(mut self) -> SpectroResult<StoppedAcquisition> {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return Err(SpectroError::WorkerPanicked {
                identifier: self.identifier.clone(),
            });
        };

        let deadline = Instant::now() + self.stop_timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    identifier = %self.identifier,
                    timeout = ?self.stop_timeout,
                    "Acquisition worker did not stop in time; detaching"
                );
                return Err(SpectroError::StopTimeout {
                    identifier: self.identifier.clone(),
                    waited: self.stop_timeout,
                });
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        let exit = worker.join().map_err(|_| {
            error!(identifier = %self.identifier, "Acquisition worker panicked");
            SpectroError::WorkerPanicked {
                identifier: self.identifier.clone(),
            }
        })?;

        let stats = self.stats();
        info!(
            identifier = %self.identifier,
            cycles = stats.cycles,
            read_failures = stats.read_failures,
            saved = stats.saved,
            dropped = stats.samples_dropped,
            reason = %exit.reason,
            "Stopped acquisition"
        );
        Ok(StoppedAcquisition {
            session: exit.session,
            reason: exit.reason,
            stats,
        })
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.worker.take().is_some() {
            debug!(identifier = %self.identifier, "Acquisition handle dropped; cancelling worker");
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

enum CycleOutcome {
    Completed,
    Skipped,
    Retry(Duration),
}

struct Worker {
    session: InstrumentSession,
    identifier: String,
    context: AcquisitionContext,
    settings: LoopSettings,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    applied_trigger: Option<TriggerMode>,
    consecutive_failures: u32,
    backoff: Duration,
    save_failing: bool,
    processing_failing: bool,
}

impl Worker {
    fn run(mut self) -> WorkerExit {
        self.context.sink.status(AcquisitionStatus::Started {
            identifier: self.identifier.clone(),
        });

        let reason = loop {
            if !self.running.load(Ordering::SeqCst) {
                break ExitReason::Cancelled;
            }
            let started = Instant::now();
            let outcome = self.cycle();
            let floor = self
                .settings
                .min_cycle_interval
                .saturating_sub(started.elapsed());
            let pause = match outcome {
                // the cycle floor applies to failed reads too
                Ok(CycleOutcome::Retry(backoff)) => backoff.max(floor),
                Ok(CycleOutcome::Completed | CycleOutcome::Skipped) => floor,
                Err(err) => break ExitReason::Failed(err),
            };
            if !self.sleep_while_running(pause) {
                break ExitReason::Cancelled;
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if let ExitReason::Failed(err) = &reason {
            error!(identifier = %self.identifier, error = %err, "Acquisition ended");
            if let SpectroError::DeviceLost { message, .. } = err {
                self.context.sink.status(AcquisitionStatus::DeviceLost {
                    identifier: self.identifier.clone(),
                    message: message.clone(),
                });
            }
        }
        self.context.sink.status(AcquisitionStatus::Stopped {
            identifier: self.identifier.clone(),
        });
        debug!(identifier = %self.identifier, "Acquisition worker exiting");

        WorkerExit {
            session: self.session,
            reason,
        }
    }

    fn cycle(&mut self) -> SpectroResult<CycleOutcome> {
        let cfg = self.context.config.snapshot();

        if self.applied_trigger != Some(cfg.trigger_mode) {
            self.session.configure(cfg.trigger_mode)?;
            self.applied_trigger = Some(cfg.trigger_mode);
        }

        let raw = match self.session.read_sample(cfg.integration_time_micros) {
            Ok(sample) => {
                self.consecutive_failures = 0;
                self.backoff = self.settings.initial_backoff;
                sample
            }
            Err(err) if err.is_transient() => return self.read_failed(err),
            Err(err) => return Err(err),
        };

        let background = self.context.background.snapshot();
        let processed = match process_sample(&raw, &cfg, background.as_deref()) {
            Ok(processed) => {
                self.processing_failing = false;
                processed
            }
            Err(err) => {
                // a fresh background can still be captured from this read
                self.context.latest.publish_raw(raw);
                if !self.processing_failing {
                    warn!(identifier = %self.identifier, error = %err, "Skipping spectrum");
                    self.context.sink.status(AcquisitionStatus::ProcessingFailed {
                        message: err.to_string(),
                    });
                }
                self.processing_failing = true;
                return Ok(CycleOutcome::Skipped);
            }
        };

        self.context.latest.publish(raw, processed.clone());

        if cfg.continuous_save_enabled {
            self.save(&processed, &cfg);
        }

        let queued = self.context.sink.send(DisplayEvent::Sample {
            wavelengths: processed.shared_wavelengths(),
            intensities: processed.shared_intensities(),
        });
        if !queued && !self.context.sink.is_closed() {
            Counters::bump(&self.counters.samples_dropped);
        }

        Counters::bump(&self.counters.cycles);
        Ok(CycleOutcome::Completed)
    }

    fn read_failed(&mut self, err: SpectroError) -> SpectroResult<CycleOutcome> {
        Counters::bump(&self.counters.read_failures);
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            return Err(SpectroError::DeviceLost {
                identifier: self.identifier.clone(),
                attempts: self.consecutive_failures,
                message: err.to_string(),
            });
        }

        let backoff = self.backoff;
        warn!(
            identifier = %self.identifier,
            attempt = self.consecutive_failures,
            backoff = ?backoff,
            error = %err,
            "Read failed; retrying"
        );
        self.backoff = (self.backoff * 2).min(self.settings.max_backoff);
        Ok(CycleOutcome::Retry(backoff))
    }

    fn save(&mut self, sample: &SpectrumSample, cfg: &ProcessingConfig) {
        match self.context.recorder.record_continuous(sample, cfg) {
            Ok(_) => {
                Counters::bump(&self.counters.saved);
                if self.save_failing {
                    info!(identifier = %self.identifier, "Continuous save recovered");
                    self.context.sink.status(AcquisitionStatus::SaveRecovered);
                    self.save_failing = false;
                }
            }
            Err(err) => {
                Counters::bump(&self.counters.save_failures);
                if !self.save_failing {
                    warn!(identifier = %self.identifier, error = %err, "Continuous save failed");
                    self.context.sink.status(AcquisitionStatus::SaveFailed {
                        message: err.to_string(),
                    });
                    self.save_failing = true;
                }
            }
        }
    }

    /// Sleep in short slices; false if the running flag was cleared.
    fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::catalog::DeviceCatalog;
    use crate::hardware::mock::{SimulatedBackend, SimulatedDeviceSpec, SimulatedProbe};
    use crate::hardware::session::SessionSettings;
    use crate::sink::{display_channel, DisplayReceiver};

    fn fast_loop() -> LoopSettings {
        LoopSettings {
            min_cycle_interval: Duration::from_millis(1),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn open_session(serial: &str) -> (InstrumentSession, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new([SimulatedDeviceSpec {
            pixels: 100,
            seed: Some(3),
            ..SimulatedDeviceSpec::with_serial(serial)
        }]));
        let catalog = DeviceCatalog::new(backend.clone());
        catalog.refresh().unwrap();
        let mut session = InstrumentSession::new(
            catalog,
            SessionSettings {
                settle_interval: Duration::ZERO,
                ..Default::default()
            },
        );
        session.open(serial).unwrap();
        (session, backend)
    }

    fn context() -> (AcquisitionContext, DisplayReceiver) {
        let (tx, rx) = display_channel(64);
        (AcquisitionContext::new(ConfigState::default(), tx), rx)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn start_requires_open_session() {
        let (mut session, _) = open_session("A");
        session.close().unwrap();
        let (ctx, _rx) = context();
        let err = AcquisitionLoop::start(session, ctx, fast_loop()).unwrap_err();
        assert!(matches!(err, SpectroError::InvalidState { .. }));
    }

    #[test]
    fn publishes_latest_and_returns_open_session() {
        let (session, _) = open_session("A");
        let (ctx, mut rx) = context();
        let latest = ctx.latest.clone();
        let acq = AcquisitionLoop::start(session, ctx, fast_loop()).unwrap();
        wait_for(|| acq.stats().cycles >= 3);

        let stopped = acq.stop().unwrap();
        assert!(matches!(stopped.reason, ExitReason::Cancelled));
        assert_eq!(stopped.session.state(), SessionState::Open);
        assert_eq!(latest.raw().unwrap().len(), 70);
        assert_eq!(latest.processed().unwrap().len(), 70);

        assert!(matches!(
            rx.try_recv().unwrap(),
            DisplayEvent::Status(AcquisitionStatus::Started { .. })
        ));
        assert!(matches!(rx.try_recv().unwrap(), DisplayEvent::Sample { .. }));
    }

    #[test]
    fn transient_failures_are_retried() {
        let (session, backend) = open_session("A");
        backend.probe("A").unwrap().fail_next_reads(3);
        let (ctx, _rx) = context();
        let acq = AcquisitionLoop::start(session, ctx, fast_loop()).unwrap();
        wait_for(|| acq.stats().cycles >= 1);
        let stopped = acq.stop().unwrap();
        assert_eq!(stopped.stats.read_failures, 3);
        assert!(stopped.reason.error().is_none());
    }

    fn assert_paced(device: &SimulatedProbe, floor: Duration) {
        let starts = device.integration_set_times();
        // 1ms of timer slack
        let floor = floor - Duration::from_millis(1);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= floor, "reads {gap:?} apart");
        }
    }

    #[test]
    fn reads_respect_min_cycle_interval() {
        let (session, backend) = open_session("A");
        let device = backend.probe("A").unwrap();
        let (ctx, _rx) = context();
        let floor = Duration::from_millis(25);
        let settings = LoopSettings {
            min_cycle_interval: floor,
            ..fast_loop()
        };
        let acq = AcquisitionLoop::start(session, ctx, settings).unwrap();
        wait_for(|| device.integration_set_times().len() >= 4);
        acq.stop().unwrap();
        assert_paced(&device, floor);
    }

    #[test]
    fn retries_respect_min_cycle_interval() {
        let (session, backend) = open_session("A");
        let device = backend.probe("A").unwrap();
        device.fail_next_reads(3);
        let (ctx, _rx) = context();
        let floor = Duration::from_millis(25);
        let settings = LoopSettings {
            min_cycle_interval: floor,
            ..fast_loop()
        };
        let acq = AcquisitionLoop::start(session, ctx, settings).unwrap();
        wait_for(|| acq.stats().cycles >= 2);
        let stopped = acq.stop().unwrap();
        assert_eq!(stopped.stats.read_failures, 3);
        assert!(device.integration_set_times().len() >= 5);
        assert_paced(&device, floor);
    }

    #[test]
    fn persistent_failures_escalate_to_device_lost() {
        let (session, backend) = open_session("A");
        backend.probe("A").unwrap().set_disconnected(true);
        let (ctx, _rx) = context();
        let acq = AcquisitionLoop::start(session, ctx, fast_loop()).unwrap();
        wait_for(|| !acq.is_running());
        let stopped = acq.stop().unwrap();
        assert!(stopped.reason.is_device_lost());
        assert_eq!(stopped.stats.read_failures, 5);
    }

    #[test]
    fn trigger_change_is_applied_by_worker() {
        let (session, backend) = open_session("A");
        let probe = backend.probe("A").unwrap();
        let (ctx, _rx) = context();
        let config = ctx.config.clone();
        let acq = AcquisitionLoop::start(session, ctx, fast_loop()).unwrap();
        wait_for(|| probe.trigger_mode() == Some(TriggerMode::FreeRunning));
        config
            .update(|cfg| cfg.trigger_mode = TriggerMode::ExternalEdge)
            .unwrap();
        wait_for(|| probe.trigger_mode() == Some(TriggerMode::ExternalEdge));
        acq.stop().unwrap();
    }

    #[test]
    fn mismatched_background_skips_cycles_without_stopping() {
        let (session, _) = open_session("A");
        let (ctx, mut rx) = context();
        ctx.background.set(Arc::from(vec![0.0; 3]));
        ctx.config
            .update(|cfg| cfg.background_subtraction_enabled = true)
            .unwrap();
        let acq = AcquisitionLoop::start(session, ctx.clone(), fast_loop()).unwrap();
        wait_for(|| !rx.is_empty());
        thread::sleep(Duration::from_millis(30));
        assert!(acq.is_running());
        assert_eq!(acq.stats().cycles, 0);
        // raw reads stay visible so a matching background can be captured
        assert_eq!(ctx.latest.raw().unwrap().len(), 70);
        assert!(ctx.latest.processed().is_none());

        ctx.background.clear();
        wait_for(|| acq.stats().cycles >= 1);
        acq.stop().unwrap();

        let mut processing_failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let DisplayEvent::Status(AcquisitionStatus::ProcessingFailed { .. }) = event {
                processing_failures += 1;
            }
        }
        assert_eq!(processing_failures, 1);
    }

    #[test]
    fn slow_read_reports_stop_timeout() {
        let (session, backend) = open_session("A");
        let probe = backend.probe("A").unwrap();
        probe.set_extra_read_delay(Duration::from_millis(300));
        let (ctx, _rx) = context();
        let settings = LoopSettings {
            stop_timeout: Duration::from_millis(20),
            ..fast_loop()
        };
        let acq = AcquisitionLoop::start(session, ctx, settings).unwrap();
        wait_for(|| probe.is_reading());
        let err = acq.stop().unwrap_err();
        assert!(matches!(err, SpectroError::StopTimeout { .. }));

        // the detached worker closes the handle after its read completes
        wait_for(|| probe.closes() == 1);
        assert!(!probe.closed_during_read());
    }
}
