//! Presentation handoff.
//!
//! The acquisition worker never calls a [`PresentationSink`] directly. It pushes
//! [`DisplayEvent`]s into a bounded channel with `try_send`; a full channel drops
//! the event and the worker counts it. The consumer side drains the channel either on a
//! dedicated thread ([`spawn_presenter`]) or as an async task ([`present`]), so
//! sink callbacks are strictly sequential and never run on the worker.
//!
//! ```text
//!   acquisition worker ──try_send──▶ [ bounded mpsc ] ──recv──▶ PresentationSink
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Consumer of processed spectra (plot widget, logger, network bridge).
pub trait PresentationSink: Send {
    /// A processed spectrum; both slices have the same length.
    fn on_sample(&mut self, wavelengths: &[f64], intensities: &[f64]);

    /// The wavelength range to display changed.
    fn on_display_bounds_changed(&mut self, lower: f64, upper: f64);

    /// Acquisition lifecycle notification.
    fn on_status(&mut self, _status: &AcquisitionStatus) {}
}

/// Lifecycle notifications raised by the acquisition loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionStatus {
    /// Loop started on an instrument
    Started {
        /// Instrument identifier
        identifier: String,
    },
    /// Continuous save failed; repeated failures are not reported again
    SaveFailed {
        /// Error description
        message: String,
    },
    /// Continuous save succeeded after a reported failure
    SaveRecovered,
    /// A cycle's sample could not be processed and was skipped
    ProcessingFailed {
        /// Error description
        message: String,
    },
    /// Reads kept failing; the loop has ended
    DeviceLost {
        /// Instrument identifier
        identifier: String,
        /// Error description
        message: String,
    },
    /// Loop ended
    Stopped {
        /// Instrument identifier
        identifier: String,
    },
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { identifier } => write!(f, "acquiring from '{identifier}'"),
            Self::SaveFailed { message } => write!(f, "saving spectra failed: {message}"),
            Self::SaveRecovered => f.write_str("saving spectra again"),
            Self::ProcessingFailed { message } => write!(f, "spectrum skipped: {message}"),
            Self::DeviceLost {
                identifier,
                message,
            } => write!(f, "lost '{identifier}': {message}"),
            Self::Stopped { identifier } => write!(f, "stopped acquiring from '{identifier}'"),
        }
    }
}

/// Event crossing the presentation channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    /// Processed spectrum
    Sample {
        /// Wavelength axis
        wavelengths: Arc<[f64]>,
        /// Processed intensities
        intensities: Arc<[f64]>,
    },
    /// New display range
    DisplayBounds {
        /// Lower wavelength
        lower: f64,
        /// Upper wavelength
        upper: f64,
    },
    /// Lifecycle notification
    Status(AcquisitionStatus),
}

/// Receiving half of the presentation channel.
pub type DisplayReceiver = mpsc::Receiver<DisplayEvent>;

/// Non-blocking sending half of the presentation channel.
#[derive(Debug, Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<DisplayEvent>,
}

impl SinkSender {
    /// Queue an event without blocking. Returns whether it was queued.
    pub fn send(&self, event: DisplayEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("Dropped display event (presenter busy)");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Dropped display event (presenter gone)");
                false
            }
        }
    }

    /// Queue a status event.
    pub fn status(&self, status: AcquisitionStatus) -> bool {
        self.send(DisplayEvent::Status(status))
    }

    /// Whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a presentation channel holding at most `capacity` pending events.
pub fn display_channel(capacity: usize) -> (SinkSender, DisplayReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SinkSender { tx }, rx)
}

/// Deliver one event to a sink.
pub fn dispatch<S: PresentationSink + ?Sized>(sink: &mut S, event: &DisplayEvent) {
    match event {
        DisplayEvent::Sample {
            wavelengths,
            intensities,
        } => sink.on_sample(wavelengths, intensities),
        DisplayEvent::DisplayBounds { lower, upper } => sink.on_display_bounds_changed(*lower, *upper),
        DisplayEvent::Status(status) => sink.on_status(status),
    }
}

/// Drain the channel into `sink` on a dedicated thread.
///
/// The thread ends when every sender is dropped and returns the sink.
pub fn spawn_presenter<S>(mut rx: DisplayReceiver, mut sink: S) -> std::io::Result<JoinHandle<S>>
where
    S: PresentationSink + 'static,
{
    thread::Builder::new()
        .name("spectro-presenter".to_string())
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                dispatch(&mut sink, &event);
            }
            debug!("Presenter thread exiting");
            sink
        })
}

/// Drain the channel into `sink` until every sender is dropped.
pub async fn present<S: PresentationSink>(mut rx: DisplayReceiver, mut sink: S) -> S {
    while let Some(event) = rx.recv().await {
        dispatch(&mut sink, &event);
    }
    debug!("Presenter task exiting");
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        samples: Vec<usize>,
        bounds: Vec<(f64, f64)>,
        statuses: Vec<AcquisitionStatus>,
    }

    impl PresentationSink for Recording {
        fn on_sample(&mut self, wavelengths: &[f64], intensities: &[f64]) {
            assert_eq!(wavelengths.len(), intensities.len());
            self.samples.push(intensities.len());
        }

        fn on_display_bounds_changed(&mut self, lower: f64, upper: f64) {
            self.bounds.push((lower, upper));
        }

        fn on_status(&mut self, status: &AcquisitionStatus) {
            self.statuses.push(status.clone());
        }
    }

    fn sample(n: usize) -> DisplayEvent {
        DisplayEvent::Sample {
            wavelengths: vec![0.0; n].into(),
            intensities: vec![1.0; n].into(),
        }
    }

    #[test]
    fn full_channel_drops_until_drained() {
        let (tx, mut rx) = display_channel(2);
        assert!(tx.send(sample(1)));
        assert!(tx.clone().send(sample(2)));
        assert!(!tx.send(sample(3)));

        assert!(rx.try_recv().is_ok());
        assert!(tx.send(sample(4)));
        let mut lengths = Vec::new();
        while let Ok(DisplayEvent::Sample { intensities, .. }) = rx.try_recv() {
            lengths.push(intensities.len());
        }
        assert_eq!(lengths, vec![2, 4]);
    }

    #[test]
    fn presenter_thread_delivers_in_order() {
        let (tx, rx) = display_channel(8);
        let presenter = spawn_presenter(rx, Recording::default()).unwrap();
        tx.send(sample(3));
        tx.send(DisplayEvent::DisplayBounds {
            lower: 400.0,
            upper: 700.0,
        });
        tx.status(AcquisitionStatus::SaveRecovered);
        tx.send(sample(5));
        drop(tx);
        let sink = presenter.join().unwrap();
        assert_eq!(sink.samples, vec![3, 5]);
        assert_eq!(sink.bounds, vec![(400.0, 700.0)]);
        assert_eq!(sink.statuses, vec![AcquisitionStatus::SaveRecovered]);
    }

    #[tokio::test]
    async fn async_presenter_ends_when_senders_drop() {
        let (tx, rx) = display_channel(4);
        let task = tokio::spawn(present(rx, Recording::default()));
        tx.send(sample(2));
        drop(tx);
        let sink = task.await.unwrap();
        assert_eq!(sink.samples, vec![2]);
    }

    #[test]
    fn closed_channel_rejects_events() {
        let (tx, rx) = display_channel(1);
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.send(sample(1)));
    }

    #[test]
    fn status_messages_are_readable() {
        let status = AcquisitionStatus::DeviceLost {
            identifier: "SIM0001".into(),
            message: "timeout".into(),
        };
        assert_eq!(status.to_string(), "lost 'SIM0001': timeout");
    }
}
