//! # Spectro DAQ Core Library
//!
//! Live acquisition, processing and recording for optical spectrometers. The
//! library holds every component so that any front end (the bundled CLI, a
//! plotting GUI, a service) only has to implement a [`sink::PresentationSink`]
//! and drive a [`controller::SpectrometerController`].
//!
//! ## Crate Structure
//!
//! - **`hardware`**: driver traits ([`hardware::Spectrometer`],
//!   [`hardware::SpectrometerBackend`]), the device catalog, the instrument
//!   session lifecycle and a simulated backend.
//! - **`data`**: the [`data::SpectrumSample`] type, the signal processor
//!   (background subtraction, moving average) and the spectrum file recorder.
//! - **`state`**: [`state::ProcessingConfig`], the shared [`state::ConfigState`]
//!   and the optional [`state::BackgroundReference`].
//! - **`acquisition`**: the cancellable worker that reads, processes, records and
//!   emits one spectrum per cycle.
//! - **`sink`**: the bounded presentation channel and the sink trait.
//! - **`controller`**: instrument selection and switching plus user actions.
//! - **`config`**: Figment-based configuration loading.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the crate-wide [`error::SpectroError`].
//!
//! ## Data Flow
//!
//! ```text
//! DeviceCatalog ─▶ InstrumentSession ─▶ AcquisitionLoop ─┬─▶ processor ─▶ SampleRecorder
//!                                                         └─▶ presentation channel ─▶ PresentationSink
//! ```

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod sink;
pub mod state;

pub use error::{SpectroError, SpectroResult};
