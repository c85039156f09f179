//! Spectrometer hardware abstractions.
//!
//! - [`capabilities`]: driver traits a vendor backend implements
//! - [`catalog`]: enumeration and per-identifier handle ownership
//! - [`session`]: open/configure/read/close lifecycle of one instrument
//! - [`mock`]: simulated backend for running without hardware

pub mod capabilities;
pub mod catalog;
pub mod mock;
pub mod session;

pub use capabilities::{DeviceDescriptor, Spectrometer, SpectrometerBackend};
pub use catalog::DeviceCatalog;
pub use session::{InstrumentSession, SessionSettings, SessionState};
