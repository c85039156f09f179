//! Spectrum data type, processing and storage modules.
pub mod processor;
pub mod spectrum;
pub mod storage;

pub use spectrum::{SpectrumSample, DEFAULT_ARTIFACT_BINS};
