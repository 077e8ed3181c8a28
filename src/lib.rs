//! Real-time audio feature extraction and mood inference.
//!
//! Capture code pushes PCM into a [`Pipeline`](pipeline::Pipeline) through a
//! non-blocking [`CaptureHandle`](pipeline::CaptureHandle); a single worker
//! turns each buffer into [`AudioFeatures`](analysis::AudioFeatures) and a
//! hysteresis-smoothed [`Mood`](mood::Mood). Whole files go through
//! [`FileAnalyzer`](pipeline::file::FileAnalyzer) instead.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod governor;
pub mod mood;
pub mod options;
pub mod pipeline;
pub mod retry;
mod ring;

pub use analysis::{AudioFeatures, Mode, SpectralFeatures};
pub use audio::{AudioBuffer, BufferFormat, BufferPool};
pub use config::Config;
pub use error::{AnalysisError, ErrorKind, Result};
pub use governor::{PressureLevel, ResourceGovernor};
pub use mood::{Mood, MoodClassifier, MoodSnapshot};
pub use options::AnalysisOptions;
pub use pipeline::file::{FileAnalysis, FileAnalyzer};
pub use pipeline::{AnalysisContext, CaptureHandle, Pipeline, StopReport};
