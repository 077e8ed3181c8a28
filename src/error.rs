//! Error taxonomy for the analysis core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid audio format: {0}")]
    InvalidAudioFormat(String),

    #[error("Buffer processing failed: {0}")]
    BufferProcessingFailed(String),

    #[error("Mood model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("Mood inference failed: {0}")]
    InferenceFailed(String),

    #[error("Insufficient audio data: {0}")]
    InsufficientAudioData(String),

    #[error("Analysis timed out after {elapsed_ms} ms ({pct:.0}% complete)", pct = .progress * 100.0)]
    AnalysisTimeout { elapsed_ms: u64, progress: f32 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device resources unavailable: {0}")]
    DeviceResourcesUnavailable(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: u32, last: String },
}

/// Fieldless mirror of [`AnalysisError`] used for policy decisions and
/// for reporting across the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    FileNotFound,
    InvalidAudioFormat,
    BufferProcessingFailed,
    ModelLoadFailed,
    InferenceFailed,
    InsufficientAudioData,
    AnalysisTimeout,
    PermissionDenied,
    DeviceResourcesUnavailable,
    MaxRetriesExceeded,
}

impl ErrorKind {
    /// Transient kinds get local cleanup and a bounded retry.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::DeviceResourcesUnavailable
                | ErrorKind::BufferProcessingFailed
                | ErrorKind::PermissionDenied
        )
    }

    /// Data-shape kinds fail immediately; retrying cannot change the input.
    pub fn is_data_shape(self) -> bool {
        matches!(
            self,
            ErrorKind::InsufficientAudioData | ErrorKind::InvalidAudioFormat
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::FileNotFound => "The audio file could not be found",
            ErrorKind::InvalidAudioFormat => "The audio format is not supported",
            ErrorKind::BufferProcessingFailed => "An audio buffer could not be processed",
            ErrorKind::ModelLoadFailed => "The mood model could not be loaded",
            ErrorKind::InferenceFailed => "Mood inference failed",
            ErrorKind::InsufficientAudioData => "Not enough audio to analyze",
            ErrorKind::AnalysisTimeout => "Analysis took too long and was checkpointed",
            ErrorKind::PermissionDenied => "Access to the audio source was denied",
            ErrorKind::DeviceResourcesUnavailable => "The device is low on resources",
            ErrorKind::MaxRetriesExceeded => "The operation kept failing and was abandoned",
        }
    }
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::FileNotFound(_) => ErrorKind::FileNotFound,
            AnalysisError::InvalidAudioFormat(_) => ErrorKind::InvalidAudioFormat,
            AnalysisError::BufferProcessingFailed(_) => ErrorKind::BufferProcessingFailed,
            AnalysisError::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            AnalysisError::InferenceFailed(_) => ErrorKind::InferenceFailed,
            AnalysisError::InsufficientAudioData(_) => ErrorKind::InsufficientAudioData,
            AnalysisError::AnalysisTimeout { .. } => ErrorKind::AnalysisTimeout,
            AnalysisError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            AnalysisError::DeviceResourcesUnavailable(_) => ErrorKind::DeviceResourcesUnavailable,
            AnalysisError::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
        }
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::BufferProcessingFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        Self::BufferProcessingFailed(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_taxonomy() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(AnalysisError::from(nf).kind(), ErrorKind::FileNotFound);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(AnalysisError::from(denied).kind(), ErrorKind::PermissionDenied);

        let other = std::io::Error::new(std::io::ErrorKind::Other, "?");
        assert_eq!(AnalysisError::from(other).kind(), ErrorKind::BufferProcessingFailed);
    }

    #[test]
    fn propagation_classes() {
        assert!(ErrorKind::DeviceResourcesUnavailable.is_transient());
        assert!(ErrorKind::PermissionDenied.is_transient());
        assert!(!ErrorKind::InsufficientAudioData.is_transient());
        assert!(ErrorKind::InvalidAudioFormat.is_data_shape());
        assert!(!ErrorKind::AnalysisTimeout.is_transient());
    }

    #[test]
    fn timeout_message_reports_progress() {
        let err = AnalysisError::AnalysisTimeout {
            elapsed_ms: 1500,
            progress: 0.25,
        };
        assert_eq!(
            err.to_string(),
            "Analysis timed out after 1500 ms (25% complete)"
        );
    }
}
