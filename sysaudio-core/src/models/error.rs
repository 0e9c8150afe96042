use thiserror::Error;

use super::state::SessionState;

/// Errors that can occur while setting up, running or finalizing a recording.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CaptureError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no system audio source available: {0}")]
    SourceUnavailable(String),

    #[error("failed to acquire audio source ({context}): OS status {code}")]
    AcquisitionFailed { code: i32, context: String },

    #[error("audio format unavailable after {attempts} attempts")]
    FormatUnavailable { attempts: u32 },

    #[error("failed to start audio delivery ({context}): OS status {code}")]
    StartFailed { code: i32, context: String },

    #[error("recorder is already running")]
    AlreadyRecording,

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("format conversion failed: {0}")]
    ConversionFailed(String),

    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("another recording session is already active in this process")]
    SessionActive,
}

impl CaptureError {
    /// Wrap an `std::io::Error` with a short description of what was attempted.
    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::Io(format!("{}: {}", context, err))
    }
}
