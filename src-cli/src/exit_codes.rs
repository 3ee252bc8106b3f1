//! Exit codes for the CLI.
//!
//! These codes enable scripting integration by providing structured
//! feedback about operation results.

/// Exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum ExitCode {
    /// Operation completed successfully
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Invalid command-line arguments
    InvalidArguments = 2,
    /// Failed to connect to the service
    ServiceConnectionFailed = 3,
    /// Recording failed to start
    RecordingFailedToStart = 4,
    /// Transcription failed after the recording ended
    TranscriptionFailed = 5,
    /// Text refinement failed (the original text is preserved)
    RefinementFailed = 6,
    /// Command was not valid in the service's current state
    StateConflict = 7,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Success => write!(f, "success"),
            ExitCode::GeneralError => write!(f, "general error"),
            ExitCode::InvalidArguments => write!(f, "invalid arguments"),
            ExitCode::ServiceConnectionFailed => write!(f, "service connection failed"),
            ExitCode::RecordingFailedToStart => write!(f, "recording failed to start"),
            ExitCode::TranscriptionFailed => write!(f, "transcription failed"),
            ExitCode::RefinementFailed => write!(f, "refinement failed"),
            ExitCode::StateConflict => write!(f, "state conflict"),
        }
    }
}
