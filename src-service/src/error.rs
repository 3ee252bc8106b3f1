//! Error types for the sotto daemon
//!
//! Uses thiserror for ergonomic error definitions. The Display text of a
//! variant is what clients see in the `error` field of a reply, so each
//! message names the failing subsystem first.

use thiserror::Error;

/// Top-level error type for daemon operations
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Refinement error: {0}")]
    Refinement(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Result type alias using DaemonError
pub type Result<T> = std::result::Result<T, DaemonError>;
