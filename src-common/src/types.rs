//! Shared daemon state types visible on the wire.

use serde::{Deserialize, Serialize};

/// Daemon phase enum.
///
/// Exactly one phase is active at any instant. All mutation happens inside
/// the service's state machine; clients only ever see snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not doing anything, ready for commands
    Idle,
    /// Microphone capture in progress
    Recording,
    /// Speech engine running on a finished capture
    Transcribing,
    /// LLM refinement running on submitted text
    Processing,
    /// Suspended by a client; no capture or inference runs
    Paused,
    /// Last workflow failed; detail in `last_error`
    Error,
    /// Tearing down workers and re-initializing engine bindings
    Restarting,
    /// Terminal; the process exits after cleanup
    ShuttingDown,
}

impl Phase {
    /// Whether a workflow currently holds the capture device or an engine.
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Recording | Phase::Transcribing | Phase::Processing)
    }

    /// Wire name of this phase ("idle", "shutting_down", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Recording => "recording",
            Phase::Transcribing => "transcribing",
            Phase::Processing => "processing",
            Phase::Paused => "paused",
            Phase::Error => "error",
            Phase::Restarting => "restarting",
            Phase::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of the daemon state, attached to every reply and event.
///
/// `sequence` increments on every phase transition; clients compare it to
/// detect stale or skipped updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StateSnapshot {
    pub fn new(phase: Phase, sequence: u64) -> Self {
        Self {
            phase,
            sequence,
            last_error: None,
        }
    }
}
