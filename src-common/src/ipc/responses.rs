//! IPC reply and event types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::StateSnapshot;

/// Outcome marker carried by every reply and event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// One message from service to client.
///
/// Direct command replies and broadcast state events share this shape:
/// `{"status": ..., "data": ...|null, "error": ...|null, "state": {...}}`.
/// Events are recognizable by an `event` field inside `data`; a client
/// waiting on a direct reply skips frames carrying one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub state: StateSnapshot,
}

/// Event kinds broadcast to every session after a state transition.
///
/// Serialized into the `data` field of a `Reply`, tagged by `event`, so the
/// wire carries e.g. `{"event": "transcription_complete", "transcription": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    /// Capture opened, daemon is recording
    RecordingStarted,
    /// Capture device failed while recording; back to idle
    RecordingFailed,
    /// Capture finished, speech engine running
    TranscriptionStarted,
    /// Transcript ready (empty string when the capture held no speech)
    TranscriptionComplete { transcription: String },
    /// Engine failed after its retry; detail in the reply's error field
    TranscriptionFailed,
    /// Refinement provider call in flight
    RefinementStarted,
    /// Refined text ready
    RefinementComplete { text: String },
    /// Provider retries exhausted; `text` is the original, unmodified
    RefinementFailed { text: String },
    /// Daemon suspended
    Paused,
    /// Daemon resumed
    Resumed,
    /// Engine bindings are being re-initialized
    Restarting,
    /// Restart finished, daemon is idle again
    RestartComplete,
    /// Engine re-initialization failed; detail in the reply's error field
    RestartFailed,
    /// Terminal: the daemon is going away
    ShuttingDown,
}

impl Reply {
    /// Create a success reply.
    pub fn success(data: Option<Value>, state: StateSnapshot) -> Self {
        Reply {
            status: ReplyStatus::Success,
            data,
            error: None,
            state,
        }
    }

    /// Create an error reply with a human-readable message.
    pub fn error(message: impl Into<String>, state: StateSnapshot) -> Self {
        Reply {
            status: ReplyStatus::Error,
            data: None,
            error: Some(message.into()),
            state,
        }
    }

    /// Create a broadcast event for a successful transition.
    pub fn event(event: &StateEvent, state: StateSnapshot) -> Self {
        Reply {
            status: ReplyStatus::Success,
            data: Some(serde_json::to_value(event).unwrap_or(Value::Null)),
            error: None,
            state,
        }
    }

    /// Create a broadcast event for a failed workflow.
    pub fn error_event(
        event: &StateEvent,
        message: impl Into<String>,
        state: StateSnapshot,
    ) -> Self {
        Reply {
            status: ReplyStatus::Error,
            data: Some(serde_json::to_value(event).unwrap_or(Value::Null)),
            error: Some(message.into()),
            state,
        }
    }

    /// Check if this reply indicates an error.
    pub fn is_error(&self) -> bool {
        self.status == ReplyStatus::Error
    }

    /// The `event` marker if this frame is a broadcast event.
    pub fn event_kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("event")?.as_str()
    }

    /// Sequence number of the attached state snapshot.
    pub fn sequence(&self) -> u64 {
        self.state.sequence
    }
}
