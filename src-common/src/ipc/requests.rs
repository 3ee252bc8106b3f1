//! IPC request types.

use serde::{Deserialize, Serialize};

/// IPC request from client to service.
///
/// Wire shape: `{"command": "<NAME>", "payload": {...}}`. Commands without
/// parameters omit the `payload` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    // === Recording Control ===
    /// Start microphone capture
    StartRecording,
    /// Stop capture and hand the buffer to transcription
    StopRecording,

    // === State Queries ===
    /// Get current daemon state and transcript
    GetStatus,

    // === Refinement ===
    /// Run the configured LLM provider over arbitrary text
    ProcessText { text: String },

    // === Lifecycle ===
    /// Suspend activity; a recording in progress is discarded
    Pause,
    /// Leave the paused state
    Resume,
    /// Cancel active work and re-initialize engine bindings
    Restart,
    /// Request service shutdown
    Shutdown,
    /// Ping for health check
    Ping,
}

/// Errors produced while turning a decoded frame into a `Request`.
#[derive(Debug)]
pub enum DecodeError {
    /// Payload bytes are not a JSON object. Wire corruption, connection-fatal.
    Malformed(String),
    /// Valid JSON that names an unknown command or a bad payload shape
    Unrecognized(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(e) => write!(f, "Malformed request: {}", e),
            DecodeError::Unrecognized(e) => write!(f, "Unrecognized command: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors found by semantic validation of a decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// PROCESS_TEXT carried an empty or whitespace-only text field
    EmptyText,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyText => write!(f, "text payload must not be empty"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl Request {
    /// Decode a frame payload into a request.
    ///
    /// Distinguishes wire corruption (not JSON at all) from a well-formed
    /// object that simply isn't a known command; the former kills the
    /// connection, the latter only the request.
    pub fn decode(data: &[u8]) -> Result<Request, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| DecodeError::Unrecognized(e.to_string()))
    }

    /// Validate all parameters in this request.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Request::ProcessText { text } => {
                if text.trim().is_empty() {
                    return Err(ValidationError::EmptyText);
                }
            }
            // Other requests carry no parameters
            _ => {}
        }
        Ok(())
    }

    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::StartRecording => "START_RECORDING",
            Request::StopRecording => "STOP_RECORDING",
            Request::GetStatus => "GET_STATUS",
            Request::ProcessText { .. } => "PROCESS_TEXT",
            Request::Pause => "PAUSE",
            Request::Resume => "RESUME",
            Request::Restart => "RESTART",
            Request::Shutdown => "SHUTDOWN",
            Request::Ping => "PING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_command_wire_shape() {
        let json = serde_json::to_value(&Request::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"command": "PING"}));
    }

    #[test]
    fn test_payload_command_wire_shape() {
        let json = serde_json::to_value(&Request::ProcessText {
            text: "hello".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"command": "PROCESS_TEXT", "payload": {"text": "hello"}})
        );
    }

    #[test]
    fn test_decode_roundtrip() {
        for request in [
            Request::StartRecording,
            Request::StopRecording,
            Request::GetStatus,
            Request::ProcessText { text: "abc".into() },
            Request::Pause,
            Request::Resume,
            Request::Restart,
            Request::Shutdown,
            Request::Ping,
        ] {
            let bytes = serde_json::to_vec(&request).unwrap();
            let decoded = Request::decode(&bytes).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_decode_unknown_command_survives_connection() {
        let result = Request::decode(br#"{"command": "EJECT_DISC"}"#);
        assert!(matches!(result, Err(DecodeError::Unrecognized(_))));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let result = Request::decode(b"\x00\x01not json");
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_null_payload_accepted_for_bare_command() {
        let decoded = Request::decode(br#"{"command": "PING", "payload": null}"#).unwrap();
        assert_eq!(decoded, Request::Ping);
    }

    #[test]
    fn test_validate_rejects_empty_text() {
        let request = Request::ProcessText { text: "  ".into() };
        assert_eq!(request.validate(), Err(ValidationError::EmptyText));
        assert!(Request::ProcessText { text: "hi".into() }.validate().is_ok());
        assert!(Request::StartRecording.validate().is_ok());
    }
}
