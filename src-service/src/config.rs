//! Configuration loading and types for the sotto daemon
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/sotto/config.toml)
//! 3. Environment variables (SOTTO_*)

use crate::error::DaemonError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Sotto Configuration
#
# Location: ~/.config/sotto/config.toml

[audio]
# Audio input device ("default" uses system default)
# List devices with: pactl list sources short
device = "default"

# Sample rate in Hz the pipeline works in (whisper expects 16000)
sample_rate = 16000

[segmenter]
# Speech detection sensitivity (0.0 to 1.0, higher = less sensitive)
threshold = 0.3

# Minimum speech duration in milliseconds (shorter bursts are ignored)
min_speech_ms = 200

# Silence duration in milliseconds before a segment is closed
hold_ms = 500

# Padding in milliseconds kept around each detected segment
pad_ms = 100

[speech]
# OpenAI-compatible transcription endpoint (whisper.cpp server, etc.)
endpoint = "http://127.0.0.1:8080"

# Model name sent to the server
model = "whisper-1"

# Request timeout in seconds
timeout_secs = 30

# Optional API key (or set SOTTO_SPEECH_API_KEY)
# api_key = "sk-..."

[refinement]
# OpenAI-compatible chat completions endpoint used by PROCESS_TEXT
endpoint = "http://127.0.0.1:11434/v1/chat/completions"

# Model name sent to the server
model = "llama3.2"

# Instruction prepended as the system message
prompt = "Clean up this dictation. Fix grammar and punctuation, remove filler words. Output only the cleaned text."

# Per-attempt timeout in milliseconds
timeout_ms = 15000

# Retries after the first failed attempt
max_retries = 2

# Exponential backoff between attempts (doubles up to the max)
backoff_initial_ms = 500
backoff_max_ms = 4000

# Optional API key (or set SOTTO_REFINEMENT_API_KEY)
# api_key = "sk-..."

[events]
# Per-subscriber event queue capacity. When a slow client falls this far
# behind, its oldest undelivered events are dropped.
queue_capacity = 64
"#;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub segmenter: SegmenterConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub refinement: RefinementConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// PipeWire/PulseAudio device name, or "default"
    #[serde(default = "default_device")]
    pub device: String,

    /// Sample rate in Hz (whisper expects 16000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

/// Speech segmentation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmenterConfig {
    /// Detection sensitivity, 0.0 (most sensitive) to 1.0 (least)
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Segments shorter than this are discarded as noise
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,

    /// Silence required before a segment is closed
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u32,

    /// Padding kept around each detected segment
    #[serde(default = "default_pad_ms")]
    pub pad_ms: u32,
}

/// Remote transcription endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeechConfig {
    /// Base endpoint URL of an OpenAI-compatible transcription server
    #[serde(default = "default_speech_endpoint")]
    pub endpoint: String,

    /// Model name to send to the server
    #[serde(default = "default_speech_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_speech_timeout_secs")]
    pub timeout_secs: u64,

    /// Optional API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Text refinement endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefinementConfig {
    /// Chat completions endpoint URL
    #[serde(default = "default_refinement_endpoint")]
    pub endpoint: String,

    /// Model name to send to the server
    #[serde(default = "default_refinement_model")]
    pub model: String,

    /// Instruction sent as the system message
    #[serde(default = "default_refinement_prompt")]
    pub prompt: String,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_refinement_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff between attempts in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Optional API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Event broadcasting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Per-subscriber event queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_threshold() -> f32 {
    0.3
}

fn default_min_speech_ms() -> u32 {
    200
}

fn default_hold_ms() -> u32 {
    500
}

fn default_pad_ms() -> u32 {
    100
}

fn default_speech_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_speech_model() -> String {
    "whisper-1".to_string()
}

fn default_speech_timeout_secs() -> u64 {
    30
}

fn default_refinement_endpoint() -> String {
    "http://127.0.0.1:11434/v1/chat/completions".to_string()
}

fn default_refinement_model() -> String {
    "llama3.2".to_string()
}

fn default_refinement_prompt() -> String {
    "Clean up this dictation. Fix grammar and punctuation, remove filler words. \
     Output only the cleaned text."
        .to_string()
}

fn default_refinement_timeout_ms() -> u64 {
    15000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    4000
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_sample_rate(),
        }
    }
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_speech_ms: default_min_speech_ms(),
            hold_ms: default_hold_ms(),
            pad_ms: default_pad_ms(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            endpoint: default_speech_endpoint(),
            model: default_speech_model(),
            timeout_secs: default_speech_timeout_secs(),
            api_key: None,
        }
    }
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            endpoint: default_refinement_endpoint(),
            model: default_refinement_model(),
            prompt: default_refinement_prompt(),
            timeout_ms: default_refinement_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            api_key: None,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            segmenter: SegmenterConfig::default(),
            speech: SpeechConfig::default(),
            refinement: RefinementConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "sotto")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, DaemonError> {
    let mut config = Config::default();

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| DaemonError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| DaemonError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    // Override from environment variables
    if let Ok(device) = std::env::var("SOTTO_AUDIO_DEVICE") {
        config.audio.device = device;
    }
    if let Ok(endpoint) = std::env::var("SOTTO_SPEECH_ENDPOINT") {
        config.speech.endpoint = endpoint;
    }
    if let Ok(key) = std::env::var("SOTTO_SPEECH_API_KEY") {
        config.speech.api_key = Some(key);
    }
    if let Ok(endpoint) = std::env::var("SOTTO_REFINEMENT_ENDPOINT") {
        config.refinement.endpoint = endpoint;
    }
    if let Ok(key) = std::env::var("SOTTO_REFINEMENT_API_KEY") {
        config.refinement.api_key = Some(key);
    }

    Ok(config)
}

/// Write the default config template if no file exists yet.
///
/// Returns the path that was written, or None when a file was already there
/// (or no config directory could be determined).
pub fn ensure_default_config() -> std::io::Result<Option<PathBuf>> {
    let Some(path) = Config::default_path() else {
        return Ok(None);
    };

    if path.exists() {
        return Ok(None);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, DEFAULT_CONFIG)?;

    Ok(Some(path))
}
