//! Speech-to-text via an OpenAI-compatible API
//!
//! Sends audio to a whisper.cpp server or OpenAI-compatible endpoint for
//! transcription. Output is post-processed to remove hallucination loops
//! (the same phrase repeated many times) before it reaches clients.

use super::SpeechEngine;
use crate::config::SpeechConfig;
use crate::error::{DaemonError, Result};
use std::io::Cursor;
use std::time::Duration;

/// Minimum number of repetitions to consider text a hallucination loop
const MIN_REPETITIONS_FOR_LOOP: usize = 3;

/// Minimum phrase length (in chars) to check for repetition
const MIN_PHRASE_LENGTH: usize = 10;

/// Remote transcriber using an OpenAI-compatible Whisper API
#[derive(Debug)]
pub struct HttpSpeechEngine {
    /// Base endpoint URL (e.g., "http://127.0.0.1:8080")
    endpoint: String,
    /// Model name to send to the server
    model: String,
    /// Optional API key for authentication
    api_key: Option<String>,
    /// Request timeout
    timeout: Duration,
}

impl HttpSpeechEngine {
    /// Create a new engine from config
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone();

        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(DaemonError::Config(format!(
                "speech endpoint must start with http:// or https://, got: {}",
                endpoint
            )));
        }

        if endpoint.starts_with("http://")
            && !endpoint.contains("localhost")
            && !endpoint.contains("127.0.0.1")
            && !endpoint.contains("[::1]")
        {
            tracing::warn!(
                "Speech endpoint uses HTTP without TLS. Audio data will be transmitted unencrypted!"
            );
        }

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Encode f32 samples to 16kHz mono WAV
    fn encode_wav(samples: &[f32]) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut buffer = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut buffer, spec).map_err(|e| {
            DaemonError::Transcription(format!("Failed to create WAV writer: {}", e))
        })?;

        for &sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            let scaled = (clamped * i16::MAX as f32) as i16;
            writer
                .write_sample(scaled)
                .map_err(|e| DaemonError::Transcription(format!("Failed to write sample: {}", e)))?;
        }

        writer
            .finalize()
            .map_err(|e| DaemonError::Transcription(format!("Failed to finalize WAV: {}", e)))?;

        Ok(buffer.into_inner())
    }

    /// Build the multipart form body for the API request
    fn build_multipart_body(&self, wav_data: &[u8]) -> (String, Vec<u8>) {
        let boundary = format!(
            "----SottoBoundary{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );

        let mut body = Vec::new();

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"audio.wav\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: audio/wav\r\n\r\n");
        body.extend_from_slice(wav_data);
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"model\"\r\n\r\n");
        body.extend_from_slice(self.model.as_bytes());
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"response_format\"\r\n\r\n");
        body.extend_from_slice(b"json\r\n");

        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        (boundary, body)
    }
}

impl SpeechEngine for HttpSpeechEngine {
    fn transcribe(&self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        let duration_secs = samples.len() as f32 / 16000.0;
        tracing::debug!(
            "Sending {:.2}s of audio to transcription server ({} samples)",
            duration_secs,
            samples.len()
        );

        let start = std::time::Instant::now();

        let wav_data = Self::encode_wav(samples)?;
        let (boundary, body) = self.build_multipart_body(&wav_data);

        let url = format!(
            "{}/v1/audio/transcriptions",
            self.endpoint.trim_end_matches('/')
        );

        let mut request = ureq::post(&url).timeout(self.timeout).set(
            "Content-Type",
            &format!("multipart/form-data; boundary={}", boundary),
        );

        if let Some(ref key) = self.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }

        let response = request.send_bytes(&body).map_err(|e| match e {
            ureq::Error::Status(code, resp) => {
                let body = resp.into_string().unwrap_or_default();
                DaemonError::Transcription(format!("Server returned {}: {}", code, body))
            }
            ureq::Error::Transport(t) => {
                DaemonError::Transcription(format!("Request failed: {}", t))
            }
        })?;

        let json: serde_json::Value = response
            .into_json()
            .map_err(|e| DaemonError::Transcription(format!("Failed to parse response: {}", e)))?;

        let text = json
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DaemonError::Transcription(format!("Response missing 'text' field: {}", json))
            })?
            .trim()
            .to_string();

        tracing::debug!(
            "Transcription completed in {:.2}s ({} chars)",
            start.elapsed().as_secs_f32(),
            text.len()
        );

        Ok(text)
    }
}

/// Remove repetition loops (hallucinations) from transcribed text.
///
/// Whisper sometimes produces output like:
/// "And I think that's important. And I think that's important. And I think that's important."
///
/// This function detects such patterns and keeps only the first occurrence.
pub(crate) fn remove_repetition_loops(text: &str) -> String {
    if text.len() < MIN_PHRASE_LENGTH * MIN_REPETITIONS_FOR_LOOP {
        return text.to_string();
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < MIN_REPETITIONS_FOR_LOOP * 3 {
        return text.to_string();
    }

    // Longer sequences first, they are the more reliable detection
    for seq_len in (3..=words.len() / MIN_REPETITIONS_FOR_LOOP).rev() {
        if let Some(result) = remove_word_sequence_repetition(&words, seq_len) {
            tracing::debug!("Removed repetition loop (seq_len={})", seq_len);
            return result;
        }
    }

    text.to_string()
}

/// Find a repeating word sequence of the given length and collapse it to a
/// single occurrence.
fn remove_word_sequence_repetition(words: &[&str], seq_len: usize) -> Option<String> {
    if words.len() < seq_len * MIN_REPETITIONS_FOR_LOOP {
        return None;
    }

    for start in 0..=(words.len() - seq_len * MIN_REPETITIONS_FOR_LOOP) {
        let pattern = &words[start..start + seq_len];
        let pattern_lower: Vec<String> = pattern.iter().map(|w| w.to_lowercase()).collect();

        let mut count = 1;
        let mut pos = start + seq_len;

        while pos + seq_len <= words.len() {
            let matches = words[pos..pos + seq_len]
                .iter()
                .map(|w| w.to_lowercase())
                .eq(pattern_lower.iter().cloned());
            if matches {
                count += 1;
                pos += seq_len;
            } else {
                break;
            }
        }

        if count >= MIN_REPETITIONS_FOR_LOOP {
            let mut result_words: Vec<&str> = Vec::new();
            result_words.extend_from_slice(&words[..start]);
            // Keep the pattern once, original casing from the first occurrence
            result_words.extend_from_slice(pattern);

            let after_repetitions = start + seq_len * count;
            if after_repetitions < words.len() {
                result_words.extend_from_slice(&words[after_repetitions..]);
            }

            return Some(result_words.join(" "));
        }
    }

    None
}
