//! cpal-based audio capture
//!
//! Uses the cpal crate for cross-platform audio input. Works with PipeWire,
//! PulseAudio, and ALSA backends.
//!
//! Note: cpal::Stream is not Send, so the stream lives on a dedicated thread
//! and is controlled via a command channel.

use super::AudioCapture;
use crate::config::AudioConfig;
use crate::error::{DaemonError, Result};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Commands sent to the audio capture thread
enum CaptureCommand {
    /// End the stream and send back everything captured
    Stop(mpsc::Sender<Vec<f32>>),
    /// End the stream and discard the buffer
    Abort,
}

/// A running capture thread
struct CaptureSession {
    cmd_tx: mpsc::Sender<CaptureCommand>,
    thread_handle: thread::JoinHandle<()>,
}

/// cpal-based audio capture implementation
pub struct CpalCapture {
    config: AudioConfig,
    session: Mutex<Option<CaptureSession>>,
    /// Last stream error reported by the cpal error callback
    stream_error: Arc<Mutex<Option<String>>>,
}

impl CpalCapture {
    /// Create a new cpal audio capture instance
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
            session: Mutex::new(None),
            stream_error: Arc::new(Mutex::new(None)),
        }
    }

    fn take_stream_error(&self) -> Option<String> {
        self.stream_error.lock().ok().and_then(|mut e| e.take())
    }
}

/// Find an audio input device by name with flexible matching.
///
/// Matching strategy (in order): exact, case-insensitive exact, then
/// case-insensitive substring. This allows full cpal device names,
/// PipeWire/PulseAudio short names, or partial names.
fn find_audio_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| DaemonError::AudioDevice(e.to_string()))?
        .collect();

    let search_lower = device_name.to_lowercase();

    let matched_name = devices
        .iter()
        .filter_map(|d| d.name().ok())
        .find(|name| name == device_name)
        .or_else(|| {
            devices
                .iter()
                .filter_map(|d| d.name().ok())
                .find(|name| name.to_lowercase() == search_lower)
        })
        .or_else(|| {
            devices
                .iter()
                .filter_map(|d| d.name().ok())
                .find(|name| name.to_lowercase().contains(&search_lower))
        });

    match matched_name {
        Some(name) => {
            tracing::debug!("Found audio device: {} (searched for: {})", name, device_name);
            devices
                .into_iter()
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    DaemonError::AudioDevice(format!("Device not found: {}", device_name))
                })
        }
        None => {
            let available: Vec<String> = devices.iter().filter_map(|d| d.name().ok()).collect();
            Err(DaemonError::AudioDevice(format!(
                "Device not found: '{}'. Available devices: {}",
                device_name,
                if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                }
            )))
        }
    }
}

impl AudioCapture for CpalCapture {
    fn start(&self) -> Result<()> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(DaemonError::AudioDevice(
                "Capture is already running".to_string(),
            ));
        }

        // Resolve the device before spawning the thread so a missing device
        // fails the start, not the stop.
        let host = cpal::default_host();
        let device = if self.config.device == "default" {
            host.default_input_device().ok_or_else(|| {
                DaemonError::AudioDevice("No default input device".to_string())
            })?
        } else {
            find_audio_device(&host, &self.config.device)?
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("Using audio device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| DaemonError::AudioDevice(e.to_string()))?;

        let source_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let target_rate = self.config.sample_rate;
        let sample_format = supported_config.sample_format();

        tracing::debug!(
            "Device config: {} Hz, {} channel(s), format: {:?}",
            source_rate,
            source_channels,
            sample_format
        );

        let (cmd_tx, cmd_rx) = mpsc::channel::<CaptureCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let samples = Arc::new(Mutex::new(Vec::<f32>::new()));
        let samples_clone = samples.clone();
        let stream_error = self.stream_error.clone();
        if let Ok(mut e) = stream_error.lock() {
            *e = None;
        }

        let thread_handle = thread::spawn(move || {
            use cpal::traits::StreamTrait;

            let stream_config = cpal::StreamConfig {
                channels: supported_config.channels(),
                sample_rate: supported_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_slot = stream_error.clone();
            let err_fn = move |err: cpal::StreamError| {
                tracing::error!("Audio stream error: {}", err);
                if let Ok(mut slot) = err_slot.lock() {
                    *slot = Some(err.to_string());
                }
            };

            let params = StreamBuildParams {
                samples: samples_clone.clone(),
                source_rate,
                target_rate,
                source_channels,
            };

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => {
                    build_stream::<f32>(&device, &stream_config, params, err_fn)
                }
                cpal::SampleFormat::I16 => {
                    build_stream::<i16>(&device, &stream_config, params, err_fn)
                }
                cpal::SampleFormat::U16 => {
                    build_stream::<u16>(&device, &stream_config, params, err_fn)
                }
                format => Err(DaemonError::AudioDevice(format!(
                    "Unsupported sample format: {:?}",
                    format
                ))),
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            tracing::debug!("Audio capture thread started");

            match cmd_rx.recv() {
                Ok(CaptureCommand::Stop(response_tx)) => {
                    drop(stream);
                    let collected = {
                        let guard = samples_clone.lock().unwrap();
                        guard.clone()
                    };
                    let _ = response_tx.send(collected);
                }
                // Abort, or the capture handle was dropped
                _ => drop(stream),
            }

            tracing::debug!("Audio capture thread stopped");
        });

        // Wait for the stream to come up so init failures surface here
        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(DaemonError::AudioDevice(e));
            }
            Err(_) => {
                return Err(DaemonError::AudioDevice(
                    "Timed out waiting for audio stream".to_string(),
                ));
            }
        }

        *session = Some(CaptureSession {
            cmd_tx,
            thread_handle,
        });

        Ok(())
    }

    fn stop(&self) -> Result<Vec<f32>> {
        let session = {
            let mut guard = self.session.lock().unwrap();
            guard.take()
        };

        let Some(session) = session else {
            return Err(DaemonError::AudioDevice(
                "Capture is not running".to_string(),
            ));
        };

        let (response_tx, response_rx) = mpsc::channel();
        let samples = if session.cmd_tx.send(CaptureCommand::Stop(response_tx)).is_ok() {
            match response_rx.recv_timeout(Duration::from_secs(2)) {
                Ok(samples) => samples,
                Err(_) => {
                    return Err(DaemonError::AudioDevice(
                        "Capture thread did not respond".to_string(),
                    ))
                }
            }
        } else {
            Vec::new()
        };

        let _ = session.thread_handle.join();

        if let Some(e) = self.take_stream_error() {
            return Err(DaemonError::AudioDevice(e));
        }

        let duration_secs = samples.len() as f32 / self.config.sample_rate as f32;
        tracing::debug!(
            "Audio capture stopped: {} samples ({:.2}s)",
            samples.len(),
            duration_secs
        );

        Ok(samples)
    }

    fn abort(&self) {
        let session = {
            let mut guard = self.session.lock().unwrap();
            guard.take()
        };

        if let Some(session) = session {
            // The thread exits on its own once it sees the command
            let _ = session.cmd_tx.send(CaptureCommand::Abort);
            tracing::debug!("Audio capture aborted");
        }
    }
}

/// Parameters for building an audio input stream
struct StreamBuildParams {
    samples: Arc<Mutex<Vec<f32>>>,
    source_rate: u32,
    target_rate: u32,
    source_channels: usize,
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: StreamBuildParams,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let StreamBuildParams {
        samples,
        source_rate,
        target_rate,
        source_channels,
    } = params;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Convert to f32 and mix to mono
                let mono: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                let resampled = if source_rate != target_rate {
                    resample(&mono, source_rate, target_rate)
                } else {
                    mono
                };

                if let Ok(mut guard) = samples.lock() {
                    guard.extend_from_slice(&resampled);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| DaemonError::AudioDevice(e.to_string()))?;

    Ok(stream)
}

/// Linear interpolation resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}
