//! Energy-based speech segmentation
//!
//! Analyzes a finished recording in short frames (20ms) and returns the
//! spans where RMS energy indicates speech. Silent recordings produce no
//! spans, which keeps hallucination-prone silence away from the
//! transcription engine.

use super::{SpeechSegmenter, SpeechSpan};
use crate::config::SegmenterConfig;

/// Frame length used for energy analysis
const FRAME_MS: usize = 20;

/// Energy-based segmenter using RMS amplitude analysis
pub struct EnergySegmenter {
    /// Energy threshold for speech detection
    threshold: f32,
    sample_rate: u32,
    /// Spans shorter than this are discarded
    min_speech_samples: usize,
    /// Silence run that closes an open span
    hold_samples: usize,
    /// Padding added around each span
    pad_samples: usize,
}

impl EnergySegmenter {
    /// Create a new segmenter from config
    pub fn new(config: &SegmenterConfig, sample_rate: u32) -> Self {
        let per_ms = sample_rate as usize / 1000;
        Self {
            threshold: map_threshold_to_energy(config.threshold),
            sample_rate,
            min_speech_samples: config.min_speech_ms as usize * per_ms,
            hold_samples: config.hold_ms as usize * per_ms,
            pad_samples: config.pad_ms as usize * per_ms,
        }
    }

    /// Calculate RMS energy of a sample slice
    fn calculate_rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
        (sum_squares / samples.len() as f32).sqrt()
    }
}

/// Map config threshold (0.0-1.0) to energy threshold
///
/// - 0.0 = very sensitive (energy threshold ~0.001, detects quiet whispers)
/// - 0.5 = balanced (energy threshold ~0.01, filters silence)
/// - 1.0 = aggressive (energy threshold ~0.1, requires louder speech)
fn map_threshold_to_energy(config_threshold: f32) -> f32 {
    let t = config_threshold.clamp(0.0, 1.0);
    0.001 * (100.0_f32).powf(t)
}

impl SpeechSegmenter for EnergySegmenter {
    fn segment(&self, samples: &[f32]) -> Vec<SpeechSpan> {
        if samples.is_empty() {
            return Vec::new();
        }

        let frame_size = self.sample_rate as usize * FRAME_MS / 1000;
        let mut spans: Vec<SpeechSpan> = Vec::new();

        let mut in_speech = false;
        let mut span_start = 0usize;
        let mut last_voiced_end = 0usize;
        let mut silence_run = 0usize;

        let mut offset = 0usize;
        for frame in samples.chunks(frame_size) {
            let rms = Self::calculate_rms(frame);
            let frame_end = offset + frame.len();

            if rms >= self.threshold {
                if !in_speech {
                    in_speech = true;
                    span_start = offset;
                }
                last_voiced_end = frame_end;
                silence_run = 0;
            } else if in_speech {
                silence_run += frame.len();
                if silence_run >= self.hold_samples {
                    self.close_span(&mut spans, span_start, last_voiced_end, samples.len());
                    in_speech = false;
                }
            }

            offset = frame_end;
        }

        if in_speech {
            self.close_span(&mut spans, span_start, last_voiced_end, samples.len());
        }

        tracing::debug!(
            "Segmented {} samples into {} span(s), threshold={:.4}",
            samples.len(),
            spans.len(),
            self.threshold
        );

        spans
    }
}

impl EnergySegmenter {
    /// Pad a closed span, enforce the minimum duration, and merge it with the
    /// previous span when the padded ranges touch.
    fn close_span(&self, spans: &mut Vec<SpeechSpan>, start: usize, end: usize, total: usize) {
        if end <= start || end - start < self.min_speech_samples {
            return;
        }

        let padded_start = start.saturating_sub(self.pad_samples);
        let padded_end = (end + self.pad_samples).min(total);

        if let Some(last) = spans.last_mut() {
            if padded_start <= last.end {
                last.end = padded_end.max(last.end);
                return;
            }
        }

        spans.push(SpeechSpan {
            start: padded_start,
            end: padded_end,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> EnergySegmenter {
        EnergySegmenter::new(&SegmenterConfig::default(), 16000)
    }

    fn sine(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_silence_has_no_spans() {
        let seg = segmenter();
        let silence = vec![0.0f32; 16000];
        assert!(seg.segment(&silence).is_empty());
    }

    #[test]
    fn test_empty_input() {
        let seg = segmenter();
        assert!(seg.segment(&[]).is_empty());
    }

    #[test]
    fn test_single_burst() {
        let seg = segmenter();
        // 1s of speech-level audio
        let samples = sine(16000, 0.5);
        let spans = seg.segment(&samples);
        assert_eq!(spans.len(), 1);
        assert!(spans[0].start < 1000);
        assert!(spans[0].end >= 15000);
    }

    #[test]
    fn test_two_bursts_are_ordered_and_disjoint() {
        let seg = segmenter();
        // 500ms speech, 1s silence (longer than hold), 500ms speech
        let mut samples = sine(8000, 0.5);
        samples.extend(vec![0.0f32; 16000]);
        samples.extend(sine(8000, 0.5));

        let spans = seg.segment(&samples);
        assert_eq!(spans.len(), 2);
        assert!(spans[0].start < spans[0].end);
        assert!(spans[0].end <= spans[1].start);
        assert!(spans[1].start < spans[1].end);
        // Second burst begins at 24000 samples, minus padding
        assert!(spans[1].start >= 22000);
    }

    #[test]
    fn test_short_blip_is_dropped() {
        let seg = segmenter();
        // 100ms burst is below the 200ms default minimum
        let mut samples = sine(1600, 0.5);
        samples.extend(vec![0.0f32; 16000]);
        assert!(seg.segment(&samples).is_empty());
    }

    #[test]
    fn test_padding_is_clamped() {
        let seg = segmenter();
        // Speech right at the start and end of the recording
        let samples = sine(8000, 0.5);
        let spans = seg.segment(&samples);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0);
        assert!(spans[0].end <= samples.len());
    }

    #[test]
    fn test_quiet_audio_is_silence() {
        let seg = segmenter();
        let samples = sine(16000, 0.001);
        assert!(seg.segment(&samples).is_empty());
    }

    #[test]
    fn test_threshold_mapping() {
        let low = map_threshold_to_energy(0.0);
        let mid = map_threshold_to_energy(0.5);
        let high = map_threshold_to_energy(1.0);

        assert!(low < mid);
        assert!(mid < high);
        assert!(low >= 0.001);
        assert!(high <= 0.1);
    }

    #[test]
    fn test_calculate_rms() {
        let ones = vec![1.0f32; 100];
        assert!((EnergySegmenter::calculate_rms(&ones) - 1.0).abs() < 0.001);

        let zeros = vec![0.0f32; 100];
        assert_eq!(EnergySegmenter::calculate_rms(&zeros), 0.0);
    }
}
