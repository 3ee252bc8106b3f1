//! Engine seams for the daemon workflows
//!
//! Each trait covers one stage of the pipeline: capturing audio, locating
//! speech within it, transcribing speech spans, and refining text. The
//! daemon holds exactly one engine set at a time and rebuilds the whole set
//! through the factory on RESTART.

pub mod capture;
pub mod refine;
pub mod segmenter;
pub mod speech;

pub use capture::CpalCapture;
pub use refine::HttpRefiner;
pub use segmenter::EnergySegmenter;
pub use speech::HttpSpeechEngine;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;

/// A half-open range of samples containing speech
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSpan {
    pub start: usize,
    pub end: usize,
}

impl SpeechSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Microphone capture.
///
/// `start` begins buffering samples on a background stream; `stop` ends the
/// stream and hands back everything captured as mono audio at the pipeline
/// sample rate. `abort` ends the stream and discards the buffer.
pub trait AudioCapture: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<Vec<f32>>;
    fn abort(&self);
}

/// Finds the spans of speech within a finished recording.
///
/// Returned spans are ordered and non-overlapping.
pub trait SpeechSegmenter: Send + Sync {
    fn segment(&self, samples: &[f32]) -> Vec<SpeechSpan>;
}

/// Speech-to-text engine.
///
/// Blocking; the transcription workflow runs it on a blocking thread.
pub trait SpeechEngine: Send + Sync {
    fn transcribe(&self, samples: &[f32]) -> Result<String>;
}

/// Text refinement engine
#[async_trait]
pub trait TextRefiner: Send + Sync {
    async fn refine(&self, text: &str) -> Result<String>;
}

/// One complete set of engine bindings
pub struct EngineSet {
    pub capture: Box<dyn AudioCapture>,
    pub segmenter: Box<dyn SpeechSegmenter>,
    pub speech: Box<dyn SpeechEngine>,
    pub refiner: Box<dyn TextRefiner>,
}

/// Builds a fresh engine set. RESTART drops the old set and calls this again.
pub type EngineFactory = Arc<dyn Fn() -> Result<EngineSet> + Send + Sync>;

/// Build the production engine factory from config
pub fn engine_factory(config: &Config) -> EngineFactory {
    let config = config.clone();
    Arc::new(move || {
        Ok(EngineSet {
            capture: Box::new(CpalCapture::new(&config.audio)),
            segmenter: Box::new(EnergySegmenter::new(
                &config.segmenter,
                config.audio.sample_rate,
            )),
            speech: Box::new(HttpSpeechEngine::new(&config.speech)?),
            refiner: Box::new(HttpRefiner::new(&config.refinement)),
        })
    })
}

#[cfg(test)]
pub(crate) mod mock {
    //! Canned engines for daemon and server tests.

    use super::*;
    use crate::error::DaemonError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub struct MockCapture {
        samples: Vec<f32>,
        fail_start: bool,
        started: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
    }

    impl AudioCapture for MockCapture {
        fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(DaemonError::AudioDevice("mock device unavailable".into()));
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<Vec<f32>> {
            self.started.store(false, Ordering::SeqCst);
            Ok(self.samples.clone())
        }

        fn abort(&self) {
            self.started.store(false, Ordering::SeqCst);
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    pub struct MockSegmenter {
        empty: bool,
    }

    impl SpeechSegmenter for MockSegmenter {
        fn segment(&self, samples: &[f32]) -> Vec<SpeechSpan> {
            if self.empty || samples.is_empty() {
                Vec::new()
            } else {
                vec![SpeechSpan {
                    start: 0,
                    end: samples.len(),
                }]
            }
        }
    }

    pub struct MockEngine {
        results: Mutex<VecDeque<std::result::Result<String, String>>>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl SpeechEngine for MockEngine {
        fn transcribe(&self, _samples: &[f32]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            match self.results.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(DaemonError::Transcription(msg)),
                None => Ok(String::new()),
            }
        }
    }

    pub struct MockRefiner {
        results: Mutex<VecDeque<std::result::Result<String, String>>>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl TextRefiner for MockRefiner {
        async fn refine(&self, _text: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.results.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(DaemonError::Refinement(msg)),
                None => Ok(String::new()),
            }
        }
    }

    /// Builder for a mock engine factory with probes.
    ///
    /// Result queues are refreshed on every factory invocation, so RESTART
    /// starts each rebuilt set from the same canned script.
    pub struct MockSet {
        pub capture_samples: Vec<f32>,
        pub capture_fail: bool,
        pub segmenter_empty: bool,
        pub engine_results: Vec<std::result::Result<String, String>>,
        pub engine_delay: Duration,
        pub refiner_results: Vec<std::result::Result<String, String>>,
        pub refiner_delay: Duration,

        pub capture_started: Arc<AtomicBool>,
        pub capture_aborted: Arc<AtomicBool>,
        pub engine_calls: Arc<AtomicUsize>,
        pub refiner_calls: Arc<AtomicUsize>,
        pub factory_calls: Arc<AtomicUsize>,
    }

    impl MockSet {
        pub fn new() -> Self {
            Self {
                capture_samples: vec![0.5; 1600],
                capture_fail: false,
                segmenter_empty: false,
                engine_results: vec![Ok("hello world".to_string())],
                engine_delay: Duration::ZERO,
                refiner_results: vec![Ok("Hello, world.".to_string())],
                refiner_delay: Duration::ZERO,
                capture_started: Arc::new(AtomicBool::new(false)),
                capture_aborted: Arc::new(AtomicBool::new(false)),
                engine_calls: Arc::new(AtomicUsize::new(0)),
                refiner_calls: Arc::new(AtomicUsize::new(0)),
                factory_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_engine_results(
            mut self,
            results: Vec<std::result::Result<String, String>>,
        ) -> Self {
            self.engine_results = results;
            self
        }

        pub fn with_refiner_results(
            mut self,
            results: Vec<std::result::Result<String, String>>,
        ) -> Self {
            self.refiner_results = results;
            self
        }

        pub fn into_factory(self) -> EngineFactory {
            Arc::new(move || {
                self.factory_calls.fetch_add(1, Ordering::SeqCst);
                Ok(EngineSet {
                    capture: Box::new(MockCapture {
                        samples: self.capture_samples.clone(),
                        fail_start: self.capture_fail,
                        started: self.capture_started.clone(),
                        aborted: self.capture_aborted.clone(),
                    }),
                    segmenter: Box::new(MockSegmenter {
                        empty: self.segmenter_empty,
                    }),
                    speech: Box::new(MockEngine {
                        results: Mutex::new(self.engine_results.clone().into()),
                        calls: self.engine_calls.clone(),
                        delay: self.engine_delay,
                    }),
                    refiner: Box::new(MockRefiner {
                        results: Mutex::new(self.refiner_results.clone().into()),
                        calls: self.refiner_calls.clone(),
                        delay: self.refiner_delay,
                    }),
                })
            })
        }
    }
}
