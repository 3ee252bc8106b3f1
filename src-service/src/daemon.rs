//! Daemon state machine and workflow orchestration.
//!
//! This module owns the daemon lifecycle, including:
//! - The current phase and its transition guards
//! - The monotonic sequence number attached to every snapshot
//! - The session that started the active recording
//! - The engine set that workflows run against (swapped on RESTART)
//! - Event broadcasting to subscribed clients
//!
//! Phase changes, sequence increments, and event broadcasts all happen while
//! the state lock is held, so subscribers observe exactly one event per
//! transition, in sequence order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sotto_common::ipc::{Reply, StateEvent};
use sotto_common::{Phase, StateSnapshot};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RefinementConfig};
use crate::engine::speech::remove_repetition_loops;
use crate::engine::{EngineFactory, EngineSet};
use crate::error::{DaemonError, Result};

/// Identifies one connected client session.
pub type SessionId = u64;

/// Mutable daemon state, guarded by the manager's mutex.
struct DaemonState {
    phase: Phase,
    sequence: u64,
    /// Session that issued START_RECORDING. Any session may stop or pause
    /// the recording; ownership is informational.
    owner: Option<SessionId>,
    /// Last text produced (transcription or refinement), cleared when a new
    /// recording starts.
    transcript: String,
    last_error: Option<String>,
}

impl DaemonState {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            sequence: self.sequence,
            last_error: self.last_error.clone(),
        }
    }
}

/// Handle to an in-flight transcription or refinement worker.
struct WorkflowHandle {
    task: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl WorkflowHandle {
    /// Signal cancellation and abort the worker at its next await point.
    fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Point-in-time view assembled for GET_STATUS replies.
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub snapshot: StateSnapshot,
    pub owner: Option<SessionId>,
    pub transcript: String,
}

/// Global state manager for the daemon.
///
/// Constructed once in `main` and shared as `Arc` between the socket server
/// and the workflows it spawns.
pub struct DaemonManager {
    state: Mutex<DaemonState>,
    engines: RwLock<Arc<EngineSet>>,
    factory: EngineFactory,
    /// Broadcast channel for state events
    event_tx: broadcast::Sender<Reply>,
    workflow: Mutex<Option<WorkflowHandle>>,
    refinement: RefinementConfig,
}

impl DaemonManager {
    /// Build the initial engine set and create the manager.
    pub fn new(factory: EngineFactory, config: &Config) -> Result<Arc<Self>> {
        let engines = factory()?;
        let (event_tx, _) = broadcast::channel(config.events.queue_capacity.max(1));
        Ok(Arc::new(Self {
            state: Mutex::new(DaemonState {
                phase: Phase::Idle,
                sequence: 0,
                owner: None,
                transcript: String::new(),
                last_error: None,
            }),
            engines: RwLock::new(Arc::new(engines)),
            factory,
            event_tx,
            workflow: Mutex::new(None),
            refinement: config.refinement.clone(),
        }))
    }

    /// Subscribe to broadcast state events.
    pub fn subscribe(&self) -> broadcast::Receiver<Reply> {
        self.event_tx.subscribe()
    }

    /// Get the current state snapshot without transitioning.
    pub async fn status(&self) -> StateSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Get the snapshot plus recording owner and transcript buffer.
    pub async fn describe(&self) -> DaemonStatus {
        let state = self.state.lock().await;
        DaemonStatus {
            snapshot: state.snapshot(),
            owner: state.owner,
            transcript: state.transcript.clone(),
        }
    }

    /// Apply a transition under the held state lock: change phase, bump the
    /// sequence, and broadcast exactly one event carrying the new snapshot.
    fn transition(&self, state: &mut DaemonState, phase: Phase, event: &StateEvent) {
        state.phase = phase;
        state.sequence += 1;
        debug!("Transition to {} (sequence {})", state.phase, state.sequence);
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(Reply::event(event, state.snapshot()));
    }

    /// Like `transition`, but records the error and broadcasts an error event.
    fn transition_failed(
        &self,
        state: &mut DaemonState,
        phase: Phase,
        event: &StateEvent,
        message: String,
    ) {
        state.phase = phase;
        state.sequence += 1;
        state.last_error = Some(message.clone());
        debug!("Transition to {} (sequence {})", state.phase, state.sequence);
        let _ = self
            .event_tx
            .send(Reply::error_event(event, message, state.snapshot()));
    }

    /// Store the active workflow handle, cancelling any stale one.
    async fn store_workflow(&self, handle: WorkflowHandle) {
        let mut workflow = self.workflow.lock().await;
        if let Some(stale) = workflow.replace(handle) {
            stale.cancel();
        }
    }

    /// Cancel the in-flight workflow, if any.
    async fn cancel_workflow(&self) {
        let handle = self.workflow.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Open the capture device and start recording.
    pub async fn start_recording(&self, session: SessionId) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Idle {
            return Err(DaemonError::StateConflict(match state.phase {
                Phase::Recording => "already recording".to_string(),
                phase => format!("cannot start recording while {}", phase),
            }));
        }

        let engines = self.engines.read().await.clone();
        match engines.capture.start() {
            Ok(()) => {
                state.owner = Some(session);
                state.transcript.clear();
                self.transition(&mut state, Phase::Recording, &StateEvent::RecordingStarted);
                info!("Recording started (session {})", session);
                Ok(state.snapshot())
            }
            Err(e) => {
                warn!("Capture failed to open: {}", e);
                self.transition_failed(
                    &mut state,
                    Phase::Idle,
                    &StateEvent::RecordingFailed,
                    e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Close the capture device and hand the buffer to transcription.
    ///
    /// Returns as soon as the worker is spawned; the transcript arrives later
    /// as a broadcast event.
    pub async fn stop_recording(self: &Arc<Self>) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Recording {
            return Err(DaemonError::StateConflict("not recording".to_string()));
        }

        state.owner = None;
        self.transition(
            &mut state,
            Phase::Transcribing,
            &StateEvent::TranscriptionStarted,
        );

        let engines = self.engines.read().await.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let manager = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            manager.run_transcription(engines, flag).await;
        });
        self.store_workflow(WorkflowHandle { task, stop }).await;

        Ok(state.snapshot())
    }

    async fn run_transcription(
        self: Arc<Self>,
        engines: Arc<EngineSet>,
        stop: Arc<AtomicBool>,
    ) {
        let result = transcribe_capture(engines, &stop).await;
        if stop.load(Ordering::SeqCst) {
            debug!("Transcription workflow canceled, result discarded");
            return;
        }
        self.finish_transcription(result).await;
    }

    /// Commit a finished transcription, unless the phase moved on meanwhile.
    async fn finish_transcription(&self, result: Result<String>) {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Transcribing {
            debug!(
                "Transcription finished after phase moved to {}, discarding",
                state.phase
            );
            return;
        }
        match result {
            Ok(transcription) => {
                info!("Transcription complete ({} chars)", transcription.len());
                state.last_error = None;
                state.transcript = transcription.clone();
                self.transition(
                    &mut state,
                    Phase::Idle,
                    &StateEvent::TranscriptionComplete { transcription },
                );
            }
            Err(e) => {
                error!("Transcription failed: {}", e);
                self.transition_failed(
                    &mut state,
                    Phase::Error,
                    &StateEvent::TranscriptionFailed,
                    e.to_string(),
                );
            }
        }
    }

    /// Submit text to the refinement provider.
    ///
    /// Independent of recording; valid from `idle` and `error`. The refined
    /// (or, on failure, original) text arrives later as a broadcast event.
    pub async fn process_text(self: &Arc<Self>, text: String) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        if !matches!(state.phase, Phase::Idle | Phase::Error) {
            return Err(DaemonError::StateConflict(format!(
                "cannot process text while {}",
                state.phase
            )));
        }

        self.transition(&mut state, Phase::Processing, &StateEvent::RefinementStarted);

        let engines = self.engines.read().await.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let manager = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            manager.run_refinement(engines, text, flag).await;
        });
        self.store_workflow(WorkflowHandle { task, stop }).await;

        Ok(state.snapshot())
    }

    async fn run_refinement(
        self: Arc<Self>,
        engines: Arc<EngineSet>,
        text: String,
        stop: Arc<AtomicBool>,
    ) {
        let result = self.refine_with_backoff(&engines, &text).await;
        if stop.load(Ordering::SeqCst) {
            debug!("Refinement workflow canceled, result discarded");
            return;
        }
        self.finish_refinement(text, result).await;
    }

    /// Call the provider with a bounded timeout per attempt and exponential
    /// backoff between attempts.
    async fn refine_with_backoff(&self, engines: &EngineSet, text: &str) -> Result<String> {
        let cfg = &self.refinement;
        let attempts = cfg.max_retries + 1;
        let per_attempt = Duration::from_millis(cfg.timeout_ms);
        let backoff_max = Duration::from_millis(cfg.backoff_max_ms);
        let mut backoff = Duration::from_millis(cfg.backoff_initial_ms);

        let mut last_failure = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_max);
            }
            match tokio::time::timeout(per_attempt, engines.refiner.refine(text)).await {
                Ok(Ok(refined)) => return Ok(refined),
                Ok(Err(e)) => {
                    warn!("Refinement attempt {}/{} failed: {}", attempt, attempts, e);
                    last_failure = Some(e);
                }
                Err(_) => {
                    warn!(
                        "Refinement attempt {}/{} timed out after {}ms",
                        attempt, attempts, cfg.timeout_ms
                    );
                    last_failure = Some(DaemonError::Refinement(format!(
                        "provider timed out after {}ms",
                        cfg.timeout_ms
                    )));
                }
            }
        }
        Err(last_failure.unwrap_or_else(|| {
            DaemonError::Refinement("no refinement attempts configured".to_string())
        }))
    }

    /// Commit a finished refinement, unless the phase moved on meanwhile.
    ///
    /// On failure the original text rides along in the event so the client
    /// never loses what it submitted.
    async fn finish_refinement(&self, original: String, result: Result<String>) {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Processing {
            debug!(
                "Refinement finished after phase moved to {}, discarding",
                state.phase
            );
            return;
        }
        match result {
            Ok(text) => {
                info!("Refinement complete ({} chars)", text.len());
                state.last_error = None;
                state.transcript = text.clone();
                self.transition(
                    &mut state,
                    Phase::Idle,
                    &StateEvent::RefinementComplete { text },
                );
            }
            Err(e) => {
                error!("Refinement failed, original text preserved: {}", e);
                self.transition_failed(
                    &mut state,
                    Phase::Error,
                    &StateEvent::RefinementFailed { text: original },
                    e.to_string(),
                );
            }
        }
    }

    /// Suspend the daemon. A recording in progress is discarded, an in-flight
    /// workflow is canceled.
    pub async fn pause(&self) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Idle | Phase::Recording | Phase::Transcribing | Phase::Processing => {}
            phase => {
                return Err(DaemonError::StateConflict(format!(
                    "cannot pause while {}",
                    phase
                )))
            }
        }

        if state.phase == Phase::Recording {
            let engines = self.engines.read().await.clone();
            engines.capture.abort();
            state.owner = None;
            info!("Recording discarded by pause");
        }
        self.cancel_workflow().await;

        self.transition(&mut state, Phase::Paused, &StateEvent::Paused);
        Ok(state.snapshot())
    }

    /// Leave the paused state.
    pub async fn resume(&self) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Paused {
            return Err(DaemonError::StateConflict("not paused".to_string()));
        }
        self.transition(&mut state, Phase::Idle, &StateEvent::Resumed);
        Ok(state.snapshot())
    }

    /// Tear down the active workflow and rebuild the engine set.
    pub async fn restart(&self) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        if state.phase == Phase::ShuttingDown {
            return Err(DaemonError::StateConflict("shutting down".to_string()));
        }

        if state.phase == Phase::Recording {
            let engines = self.engines.read().await.clone();
            engines.capture.abort();
        }
        state.owner = None;
        self.cancel_workflow().await;
        self.transition(&mut state, Phase::Restarting, &StateEvent::Restarting);

        info!("Rebuilding engine bindings");
        match (self.factory)() {
            Ok(rebuilt) => {
                *self.engines.write().await = Arc::new(rebuilt);
                state.last_error = None;
                state.transcript.clear();
                self.transition(&mut state, Phase::Idle, &StateEvent::RestartComplete);
                info!("Restart complete");
                Ok(state.snapshot())
            }
            Err(e) => {
                error!("Engine rebuild failed: {}", e);
                self.transition_failed(
                    &mut state,
                    Phase::Error,
                    &StateEvent::RestartFailed,
                    e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Enter the terminal shutting-down phase, cancelling whatever runs.
    ///
    /// The caller is responsible for stopping the accept loop afterwards.
    pub async fn shutdown(&self) -> Result<StateSnapshot> {
        let mut state = self.state.lock().await;
        if state.phase == Phase::ShuttingDown {
            return Err(DaemonError::StateConflict(
                "already shutting down".to_string(),
            ));
        }

        if state.phase == Phase::Recording {
            let engines = self.engines.read().await.clone();
            engines.capture.abort();
        }
        state.owner = None;
        self.cancel_workflow().await;
        self.transition(&mut state, Phase::ShuttingDown, &StateEvent::ShuttingDown);
        info!("Shutdown requested");
        Ok(state.snapshot())
    }

    /// Called when a client disconnects. Recording started by that session
    /// keeps running; it just no longer has an owner to report.
    pub async fn session_closed(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        if state.owner == Some(session) {
            debug!("Owning session {} disconnected", session);
            state.owner = None;
        }
    }
}

/// Drain the capture stream, locate speech, and run the engine per segment.
async fn transcribe_capture(engines: Arc<EngineSet>, stop: &AtomicBool) -> Result<String> {
    let eng = Arc::clone(&engines);
    let samples = tokio::task::spawn_blocking(move || eng.capture.stop())
        .await
        .map_err(|e| DaemonError::Engine(format!("capture worker panicked: {}", e)))??;

    let spans = engines.segmenter.segment(&samples);
    debug!(
        "Captured {} samples, {} speech segment(s)",
        samples.len(),
        spans.len()
    );
    if spans.is_empty() {
        // Silence is a successful, empty transcript
        return Ok(String::new());
    }

    let mut pieces = Vec::with_capacity(spans.len());
    for span in spans {
        // Cancellation is observed between segments
        if stop.load(Ordering::SeqCst) {
            return Ok(String::new());
        }
        let segment = samples[span.start..span.end].to_vec();
        let text = transcribe_with_retry(Arc::clone(&engines), segment).await?;
        if !text.is_empty() {
            pieces.push(text);
        }
    }

    Ok(remove_repetition_loops(&pieces.join(" ")))
}

/// Run the speech engine on one segment, retrying once on failure.
async fn transcribe_with_retry(engines: Arc<EngineSet>, segment: Vec<f32>) -> Result<String> {
    let eng = Arc::clone(&engines);
    let samples = segment.clone();
    let first = tokio::task::spawn_blocking(move || eng.speech.transcribe(&samples))
        .await
        .map_err(|e| DaemonError::Engine(format!("transcription worker panicked: {}", e)))?;

    match first {
        Ok(text) => Ok(text),
        Err(e) => {
            warn!("Transcription attempt failed, retrying once: {}", e);
            tokio::task::spawn_blocking(move || engines.speech.transcribe(&segment))
                .await
                .map_err(|e| DaemonError::Engine(format!("transcription worker panicked: {}", e)))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockSet;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.refinement.timeout_ms = 200;
        config.refinement.max_retries = 1;
        config.refinement.backoff_initial_ms = 1;
        config.refinement.backoff_max_ms = 4;
        config
    }

    fn manager_with(mocks: MockSet) -> Arc<DaemonManager> {
        DaemonManager::new(mocks.into_factory(), &test_config()).unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<Reply>) -> Reply {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for_phase(manager: &DaemonManager, phase: Phase) -> StateSnapshot {
        for _ in 0..400 {
            let snapshot = manager.status().await;
            if snapshot.phase == phase {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("daemon never reached {}", phase);
    }

    #[tokio::test]
    async fn test_record_stop_transcribe_event_flow() {
        let manager = manager_with(MockSet::new());
        let mut events = manager.subscribe();

        let snap = manager.start_recording(1).await.unwrap();
        assert_eq!(snap.phase, Phase::Recording);
        assert_eq!(snap.sequence, 1);

        let started = next_event(&mut events).await;
        assert_eq!(started.event_kind(), Some("recording_started"));
        assert_eq!(started.sequence(), 1);

        let snap = manager.stop_recording().await.unwrap();
        assert_eq!(snap.phase, Phase::Transcribing);
        assert_eq!(snap.sequence, 2);

        let transcribing = next_event(&mut events).await;
        assert_eq!(transcribing.event_kind(), Some("transcription_started"));
        assert_eq!(transcribing.sequence(), 2);

        let done = next_event(&mut events).await;
        assert_eq!(done.event_kind(), Some("transcription_complete"));
        assert_eq!(done.sequence(), 3);
        assert_eq!(done.state.phase, Phase::Idle);
        assert_eq!(done.data.as_ref().unwrap()["transcription"], "hello world");
    }

    #[tokio::test]
    async fn test_start_while_recording_is_a_conflict() {
        let manager = manager_with(MockSet::new());
        manager.start_recording(1).await.unwrap();
        let before = manager.status().await;

        let err = manager.start_recording(2).await.unwrap_err();
        assert!(matches!(err, DaemonError::StateConflict(_)));

        // Rejected commands neither transition nor bump the sequence
        let after = manager.status().await;
        assert_eq!(after.phase, Phase::Recording);
        assert_eq!(after.sequence, before.sequence);
        assert_eq!(manager.describe().await.owner, Some(1));
    }

    #[tokio::test]
    async fn test_silent_recording_yields_empty_transcript() {
        let mut mocks = MockSet::new();
        mocks.segmenter_empty = true;
        let manager = manager_with(mocks);
        let mut events = manager.subscribe();

        manager.start_recording(1).await.unwrap();
        manager.stop_recording().await.unwrap();

        next_event(&mut events).await;
        next_event(&mut events).await;
        let done = next_event(&mut events).await;
        assert_eq!(done.event_kind(), Some("transcription_complete"));
        assert!(!done.is_error());
        assert_eq!(done.data.as_ref().unwrap()["transcription"], "");
        assert_eq!(done.state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_capture_failure_reports_device_error() {
        let mut mocks = MockSet::new();
        mocks.capture_fail = true;
        let manager = manager_with(mocks);
        let mut events = manager.subscribe();

        let err = manager.start_recording(1).await.unwrap_err();
        assert!(matches!(err, DaemonError::AudioDevice(_)));

        let event = next_event(&mut events).await;
        assert_eq!(event.event_kind(), Some("recording_failed"));
        assert!(event.is_error());

        let snap = manager.status().await;
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.sequence, 1);
        assert!(snap.last_error.is_some());
    }

    #[tokio::test]
    async fn test_transcription_failure_after_retry_enters_error() {
        let mocks = MockSet::new()
            .with_engine_results(vec![Err("server 500".into()), Err("server 500".into())]);
        let engine_calls = mocks.engine_calls.clone();
        let manager = manager_with(mocks);

        manager.start_recording(1).await.unwrap();
        manager.stop_recording().await.unwrap();

        let snap = wait_for_phase(&manager, Phase::Error).await;
        assert_eq!(engine_calls.load(Ordering::SeqCst), 2);
        assert!(snap.last_error.as_deref().unwrap_or("").contains("server 500"));
    }

    #[tokio::test]
    async fn test_transcription_retry_recovers() {
        let mocks = MockSet::new()
            .with_engine_results(vec![Err("flaky".into()), Ok("second try".into())]);
        let engine_calls = mocks.engine_calls.clone();
        let manager = manager_with(mocks);
        let mut events = manager.subscribe();

        manager.start_recording(1).await.unwrap();
        manager.stop_recording().await.unwrap();

        next_event(&mut events).await;
        next_event(&mut events).await;
        let done = next_event(&mut events).await;
        assert_eq!(done.event_kind(), Some("transcription_complete"));
        assert_eq!(done.data.as_ref().unwrap()["transcription"], "second try");
        assert_eq!(engine_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transcript_buffer_updated_and_cleared() {
        let manager = manager_with(MockSet::new());

        manager.start_recording(1).await.unwrap();
        manager.stop_recording().await.unwrap();
        wait_for_phase(&manager, Phase::Idle).await;
        assert_eq!(manager.describe().await.transcript, "hello world");

        manager.start_recording(1).await.unwrap();
        assert_eq!(manager.describe().await.transcript, "");
    }

    #[tokio::test]
    async fn test_process_text_refines_and_returns_to_idle() {
        let manager = manager_with(MockSet::new());
        let mut events = manager.subscribe();

        let snap = manager.process_text("hello world".to_string()).await.unwrap();
        assert_eq!(snap.phase, Phase::Processing);

        let started = next_event(&mut events).await;
        assert_eq!(started.event_kind(), Some("refinement_started"));

        let done = next_event(&mut events).await;
        assert_eq!(done.event_kind(), Some("refinement_complete"));
        assert_eq!(done.data.as_ref().unwrap()["text"], "Hello, world.");
        assert_eq!(done.state.phase, Phase::Idle);

        // The refined text is retrievable afterwards
        assert_eq!(manager.describe().await.transcript, "Hello, world.");
    }

    #[tokio::test]
    async fn test_refinement_failure_preserves_original_text() {
        let mocks = MockSet::new().with_refiner_results(vec![
            Err("connection refused".into()),
            Err("connection refused".into()),
        ]);
        let refiner_calls = mocks.refiner_calls.clone();
        let manager = manager_with(mocks);
        let mut events = manager.subscribe();

        manager.process_text("teh raw text".to_string()).await.unwrap();

        next_event(&mut events).await;
        let failed = next_event(&mut events).await;
        assert_eq!(failed.event_kind(), Some("refinement_failed"));
        assert!(failed.is_error());
        assert_eq!(failed.data.as_ref().unwrap()["text"], "teh raw text");
        assert_eq!(failed.state.phase, Phase::Error);

        // One initial attempt plus max_retries
        assert_eq!(refiner_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refinement_timeout_counts_as_attempt() {
        let mut mocks = MockSet::new();
        mocks.refiner_delay = Duration::from_millis(500);
        let refiner_calls = mocks.refiner_calls.clone();
        let mut config = test_config();
        config.refinement.timeout_ms = 50;
        let manager = DaemonManager::new(mocks.into_factory(), &config).unwrap();

        manager.process_text("slow provider".to_string()).await.unwrap();

        let snap = wait_for_phase(&manager, Phase::Error).await;
        assert!(snap.last_error.as_deref().unwrap_or("").contains("timed out"));
        assert_eq!(refiner_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_process_text_recovers_from_error_phase() {
        let mocks = MockSet::new().with_refiner_results(vec![
            Err("down".into()),
            Err("down".into()),
            Ok("Clean text.".into()),
        ]);
        let manager = manager_with(mocks);

        manager.process_text("raw".to_string()).await.unwrap();
        wait_for_phase(&manager, Phase::Error).await;

        manager.process_text("raw again".to_string()).await.unwrap();
        let snap = wait_for_phase(&manager, Phase::Idle).await;
        assert_eq!(snap.last_error, None);
    }

    #[tokio::test]
    async fn test_pause_discards_active_recording() {
        let mocks = MockSet::new();
        let aborted = mocks.capture_aborted.clone();
        let engine_calls = mocks.engine_calls.clone();
        let manager = manager_with(mocks);

        manager.start_recording(1).await.unwrap();
        let snap = manager.pause().await.unwrap();
        assert_eq!(snap.phase, Phase::Paused);
        assert!(aborted.load(Ordering::SeqCst));
        assert_eq!(manager.describe().await.owner, None);

        // The discarded capture is never transcribed
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine_calls.load(Ordering::SeqCst), 0);

        let snap = manager.resume().await.unwrap();
        assert_eq!(snap.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_pause_cancels_in_flight_transcription() {
        let mut mocks = MockSet::new();
        mocks.engine_delay = Duration::from_millis(300);
        let manager = manager_with(mocks);
        let mut events = manager.subscribe();

        manager.start_recording(1).await.unwrap();
        manager.stop_recording().await.unwrap();
        manager.pause().await.unwrap();

        assert_eq!(next_event(&mut events).await.event_kind(), Some("recording_started"));
        assert_eq!(
            next_event(&mut events).await.event_kind(),
            Some("transcription_started")
        );
        assert_eq!(next_event(&mut events).await.event_kind(), Some("paused"));

        // The canceled worker never commits a completion
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.status().await.phase, Phase::Paused);
    }

    #[tokio::test]
    async fn test_resume_without_pause_is_a_conflict() {
        let manager = manager_with(MockSet::new());
        let err = manager.resume().await.unwrap_err();
        assert!(matches!(err, DaemonError::StateConflict(_)));
        assert_eq!(manager.status().await.sequence, 0);
    }

    #[tokio::test]
    async fn test_restart_rebuilds_engines_and_clears_error() {
        let mocks =
            MockSet::new().with_engine_results(vec![Err("dead".into()), Err("dead".into())]);
        let factory_calls = mocks.factory_calls.clone();
        let manager = manager_with(mocks);

        manager.start_recording(1).await.unwrap();
        manager.stop_recording().await.unwrap();
        let snap = wait_for_phase(&manager, Phase::Error).await;
        assert!(snap.last_error.is_some());

        let mut events = manager.subscribe();
        let snap = manager.restart().await.unwrap();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.last_error, None);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 2);

        assert_eq!(next_event(&mut events).await.event_kind(), Some("restarting"));
        assert_eq!(
            next_event(&mut events).await.event_kind(),
            Some("restart_complete")
        );
    }

    #[tokio::test]
    async fn test_shutdown_aborts_recording_and_is_terminal() {
        let mocks = MockSet::new();
        let aborted = mocks.capture_aborted.clone();
        let manager = manager_with(mocks);

        manager.start_recording(1).await.unwrap();
        let snap = manager.shutdown().await.unwrap();
        assert_eq!(snap.phase, Phase::ShuttingDown);
        assert!(aborted.load(Ordering::SeqCst));

        let err = manager.start_recording(1).await.unwrap_err();
        assert!(matches!(err, DaemonError::StateConflict(_)));
        let err = manager.shutdown().await.unwrap_err();
        assert!(matches!(err, DaemonError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_any_session_may_stop_a_recording() {
        let manager = manager_with(MockSet::new());

        manager.start_recording(7).await.unwrap();
        assert_eq!(manager.describe().await.owner, Some(7));

        // Stop carries no session check at all; any client may issue it
        let snap = manager.stop_recording().await.unwrap();
        assert_eq!(snap.phase, Phase::Transcribing);
    }

    #[tokio::test]
    async fn test_owner_disconnect_keeps_recording_running() {
        let manager = manager_with(MockSet::new());

        manager.start_recording(3).await.unwrap();
        let before = manager.status().await;

        manager.session_closed(3).await;

        let after = manager.status().await;
        assert_eq!(after.phase, Phase::Recording);
        assert_eq!(after.sequence, before.sequence);
        assert_eq!(manager.describe().await.owner, None);
    }

    #[tokio::test]
    async fn test_status_reads_do_not_transition() {
        let manager = manager_with(MockSet::new());

        let first = manager.status().await;
        assert_eq!(first.phase, Phase::Idle);
        assert_eq!(first.sequence, 0);

        let second = manager.status().await;
        assert_eq!(second.sequence, 0);

        let status = manager.describe().await;
        assert_eq!(status.owner, None);
        assert_eq!(status.transcript, "");
    }
}
