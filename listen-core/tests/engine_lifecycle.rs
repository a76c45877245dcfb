//! Engine lifecycle tests with scripted audio and recognizer backends.
//!
//! The audio source stamps every chunk with its read index so the tests
//! can tell exactly which stretch of microphone time the recognizer was
//! fed — that is how pre-roll semantics are pinned down without a real
//! microphone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use listen_core::audio::chunk::AudioChunk;
use listen_core::audio::AudioSource;
use listen_core::config::{EngineConfig, PrewarmMode, Provider};
use listen_core::engine::{EngineBackend, EngineEvent};
use listen_core::error::{ListenError, Result};
use listen_core::recognizer::StreamingRecognizer;
use listen_core::ListenEngine;

/// Marker scale: chunk for read index `i` is filled with `(i + 1) * 1e-4`.
const MARKER_SCALE: f32 = 1e-4;

fn marker_index(sample: f32) -> usize {
    (sample / MARKER_SCALE).round() as usize - 1
}

struct ScriptedSource {
    rate: u32,
    chunk_frames: usize,
    reads: Arc<AtomicUsize>,
    fail_at: Option<usize>,
}

impl AudioSource for ScriptedSource {
    fn read(&mut self) -> Result<AudioChunk> {
        let index = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.is_some_and(|at| index >= at) {
            return Err(ListenError::AudioStream("device unplugged".into()));
        }
        // Pace the loop like a real device delivering 100 ms blocks.
        thread::sleep(Duration::from_millis(2));
        let marker = (index + 1) as f32 * MARKER_SCALE;
        Ok(AudioChunk::new(vec![marker; self.chunk_frames], self.rate))
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

/// Records every accepted non-silence sample, bucketed by decoder session
/// (a new bucket per `reset`).
struct ScriptedRecognizer {
    sessions: Arc<Mutex<Vec<Vec<f32>>>>,
    accepts_in_session: usize,
    /// `Some(n)`: report "hello world" once `n` accepts landed in the
    /// current session.
    speak_after: Option<usize>,
    closed: Arc<AtomicBool>,
}

impl StreamingRecognizer for ScriptedRecognizer {
    fn accept(&mut self, _sample_rate: u32, samples: &[f32]) -> Result<()> {
        self.accepts_in_session += 1;
        let mut sessions = self.sessions.lock().unwrap();
        let current = sessions.last_mut().expect("session bucket exists");
        current.extend(samples.iter().copied().filter(|s| *s != 0.0));
        Ok(())
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn decode(&mut self) -> Result<()> {
        Ok(())
    }

    fn current_text(&mut self) -> String {
        match self.speak_after {
            Some(n) if self.accepts_in_session >= n => "hello world".into(),
            _ => String::new(),
        }
    }

    fn reset(&mut self) {
        self.sessions.lock().unwrap().push(Vec::new());
        self.accepts_in_session = 0;
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    reads: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<Vec<f32>>>>,
    closed: Arc<AtomicBool>,
}

impl Harness {
    fn new() -> Self {
        Self {
            reads: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(Mutex::new(vec![Vec::new()])),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn backend(&self, speak_after: Option<usize>, fail_at: Option<usize>) -> EngineBackend {
        let rate = 1_000u32;
        let chunk_frames = 100usize;
        let reads = Arc::clone(&self.reads);
        let sessions = Arc::clone(&self.sessions);
        let closed = Arc::clone(&self.closed);
        EngineBackend {
            open_source: Box::new(move || {
                Ok(Box::new(ScriptedSource {
                    rate,
                    chunk_frames,
                    reads: Arc::clone(&reads),
                    fail_at,
                }) as Box<dyn AudioSource>)
            }),
            make_recognizer: Box::new(move |_sink| {
                Ok(Box::new(ScriptedRecognizer {
                    sessions,
                    accepts_in_session: 0,
                    speak_after,
                    closed,
                }) as Box<dyn StreamingRecognizer>)
            }),
            make_punctuator: Box::new(|| None),
        }
    }
}

fn test_config(hot_mic: bool) -> EngineConfig {
    EngineConfig {
        provider: Provider::Local,
        hot_mic,
        prewarm: PrewarmMode::Never,
        mic_rate: 1_000,
        chunk_ms: 100,
        preroll_seconds: 0.4,
        hud_throttle_ms: 0,
        local: None,
        punct: None,
        punct_disabled: false,
        remote: None,
    }
}

fn wait_ready(engine: &ListenEngine) {
    assert!(
        engine.ready_gate().wait_timeout(Duration::from_secs(5)),
        "engine never became ready"
    );
}

fn recv_event(
    rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    timeout: Duration,
) -> EngineEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(event) => return event,
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for engine event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::TryRecvError::Closed) => {
                panic!("event channel closed unexpectedly")
            }
        }
    }
}

#[test]
fn first_start_clears_preroll_and_second_start_drains_it() {
    let harness = Harness::new();
    let engine = ListenEngine::new(test_config(true), harness.backend(None, None)).unwrap();
    wait_ready(&engine);

    // Let the idle loop refill the ring past the priming audio.
    thread::sleep(Duration::from_millis(40));

    // First utterance: the ring (silence prime + boot noise window) must
    // be cleared, so every sample fed belongs to reads issued after start.
    let reads_at_start1 = harness.reads.load(Ordering::SeqCst);
    engine.start().unwrap();
    thread::sleep(Duration::from_millis(40));
    assert!(engine.is_listening());
    assert_eq!(engine.stop_quick(), "");
    assert!(!engine.is_listening());

    {
        let sessions = harness.sessions.lock().unwrap();
        let first_utterance = &sessions[1];
        assert!(!first_utterance.is_empty(), "no audio reached the recognizer");
        let earliest = first_utterance.iter().copied().map(marker_index).min().unwrap();
        assert!(
            earliest >= reads_at_start1,
            "first utterance was fed pre-start audio: read {earliest} < {reads_at_start1}"
        );
    }

    // Idle again: the ring refills with audio from before the next toggle.
    thread::sleep(Duration::from_millis(40));

    // Second utterance: the ring is drained, so the recognizer must see
    // audio captured before start was called.
    let reads_at_start2 = harness.reads.load(Ordering::SeqCst);
    engine.start().unwrap();
    thread::sleep(Duration::from_millis(40));
    engine.stop_quick();

    {
        let sessions = harness.sessions.lock().unwrap();
        let second_utterance = &sessions[2];
        assert!(!second_utterance.is_empty());
        let earliest = second_utterance.iter().copied().map(marker_index).min().unwrap();
        assert!(
            earliest < reads_at_start2,
            "pre-roll was not drained: earliest read {earliest} >= {reads_at_start2}"
        );
    }

    engine.shutdown();
    assert!(harness.closed.load(Ordering::SeqCst), "recognizer not closed");
}

#[test]
fn start_is_rejected_before_ready_and_idempotent_after() {
    let harness = Harness::new();
    let mut backend = harness.backend(None, None);
    // Slow the load phase down so the not-ready window is observable.
    let inner = backend.make_recognizer;
    backend.make_recognizer = Box::new(move |sink| {
        thread::sleep(Duration::from_millis(150));
        inner(sink)
    });

    let engine = ListenEngine::new(test_config(true), backend).unwrap();
    assert!(!engine.is_ready());
    assert!(matches!(engine.start(), Err(ListenError::NotReady)));

    wait_ready(&engine);
    engine.start().unwrap();
    engine.start().unwrap(); // second start is a quiet no-op
    assert!(engine.is_listening());

    // Nothing but scripted tone markers was "recognized", so the
    // transcript is empty — and an empty transcript is never pasted.
    assert_eq!(engine.stop_quick(), "");
    assert!(!engine.is_listening());
    // A stop without a matching start returns nothing.
    assert_eq!(engine.stop_quick(), "");

    engine.shutdown();
}

#[test]
fn partials_are_emitted_and_finalized_with_capitalization() {
    let harness = Harness::new();
    let engine =
        ListenEngine::new(test_config(true), harness.backend(Some(2), None)).unwrap();
    let mut events = engine.subscribe();
    wait_ready(&engine);

    engine.start().unwrap();
    let event = recv_event(&mut events, Duration::from_secs(2));
    match event {
        EngineEvent::Partial { text } => assert_eq!(text, "hello world"),
        other => panic!("expected partial, got {other:?}"),
    }

    let finalized = engine.stop_quick();
    assert_eq!(finalized, "Hello world");

    engine.shutdown();
}

#[test]
fn per_utterance_mode_opens_the_microphone_per_start() {
    let harness = Harness::new();
    let engine = ListenEngine::new(test_config(false), harness.backend(Some(2), None)).unwrap();
    // Per-utterance engines are ready immediately.
    assert!(engine.is_ready());
    assert!(!engine.is_listening());

    engine.start().unwrap();
    assert!(engine.is_listening());
    thread::sleep(Duration::from_millis(40));
    assert_eq!(engine.stop_quick(), "Hello world");
    assert!(!engine.is_listening());

    // The engine can go around again: new session, new microphone scope.
    engine.start().unwrap();
    thread::sleep(Duration::from_millis(40));
    assert_eq!(engine.stop_quick(), "Hello world");

    let sessions = harness.sessions.lock().unwrap();
    // Initial bucket + one reset per start + one per stop.
    assert!(sessions.len() >= 3, "expected a session per utterance");
    drop(sessions);

    engine.shutdown();
    assert!(harness.closed.load(Ordering::SeqCst));
}

#[test]
fn audio_failure_while_listening_revokes_readiness() {
    let harness = Harness::new();
    // Fail after the priming phase is comfortably over.
    let engine =
        ListenEngine::new(test_config(true), harness.backend(None, Some(20))).unwrap();
    let mut events = engine.subscribe();
    wait_ready(&engine);

    engine.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match recv_event(&mut events, deadline.saturating_duration_since(Instant::now())) {
            EngineEvent::Error { message } => {
                assert!(message.contains("audio read failed"), "message: {message}");
                break;
            }
            _ => continue,
        }
    }

    assert!(!engine.is_listening());
    assert!(!engine.is_ready(), "engine must be not-ready after audio death");
    assert_eq!(engine.stop_quick(), "");

    engine.shutdown();
}
