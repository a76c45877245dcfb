//! `ListenEngine` — the push-to-dictate lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ListenEngine::new()
//!     hot-mic:       spawns the capture thread immediately; it loads the
//!                    model, opens the mic, primes the pre-roll, then sets
//!                    the ready gate and keeps the ring warm forever.
//!     per-utterance: constructs the recognizer inline and is ready at once;
//!                    the capture thread lives only between start() and
//!                    stop_quick().
//!
//! start()      → transcript state cleared, silence padding armed,
//!                recognizer reset (acknowledged by the capture loop,
//!                bounded), pre-roll cleared or flagged for drain,
//!                listening = true
//! stop_quick() → listening = false, best text assembled and formatted;
//!                pasting is the daemon's job, never the engine's
//! shutdown()   → capture thread joined (bounded), recognizer closed
//! ```
//!
//! ## Threading
//!
//! One dedicated OS capture thread per engine. The microphone is opened on
//! that thread and never leaves it (`cpal::Stream` is `!Send` on most
//! platforms); control threads talk to the loop exclusively through the
//! state lock, the recognizer lock, and the ready gate.

mod hotmic;
mod utterance;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audio::AudioSource;
use crate::config::{EngineConfig, Provider};
use crate::error::{ListenError, Result};
use crate::preroll::PrerollRing;
use crate::preview::PreviewFilter;
use crate::punctuate::{Punctuate, PunctuatorCell};
use crate::recognizer::{RecognizerCell, StreamingRecognizer, TranscriptSink};

/// Broadcast capacity: plenty for a single slow HUD consumer.
const BROADCAST_CAP: usize = 256;

/// Silence fed at utterance start so the recognizer's internal buffers are
/// past their cold-start region (~120 ms).
const PADDING_MS: u64 = 120;

/// How long `start` waits for the capture loop to acknowledge a reset.
const RESET_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded joins; past these the thread is abandoned rather than hanging
/// the daemon.
const HOTMIC_JOIN_TIMEOUT: Duration = Duration::from_millis(1_500);
const UTTERANCE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Events emitted by the engine. Partials arriving here are already
/// throttled and normalized for the status line.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Partial { text: String },
    Final { text: String },
    Error { message: String },
}

/// One-shot readiness latch.
///
/// `is_set` is lock-free so the control path can poll it per request; the
/// condvar side lets the daemon park a watcher thread until loading ends.
/// `revoke` flips only the observable flag — after a fatal audio failure
/// the engine reads as not-ready forever, but sleepers stay released.
#[derive(Default)]
pub struct ReadyGate {
    flag: AtomicBool,
    lock: Mutex<bool>,
    cv: Condvar,
}

impl ReadyGate {
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        let mut latched = self.lock.lock();
        *latched = true;
        self.cv.notify_all();
    }

    pub fn revoke(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Block until `set` has been called (returns immediately afterwards,
    /// even if later revoked).
    pub fn wait(&self) {
        let mut latched = self.lock.lock();
        while !*latched {
            self.cv.wait(&mut latched);
        }
    }

    /// Like `wait`, but gives up after `timeout`; returns whether the gate
    /// was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut latched = self.lock.lock();
        while !*latched {
            if self.cv.wait_until(&mut latched, deadline).timed_out() {
                return *latched;
            }
        }
        true
    }
}

/// Everything guarded by the state lock. The shared scalars, the
/// transcript state, and the pre-roll ring share one mutex because the
/// control path and the capture loop interleave on all of them.
pub(crate) struct EngineState {
    pub listening: bool,
    pub reset_requested: bool,
    pub padding_frames: usize,
    pub preroll_flush_pending: bool,
    pub first_start_after_init: bool,
    /// Most recent raw (pre-format) text; fallback when the recognizer's
    /// best text reads empty at stop.
    pub raw: String,
    /// Last partial as emitted (dedupe guard).
    pub partial: String,
    /// Committed fragments (remote finals), in arrival order.
    pub finals: Vec<String>,
    pub preroll: PrerollRing,
    pub preview: PreviewFilter,
}

/// State lock + event channel; shared with the capture loop and (weakly)
/// with backend bridge threads.
pub(crate) struct Inner {
    pub state: Mutex<EngineState>,
    pub reset_cv: Condvar,
    pub events: broadcast::Sender<EngineEvent>,
}

impl Inner {
    /// Record a revisable partial and emit it through the preview throttle.
    pub(crate) fn note_partial(&self, text: &str) {
        let admitted = {
            let mut state = self.state.lock();
            if text == state.partial {
                return;
            }
            state.partial = text.to_string();
            state.raw = text.to_string();
            if !state.listening {
                return;
            }
            state.preview.admit(text)
        };
        if let Some(text) = admitted {
            let _ = self.events.send(EngineEvent::Partial { text });
        }
    }

    /// Record a committed fragment (remote backends decide their own turn
    /// boundaries; fragments are additive and `start` discards stragglers).
    pub(crate) fn note_final(&self, text: &str) {
        {
            let mut state = self.state.lock();
            state.finals.push(text.to_string());
            state.partial.clear();
            state.raw.clear();
        }
        let _ = self.events.send(EngineEvent::Final {
            text: text.to_string(),
        });
    }

    /// Surface a failure: the in-flight transcript is discarded and
    /// listening ends so no paste can happen.
    pub(crate) fn emit_error(&self, message: &str) {
        {
            let mut state = self.state.lock();
            state.listening = false;
            state.partial.clear();
            state.raw.clear();
            state.finals.clear();
        }
        let _ = self.events.send(EngineEvent::Error {
            message: message.to_string(),
        });
    }
}

/// Bridge from backend threads into the engine's transcript state. Holds a
/// weak reference so a lingering socket reader cannot keep the engine
/// alive.
struct EngineSink {
    inner: Weak<Inner>,
}

impl TranscriptSink for EngineSink {
    fn partial(&self, text: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.note_partial(text);
        }
    }

    fn final_fragment(&self, text: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.note_final(text);
        }
    }

    fn error(&self, message: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit_error(message);
        }
    }
}

/// Opens the microphone; called on the capture thread, so the product does
/// not need to be `Send` — only the closure does.
pub type SourceOpener = Box<dyn FnMut() -> Result<Box<dyn AudioSource>> + Send>;

/// Builds the recognizer once; receives the engine's transcript sink for
/// backends that report on their own thread.
pub type RecognizerFactory =
    Box<dyn FnOnce(Arc<dyn TranscriptSink>) -> Result<Box<dyn StreamingRecognizer>> + Send>;

/// Builds the punctuator, or `None` when unavailable — never fatal.
pub type PunctuatorFactory = Box<dyn FnOnce() -> Option<Box<dyn Punctuate>> + Send>;

/// The engine's pluggable edges. The daemon wires real devices via
/// [`EngineBackend::from_config`]; tests wire scripts.
pub struct EngineBackend {
    pub open_source: SourceOpener,
    pub make_recognizer: RecognizerFactory,
    pub make_punctuator: PunctuatorFactory,
}

impl EngineBackend {
    /// Production wiring for the configured provider.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mic_rate = config.mic_rate;
        let chunk_frames = config.chunk_frames();
        let open_source: SourceOpener = Box::new(move || {
            crate::audio::MicrophoneSource::open(mic_rate, chunk_frames)
                .map(|s| Box::new(s) as Box<dyn AudioSource>)
        });

        Ok(Self {
            open_source,
            make_recognizer: make_recognizer_factory(config)?,
            make_punctuator: make_punctuator_factory(config),
        })
    }
}

fn make_recognizer_factory(config: &EngineConfig) -> Result<RecognizerFactory> {
    match config.provider {
        Provider::Local => local_recognizer_factory(config),
        Provider::Remote => {
            let remote = config.remote.clone().ok_or_else(|| {
                ListenError::ConfigMissing("remote provider selected without credentials".into())
            })?;
            Ok(Box::new(move |sink| {
                Ok(Box::new(crate::recognizer::remote::RemoteRecognizer::new(
                    remote, sink,
                )) as Box<dyn StreamingRecognizer>)
            }))
        }
    }
}

#[cfg(feature = "local-asr")]
fn local_recognizer_factory(config: &EngineConfig) -> Result<RecognizerFactory> {
    let local = config.local.clone().ok_or_else(|| {
        ListenError::ConfigMissing("local provider selected without model paths".into())
    })?;
    Ok(Box::new(move |_sink| {
        crate::recognizer::sherpa::ZipformerRecognizer::new(
            &local,
            crate::config::LOCAL_MODEL_SAMPLE_RATE,
        )
        .map(|r| Box::new(r) as Box<dyn StreamingRecognizer>)
    }))
}

#[cfg(not(feature = "local-asr"))]
fn local_recognizer_factory(_config: &EngineConfig) -> Result<RecognizerFactory> {
    Err(ListenError::ConfigInvalid(
        "local provider requested but listen-core was built without the local-asr feature".into(),
    ))
}

#[cfg(feature = "local-asr")]
fn make_punctuator_factory(config: &EngineConfig) -> PunctuatorFactory {
    match (config.punct.clone(), config.punct_disabled) {
        (Some(punct), false) => Box::new(move || {
            match crate::punctuate::OnlinePunctuator::new(&punct) {
                Ok(model) => Some(Box::new(model) as Box<dyn Punctuate>),
                Err(e) => {
                    warn!("punctuator unavailable, using capitalization fallback: {e}");
                    None
                }
            }
        }),
        _ => Box::new(|| None),
    }
}

#[cfg(not(feature = "local-asr"))]
fn make_punctuator_factory(_config: &EngineConfig) -> PunctuatorFactory {
    Box::new(|| None)
}

struct CaptureThread {
    handle: std::thread::JoinHandle<()>,
    done_rx: Receiver<()>,
}

/// The engine façade. `Send + Sync`; wrap in `Arc` and share between the
/// daemon's control tasks.
pub struct ListenEngine {
    config: EngineConfig,
    inner: Arc<Inner>,
    recognizer: RecognizerCell,
    punctuator: PunctuatorCell,
    ready: Arc<ReadyGate>,
    shutting_down: Arc<AtomicBool>,
    /// Per-utterance stop event; unused in hot-mic mode.
    utterance_stop: Arc<AtomicBool>,
    capture: Mutex<Option<CaptureThread>>,
    /// Re-opened per utterance; opened exactly once in hot-mic mode.
    open_source: Arc<Mutex<SourceOpener>>,
}

impl ListenEngine {
    /// Create the engine. Hot-mic configurations begin loading immediately
    /// on the capture thread; per-utterance configurations construct the
    /// recognizer inline and fail fast here.
    pub fn new(config: EngineConfig, backend: EngineBackend) -> Result<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAP);
        let inner = Arc::new(Inner {
            state: Mutex::new(EngineState {
                listening: false,
                reset_requested: false,
                padding_frames: 0,
                preroll_flush_pending: false,
                first_start_after_init: false,
                raw: String::new(),
                partial: String::new(),
                finals: Vec::new(),
                preroll: PrerollRing::new(if config.hot_mic {
                    config.preroll_cap_frames()
                } else {
                    0
                }),
                preview: PreviewFilter::new(config.hud_throttle_ms),
            }),
            reset_cv: Condvar::new(),
            events,
        });

        let sink: Arc<dyn TranscriptSink> = Arc::new(EngineSink {
            inner: Arc::downgrade(&inner),
        });

        let engine = Self {
            recognizer: RecognizerCell::new(),
            punctuator: PunctuatorCell::new(),
            ready: Arc::new(ReadyGate::default()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            utterance_stop: Arc::new(AtomicBool::new(false)),
            capture: Mutex::new(None),
            open_source: Arc::new(Mutex::new(backend.open_source)),
            inner,
            config,
        };

        if engine.config.hot_mic {
            let ctx = hotmic::HotMicContext {
                config: engine.config.clone(),
                inner: Arc::clone(&engine.inner),
                recognizer: engine.recognizer.clone(),
                punctuator: engine.punctuator.clone(),
                ready: Arc::clone(&engine.ready),
                shutting_down: Arc::clone(&engine.shutting_down),
                open_source: Arc::clone(&engine.open_source),
                make_recognizer: backend.make_recognizer,
                make_punctuator: backend.make_punctuator,
                sink,
            };
            let (done_tx, done_rx) = bounded(1);
            let handle = std::thread::Builder::new()
                .name("listen-capture".into())
                .spawn(move || {
                    hotmic::run(ctx);
                    let _ = done_tx.send(());
                })
                .map_err(|e| ListenError::Other(anyhow::anyhow!("capture thread spawn: {e}")))?;
            *engine.capture.lock() = Some(CaptureThread { handle, done_rx });
        } else {
            let recognizer = (backend.make_recognizer)(sink)?;
            engine.recognizer.install(recognizer);
            if let Some(punctuator) = (backend.make_punctuator)() {
                engine.punctuator.install(punctuator);
            }
            engine.ready.set();
        }

        Ok(engine)
    }

    /// Begin an utterance.
    ///
    /// # Errors
    /// `ListenError::NotReady` while loading (or forever after a fatal
    /// audio failure); the caller surfaces "Loading…". Re-entry while
    /// already listening is a no-op `Ok`.
    pub fn start(&self) -> Result<()> {
        if !self.ready.is_set() {
            return Err(ListenError::NotReady);
        }

        let mut state = self.inner.state.lock();
        if state.listening {
            debug!("start ignored: already listening");
            return Ok(());
        }

        state.partial.clear();
        state.raw.clear();
        state.finals.clear();
        state.padding_frames = self.padding_frames();
        state.preview.reset();

        if self.config.hot_mic {
            state.reset_requested = true;
            if state.first_start_after_init {
                // The ring still holds the silence prime and mic boot
                // noise; dictation must not begin with that.
                state.preroll.clear();
                state.first_start_after_init = false;
                state.preroll_flush_pending = false;
            } else {
                state.preroll_flush_pending = true;
            }

            let deadline = Instant::now() + RESET_ACK_TIMEOUT;
            while state.reset_requested {
                if self
                    .inner
                    .reset_cv
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    warn!("capture loop did not acknowledge reset in time");
                    break;
                }
            }
            state.listening = true;
            info!("listening (hot-mic)");
        } else {
            state.listening = true;
            drop(state);

            self.recognizer.with(|r| r.reset());
            self.utterance_stop.store(false, Ordering::SeqCst);

            let ctx = utterance::UtteranceContext {
                inner: Arc::clone(&self.inner),
                recognizer: self.recognizer.clone(),
                stop: Arc::clone(&self.utterance_stop),
                open_source: Arc::clone(&self.open_source),
                mic_rate: self.config.mic_rate,
            };
            let (done_tx, done_rx) = bounded(1);
            let spawned = std::thread::Builder::new()
                .name("listen-utterance".into())
                .spawn(move || {
                    utterance::run(ctx);
                    let _ = done_tx.send(());
                });
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    self.inner.state.lock().listening = false;
                    return Err(ListenError::Other(anyhow::anyhow!(
                        "capture thread spawn: {e}"
                    )));
                }
            };
            *self.capture.lock() = Some(CaptureThread { handle, done_rx });
            info!("listening (per-utterance)");
        }
        Ok(())
    }

    /// End the utterance and return the formatted transcript (empty when
    /// nothing was recognized or the engine was not listening).
    ///
    /// Cheap by design: in hot-mic mode this only flips state and reads
    /// text — no thread join, no device close. The daemon pastes the
    /// returned text itself so it can update the HUD in between.
    pub fn stop_quick(&self) -> String {
        {
            let mut state = self.inner.state.lock();
            if !state.listening {
                return String::new();
            }
            state.listening = false;
        }

        if !self.config.hot_mic {
            self.utterance_stop.store(true, Ordering::SeqCst);
            self.join_capture(UTTERANCE_JOIN_TIMEOUT);
        }

        let current = self
            .recognizer
            .with(|r| r.current_text())
            .unwrap_or_default();

        let raw_text = {
            let mut state = self.inner.state.lock();
            let primary = if current.trim().is_empty() {
                std::mem::take(&mut state.raw)
            } else {
                current
            };
            let mut parts = std::mem::take(&mut state.finals);
            if !primary.trim().is_empty() {
                parts.push(primary);
            }
            state.partial.clear();
            state.raw.clear();
            state.preroll.clear();
            parts.join(" ")
        };

        if !self.config.hot_mic {
            self.recognizer.with(|r| r.reset());
        }

        let formatted = self.punctuator.finalize(&raw_text);
        info!(chars = formatted.chars().count(), "utterance finalized");
        formatted
    }

    /// Tear the engine down. Idempotent; may block up to the join bound
    /// plus a network close, so call it off the control thread.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.utterance_stop.store(true, Ordering::SeqCst);
        self.inner.state.lock().listening = false;

        let timeout = if self.config.hot_mic {
            HOTMIC_JOIN_TIMEOUT
        } else {
            UTTERANCE_JOIN_TIMEOUT
        };
        self.join_capture(timeout);

        if let Some(mut recognizer) = self.recognizer.take() {
            recognizer.close();
        }
        info!("engine shut down");
    }

    pub fn is_listening(&self) -> bool {
        self.inner.state.lock().listening
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    /// Pay deferred backend startup cost now, if the prewarm policy says
    /// so. Local model load happens on the capture thread regardless; this
    /// mainly opens the remote session early.
    pub fn prewarm(&self) {
        if !self.config.prewarm.should_prewarm(self.config.provider) {
            return;
        }
        if let Some(Err(e)) = self.recognizer.with(|r| r.prewarm()) {
            self.inner.emit_error(&format!("prewarm failed: {e}"));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn ready_gate(&self) -> Arc<ReadyGate> {
        Arc::clone(&self.ready)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn padding_frames(&self) -> usize {
        ((u64::from(self.config.mic_rate) * PADDING_MS) / 1000) as usize
    }

    fn join_capture(&self, timeout: Duration) {
        let Some(capture) = self.capture.lock().take() else {
            return;
        };
        match capture.done_rx.recv_timeout(timeout) {
            Ok(()) => {
                let _ = capture.handle.join();
            }
            Err(_) => {
                warn!("capture thread did not exit within {timeout:?}; abandoning it");
            }
        }
    }
}

impl Drop for ListenEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_gate_wait_timeout_expires_when_unset() {
        let gate = ReadyGate::default();
        assert!(!gate.is_set());
        assert!(!gate.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn ready_gate_releases_waiters_and_survives_revoke() {
        let gate = Arc::new(ReadyGate::default());
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        gate.set();
        assert!(waiter.join().unwrap());

        gate.revoke();
        assert!(!gate.is_set());
        // Already-latched waiters are not re-parked by a revoke.
        assert!(gate.wait_timeout(Duration::from_millis(1)));
    }
}
