//! Streaming recognizer abstraction.
//!
//! Two backends implement the same contract: a local sherpa-onnx
//! streaming zipformer ([`sherpa::ZipformerRecognizer`]) and a realtime
//! WebSocket service ([`remote::RemoteRecognizer`]). The engine drives
//! either one through [`StreamingRecognizer`] without caring which.
//!
//! `&mut self` throughout intentionally expresses that decoders are
//! stateful; all mutation is serialised through the [`RecognizerCell`]
//! mutex — the "recognizer lock". Exactly one thread at a time calls in.

#[cfg(feature = "local-asr")]
pub mod sherpa;

pub mod remote;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Contract shared by all streaming ASR backends.
pub trait StreamingRecognizer: Send {
    /// Feed mono f32 samples captured at `sample_rate`.
    fn accept(&mut self, sample_rate: u32, samples: &[f32]) -> Result<()>;

    /// Whether the backend has undecoded frames buffered.
    fn is_ready(&self) -> bool;

    /// Decode one step; callers loop `while is_ready() { decode()? }`.
    fn decode(&mut self) -> Result<()>;

    /// Best-effort latest transcript for the current utterance. May be
    /// empty while the decoder warms up.
    fn current_text(&mut self) -> String;

    /// Start a new utterance: clear decoder state without reloading the
    /// model or reopening the connection.
    fn reset(&mut self);

    /// Pay any deferred startup cost early (e.g. open the WebSocket
    /// session). Default: nothing to do.
    fn prewarm(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release all backend resources. May block (network close).
    fn close(&mut self);
}

/// Shared, lockable slot for the recognizer.
///
/// Holds `Option` because the hot-mic thread constructs the backend during
/// its load phase while the control thread may already be probing for
/// final text. Both sides take the lock; nobody else touches the backend.
#[derive(Clone, Default)]
pub struct RecognizerCell(pub Arc<Mutex<Option<Box<dyn StreamingRecognizer>>>>);

impl RecognizerCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, recognizer: Box<dyn StreamingRecognizer>) {
        *self.0.lock() = Some(recognizer);
    }

    /// Take the backend out for teardown; later callers see `None`.
    pub fn take(&self) -> Option<Box<dyn StreamingRecognizer>> {
        self.0.lock().take()
    }

    /// Run `f` against the backend under the recognizer lock, if present.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn StreamingRecognizer) -> R) -> Option<R> {
        self.0.lock().as_mut().map(|r| f(r.as_mut()))
    }
}

impl std::fmt::Debug for RecognizerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognizerCell").finish_non_exhaustive()
    }
}

/// Bridge for backends that deliver text on their own thread (the remote
/// recognizer's socket reader). Implemented by the engine: fragments land
/// in the state-lock-protected transcript state, never straight in the
/// preview emitter.
pub trait TranscriptSink: Send + Sync {
    /// A revisable snapshot of the in-flight utterance.
    fn partial(&self, text: &str);

    /// A committed fragment; additive, ordered.
    fn final_fragment(&self, text: &str);

    /// A backend failure worth surfacing to the user.
    fn error(&self, message: &str);
}

/// Sink that drops everything; used before the engine wires a real one.
pub struct NullSink;

impl TranscriptSink for NullSink {
    fn partial(&self, _text: &str) {}
    fn final_fragment(&self, _text: &str) {}
    fn error(&self, _message: &str) {}
}
