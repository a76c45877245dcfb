//! Hot-mic capture loop.
//!
//! One persistent thread for the engine's lifetime: it loads the backend,
//! opens the microphone once, primes the recognizer and the pre-roll ring,
//! then alternates between keeping the ring warm (idle) and feeding the
//! recognizer (listening).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::chunk::AudioChunk;
use crate::config::EngineConfig;
use crate::engine::{
    Inner, PunctuatorFactory, ReadyGate, RecognizerFactory, SourceOpener, PADDING_MS,
};
use crate::error::Result;
use crate::punctuate::PunctuatorCell;
use crate::recognizer::{RecognizerCell, TranscriptSink};

/// Reads thrown away before priming the ring, dropping audio the driver
/// buffered while the device was opening.
const INITIAL_DISCARD_READS: usize = 3;

pub(crate) struct HotMicContext {
    pub config: EngineConfig,
    pub inner: Arc<Inner>,
    pub recognizer: RecognizerCell,
    pub punctuator: PunctuatorCell,
    pub ready: Arc<ReadyGate>,
    pub shutting_down: Arc<AtomicBool>,
    pub open_source: Arc<Mutex<SourceOpener>>,
    pub make_recognizer: RecognizerFactory,
    pub make_punctuator: PunctuatorFactory,
    pub sink: Arc<dyn TranscriptSink>,
}

/// Feed samples and drain the decoder, all under one recognizer-lock hold.
pub(crate) fn feed(cell: &RecognizerCell, sample_rate: u32, samples: &[f32]) -> Result<()> {
    cell.with(|recognizer| {
        recognizer.accept(sample_rate, samples)?;
        while recognizer.is_ready() {
            recognizer.decode()?;
        }
        Ok(())
    })
    .unwrap_or(Ok(()))
}

pub(crate) fn run(ctx: HotMicContext) {
    let mic_rate = ctx.config.mic_rate;

    // ── 1. Model load ────────────────────────────────────────────────────
    let recognizer = match (ctx.make_recognizer)(Arc::clone(&ctx.sink)) {
        Ok(r) => r,
        Err(e) => {
            ctx.inner.emit_error(&format!("recognizer init failed: {e}"));
            return;
        }
    };
    ctx.recognizer.install(recognizer);
    if let Some(punctuator) = (ctx.make_punctuator)() {
        ctx.punctuator.install(punctuator);
    }

    // ── 2. Audio open ────────────────────────────────────────────────────
    let mut source = {
        let mut opener = ctx.open_source.lock();
        match (*opener)() {
            Ok(s) => s,
            Err(e) => {
                ctx.inner.emit_error(&format!("microphone open failed: {e}"));
                return;
            }
        }
    };

    // ── 3. Silence prime ─────────────────────────────────────────────────
    let prime_frames = ((u64::from(mic_rate) * PADDING_MS) / 1000) as usize;
    let prime = AudioChunk::silence(prime_frames, mic_rate);
    if let Err(e) = feed(&ctx.recognizer, mic_rate, &prime.samples) {
        ctx.inner.emit_error(&format!("recognizer priming failed: {e}"));
        return;
    }

    // ── 4. Pre-roll prime ────────────────────────────────────────────────
    for _ in 0..INITIAL_DISCARD_READS {
        if ctx.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = source.read() {
            ctx.inner.emit_error(&format!("audio read failed: {e}"));
            return;
        }
    }
    let cap = ctx.config.preroll_cap_frames();
    while cap > 0 && ctx.inner.state.lock().preroll.frames() < cap {
        if ctx.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        match source.read() {
            Ok(chunk) => ctx.inner.state.lock().preroll.append(chunk),
            Err(e) => {
                ctx.inner.emit_error(&format!("audio read failed: {e}"));
                return;
            }
        }
    }

    // ── 5. Ready ─────────────────────────────────────────────────────────
    ctx.inner.state.lock().first_start_after_init = true;
    ctx.ready.set();
    info!("hot-mic capture ready");

    // ── 6. Steady state ──────────────────────────────────────────────────
    loop {
        if ctx.shutting_down.load(Ordering::Relaxed) {
            break;
        }

        service_reset(&ctx.inner, &ctx.recognizer);

        let (listening, flush_preroll, padding_frames) = {
            let mut state = ctx.inner.state.lock();
            let listening = state.listening;
            let flush = listening && state.preroll_flush_pending;
            if flush {
                state.preroll_flush_pending = false;
            }
            let padding = if listening {
                std::mem::take(&mut state.padding_frames)
            } else {
                0
            };
            (listening, flush, padding)
        };

        if !listening {
            match source.read() {
                Ok(chunk) => ctx.inner.state.lock().preroll.append(chunk),
                Err(e) => {
                    fatal_audio_failure(&ctx.inner, &ctx.ready, &e.to_string());
                    break;
                }
            }
            continue;
        }

        if flush_preroll {
            let buffered = ctx.inner.state.lock().preroll.drain();
            debug!(chunks = buffered.len(), "draining pre-roll into recognizer");
            let mut failed = false;
            for chunk in buffered {
                if let Err(e) = feed(&ctx.recognizer, chunk.sample_rate, &chunk.samples) {
                    ctx.inner.emit_error(&format!("decode failed: {e}"));
                    failed = true;
                    break;
                }
            }
            if failed {
                continue;
            }
        }

        if padding_frames > 0 {
            let padding = AudioChunk::silence(padding_frames, mic_rate);
            if let Err(e) = feed(&ctx.recognizer, mic_rate, &padding.samples) {
                ctx.inner.emit_error(&format!("decode failed: {e}"));
                continue;
            }
        }

        let chunk = match source.read() {
            Ok(chunk) => chunk,
            Err(e) => {
                fatal_audio_failure(&ctx.inner, &ctx.ready, &e.to_string());
                break;
            }
        };
        if let Err(e) = feed(&ctx.recognizer, chunk.sample_rate, &chunk.samples) {
            ctx.inner.emit_error(&format!("decode failed: {e}"));
            continue;
        }

        let text = ctx
            .recognizer
            .with(|r| r.current_text())
            .unwrap_or_default();
        if !text.is_empty() {
            ctx.inner.note_partial(&text);
        }
    }
    // `source` drops here, releasing the device on this thread.
}

/// Service a pending recognizer reset requested by `start`, then wake it.
fn service_reset(inner: &Arc<Inner>, recognizer: &RecognizerCell) {
    let requested = inner.state.lock().reset_requested;
    if !requested {
        return;
    }

    recognizer.with(|r| r.reset());

    let mut state = inner.state.lock();
    state.partial.clear();
    state.raw.clear();
    state.finals.clear();
    state.reset_requested = false;
    inner.reset_cv.notify_all();
}

/// A dead microphone is unrecoverable in hot-mic mode: surface the error
/// and leave the engine permanently not-ready so every later toggle shows
/// "Loading…" until the daemon is restarted.
fn fatal_audio_failure(inner: &Arc<Inner>, ready: &Arc<ReadyGate>, message: &str) {
    warn!("hot-mic audio failure: {message}");
    ready.revoke();
    inner.emit_error(&format!("audio read failed: {message}"));
}
