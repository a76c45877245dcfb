//! Per-utterance capture loop.
//!
//! Used when hot-mic is off (the remote provider by default): the
//! microphone is opened when dictation starts and dropped when it stops,
//! and no pre-roll exists. The thread exits as soon as the stop event or a
//! failure clears `listening`; `stop_quick` joins it with a bounded wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::audio::chunk::AudioChunk;
use crate::engine::{hotmic::feed, Inner, SourceOpener};
use crate::recognizer::RecognizerCell;

pub(crate) struct UtteranceContext {
    pub inner: Arc<Inner>,
    pub recognizer: RecognizerCell,
    pub stop: Arc<AtomicBool>,
    pub open_source: Arc<Mutex<SourceOpener>>,
    pub mic_rate: u32,
}

pub(crate) fn run(ctx: UtteranceContext) {
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

    let padding_frames = std::mem::take(&mut ctx.inner.state.lock().padding_frames);
    if padding_frames > 0 {
        let padding = AudioChunk::silence(padding_frames, ctx.mic_rate);
        if let Err(e) = feed(&ctx.recognizer, ctx.mic_rate, &padding.samples) {
            ctx.inner.emit_error(&format!("decode failed: {e}"));
            return;
        }
    }

    loop {
        if ctx.stop.load(Ordering::Relaxed) || !ctx.inner.state.lock().listening {
            break;
        }

        let chunk = match source.read() {
            Ok(chunk) => chunk,
            Err(e) => {
                ctx.inner.emit_error(&format!("audio read failed: {e}"));
                break;
            }
        };
        // A stop that landed during the blocking read means this chunk is
        // already past the utterance boundary.
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }

        if let Err(e) = feed(&ctx.recognizer, chunk.sample_rate, &chunk.samples) {
            ctx.inner.emit_error(&format!("decode failed: {e}"));
            break;
        }

        let text = ctx
            .recognizer
            .with(|r| r.current_text())
            .unwrap_or_default();
        if !text.is_empty() {
            ctx.inner.note_partial(&text);
        }
    }

    debug!("utterance capture finished");
    // `source` drops here, closing the device for this utterance.
}
