//! Remote streaming recognizer: realtime WebSocket transcription service.
//!
//! The engine is synchronous, so the socket lives on a dedicated worker
//! thread running a private current-thread tokio runtime. `accept` resamples
//! microphone audio to the service rate, encodes PCM16 and hands frames to
//! the worker over a channel; the worker's read half bridges partials and
//! finals back through [`TranscriptSink`] into the engine's transcript
//! state (never straight into the preview emitter).
//!
//! The service decides its own utterance turns, so finals may keep arriving
//! after the user toggled off; they are posted as additive fragments and the
//! engine discards any stragglers when the next utterance starts.

use std::sync::Arc;
use std::thread::JoinHandle;

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::audio::resample::StreamResampler;
use crate::config::RemoteConfig;
use crate::error::{ListenError, Result};
use crate::recognizer::{StreamingRecognizer, TranscriptSink};

enum Outbound {
    Frame(String),
    Terminate,
}

/// One inbound service message; unknown kinds deserialize harmlessly.
#[derive(Debug, Deserialize)]
struct ServiceMessage {
    message_type: Option<String>,
    text: Option<String>,
    error: Option<String>,
}

struct Connection {
    out_tx: mpsc::UnboundedSender<Outbound>,
    worker: Option<JoinHandle<()>>,
}

/// Realtime WebSocket recognizer.
pub struct RemoteRecognizer {
    config: RemoteConfig,
    sink: Arc<dyn TranscriptSink>,
    /// Built on first `accept`, once the microphone rate is known.
    converter: Option<StreamResampler>,
    connection: Option<Connection>,
    /// Last partial seen by the socket reader; `current_text` answers from
    /// here so `stop_quick` sees text even mid-turn.
    last_partial: Arc<Mutex<String>>,
}

impl RemoteRecognizer {
    /// Cheap: no connection is opened until `prewarm` or the first frame.
    pub fn new(config: RemoteConfig, sink: Arc<dyn TranscriptSink>) -> Self {
        Self {
            config,
            sink,
            converter: None,
            connection: None,
            last_partial: Arc::new(Mutex::new(String::new())),
        }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let url = format!(
            "{}?sample_rate={}",
            self.config.ws_url, self.config.sample_rate
        );
        let api_key = self.config.api_key.clone();
        let sink = Arc::clone(&self.sink);
        let last_partial = Arc::clone(&self.last_partial);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let worker = std::thread::Builder::new()
            .name("listen-remote-asr".into())
            .spawn(move || socket_worker(url, api_key, out_rx, sink, last_partial))
            .map_err(|e| ListenError::Remote(format!("worker spawn: {e}")))?;

        self.connection = Some(Connection {
            out_tx,
            worker: Some(worker),
        });
        Ok(())
    }

    fn encode_frame(&self, pcm: &[f32]) -> String {
        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for &sample in pcm {
            let value = (sample.clamp(-1.0, 1.0) * 32_767.0) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
        serde_json::json!({ "audio_data": audio }).to_string()
    }
}

impl StreamingRecognizer for RemoteRecognizer {
    fn accept(&mut self, sample_rate: u32, samples: &[f32]) -> Result<()> {
        self.ensure_connected()?;

        if self.converter.is_none() {
            self.converter = Some(StreamResampler::new(sample_rate, self.config.sample_rate)?);
        }
        let Some(converter) = self.converter.as_mut() else {
            return Ok(());
        };
        let mut pcm = Vec::new();
        converter.push(samples, &mut pcm);
        if pcm.is_empty() {
            return Ok(());
        }

        let frame = self.encode_frame(&pcm);
        let Some(conn) = self.connection.as_ref() else {
            return Ok(());
        };
        if conn.out_tx.send(Outbound::Frame(frame)).is_err() {
            // Worker died (connect failure or socket error); drop the
            // carcass so the next utterance reconnects.
            self.connection = None;
            return Err(ListenError::Remote("realtime session closed".into()));
        }
        Ok(())
    }

    // Decoding happens server-side; there is never local work pending.
    fn is_ready(&self) -> bool {
        false
    }

    fn decode(&mut self) -> Result<()> {
        Ok(())
    }

    fn current_text(&mut self) -> String {
        self.last_partial.lock().clone()
    }

    /// Asks the service to finalize the current turn so audio from this
    /// utterance cannot bleed into the next one, then forgets local state.
    fn reset(&mut self) {
        self.last_partial.lock().clear();
        self.converter = None;
        if let Some(conn) = self.connection.as_ref() {
            let end = serde_json::json!({ "force_end_utterance": true }).to_string();
            if conn.out_tx.send(Outbound::Frame(end)).is_err() {
                self.connection = None;
            }
        }
    }

    /// Opening the session early hides the connect latency from the first
    /// utterance.
    fn prewarm(&mut self) -> Result<()> {
        self.ensure_connected()
    }

    fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.out_tx.send(Outbound::Terminate);
            if let Some(worker) = conn.worker {
                if worker.join().is_err() {
                    warn!("remote recognizer worker panicked during close");
                }
            }
        }
    }
}

impl Drop for RemoteRecognizer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker body: own runtime, one socket, pump both directions until the
/// engine terminates the session or the service hangs up.
fn socket_worker(
    url: String,
    api_key: String,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    sink: Arc<dyn TranscriptSink>,
    last_partial: Arc<Mutex<String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            sink.error(&format!("remote runtime: {e}"));
            return;
        }
    };

    runtime.block_on(async move {
        let mut request = match url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                sink.error(&format!("remote url: {e}"));
                return;
            }
        };
        match api_key.parse() {
            Ok(value) => {
                request
                    .headers_mut()
                    .insert(http::header::AUTHORIZATION, value);
            }
            Err(_) => {
                sink.error("remote api key is not a valid header value");
                return;
            }
        }

        let (ws, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                sink.error(&format!("realtime connect failed: {e}"));
                return;
            }
        };
        info!("realtime session open");
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            sink.error(&format!("realtime send failed: {e}"));
                            break;
                        }
                    }
                    Some(Outbound::Terminate) | None => {
                        let bye = serde_json::json!({ "terminate_session": true }).to_string();
                        let _ = write.send(Message::Text(bye)).await;
                        let _ = write.close().await;
                        break;
                    }
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        handle_message(&raw, &sink, &last_partial);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("realtime session closed by service");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        sink.error(&format!("realtime read failed: {e}"));
                        break;
                    }
                },
            }
        }
    });
}

fn handle_message(raw: &str, sink: &Arc<dyn TranscriptSink>, last_partial: &Arc<Mutex<String>>) {
    let message: ServiceMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            debug!("undecodable service message: {e}");
            return;
        }
    };

    if let Some(error) = message.error {
        sink.error(&error);
        return;
    }

    let text = message.text.unwrap_or_default();
    match message.message_type.as_deref() {
        Some("PartialTranscript") if !text.is_empty() => {
            *last_partial.lock() = text.clone();
            sink.partial(&text);
        }
        Some("FinalTranscript") if !text.is_empty() => {
            last_partial.lock().clear();
            sink.final_fragment(&text);
        }
        _ => {}
    }
}
