//! Control socket: the daemon half of the push-to-dictate protocol.
//!
//! The hotkey handler connects, writes one short line (`TOGGLE <pane>` or
//! `PING`), reads one reply line, and disconnects. Toggle arbitration
//! lives here: the start path is cheap and runs inline on the event loop;
//! the stop path flips the HUD immediately and pushes `stop_quick` +
//! paste onto a blocking worker so the socket reply never waits on the
//! recognizer. A single `stopping` flag guarantees at most one stop in
//! flight — extra toggles while stopping are dropped on the floor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use listen_core::error::Result;
use listen_core::{ListenEngine, ReadyGate};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::hud::StatusSurface;

/// Longest request the daemon will look at.
const MAX_REQUEST_BYTES: usize = 256;

/// The slice of the engine the control path needs. `ListenEngine` is the
/// production implementation; tests substitute a scripted one and the
/// daemon falls back to [`UnavailableEngine`] when construction fails.
pub trait DictationControl: Send + Sync + 'static {
    fn is_ready(&self) -> bool;
    fn is_listening(&self) -> bool;
    fn start(&self) -> Result<()>;
    fn stop_quick(&self) -> String;
    fn shutdown(&self);
    fn ready_gate(&self) -> Arc<ReadyGate>;
}

impl DictationControl for ListenEngine {
    fn is_ready(&self) -> bool {
        ListenEngine::is_ready(self)
    }

    fn is_listening(&self) -> bool {
        ListenEngine::is_listening(self)
    }

    fn start(&self) -> Result<()> {
        ListenEngine::start(self)
    }

    fn stop_quick(&self) -> String {
        ListenEngine::stop_quick(self)
    }

    fn shutdown(&self) {
        ListenEngine::shutdown(self)
    }

    fn ready_gate(&self) -> Arc<ReadyGate> {
        ListenEngine::ready_gate(self)
    }
}

/// Stand-in used when engine construction failed at startup. The daemon
/// keeps the control socket alive so the hotkey launcher can still `PING`
/// and diagnose; the ready gate never fires, so every toggle surfaces
/// "Loading…" next to the error on the message line.
pub struct UnavailableEngine {
    gate: Arc<ReadyGate>,
}

impl UnavailableEngine {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(ReadyGate::default()),
        }
    }
}

impl Default for UnavailableEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DictationControl for UnavailableEngine {
    fn is_ready(&self) -> bool {
        false
    }

    fn is_listening(&self) -> bool {
        false
    }

    fn start(&self) -> Result<()> {
        Err(listen_core::ListenError::NotReady)
    }

    fn stop_quick(&self) -> String {
        String::new()
    }

    fn shutdown(&self) {}

    fn ready_gate(&self) -> Arc<ReadyGate> {
        Arc::clone(&self.gate)
    }
}

/// Shared control state: engine + HUD surface + the stop arbitration flag.
pub struct Controller<E: ?Sized, S> {
    engine: Arc<E>,
    surface: Arc<S>,
    stopping: Arc<AtomicBool>,
    ready_watch_started: AtomicBool,
}

impl<E: DictationControl + ?Sized, S: StatusSurface> Controller<E, S> {
    pub fn new(engine: Arc<E>, surface: Arc<S>) -> Self {
        Self {
            engine,
            surface,
            stopping: Arc::new(AtomicBool::new(false)),
            ready_watch_started: AtomicBool::new(false),
        }
    }

    /// Dispatch one request line; every request gets exactly one reply.
    pub fn dispatch(&self, request: &str) -> &'static str {
        let mut parts = request.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        match verb.as_str() {
            "TOGGLE" => {
                let pane = parts.next().unwrap_or("").to_string();
                debug!(pane = pane.as_str(), "toggle");
                self.toggle(pane);
                "OK\n"
            }
            "PING" => "PONG\n",
            _ => "ERR\n",
        }
    }

    fn toggle(&self, pane: String) {
        if !self.engine.is_listening() && !self.stopping.load(Ordering::SeqCst) {
            if !self.engine.is_ready() {
                self.surface.set_preview("Loading…");
                self.watch_ready_once();
                return;
            }
            self.surface.set_listening(true);
            self.surface.set_preview("");
            if let Err(e) = self.engine.start() {
                self.surface.set_listening(false);
                self.surface.set_preview(&format!("Error: {e}"));
                warn!("engine start failed: {e}");
            }
            return;
        }

        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("toggle ignored (stop already in flight)");
            return;
        }

        self.surface.set_listening(false);
        self.surface.set_preview("Pasting…");

        let engine = Arc::clone(&self.engine);
        let surface = Arc::clone(&self.surface);
        let stopping = Arc::clone(&self.stopping);
        tokio::task::spawn_blocking(move || {
            let text = engine.stop_quick();
            if !text.trim().is_empty() && !pane.is_empty() {
                if let Err(e) = surface.paste(&pane, &text) {
                    warn!("paste failed: {e}");
                }
            }
            surface.set_preview("");
            stopping.store(false, Ordering::SeqCst);
        });
    }

    /// Park one watcher on the ready gate; when loading ends it wipes the
    /// "Loading…" surfaces. Subsequent not-ready toggles reuse the watcher.
    /// A plain detached thread, not a blocking-pool task: if the gate never
    /// fires (engine dead on arrival), daemon exit must not wait on it.
    pub fn watch_ready_once(&self) {
        if self.ready_watch_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let gate = self.engine.ready_gate();
        let surface = Arc::clone(&self.surface);
        let spawned = std::thread::Builder::new()
            .name("listen-ready-watch".into())
            .spawn(move || {
                gate.wait();
                surface.set_preview("");
                surface.set_message("");
            });
        if let Err(e) = spawned {
            warn!("ready watcher spawn failed: {e}");
        }
    }
}

/// Accept loop: one short-lived task per connection.
pub async fn serve<E: DictationControl + ?Sized, S: StatusSurface>(
    listener: UnixListener,
    controller: Arc<Controller<E, S>>,
) {
    info!("control socket serving");
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("control socket accept failed: {e}");
                continue;
            }
        };
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, controller).await {
                debug!("control connection error: {e}");
            }
        });
    }
}

async fn handle_connection<E: DictationControl + ?Sized, S: StatusSurface>(
    mut stream: tokio::net::UnixStream,
    controller: Arc<Controller<E, S>>,
) -> std::io::Result<()> {
    let mut buf = [0u8; MAX_REQUEST_BYTES];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let reply = controller.dispatch(request.trim());
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    use listen_core::ListenError;
    use tokio::net::UnixStream;

    struct FakeEngine {
        gate: Arc<ReadyGate>,
        listening: AtomicBool,
        stops: AtomicUsize,
        transcript: String,
    }

    impl FakeEngine {
        fn new(ready: bool, transcript: &str) -> Arc<Self> {
            let gate = Arc::new(ReadyGate::default());
            if ready {
                gate.set();
            }
            Arc::new(Self {
                gate,
                listening: AtomicBool::new(false),
                stops: AtomicUsize::new(0),
                transcript: transcript.to_string(),
            })
        }
    }

    impl DictationControl for FakeEngine {
        fn is_ready(&self) -> bool {
            self.gate.is_set()
        }

        fn is_listening(&self) -> bool {
            self.listening.load(Ordering::SeqCst)
        }

        fn start(&self) -> Result<()> {
            if !self.gate.is_set() {
                return Err(ListenError::NotReady);
            }
            self.listening.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop_quick(&self) -> String {
            // Simulate the recognizer finalize cost so overlapping stop
            // toggles really do overlap.
            std::thread::sleep(Duration::from_millis(20));
            self.listening.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.transcript.clone()
        }

        fn shutdown(&self) {}

        fn ready_gate(&self) -> Arc<ReadyGate> {
            Arc::clone(&self.gate)
        }
    }

    #[derive(Default)]
    struct FakeSurface {
        listening: StdMutex<Vec<bool>>,
        previews: StdMutex<Vec<String>>,
        messages: StdMutex<Vec<String>>,
        pastes: StdMutex<Vec<(String, String)>>,
    }

    impl StatusSurface for FakeSurface {
        fn set_listening(&self, on: bool) {
            self.listening.lock().unwrap().push(on);
        }

        fn set_preview(&self, text: &str) {
            self.previews.lock().unwrap().push(text.to_string());
        }

        fn set_message(&self, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }

        fn paste(&self, pane: &str, text: &str) -> anyhow::Result<()> {
            self.pastes
                .lock()
                .unwrap()
                .push((pane.to_string(), text.to_string()));
            Ok(())
        }
    }

    async fn roundtrip(socket: &std::path::Path, request: &str) -> String {
        let mut stream = UnixStream::connect(socket).await.expect("connect");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.expect("read");
        reply
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn protocol_replies_one_line_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("listen-test.sock");
        let engine = FakeEngine::new(true, "");
        let surface = Arc::new(FakeSurface::default());
        let controller = Arc::new(Controller::new(engine, surface));
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve(listener, controller));

        assert_eq!(roundtrip(&socket, "PING\n").await, "PONG\n");
        assert_eq!(roundtrip(&socket, "REWIND\n").await, "ERR\n");
        assert_eq!(roundtrip(&socket, "\n").await, "ERR\n");
        assert_eq!(roundtrip(&socket, "TOGGLE %1\n").await, "OK\n");
    }

    #[tokio::test]
    async fn dead_engine_still_serves_ping_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("listen-dead.sock");
        let engine: Arc<dyn DictationControl> = Arc::new(UnavailableEngine::new());
        let surface = Arc::new(FakeSurface::default());
        let controller = Arc::new(Controller::new(Arc::clone(&engine), Arc::clone(&surface)));
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve(listener, controller));

        assert_eq!(roundtrip(&socket, "PING\n").await, "PONG\n");
        // Toggling still replies OK; the engine just never becomes ready.
        assert_eq!(roundtrip(&socket, "TOGGLE %1\n").await, "OK\n");
        assert!(!engine.is_listening());
        assert_eq!(
            surface.previews.lock().unwrap().last().map(String::as_str),
            Some("Loading…")
        );
        assert!(surface.pastes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggle_before_ready_shows_loading_and_clears_on_ready() {
        let engine = FakeEngine::new(false, "");
        let surface = Arc::new(FakeSurface::default());
        let controller = Controller::new(Arc::clone(&engine), Arc::clone(&surface));

        assert_eq!(controller.dispatch("TOGGLE %1"), "OK\n");
        assert!(!engine.is_listening());
        assert_eq!(
            surface.previews.lock().unwrap().last().map(String::as_str),
            Some("Loading…")
        );
        // The listening flag was never raised.
        assert!(surface.listening.lock().unwrap().is_empty());

        engine.gate.set();
        wait_until("loading preview to clear", || {
            surface.previews.lock().unwrap().last().map(String::as_str) == Some("")
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_stop_toggles_collapse_to_one_stop_and_one_paste() {
        let engine = FakeEngine::new(true, "hello world");
        let surface = Arc::new(FakeSurface::default());
        let controller = Controller::new(Arc::clone(&engine), Arc::clone(&surface));

        assert_eq!(controller.dispatch("TOGGLE %1"), "OK\n");
        assert!(engine.is_listening());
        assert_eq!(surface.listening.lock().unwrap().last(), Some(&true));

        // Two stop toggles in rapid succession: the first wins, the second
        // is a silent no-op.
        assert_eq!(controller.dispatch("TOGGLE %1"), "OK\n");
        assert_eq!(controller.dispatch("TOGGLE %1"), "OK\n");
        assert_eq!(
            surface.previews.lock().unwrap().last().map(String::as_str),
            Some("Pasting…")
        );

        wait_until("stop to finish", || {
            !controller.stopping.load(Ordering::SeqCst)
        })
        .await;

        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        let pastes = surface.pastes.lock().unwrap();
        assert_eq!(pastes.as_slice(), [("%1".to_string(), "hello world".to_string())]);
        drop(pastes);
        // HUD and engine agree: not listening.
        assert_eq!(surface.listening.lock().unwrap().last(), Some(&false));
        assert!(!engine.is_listening());
        assert_eq!(
            surface.previews.lock().unwrap().last().map(String::as_str),
            Some("")
        );
    }

    #[tokio::test]
    async fn empty_transcript_is_never_pasted() {
        let engine = FakeEngine::new(true, "   ");
        let surface = Arc::new(FakeSurface::default());
        let controller = Controller::new(Arc::clone(&engine), Arc::clone(&surface));

        controller.dispatch("TOGGLE %1");
        controller.dispatch("TOGGLE %1");
        wait_until("stop to finish", || {
            !controller.stopping.load(Ordering::SeqCst)
        })
        .await;

        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert!(surface.pastes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggle_without_pane_still_stops_but_cannot_paste() {
        let engine = FakeEngine::new(true, "hello");
        let surface = Arc::new(FakeSurface::default());
        let controller = Controller::new(Arc::clone(&engine), Arc::clone(&surface));

        controller.dispatch("TOGGLE");
        controller.dispatch("TOGGLE");
        wait_until("stop to finish", || {
            !controller.stopping.load(Ordering::SeqCst)
        })
        .await;

        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert!(surface.pastes.lock().unwrap().is_empty());
    }
}
