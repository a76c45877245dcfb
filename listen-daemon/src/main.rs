//! listen-daemon entry point.
//!
//! One daemon per tmux session, launched into a hidden window by the
//! orchestrator. Wires the dictation engine to the Unix control socket and
//! the tmux status line, and turns SIGTERM into an orderly engine
//! shutdown.
//!
//! ## Runtime note
//!
//! A current-thread tokio runtime drives the socket accept loop; blocking
//! work (`stop_quick`, paste, `shutdown`) goes through `spawn_blocking`
//! so a slow recognizer close can never stall a socket reply. The
//! ready-gate watcher is a detached thread because its gate may never
//! fire.

mod control;
mod hud;
mod paste;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use listen_core::{EngineBackend, EngineConfig, EngineEvent, ListenEngine};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use control::{serve, Controller, DictationControl, UnavailableEngine};
use hud::{StatusSurface, TmuxSurface};

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The daemon lives in a hidden tmux window where stderr is invisible;
    // LISTEN_DEBUG_LOG routes logs somewhere inspectable.
    if let Ok(log_path) = std::env::var("LISTEN_DEBUG_LOG") {
        let path = Path::new(&log_path);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => Some(parent),
            _ => Some(Path::new(".")),
        };
        let file = path.file_name();
        if let (Some(dir), Some(file)) = (dir, file) {
            let appender = tracing_appender::rolling::never(dir, file);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            return Some(guard);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

fn bind_control_socket(path: &str) -> anyhow::Result<UnixListener> {
    // A stale socket from a crashed daemon would make bind fail.
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path).with_context(|| format!("binding {path}"))?;

    // Only the session owner may toggle dictation.
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod 0600 {path}"))?;

    Ok(listener)
}

/// Forward engine events to the status line.
async fn forward_events(
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    surface: Arc<TmuxSurface>,
) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Partial { text }) => surface.set_preview(&text),
            Ok(EngineEvent::Final { text }) => {
                tracing::debug!(text = text.as_str(), "final fragment");
            }
            Ok(EngineEvent::Error { message }) => {
                warn!("engine error: {message}");
                surface.set_preview(&format!("Error: {message}"));
                surface.set_listening(false);
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event consumer lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _log_guard = init_tracing();

    let Ok(session) = std::env::var("LISTEN_SESSION") else {
        eprintln!("LISTEN_SESSION env var is required");
        return ExitCode::from(2);
    };
    let socket_path = std::env::var("LISTEN_SOCKET")
        .unwrap_or_else(|_| format!("/tmp/listen-{session}.sock"));

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            eprintln!("listen-daemon: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        session = session.as_str(),
        socket = socket_path.as_str(),
        provider = ?config.provider,
        hot_mic = config.hot_mic,
        "daemon starting"
    );

    let surface = Arc::new(TmuxSurface::from_env());
    surface.set_listening(false);
    surface.set_preview("");

    let backend = match EngineBackend::from_config(&config) {
        Ok(backend) => backend,
        Err(e) => {
            error!("backend wiring failed: {e}");
            eprintln!("listen-daemon: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Engine construction can fail (bad model files, say). The daemon
    // still binds the control socket and answers PING so the hotkey
    // launcher can diagnose; toggles surface "Loading…" next to the
    // error carried on the message line.
    let mut engine_dead = false;
    let engine: Arc<dyn DictationControl> = match ListenEngine::new(config, backend) {
        Ok(engine) => {
            let engine = Arc::new(engine);
            tokio::spawn(forward_events(engine.subscribe(), Arc::clone(&surface)));
            engine.prewarm();
            engine
        }
        Err(e) => {
            error!("engine construction failed: {e}");
            surface.set_message(&format!("Error: {e}"));
            engine_dead = true;
            Arc::new(UnavailableEngine::new())
        }
    };

    let controller = Arc::new(Controller::new(Arc::clone(&engine), Arc::clone(&surface)));
    // When the engine is dead the message line already carries the error.
    if !engine_dead {
        if engine.is_ready() {
            surface.set_message("");
        } else {
            surface.set_message("Loading…");
            controller.watch_ready_once();
        }
    }

    let listener = match bind_control_socket(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("control socket setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("installing SIGTERM handler failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = serve(listener, Arc::clone(&controller)) => {}
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // Orderly teardown: stop a live utterance (discarding it — no paste on
    // shutdown), then close the backend off the event loop.
    if engine.is_listening() {
        let engine = Arc::clone(&engine);
        let _ = tokio::task::spawn_blocking(move || engine.stop_quick()).await;
    }
    {
        let engine = Arc::clone(&engine);
        let _ = tokio::task::spawn_blocking(move || engine.shutdown()).await;
    }
    surface.set_listening(false);
    surface.set_preview("");
    surface.set_message("");
    let _ = std::fs::remove_file(&socket_path);

    info!("daemon exited cleanly");
    ExitCode::SUCCESS
}
