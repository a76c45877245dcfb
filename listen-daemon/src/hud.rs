//! tmux status-line surface.
//!
//! The daemon talks to the multiplexer exclusively through three status
//! variables — `@asr_on`, `@asr_preview`, `@asr_message` — plus the
//! paste-buffer commands in [`crate::paste`]. tmux polls; the daemon never
//! waits on it, and a failing tmux invocation must never take the daemon
//! down.

use std::process::Command;

use listen_core::normalize_preview;
use tracing::debug;

/// Everything the control path does to the outside world. One trait so the
/// protocol can be exercised in tests without tmux or a microphone.
pub trait StatusSurface: Send + Sync + 'static {
    /// `@asr_on`: "1" while listening, "0" otherwise.
    fn set_listening(&self, on: bool);
    /// `@asr_preview`: the current partial (already throttled upstream).
    fn set_preview(&self, text: &str);
    /// `@asr_message`: transient status ("Loading…", "Pasting…", errors).
    fn set_message(&self, text: &str);
    /// Bracket-paste `text` into `pane`. No trailing newline.
    fn paste(&self, pane: &str, text: &str) -> anyhow::Result<()>;
}

/// The real surface: shells out to tmux, honoring `TMUX_SOCKET`.
pub struct TmuxSurface {
    socket: Option<String>,
}

impl TmuxSurface {
    pub fn from_env() -> Self {
        Self {
            socket: std::env::var("TMUX_SOCKET").ok(),
        }
    }

    fn set_var(&self, name: &str, value: &str) {
        run_tmux(self.socket.as_deref(), &["set", "-gq", name, value]);
        run_tmux(self.socket.as_deref(), &["refresh-client", "-S"]);
    }
}

impl StatusSurface for TmuxSurface {
    fn set_listening(&self, on: bool) {
        self.set_var("@asr_on", if on { "1" } else { "0" });
    }

    fn set_preview(&self, text: &str) {
        self.set_var("@asr_preview", &normalize_preview(text));
    }

    fn set_message(&self, text: &str) {
        self.set_var("@asr_message", text);
    }

    fn paste(&self, pane: &str, text: &str) -> anyhow::Result<()> {
        crate::paste::paste_into_pane(self.socket.as_deref(), pane, text)
    }
}

/// Build a tmux command, adding `-L <socket>` when the launcher gave the
/// daemon a dedicated server.
pub(crate) fn tmux_command(socket: Option<&str>) -> Command {
    let mut cmd = Command::new("tmux");
    if let Some(socket) = socket {
        cmd.arg("-L").arg(socket);
    }
    cmd
}

/// Run a tmux command, ignoring failures (the daemon must not crash over a
/// status-line write).
fn run_tmux(socket: Option<&str>, args: &[&str]) {
    let status = tmux_command(socket).args(args).status();
    match status {
        Ok(status) if !status.success() => {
            debug!(?args, code = status.code(), "tmux command failed");
        }
        Ok(_) => {}
        Err(e) => debug!(?args, "tmux unavailable: {e}"),
    }
}
