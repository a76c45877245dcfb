//! Paste delivery.
//!
//! The finalized transcript goes through a named tmux buffer: load the
//! text over stdin (no temp file, no shell quoting), bracket-paste it into
//! the target pane, then drop the buffer. `-p` makes tmux wrap the paste
//! in bracketed-paste sequences so the hosted program can tell it from
//! typing. The daemon never appends a newline; pressing Enter is the
//! user's call.

use std::io::Write;
use std::process::Stdio;

use anyhow::{bail, Context};

use crate::hud::tmux_command;

/// Name of the scratch buffer used for every paste.
const PASTE_BUFFER: &str = "listen_asr";

pub fn paste_into_pane(socket: Option<&str>, pane: &str, text: &str) -> anyhow::Result<()> {
    let mut load = tmux_command(socket)
        .args(["load-buffer", "-b", PASTE_BUFFER, "-"])
        .stdin(Stdio::piped())
        .spawn()
        .context("spawning tmux load-buffer")?;
    load.stdin
        .take()
        .context("tmux load-buffer stdin unavailable")?
        .write_all(text.as_bytes())
        .context("writing transcript to tmux load-buffer")?;
    let status = load.wait().context("waiting for tmux load-buffer")?;
    if !status.success() {
        bail!("tmux load-buffer exited with {status}");
    }

    let status = tmux_command(socket)
        .args(["paste-buffer", "-p", "-b", PASTE_BUFFER, "-t", pane])
        .status()
        .context("running tmux paste-buffer")?;
    if !status.success() {
        bail!("tmux paste-buffer exited with {status}");
    }

    // Best effort: a leftover buffer is cosmetic, not an error.
    let _ = tmux_command(socket)
        .args(["delete-buffer", "-b", PASTE_BUFFER])
        .status();

    Ok(())
}
