//! # listen-core
//!
//! Engine for push-to-dictate voice input: the single long-lived process
//! component that owns the microphone, drives a streaming recognizer,
//! keeps a pre-roll ring warm, and formats finalized transcripts.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → cpal callback → SPSC ring → capture thread
//!                                             │ (pre-roll ring while idle)
//!                                      StreamingRecognizer
//!                                             │
//!                                       PreviewFilter
//!                                             │
//!                              broadcast::Sender<EngineEvent>
//! ```
//!
//! The audio callback is allocation-free; all heap work happens on the
//! capture thread. The daemon crate wires this engine to a Unix control
//! socket and the tmux status line.

#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod preroll;
pub mod preview;
pub mod punctuate;
pub mod recognizer;

// Convenience re-exports for the daemon crate
pub use config::{EngineConfig, Provider};
pub use engine::{EngineBackend, EngineEvent, ListenEngine, ReadyGate};
pub use error::ListenError;
pub use preview::normalize_preview;
pub use recognizer::StreamingRecognizer;
