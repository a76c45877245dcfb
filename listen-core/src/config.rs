//! Environment-driven engine configuration.
//!
//! The daemon is launched by the tmux orchestrator with its knobs in the
//! environment, so configuration is read once at startup. All parsing goes
//! through an injectable lookup function; `from_env` is the thin
//! production entry point and tests feed a map instead of mutating
//! process-global env vars.

use std::path::PathBuf;

use crate::error::{ListenError, Result};

/// Default AssemblyAI realtime endpoint; `sample_rate` is appended as a
/// query parameter at connect time.
pub const DEFAULT_REMOTE_WS_URL: &str = "wss://api.assemblyai.com/v2/realtime/ws";

/// Sample rate the remote realtime service expects.
pub const REMOTE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the local transducer models were trained at.
pub const LOCAL_MODEL_SAMPLE_RATE: u32 = 16_000;

/// Which streaming recognizer backend drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// sherpa-onnx streaming zipformer, in-process.
    Local,
    /// Realtime WebSocket transcription service.
    Remote,
}

/// When to pay the model-load / connection cost up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrewarmMode {
    /// Prewarm only the local provider (its load is the expensive one).
    Auto,
    Always,
    Never,
}

impl PrewarmMode {
    pub fn should_prewarm(self, provider: Provider) -> bool {
        match self {
            PrewarmMode::Always => true,
            PrewarmMode::Never => false,
            PrewarmMode::Auto => provider == Provider::Local,
        }
    }
}

/// Model paths and decoding knobs for the local transducer.
#[derive(Debug, Clone)]
pub struct LocalAsrConfig {
    pub tokens: PathBuf,
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub joiner: PathBuf,
    /// Execution provider: `cpu` / `cuda` / `coreml`.
    pub provider: String,
    pub num_threads: i32,
    /// `greedy_search` or `modified_beam_search`.
    pub decoding_method: String,
    /// Endpoint rules are configured but endpointing itself stays off —
    /// utterance boundaries come from the user's toggle, not silence.
    pub rule1_min_trailing_silence: f32,
    pub rule2_min_trailing_silence: f32,
    pub rule3_min_utterance_length: f32,
}

/// Punctuation model files (CNN-BiLSTM + BPE vocabulary).
#[derive(Debug, Clone)]
pub struct PunctConfig {
    pub model: PathBuf,
    pub bpe_vocab: PathBuf,
    pub provider: String,
    pub num_threads: i32,
}

/// Credentials and endpoint for the remote recognizer.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub ws_url: String,
    pub api_key: String,
    pub sample_rate: u32,
}

/// Full engine configuration, resolved once at daemon start.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: Provider,
    /// Hot-mic (persistent capture thread + pre-roll) vs per-utterance.
    pub hot_mic: bool,
    pub prewarm: PrewarmMode,
    /// Microphone sample rate (Hz). Default: 48000.
    pub mic_rate: u32,
    /// Capture block size (ms). Default: 100.
    pub chunk_ms: u32,
    /// Pre-roll window in seconds; 0 disables the ring. Default: 0.4.
    pub preroll_seconds: f32,
    /// Minimum interval between preview emissions (ms). Default: 75.
    pub hud_throttle_ms: u64,
    pub local: Option<LocalAsrConfig>,
    pub punct: Option<PunctConfig>,
    pub punct_disabled: bool,
    pub remote: Option<RemoteConfig>,
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Fails when no provider can be
    /// resolved or a forced provider is missing its prerequisites.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let local = resolve_local(&lookup);
        let remote = resolve_remote(&lookup);

        let forced_provider = lookup("LISTEN_ASR_PROVIDER").map(|v| v.trim().to_ascii_lowercase());
        let provider = match forced_provider.as_deref() {
            Some("local") => {
                if local.is_none() {
                    return Err(ListenError::ConfigMissing(
                        "LISTEN_ASR_PROVIDER=local but LISTEN_SHERPA_* model paths are unset".into(),
                    ));
                }
                Provider::Local
            }
            Some("remote") => {
                if remote.is_none() {
                    return Err(ListenError::ConfigMissing(
                        "LISTEN_ASR_PROVIDER=remote but ASSEMBLYAI_API_KEY is unset".into(),
                    ));
                }
                Provider::Remote
            }
            Some(other) => {
                return Err(ListenError::ConfigInvalid(format!(
                    "LISTEN_ASR_PROVIDER must be `local` or `remote`, got `{other}`"
                )));
            }
            None if local.is_some() => Provider::Local,
            None if remote.is_some() => Provider::Remote,
            None => {
                return Err(ListenError::ConfigMissing(
                    "no ASR provider configured; set LISTEN_SHERPA_* model paths or ASSEMBLYAI_API_KEY"
                        .into(),
                ));
            }
        };

        let prewarm_mode = lookup("LISTEN_PREWARM").map(|v| v.trim().to_ascii_lowercase());
        let prewarm = match prewarm_mode.as_deref() {
            None | Some("auto") => PrewarmMode::Auto,
            Some("always") => PrewarmMode::Always,
            Some("never") => PrewarmMode::Never,
            Some(other) => {
                return Err(ListenError::ConfigInvalid(format!(
                    "LISTEN_PREWARM must be auto/always/never, got `{other}`"
                )));
            }
        };

        let hot_mic = match lookup("BACKGROUND_ALWAYS_LISTEN") {
            Some(raw) => match truthiness(&raw) {
                Some(forced) => forced,
                None => provider == Provider::Local,
            },
            None => provider == Provider::Local,
        };

        let punct_disabled = lookup("LISTEN_DISABLE_PUNCT").is_some();

        Ok(Self {
            provider,
            hot_mic,
            prewarm,
            mic_rate: parse_or(&lookup, "LISTEN_SAMPLE_RATE", 48_000)?,
            chunk_ms: parse_or(&lookup, "LISTEN_CHUNK_MS", 100)?,
            preroll_seconds: parse_or::<f32>(&lookup, "BACKGROUND_PREBUFFER_SECONDS", 0.4)?
                .max(0.0),
            hud_throttle_ms: parse_or(&lookup, "LISTEN_HUD_THROTTLE_MS", 75)?,
            local,
            punct: if punct_disabled {
                None
            } else {
                resolve_punct(&lookup)
            },
            punct_disabled,
            remote,
        })
    }

    /// Capture block size in frames at the microphone rate.
    pub fn chunk_frames(&self) -> usize {
        ((self.mic_rate as u64 * self.chunk_ms as u64) / 1000).max(1) as usize
    }

    /// Pre-roll cap in frames at the microphone rate (0 = disabled).
    pub fn preroll_cap_frames(&self) -> usize {
        (self.mic_rate as f64 * self.preroll_seconds as f64) as usize
    }
}

/// Interpret the usual on/off spellings; `None` for anything else.
fn truthiness(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "always" | "on" | "true" | "1" | "yes" => Some(true),
        "never" | "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ListenError::ConfigInvalid(format!("{key}: cannot parse `{raw}`"))
        }),
    }
}

/// Resolve the four transducer model files: explicit `LISTEN_SHERPA_*`
/// paths win; otherwise probe `LISTEN_SHERPA_MODEL_DIR` for the
/// conventional file names.
fn resolve_local(lookup: &impl Fn(&str) -> Option<String>) -> Option<LocalAsrConfig> {
    let explicit = |key: &str| lookup(key).map(PathBuf::from);

    let mut tokens = explicit("LISTEN_SHERPA_TOKENS");
    let mut encoder = explicit("LISTEN_SHERPA_ENCODER");
    let mut decoder = explicit("LISTEN_SHERPA_DECODER");
    let mut joiner = explicit("LISTEN_SHERPA_JOINER");

    if tokens.is_none() || encoder.is_none() || decoder.is_none() || joiner.is_none() {
        if let Some(dir) = lookup("LISTEN_SHERPA_MODEL_DIR").map(PathBuf::from) {
            let candidate = |name: &str| -> Option<PathBuf> {
                let path = dir.join(name);
                path.is_file().then_some(path)
            };
            let (t, e, d, j) = (
                candidate("tokens.txt"),
                candidate("encoder-epoch-99-avg-1.onnx"),
                candidate("decoder-epoch-99-avg-1.onnx"),
                candidate("joiner-epoch-99-avg-1.onnx"),
            );
            if t.is_some() && e.is_some() && d.is_some() && j.is_some() {
                tokens = tokens.or(t);
                encoder = encoder.or(e);
                decoder = decoder.or(d);
                joiner = joiner.or(j);
            }
        }
    }

    Some(LocalAsrConfig {
        tokens: tokens?,
        encoder: encoder?,
        decoder: decoder?,
        joiner: joiner?,
        provider: lookup("LISTEN_SHERPA_PROVIDER").unwrap_or_else(|| "cpu".into()),
        num_threads: lookup("LISTEN_SHERPA_THREADS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1),
        decoding_method: lookup("LISTEN_SHERPA_DECODING")
            .unwrap_or_else(|| "greedy_search".into()),
        rule1_min_trailing_silence: lookup("LISTEN_SHERPA_RULE1")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(2.4),
        rule2_min_trailing_silence: lookup("LISTEN_SHERPA_RULE2")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1.2),
        rule3_min_utterance_length: lookup("LISTEN_SHERPA_RULE3")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(300.0),
    })
}

fn resolve_punct(lookup: &impl Fn(&str) -> Option<String>) -> Option<PunctConfig> {
    let dir = lookup("LISTEN_PUNCT_MODEL_DIR").map(PathBuf::from)?;
    let model = existing(dir.join("model.onnx"))?;
    let bpe_vocab = existing(dir.join("bpe.vocab"))?;
    Some(PunctConfig {
        model,
        bpe_vocab,
        provider: lookup("LISTEN_PUNCT_PROVIDER").unwrap_or_else(|| "cpu".into()),
        num_threads: lookup("LISTEN_PUNCT_THREADS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1),
    })
}

fn resolve_remote(lookup: &impl Fn(&str) -> Option<String>) -> Option<RemoteConfig> {
    let api_key = lookup("ASSEMBLYAI_API_KEY")?;
    Some(RemoteConfig {
        ws_url: lookup("LISTEN_REMOTE_WS_URL").unwrap_or_else(|| DEFAULT_REMOTE_WS_URL.into()),
        api_key,
        sample_rate: REMOTE_SAMPLE_RATE,
    })
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}
