use thiserror::Error;

/// All errors produced by listen-core.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("recognizer error: {0}")]
    Recognizer(String),

    #[error("punctuator error: {0}")]
    Punctuator(String),

    #[error("remote transcription service error: {0}")]
    Remote(String),

    #[error("engine is not ready")]
    NotReady,

    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ListenError>;
