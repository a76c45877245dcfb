//! Transcript finalization: punctuation and casing.
//!
//! Streaming transducer output is lowercase and unpunctuated. The
//! punctuator post-processes the finalized transcript through a
//! CNN-BiLSTM punctuation model with a BPE vocabulary (sherpa-onnx online
//! punctuation). When the model is absent, disabled, or fails, the
//! fallback is plain capitalization of the first character — formatting
//! must never lose a transcript.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;

/// Post-processor turning a lowercase raw transcript into cased,
/// punctuated text. `&mut self` because model runners keep scratch state;
/// serialised through [`PunctuatorCell`].
pub trait Punctuate: Send {
    fn punctuate(&mut self, text: &str) -> Result<String>;
}

/// Shared, lockable slot for the punctuator; `None` means "fallback only".
#[derive(Clone, Default)]
pub struct PunctuatorCell(pub Arc<Mutex<Option<Box<dyn Punctuate>>>>);

impl PunctuatorCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, punctuator: Box<dyn Punctuate>) {
        *self.0.lock() = Some(punctuator);
    }

    /// Format a raw transcript for delivery: the model when present and
    /// healthy, first-character capitalization otherwise.
    pub fn finalize(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        match self.0.lock().as_mut() {
            Some(punctuator) => match punctuator.punctuate(trimmed) {
                Ok(cased) if !cased.trim().is_empty() => cased.trim().to_string(),
                Ok(_) => capitalize_first(trimmed),
                Err(e) => {
                    warn!("punctuator failed, falling back to capitalization: {e}");
                    capitalize_first(trimmed)
                }
            },
            None => capitalize_first(trimmed),
        }
    }
}

impl std::fmt::Debug for PunctuatorCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PunctuatorCell").finish_non_exhaustive()
    }
}

/// Uppercase the first character, leave the rest untouched. Idempotent.
pub fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(feature = "local-asr")]
pub use model::OnlinePunctuator;

#[cfg(feature = "local-asr")]
mod model {
    //! sherpa-onnx online punctuation over the sys bindings.

    use std::ffi::{CStr, CString};
    use std::mem;

    use sherpa_rs::sherpa_rs_sys as sys;
    use tracing::info;

    use crate::config::PunctConfig;
    use crate::error::{ListenError, Result};

    use super::Punctuate;

    /// CNN-BiLSTM punctuation model handle.
    pub struct OnlinePunctuator {
        punct: *const sys::SherpaOnnxOnlinePunctuation,
    }

    // Only ever used under the PunctuatorCell mutex.
    unsafe impl Send for OnlinePunctuator {}

    impl OnlinePunctuator {
        /// # Errors
        /// `ListenError::ModelNotFound` / `ListenError::Punctuator` when the
        /// model files are missing or rejected.
        pub fn new(config: &PunctConfig) -> Result<Self> {
            for path in [&config.model, &config.bpe_vocab] {
                if !path.is_file() {
                    return Err(ListenError::ModelNotFound { path: path.clone() });
                }
            }

            let c_model = CString::new(config.model.to_str().ok_or_else(|| {
                ListenError::Punctuator("model path is not valid UTF-8".into())
            })?)
            .map_err(|_| ListenError::Punctuator("model path contains NUL".into()))?;
            let c_vocab = CString::new(config.bpe_vocab.to_str().ok_or_else(|| {
                ListenError::Punctuator("bpe vocab path is not valid UTF-8".into())
            })?)
            .map_err(|_| ListenError::Punctuator("bpe vocab path contains NUL".into()))?;
            let c_provider = CString::new(config.provider.as_str())
                .map_err(|_| ListenError::Punctuator("provider contains NUL".into()))?;

            let punct = unsafe {
                let mut cfg: sys::SherpaOnnxOnlinePunctuationConfig = mem::zeroed();
                cfg.model.cnn_bilstm = c_model.as_ptr();
                cfg.model.bpe_vocab = c_vocab.as_ptr();
                cfg.model.num_threads = config.num_threads;
                cfg.model.debug = 0;
                cfg.model.provider = c_provider.as_ptr();
                sys::SherpaOnnxCreateOnlinePunctuation(&cfg)
            };

            if punct.is_null() {
                return Err(ListenError::Punctuator(
                    "failed to create punctuation model; check LISTEN_PUNCT_MODEL_DIR".into(),
                ));
            }

            info!("punctuation model ready");
            Ok(Self { punct })
        }
    }

    impl Punctuate for OnlinePunctuator {
        fn punctuate(&mut self, text: &str) -> Result<String> {
            let c_text = CString::new(text)
                .map_err(|_| ListenError::Punctuator("text contains NUL".into()))?;
            unsafe {
                let out = sys::SherpaOnnxOnlinePunctuationAddPunct(self.punct, c_text.as_ptr());
                if out.is_null() {
                    return Err(ListenError::Punctuator("model returned no output".into()));
                }
                let cased = CStr::from_ptr(out).to_string_lossy().into_owned();
                sys::SherpaOnnxOnlinePunctuationFreeText(out);
                Ok(cased)
            }
        }
    }

    impl Drop for OnlinePunctuator {
        fn drop(&mut self) {
            unsafe {
                if !self.punct.is_null() {
                    sys::SherpaOnnxDestroyOnlinePunctuation(self.punct);
                    self.punct = std::ptr::null();
                }
            }
        }
    }
}
