//! Local streaming recognizer: sherpa-onnx zipformer transducer.
//!
//! Uses `sherpa_rs_sys` directly — the online (streaming) recognizer API
//! is what supports true streaming transducer models. Construction loads
//! all model weights eagerly; that cost is what the engine's loading phase
//! hides from the user.
//!
//! Endpoint detection is configured but **disabled**: utterance boundaries
//! in this system come from the user's toggle, never from silence.

use std::ffi::{CStr, CString};
use std::mem;
use std::path::Path;

use sherpa_rs::sherpa_rs_sys as sys;
use tracing::info;

use crate::config::LocalAsrConfig;
use crate::error::{ListenError, Result};
use crate::recognizer::StreamingRecognizer;

/// Mel filterbank dimension for zipformer models.
const FEATURE_DIM: i32 = 80;

/// Wraps the sherpa-onnx online recognizer and its single stream.
pub struct ZipformerRecognizer {
    recognizer: *const sys::SherpaOnnxOnlineRecognizer,
    stream: *const sys::SherpaOnnxOnlineStream,
}

// The raw pointers are only ever touched under the engine's recognizer
// lock, so crossing the construction thread boundary is sound.
unsafe impl Send for ZipformerRecognizer {}

fn c_path(path: &Path, what: &str) -> Result<CString> {
    let s = path
        .to_str()
        .ok_or_else(|| ListenError::Recognizer(format!("{what} path is not valid UTF-8")))?;
    CString::new(s).map_err(|_| ListenError::Recognizer(format!("{what} path contains NUL")))
}

impl ZipformerRecognizer {
    /// Load the transducer from its four model files.
    ///
    /// # Errors
    /// `ListenError::ModelNotFound` for a missing file,
    /// `ListenError::Recognizer` when sherpa-onnx rejects the models.
    pub fn new(config: &LocalAsrConfig, sample_rate: u32) -> Result<Self> {
        for path in [&config.tokens, &config.encoder, &config.decoder, &config.joiner] {
            if !path.is_file() {
                return Err(ListenError::ModelNotFound { path: path.clone() });
            }
        }

        // CStrings must outlive SherpaOnnxCreateOnlineRecognizer.
        let c_tokens = c_path(&config.tokens, "tokens")?;
        let c_encoder = c_path(&config.encoder, "encoder")?;
        let c_decoder = c_path(&config.decoder, "decoder")?;
        let c_joiner = c_path(&config.joiner, "joiner")?;
        let c_provider = CString::new(config.provider.as_str())
            .map_err(|_| ListenError::Recognizer("provider contains NUL".into()))?;
        let c_decoding = CString::new(config.decoding_method.as_str())
            .map_err(|_| ListenError::Recognizer("decoding method contains NUL".into()))?;
        let c_empty = CString::new("").expect("static");

        let recognizer = unsafe {
            let mut cfg: sys::SherpaOnnxOnlineRecognizerConfig = mem::zeroed();

            cfg.feat_config.sample_rate = sample_rate as i32;
            cfg.feat_config.feature_dim = FEATURE_DIM;

            cfg.model_config.transducer.encoder = c_encoder.as_ptr();
            cfg.model_config.transducer.decoder = c_decoder.as_ptr();
            cfg.model_config.transducer.joiner = c_joiner.as_ptr();

            cfg.model_config.tokens = c_tokens.as_ptr();
            cfg.model_config.num_threads = config.num_threads;
            cfg.model_config.provider = c_provider.as_ptr();
            cfg.model_config.debug = 0;
            cfg.model_config.model_type = c_empty.as_ptr();
            cfg.model_config.modeling_unit = c_empty.as_ptr();
            cfg.model_config.bpe_vocab = c_empty.as_ptr();

            cfg.decoding_method = c_decoding.as_ptr();
            cfg.max_active_paths = 4;

            // Rules kept configurable, detection itself off.
            cfg.enable_endpoint = 0;
            cfg.rule1_min_trailing_silence = config.rule1_min_trailing_silence;
            cfg.rule2_min_trailing_silence = config.rule2_min_trailing_silence;
            cfg.rule3_min_utterance_length = config.rule3_min_utterance_length;

            cfg.hotwords_file = c_empty.as_ptr();
            cfg.hotwords_score = 1.5;

            sys::SherpaOnnxCreateOnlineRecognizer(&cfg)
        };

        if recognizer.is_null() {
            return Err(ListenError::Recognizer(
                "failed to create online recognizer; check the LISTEN_SHERPA_* model files".into(),
            ));
        }

        let stream = unsafe { sys::SherpaOnnxCreateOnlineStream(recognizer) };
        if stream.is_null() {
            unsafe { sys::SherpaOnnxDestroyOnlineRecognizer(recognizer) };
            return Err(ListenError::Recognizer(
                "failed to create online stream".into(),
            ));
        }

        info!(
            threads = config.num_threads,
            decoding = config.decoding_method.as_str(),
            "zipformer recognizer ready"
        );

        Ok(Self { recognizer, stream })
    }
}

impl StreamingRecognizer for ZipformerRecognizer {
    fn accept(&mut self, sample_rate: u32, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        unsafe {
            sys::SherpaOnnxOnlineStreamAcceptWaveform(
                self.stream,
                sample_rate as i32,
                samples.as_ptr(),
                samples.len() as i32,
            );
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        unsafe { sys::SherpaOnnxIsOnlineStreamReady(self.recognizer, self.stream) != 0 }
    }

    fn decode(&mut self) -> Result<()> {
        unsafe { sys::SherpaOnnxDecodeOnlineStream(self.recognizer, self.stream) };
        Ok(())
    }

    fn current_text(&mut self) -> String {
        unsafe {
            let result = sys::SherpaOnnxGetOnlineStreamResult(self.recognizer, self.stream);
            if result.is_null() {
                return String::new();
            }
            let text = if (*result).text.is_null() {
                String::new()
            } else {
                CStr::from_ptr((*result).text)
                    .to_string_lossy()
                    .trim()
                    .to_string()
            };
            sys::SherpaOnnxDestroyOnlineRecognizerResult(result);
            text
        }
    }

    fn reset(&mut self) {
        unsafe { sys::SherpaOnnxOnlineStreamReset(self.recognizer, self.stream) };
    }

    fn close(&mut self) {
        unsafe {
            if !self.stream.is_null() {
                sys::SherpaOnnxDestroyOnlineStream(self.stream);
                self.stream = std::ptr::null();
            }
            if !self.recognizer.is_null() {
                sys::SherpaOnnxDestroyOnlineRecognizer(self.recognizer);
                self.recognizer = std::ptr::null();
            }
        }
    }
}

impl Drop for ZipformerRecognizer {
    fn drop(&mut self) {
        self.close();
    }
}
