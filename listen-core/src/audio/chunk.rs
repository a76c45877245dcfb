//! Typed audio chunk passed from the microphone to the pre-roll ring and
//! the recognizer.

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// Allocated once per capture-loop iteration (never on the RT callback).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 48000).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A chunk of digital silence, `frames` samples long.
    pub fn silence(frames: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; frames], sample_rate)
    }

    /// Number of frames (== samples; mono).
    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    /// Duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
