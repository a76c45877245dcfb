//! Rate conversion for the remote recognizer.
//!
//! The realtime service wants 16 kHz PCM while the microphone runs at
//! whatever rate it was opened with, so audio headed for the socket goes
//! through a rubato session first. Matching rates bypass rubato entirely.
//!
//! Rubato consumes fixed-length blocks, but capture chunks arrive at
//! whatever size the mic was configured for. Incoming samples are staged
//! into a fixed slot of [`BLOCK`] frames; each time the slot fills, one
//! conversion step runs and its output is appended to the caller's
//! buffer. A partially filled slot simply waits for the next call.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::warn;

use crate::error::{ListenError, Result};

/// Frames per conversion step.
const BLOCK: usize = 512;

/// Streaming mono f32 rate converter.
pub struct StreamResampler {
    /// `None` when input and output rates already match.
    inner: Option<FastFixedIn<f32>>,
    /// Staging slot; holds < [`BLOCK`] leftover frames between calls.
    slot: Vec<f32>,
    /// Rubato's `[channel][frame]` output scratch, allocated once.
    scratch: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// # Errors
    /// `ListenError::AudioStream` when rubato rejects the rate pair.
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self {
                inner: None,
                slot: Vec::new(),
                scratch: Vec::new(),
            });
        }

        let ratio = f64::from(output_rate) / f64::from(input_rate);
        let inner = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, BLOCK, 1)
            .map_err(|e| ListenError::AudioStream(format!("resampler init: {e}")))?;
        let scratch = vec![vec![0.0; inner.output_frames_max()]];

        Ok(Self {
            inner: Some(inner),
            slot: Vec::with_capacity(BLOCK),
            scratch,
        })
    }

    /// Feed `input`, appending whatever converted audio became available
    /// onto `out`. Leftover frames smaller than one block stay staged.
    pub fn push(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return;
        };

        let mut rest = input;
        while !rest.is_empty() {
            let take = (BLOCK - self.slot.len()).min(rest.len());
            self.slot.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.slot.len() < BLOCK {
                break;
            }
            match resampler.process_into_buffer(&[&self.slot], &mut self.scratch, None) {
                Ok((_consumed, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => warn!("resample step failed: {e}"),
            }
            self.slot.clear();
        }
    }

    pub fn is_identity(&self) -> bool {
        self.inner.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rates_copy_straight_through() {
        let mut rs = StreamResampler::new(16_000, 16_000).unwrap();
        assert!(rs.is_identity());
        let input: Vec<f32> = (0..300).map(|i| (i as f32).sin()).collect();
        let mut out = Vec::new();
        rs.push(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn sub_block_input_stays_staged_until_a_block_completes() {
        let mut rs = StreamResampler::new(48_000, 16_000).unwrap();
        let mut out = Vec::new();
        rs.push(&[0.0; 300], &mut out);
        assert!(out.is_empty(), "300 frames are less than one block");
        rs.push(&[0.0; 300], &mut out);
        assert!(!out.is_empty(), "600 frames complete a block");
    }

    #[test]
    fn output_length_tracks_the_rate_ratio_over_many_pushes() {
        let mut rs = StreamResampler::new(48_000, 16_000).unwrap();
        assert!(!rs.is_identity());
        let mut out = Vec::new();
        // 10 × 480 = 4800 frames in; a 3:1 downsample should land near
        // 1600 out, modulo the final partly-filled slot.
        for _ in 0..10 {
            rs.push(&[0.25; 480], &mut out);
        }
        let produced = out.len() as i64;
        assert!(
            (produced - 1_600).abs() <= BLOCK as i64 / 3 + 8,
            "unexpected converted length {produced}"
        );
    }

    #[test]
    fn caller_buffer_accumulates_across_pushes() {
        let mut rs = StreamResampler::new(48_000, 16_000).unwrap();
        let mut out = Vec::new();
        rs.push(&[0.1; 1024], &mut out);
        let after_first = out.len();
        assert!(after_first > 0);
        rs.push(&[0.1; 1024], &mut out);
        assert!(out.len() > after_first, "push must append, not overwrite");
    }
}
