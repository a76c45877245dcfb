//! Pre-roll ("hot-mic") audio ring.
//!
//! While the engine is idle the capture thread keeps appending microphone
//! chunks here, so the instant dictation starts the recognizer can be fed
//! the last few hundred milliseconds of audio — the gap between "user
//! decides to speak" and "user presses the hotkey".

use std::collections::VecDeque;

use crate::audio::chunk::AudioChunk;

/// Bounded FIFO of recent [`AudioChunk`]s, capped by total frame count.
///
/// Guarded externally by the engine's state lock: the capture loop appends
/// and drains, the control path clears.
#[derive(Debug, Default)]
pub struct PrerollRing {
    chunks: VecDeque<AudioChunk>,
    frames: usize,
    cap_frames: usize,
}

impl PrerollRing {
    /// `cap_frames = sample_rate * preroll_seconds`. A cap of 0 disables
    /// the ring entirely (`append` becomes a no-op).
    pub fn new(cap_frames: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            frames: 0,
            cap_frames,
        }
    }

    /// Push a chunk, evicting oldest chunks until the total frame count is
    /// back under the cap.
    pub fn append(&mut self, chunk: AudioChunk) {
        if self.cap_frames == 0 {
            return;
        }
        self.frames += chunk.frames();
        self.chunks.push_back(chunk);
        while self.frames > self.cap_frames {
            match self.chunks.pop_front() {
                Some(evicted) => self.frames -= evicted.frames(),
                None => break,
            }
        }
    }

    /// Return all buffered chunks in arrival order, leaving the ring empty.
    pub fn drain(&mut self) -> Vec<AudioChunk> {
        self.frames = 0;
        self.chunks.drain(..).collect()
    }

    /// Discard everything without returning it.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.frames = 0;
    }

    /// Total buffered frames. Never exceeds the cap.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(frames: usize, fill: f32) -> AudioChunk {
        AudioChunk::new(vec![fill; frames], 16_000)
    }

    #[test]
    fn short_sequences_are_kept_whole() {
        let mut ring = PrerollRing::new(6_400); // 0.4 s at 16 kHz
        for i in 0..4 {
            ring.append(chunk(1_600, i as f32));
        }
        assert_eq!(ring.frames(), 6_400);
        let drained = ring.drain();
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0].samples[0], 0.0);
        assert_eq!(drained[3].samples[0], 3.0);
        assert!(ring.is_empty());
        assert_eq!(ring.frames(), 0);
    }

    #[test]
    fn long_sequences_keep_only_the_most_recent_window() {
        let mut ring = PrerollRing::new(6_400);
        for i in 0..10 {
            ring.append(chunk(1_600, i as f32));
            assert!(ring.frames() <= 6_400, "cap exceeded after append {i}");
        }
        let drained = ring.drain();
        let fills: Vec<f32> = drained.iter().map(|c| c.samples[0]).collect();
        assert_eq!(fills, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn oversized_single_chunk_is_evicted_whole() {
        let mut ring = PrerollRing::new(1_000);
        // Eviction is chunk-granular; a single chunk larger than the cap
        // leaves the ring empty rather than splitting samples.
        ring.append(chunk(4_000, 1.0));
        assert!(ring.is_empty());
        ring.append(chunk(500, 2.0));
        assert_eq!(ring.frames(), 500);
    }

    #[test]
    fn zero_cap_disables_the_ring() {
        let mut ring = PrerollRing::new(0);
        ring.append(chunk(1_600, 1.0));
        assert!(ring.is_empty());
        assert!(ring.drain().is_empty());
    }

    #[test]
    fn clear_discards_without_returning() {
        let mut ring = PrerollRing::new(6_400);
        ring.append(chunk(1_600, 1.0));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.frames(), 0);
    }
}
