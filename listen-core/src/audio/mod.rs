//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate (beyond the reused mixdown scratch), block on a
//! lock, or perform I/O. The callback therefore only converts samples to
//! mono f32 and pushes them into a lock-free SPSC ring; the capture thread
//! pops fixed-size blocks out of the ring at its leisure.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). [`MicrophoneSource`] is therefore opened *and dropped* on the
//! capture thread; only the opener closure crosses threads.

pub mod chunk;
pub mod resample;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapRb,
};
use tracing::{info, warn};

use crate::audio::chunk::AudioChunk;
use crate::error::{ListenError, Result};

/// Sleep between ring polls while a chunk is incomplete.
const READ_POLL: Duration = Duration::from_millis(2);

/// Ring capacity in chunks; sized so a recognizer hiccup of a second or two
/// never drops callback audio.
const RING_CHUNK_CAPACITY: usize = 32;

/// A source of fixed-duration mono audio chunks.
///
/// `read` blocks until a full chunk is available. Implementations live on
/// the capture thread and are dropped there, so the trait does not require
/// `Send`; the factory closure that creates one does (see the engine's
/// backend bundle).
pub trait AudioSource {
    fn read(&mut self) -> Result<AudioChunk>;
    fn sample_rate(&self) -> u32;
}

/// The real microphone: a cpal input stream feeding an SPSC ring.
pub struct MicrophoneSource {
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    consumer: ringbuf::HeapCons<f32>,
    failure: Arc<Mutex<Option<String>>>,
    sample_rate: u32,
    chunk_frames: usize,
}

#[cfg(feature = "audio-cpal")]
impl MicrophoneSource {
    /// Open the default input device at `sample_rate`, delivering
    /// `chunk_frames`-sized blocks per [`AudioSource::read`].
    pub fn open(sample_rate: u32, chunk_frames: usize) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
        use cpal::{SampleFormat, SampleRate, StreamConfig};

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(ListenError::NoDefaultInputDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "<unnamed>".into());

        let supported = device
            .default_input_config()
            .map_err(|e| ListenError::AudioDevice(e.to_string()))?;
        let channels = supported.channels();

        info!(
            device = device_name.as_str(),
            sample_rate, channels, "opening input device"
        );

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) =
            HeapRb::<f32>::new(chunk_frames * RING_CHUNK_CAPACITY).split();
        let failure = Arc::new(Mutex::new(None));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(
                &device,
                &config,
                producer,
                Arc::clone(&failure),
                |s| s,
            ),
            SampleFormat::I16 => build_stream::<i16>(
                &device,
                &config,
                producer,
                Arc::clone(&failure),
                |s| f32::from(s) / 32_768.0,
            ),
            SampleFormat::U16 => build_stream::<u16>(
                &device,
                &config,
                producer,
                Arc::clone(&failure),
                |s| (f32::from(s) - 32_768.0) / 32_768.0,
            ),
            fmt => Err(ListenError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| ListenError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
            failure,
            sample_rate,
            chunk_frames,
        })
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl MicrophoneSource {
    pub fn open(_sample_rate: u32, _chunk_frames: usize) -> Result<Self> {
        Err(ListenError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl AudioSource for MicrophoneSource {
    /// Block until a full chunk has accumulated in the ring.
    ///
    /// # Errors
    /// Returns `ListenError::AudioStream` once the cpal error callback has
    /// reported a device failure; the capture loop treats that as fatal.
    fn read(&mut self) -> Result<AudioChunk> {
        let mut samples = vec![0.0f32; self.chunk_frames];
        let mut filled = 0;
        while filled < self.chunk_frames {
            if let Some(message) = self.failure.lock().take() {
                return Err(ListenError::AudioStream(message));
            }
            let n = self.consumer.pop_slice(&mut samples[filled..]);
            filled += n;
            if filled < self.chunk_frames {
                std::thread::sleep(READ_POLL);
            }
        }
        Ok(AudioChunk::new(samples, self.sample_rate))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Build an input stream for sample type `T`, downmixing to mono f32.
#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: ringbuf::HeapProd<f32>,
    failure: Arc<Mutex<Option<String>>>,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    use cpal::traits::DeviceTrait;

    let channels = config.channels as usize;
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                let frames = data.len() / channels;
                mix_buf.resize(frames, 0.0);
                if channels == 1 {
                    for (dst, src) in mix_buf.iter_mut().zip(data) {
                        *dst = to_f32(*src);
                    }
                } else {
                    for (frame, dst) in mix_buf.iter_mut().enumerate() {
                        let base = frame * channels;
                        let mut sum = 0.0f32;
                        for c in 0..channels {
                            sum += to_f32(data[base + c]);
                        }
                        *dst = sum / channels as f32;
                    }
                }
                let written = producer.push_slice(&mix_buf[..frames]);
                if written < frames {
                    warn!("capture ring full: dropped {} frames", frames - written);
                }
            },
            move |err| {
                let mut slot = failure.lock();
                if slot.is_none() {
                    *slot = Some(err.to_string());
                }
            },
            None,
        )
        .map_err(|e| ListenError::AudioStream(e.to_string()))
}
