//! Record types flowing between pipeline stations.
//!
//! Every record carries the utterance sequence number assigned at VAD emit
//! time and the origin timestamp of the earliest audio sample it derives
//! from, so any station can report end-to-end latency against one monotonic
//! reference.

use crate::defaults;
use crate::services::stt::WordTiming;
use std::time::{Duration, Instant};

/// A fixed-duration slice of raw PCM from the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples (16-bit signed, mono, 16kHz).
    pub samples: Vec<i16>,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (always 1 in this pipeline).
    pub channels: u16,
    /// Frame sequence number for gap detection.
    pub sequence: u64,
}

impl AudioFrame {
    /// Creates a new capture frame at the pipeline's native format.
    pub fn new(samples: Vec<i16>, captured_at: Instant, sequence: u64) -> Self {
        Self {
            samples,
            captured_at,
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            channels: 1,
            sequence,
        }
    }

    /// Frame duration in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u32 * 1000) / self.sample_rate
    }
}

/// The audio span of one contiguous speech segment.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Concatenated PCM of speech frames plus padding.
    pub samples: Vec<i16>,
    /// Origin timestamp: capture time of the earliest included sample.
    pub origin: Instant,
    /// Capture time of the last included sample.
    pub end: Instant,
    /// Mean speech probability over the buffered frames.
    pub avg_probability: f32,
    /// True when cut by the max-utterance guard rather than by silence.
    pub partial: bool,
    /// Utterance sequence number, assigned at VAD emit time.
    pub sequence: u64,
}

impl Utterance {
    /// Audio duration derived from the sample count.
    pub fn duration(&self) -> Duration {
        Duration::from_micros(
            self.samples.len() as u64 * 1_000_000 / defaults::CAPTURE_SAMPLE_RATE as u64,
        )
    }
}

/// The finalized recognizer output for one utterance.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub confidence: f32,
    pub words: Option<Vec<WordTiming>>,
    /// Carried from the utterance.
    pub sequence: u64,
    /// Carried from the utterance.
    pub origin: Instant,
    /// Time spent inside the STT stage.
    pub stt_latency: Duration,
}

/// The target-language rendering of one transcript.
///
/// Forwarded speculatively: each record for a sequence is a monotonically
/// growing prefix, ending in one record with `is_final` set.
#[derive(Debug, Clone)]
pub struct Translation {
    pub original: String,
    pub translated: String,
    /// True on the last (complete) record for this sequence.
    pub is_final: bool,
    pub sequence: u64,
    pub origin: Instant,
    /// Carried from the transcript for the session log.
    pub stt_latency: Duration,
    /// Time spent inside the translation stage so far.
    pub translate_latency: Duration,
}

/// A PCM slice of synthesized audio belonging to one translation.
#[derive(Debug, Clone)]
pub struct SynthChunk {
    /// PCM samples (16-bit signed, mono, 24kHz).
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Exactly one chunk per sequence carries this flag.
    pub is_final: bool,
    pub sequence: u64,
    pub origin: Instant,
    /// now − origin at the moment the chunk was enqueued to output.
    pub pipeline_latency: Duration,
}

impl SynthChunk {
    /// Audio duration derived from the sample count.
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / self.sample_rate as u64)
    }
}
