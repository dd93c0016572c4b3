//! Default tuning constants for voicebridge.
//!
//! Shared across configuration types to keep the pipeline's timing contract
//! in one place.

/// Capture sample rate in Hz.
///
/// 16kHz is the native rate of the recognizer and of frame-level speech
/// probability models.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Synthesized-audio sample rate in Hz (the synthesizer's PCM output format).
pub const SYNTH_SAMPLE_RATE: u32 = 24_000;

/// Duration of one capture frame in milliseconds.
pub const FRAME_DURATION_MS: u32 = 30;

/// Samples per capture frame (30ms at 16kHz).
pub const FRAME_SAMPLES: usize = (CAPTURE_SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Speech probability threshold for voice activity detection.
pub const VAD_THRESHOLD: f32 = 0.5;

/// Minimum speech duration before an utterance is considered valid (ms).
pub const MIN_SPEECH_MS: u32 = 250;

/// Trailing silence that ends an utterance (ms).
///
/// 300ms is the shortest value that avoids splitting natural pauses inside
/// Spanish/English utterances; the recognizer's endpointing is configured to
/// the same value so both sides agree on utterance boundaries.
pub const MIN_SILENCE_MS: u32 = 300;

/// Padding retained around speech segments so edge words are not clipped (ms).
pub const SPEECH_PAD_MS: u32 = 100;

/// Maximum utterance duration before a forced split (ms).
pub const MAX_UTTERANCE_MS: u32 = 15_000;

/// Capture → VAD channel capacity, in frames (≈1.5s of audio).
pub const CAPTURE_CHANNEL_FRAMES: usize = 50;

/// Capacity of the utterance/transcript/translation channels.
pub const TEXT_CHANNEL_CAPACITY: usize = 10;

/// TTS → output channel capacity, in chunks.
pub const SYNTH_CHANNEL_CHUNKS: usize = 50;

/// Output jitter buffer size in milliseconds.
pub const OUTPUT_BUFFER_MS: u32 = 50;

/// Fade applied at sequence boundaries to avoid clicks (ms).
pub const FADE_MS: u32 = 5;

/// Idle keepalive interval for the recognizer session (seconds).
pub const STT_KEEPALIVE_SECS: u64 = 10;

/// How long an unchanged interim transcript is trusted as final (ms).
pub const INTERIM_STABLE_MS: u64 = 500;

/// Per-utterance recognizer deadline, from the utterance origin (ms).
pub const STT_DEADLINE_MS: u64 = 10_000;

/// Per-transcript translator deadline, from the utterance origin (ms).
pub const TRANSLATE_DEADLINE_MS: u64 = 5_000;

/// Per-translation synthesizer subsession deadline, from the origin (ms).
pub const SYNTH_DEADLINE_MS: u64 = 15_000;

/// Cadence of speculative translation forwarding (ms).
pub const PREFIX_FLUSH_MS: u64 = 60;

/// Token count that forces a speculative translation flush.
pub const PREFIX_FLUSH_TOKENS: usize = 4;

/// Grace given to in-flight remote calls on cancellation (ms).
pub const CANCEL_GRACE_MS: u64 = 250;

/// Cadence of passthrough recovery probes (seconds).
pub const REENTRY_PROBE_SECS: u64 = 30;

/// Default metrics snapshot interval (seconds).
pub const METRICS_INTERVAL_SECS: u64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples_matches_rate_and_duration() {
        // 16kHz * 30ms = 480 samples
        assert_eq!(FRAME_SAMPLES, 480);
    }

    #[test]
    fn test_capture_channel_covers_over_a_second() {
        let buffered_ms = CAPTURE_CHANNEL_FRAMES as u32 * FRAME_DURATION_MS;
        assert!(buffered_ms >= 1000);
    }
}
