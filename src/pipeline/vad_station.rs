//! VAD station: groups capture frames into utterances.
//!
//! A two-state machine (idle / in speech) driven by frame-level speech
//! probabilities. Durations are accumulated from frame lengths, so the
//! segmentation is deterministic and independent of wall-clock jitter.
//!
//! Utterances are precious: emission blocks when the downstream channel is
//! full, which propagates backpressure to frame drops at capture.

use crate::config::VadConfig;
use crate::pipeline::metrics::StageStats;
use crate::pipeline::ring::SlidingReceiver;
use crate::pipeline::types::{AudioFrame, Utterance};
use crate::vad::SpeechDetector;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

struct ScoredFrame {
    frame: AudioFrame,
    probability: f32,
}

pub struct VadStation {
    config: VadConfig,
    detector: Box<dyn SpeechDetector>,
    stats: Arc<StageStats>,

    // Rolling pre-roll so the first word is not clipped
    pre_roll: VecDeque<ScoredFrame>,
    pre_roll_ms: u32,
    // Accumulated frames while in speech, trailing silence included
    buffer: Vec<ScoredFrame>,
    buffered_ms: u32,
    trailing_silence_ms: u32,
    in_speech: bool,
    sequence: u64,
}

impl VadStation {
    pub fn new(
        config: VadConfig,
        detector: Box<dyn SpeechDetector>,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            config,
            detector,
            stats,
            pre_roll: VecDeque::new(),
            pre_roll_ms: 0,
            buffer: Vec::new(),
            buffered_ms: 0,
            trailing_silence_ms: 0,
            in_speech: false,
            sequence: 0,
        }
    }

    /// Runs until the capture side closes the frame channel. Frames still
    /// queued at that point are consumed first; audio buffered inside the
    /// state machine (an unfinished utterance) is dropped.
    pub async fn run(
        mut self,
        mut input: SlidingReceiver<AudioFrame>,
        output: mpsc::Sender<Utterance>,
    ) {
        while let Some(frame) = input.recv().await {
            if let Some(utterance) = self.process(frame) {
                self.stats.add_processed();
                tracing::debug!(
                    sequence = utterance.sequence,
                    duration_ms = utterance.duration().as_millis() as u64,
                    partial = utterance.partial,
                    "utterance emitted"
                );
                // Blocks when STT is saturated, by design
                if output.send(utterance).await.is_err() {
                    break;
                }
            }
        }
    }

    /// Feeds one frame through the state machine; returns an utterance when
    /// an end condition fires.
    fn process(&mut self, frame: AudioFrame) -> Option<Utterance> {
        let probability = self.detector.probability(&frame.samples);
        let frame_ms = frame.duration_ms();
        let is_speech = probability >= self.config.threshold;

        if !self.in_speech {
            if is_speech {
                self.enter_speech(frame, probability, frame_ms);
            } else {
                self.push_pre_roll(frame, probability, frame_ms);
            }
            return None;
        }

        if is_speech {
            self.trailing_silence_ms = 0;
        } else {
            self.trailing_silence_ms += frame_ms;
        }
        self.buffer.push(ScoredFrame { frame, probability });
        self.buffered_ms += frame_ms;

        if self.trailing_silence_ms >= self.config.min_silence_ms {
            let utterance = self.emit(false);
            self.reset_to_idle();
            return utterance;
        }

        if self.buffered_ms >= self.config.max_utterance_ms {
            // Forced split: emit and continue in speech with an empty
            // buffer, so recognition has no gap
            let utterance = self.emit(true);
            self.buffer.clear();
            self.buffered_ms = 0;
            self.trailing_silence_ms = 0;
            return utterance;
        }

        None
    }

    fn enter_speech(&mut self, frame: AudioFrame, probability: f32, frame_ms: u32) {
        self.in_speech = true;
        self.buffer.clear();
        self.buffered_ms = 0;
        self.trailing_silence_ms = 0;

        while let Some(scored) = self.pre_roll.pop_front() {
            self.buffered_ms += scored.frame.duration_ms();
            self.buffer.push(scored);
        }
        self.pre_roll_ms = 0;

        self.buffer.push(ScoredFrame { frame, probability });
        self.buffered_ms += frame_ms;
    }

    fn push_pre_roll(&mut self, frame: AudioFrame, probability: f32, frame_ms: u32) {
        self.pre_roll.push_back(ScoredFrame { frame, probability });
        self.pre_roll_ms += frame_ms;
        while self.pre_roll_ms > self.config.pad_ms {
            match self.pre_roll.pop_front() {
                Some(old) => self.pre_roll_ms -= old.frame.duration_ms(),
                None => break,
            }
        }
    }

    fn reset_to_idle(&mut self) {
        self.in_speech = false;
        self.buffer.clear();
        self.buffered_ms = 0;
        self.trailing_silence_ms = 0;
        self.pre_roll.clear();
        self.pre_roll_ms = 0;
    }

    /// Freezes the buffer into an utterance.
    ///
    /// For silence-terminated utterances, trailing silence beyond `pad_ms`
    /// is cut; forced splits keep the buffer as-is. Returns `None` when the
    /// speech span is shorter than `min_speech_ms`.
    fn emit(&mut self, partial: bool) -> Option<Utterance> {
        let threshold = self.config.threshold;

        let first_speech = self
            .buffer
            .iter()
            .position(|s| s.probability >= threshold)?;
        let last_speech = self
            .buffer
            .iter()
            .rposition(|s| s.probability >= threshold)?;

        let speech_ms: u32 = self.buffer[first_speech..=last_speech]
            .iter()
            .map(|s| s.frame.duration_ms())
            .sum();
        if speech_ms < self.config.min_speech_ms {
            return None;
        }

        // Keep at most pad_ms of the trailing silence
        let mut end = self.buffer.len();
        if !partial {
            let mut kept_pad = 0u32;
            end = last_speech + 1;
            while end < self.buffer.len() && kept_pad < self.config.pad_ms {
                kept_pad += self.buffer[end].frame.duration_ms();
                end += 1;
            }
        }
        let included = &self.buffer[..end];

        let samples: Vec<i16> = included
            .iter()
            .flat_map(|s| s.frame.samples.iter().copied())
            .collect();

        let speech_frames: Vec<f32> = included
            .iter()
            .filter(|s| s.probability >= threshold)
            .map(|s| s.probability)
            .collect();
        let avg_probability = if speech_frames.is_empty() {
            0.0
        } else {
            speech_frames.iter().sum::<f32>() / speech_frames.len() as f32
        };

        let utterance = Utterance {
            origin: included.first()?.frame.captured_at,
            end: included.last()?.frame.captured_at,
            samples,
            avg_probability,
            partial,
            sequence: self.sequence,
        };
        self.sequence += 1;
        Some(utterance)
    }
}
