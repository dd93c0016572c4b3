//! Streaming speech synthesis interface.
//!
//! One duplex subsession per utterance sequence: text fragments go in,
//! ordered PCM chunks come out, bounded by begin/end-of-stream markers.

use crate::error::{Result, VoiceBridgeError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One synthesized PCM chunk (24kHz mono).
#[derive(Debug, Clone)]
pub struct SynthAudio {
    pub samples: Vec<i16>,
    pub is_final: bool,
}

/// Factory for synthesis subsessions plus the one-shot fallback path.
#[async_trait]
pub trait SynthesizerClient: Send + Sync {
    /// Opens a duplex streaming subsession for one utterance.
    async fn open_stream(&self) -> Result<Box<dyn SynthSession>>;

    /// One-shot non-streaming synthesis of complete text (fallback).
    async fn synthesize(&self, text: &str) -> Result<Vec<i16>>;
}

/// One open synthesis subsession.
#[async_trait]
pub trait SynthSession: Send {
    /// Appends a text fragment to the running synthesis.
    async fn send_text(&mut self, fragment: &str) -> Result<()>;

    /// Sends end-of-stream; no more text will follow.
    async fn finish(&mut self) -> Result<()>;

    /// Next audio chunk. `Ok(None)` after the final chunk.
    async fn next_chunk(&mut self) -> Result<Option<SynthAudio>>;

    /// Abandons the subsession.
    async fn close(&mut self) -> Result<()>;
}

/// Scripted synthesizer for tests.
///
/// Produces a fixed amount of audio per word of input text, split into
/// quarter-second chunks, with the last chunk flagged final.
#[derive(Clone)]
pub struct MockSynthesizer {
    samples_per_word: usize,
    chunk_samples: usize,
    first_chunk_delay: Duration,
    fail_streams: Arc<AtomicU32>,
    fail_oneshots: Arc<AtomicU32>,
    stream_opens: Arc<AtomicU32>,
    oneshot_calls: Arc<AtomicU32>,
    synthesized: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            // Half a second of 24kHz audio per word
            samples_per_word: 12_000,
            chunk_samples: 6_000,
            first_chunk_delay: Duration::ZERO,
            fail_streams: Arc::new(AtomicU32::new(0)),
            fail_oneshots: Arc::new(AtomicU32::new(0)),
            stream_opens: Arc::new(AtomicU32::new(0)),
            oneshot_calls: Arc::new(AtomicU32::new(0)),
            synthesized: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Audio produced per word of text.
    pub fn with_samples_per_word(mut self, samples: usize) -> Self {
        self.samples_per_word = samples;
        self
    }

    /// Delay before the first chunk of each subsession.
    pub fn with_first_chunk_delay(mut self, delay: Duration) -> Self {
        self.first_chunk_delay = delay;
        self
    }

    /// Fails the next `n` subsession opens.
    pub fn with_stream_failures(self, n: u32) -> Self {
        self.fail_streams.store(n, Ordering::SeqCst);
        self
    }

    /// Fails the next `n` one-shot synthesis calls.
    pub fn with_oneshot_failures(self, n: u32) -> Self {
        self.fail_oneshots.store(n, Ordering::SeqCst);
        self
    }

    /// Refuses all work (both paths) permanently.
    pub fn with_total_outage(self) -> Self {
        self.fail_streams.store(u32::MAX, Ordering::SeqCst);
        self.fail_oneshots.store(u32::MAX, Ordering::SeqCst);
        self
    }

    /// Number of subsessions opened so far.
    pub fn stream_count(&self) -> u32 {
        self.stream_opens.load(Ordering::SeqCst)
    }

    /// Number of one-shot calls so far.
    pub fn oneshot_count(&self) -> u32 {
        self.oneshot_calls.load(Ordering::SeqCst)
    }

    /// Full text of each completed synthesis, in order.
    pub fn synthesized_texts(&self) -> Vec<String> {
        self.synthesized.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining == 0 {
            return false;
        }
        if remaining != u32::MAX {
            counter.store(remaining - 1, Ordering::SeqCst);
        }
        true
    }

    fn render(&self, text: &str) -> Vec<i16> {
        let words = text.split_whitespace().count().max(1);
        // Nonzero ramp so output assertions can distinguish audio from fill
        let total = words * self.samples_per_word;
        (0..total).map(|i| ((i % 100) as i16 + 1) * 50).collect()
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SynthesizerClient for MockSynthesizer {
    async fn open_stream(&self) -> Result<Box<dyn SynthSession>> {
        if Self::take_failure(&self.fail_streams) {
            return Err(VoiceBridgeError::Connection {
                service: "synthesizer",
                message: "mock subsession refused".to_string(),
            });
        }

        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSynthSession {
            owner: self.clone(),
            text: String::new(),
            chunks: VecDeque::new(),
            finished: false,
            ready_at: None,
        }))
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<i16>> {
        self.oneshot_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.fail_oneshots) {
            return Err(VoiceBridgeError::Transport {
                service: "synthesizer",
                message: "mock one-shot failure".to_string(),
            });
        }

        self.synthesized.lock().unwrap().push(text.to_string());
        Ok(self.render(text))
    }
}

struct MockSynthSession {
    owner: MockSynthesizer,
    text: String,
    chunks: VecDeque<SynthAudio>,
    finished: bool,
    ready_at: Option<tokio::time::Instant>,
}

#[async_trait]
impl SynthSession for MockSynthSession {
    async fn send_text(&mut self, fragment: &str) -> Result<()> {
        self.text.push_str(fragment);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        // Absolute deadline so short-timeout polling still observes the
        // full simulated synthesis latency
        self.ready_at = Some(tokio::time::Instant::now() + self.owner.first_chunk_delay);
        self.owner
            .synthesized
            .lock()
            .unwrap()
            .push(self.text.clone());

        let samples = self.owner.render(&self.text);
        let chunk_size = self.owner.chunk_samples.max(1);
        let mut chunks: VecDeque<SynthAudio> = samples
            .chunks(chunk_size)
            .map(|chunk| SynthAudio {
                samples: chunk.to_vec(),
                is_final: false,
            })
            .collect();
        if let Some(last) = chunks.back_mut() {
            last.is_final = true;
        }
        self.chunks = chunks;
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<SynthAudio>> {
        if let Some(ready_at) = self.ready_at {
            tokio::time::sleep_until(ready_at).await;
        }
        if !self.finished && self.chunks.is_empty() {
            // Real subsessions keep the wire open until EOS; tests always
            // call finish() before draining.
            return Ok(None);
        }
        Ok(self.chunks.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.chunks.clear();
        Ok(())
    }
}
