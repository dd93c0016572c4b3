//! TTS station: turns translations into ordered PCM chunks.
//!
//! One duplex subsession per utterance sequence. Growing-prefix translation
//! records are reconciled by sending only the appended text suffix; the
//! record marked final triggers end-of-stream and the audio drain. Chunks
//! for sequence N always precede chunks for N+1: the next subsession opens
//! only after the previous one's final chunk.
//!
//! Fallback chain per translation: retry the streaming subsession, then a
//! one-shot request against the same vendor, then the alternate synthesizer
//! with a non-cloned voice, then a silence chunk sized by a duration
//! estimate so downstream never starves.

use crate::clock::Clock;
use crate::defaults;
use crate::error::VoiceBridgeError;
use crate::pipeline::health::{HealthEvent, Stage};
use crate::pipeline::metrics::StageStats;
use crate::pipeline::ring::SlidingSender;
use crate::pipeline::session_log::SessionEntry;
use crate::pipeline::types::{SynthChunk, Translation};
use crate::services::backoff::Backoff;
use crate::services::tts::{SynthAudio, SynthSession, SynthesizerClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// In-flight synthesis state for one utterance sequence.
struct ActiveSynth {
    sequence: u64,
    session: Option<Box<dyn SynthSession>>,
    sent_len: usize,
}

pub struct TtsStation {
    primary: Arc<dyn SynthesizerClient>,
    alternate: Arc<dyn SynthesizerClient>,
    clock: Arc<dyn Clock>,
    stats: Arc<StageStats>,
    health: mpsc::Sender<HealthEvent>,
    backoff: Backoff,
    deadline: Duration,
    pipeline_start: Instant,
    /// True while a fallback path served the most recent sequence.
    degraded: bool,
}

impl TtsStation {
    pub fn new(
        primary: Arc<dyn SynthesizerClient>,
        alternate: Arc<dyn SynthesizerClient>,
        clock: Arc<dyn Clock>,
        stats: Arc<StageStats>,
        health: mpsc::Sender<HealthEvent>,
        pipeline_start: Instant,
    ) -> Self {
        Self {
            primary,
            alternate,
            clock,
            stats,
            health,
            backoff: Backoff::request(),
            deadline: Duration::from_millis(defaults::SYNTH_DEADLINE_MS),
            pipeline_start,
            degraded: false,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs until upstream closes the translation channel. Translations
    /// still queued at shutdown are synthesized before the station exits,
    /// keeping the chunk stream complete for every forwarded sequence.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Translation>,
        output: SlidingSender<SynthChunk>,
    ) {
        let mut active: Option<ActiveSynth> = None;

        while let Some(translation) = input.recv().await {
            self.handle_record(&mut active, translation, &output).await;
        }

        if let Some(mut synth) = active.take()
            && let Some(mut session) = synth.session.take()
        {
            let grace = Duration::from_millis(defaults::CANCEL_GRACE_MS);
            let _ = tokio::time::timeout(grace, session.close()).await;
        }
    }

    async fn handle_record(
        &mut self,
        active: &mut Option<ActiveSynth>,
        translation: Translation,
        output: &SlidingSender<SynthChunk>,
    ) {
        // New sequence: open its subsession (failures are absorbed here and
        // resolved by the fallback chain at the final record)
        if active.as_ref().map(|a| a.sequence) != Some(translation.sequence) {
            if let Some(mut stale) = active.take()
                && let Some(mut session) = stale.session.take()
            {
                // A sequence left unterminated by upstream; abandon it
                tracing::warn!(sequence = stale.sequence, "abandoning unterminated subsession");
                let _ = session.close().await;
            }

            let session = self.primary.open_stream().await.ok();
            *active = Some(ActiveSynth {
                sequence: translation.sequence,
                session,
                sent_len: 0,
            });
        }

        let synth = active.as_mut().unwrap();

        // Forward only the appended suffix since the last send
        if let Some(session) = synth.session.as_mut() {
            let suffix = translation
                .translated
                .get(synth.sent_len..)
                .unwrap_or(&translation.translated);
            if !suffix.is_empty() {
                match session.send_text(suffix).await {
                    Ok(()) => synth.sent_len = translation.translated.len(),
                    Err(e) => {
                        tracing::warn!(error = %e, "subsession send failed");
                        synth.session = None;
                    }
                }
            }
        }

        if !translation.is_final {
            return;
        }

        // Final record: close the stream and drain, or fall back
        let synth_started = self.clock.now();
        let mut synth = active.take().unwrap();
        let drained = match synth.session.take() {
            Some(mut session) => {
                let result = self.finish_and_drain(&mut session, &translation, output).await;
                if result.is_err() {
                    let _ = session.close().await;
                }
                result
            }
            None => Err(DrainFailure::Clean(VoiceBridgeError::Connection {
                service: "synthesizer",
                message: "no live subsession".to_string(),
            })),
        };

        match drained {
            Ok(first_chunk_latency) => {
                self.stats.add_processed();
                self.stats.record_latency(first_chunk_latency);
                if self.degraded {
                    self.degraded = false;
                    let _ = self
                        .health
                        .send(HealthEvent::PrimaryRecovered { stage: Stage::Tts })
                        .await;
                }
            }
            Err(DrainFailure::AfterForwarding(e)) => {
                // Audio already reached output; retrying would duplicate it.
                // Close the sequence with a short silence tail.
                tracing::warn!(error = %e, sequence = translation.sequence, "subsession broke mid-drain");
                self.stats.add_error();
                self.emit_silence(&translation, Duration::from_millis(300), output);
                let _ = self
                    .health
                    .send(HealthEvent::FallbackEngaged {
                        stage: Stage::Tts,
                        detail: format!("sequence {} truncated: {e}", translation.sequence),
                    })
                    .await;
            }
            Err(DrainFailure::Clean(e)) => {
                self.stats.add_error();
                if e.is_fatal() {
                    let _ = self
                        .health
                        .send(HealthEvent::Fatal {
                            stage: Stage::Tts,
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
                self.fallback_chain(&translation, output).await;
            }
        }

        let _ = self
            .health
            .send(HealthEvent::UtteranceComplete(SessionEntry {
                sequence: translation.sequence,
                origin_offset_ms: translation
                    .origin
                    .duration_since(self.pipeline_start)
                    .as_millis() as u64,
                original_text: translation.original.clone(),
                translated_text: translation.translated.clone(),
                stt_latency_ms: translation.stt_latency.as_millis() as u64,
                translate_latency_ms: translation.translate_latency.as_millis() as u64,
                synth_latency_ms: self.clock.since(synth_started).as_millis() as u64,
            }))
            .await;
    }

    /// Sends end-of-stream and forwards chunks in order, holding one chunk
    /// back so exactly one carries the final flag even when the vendor
    /// never sets it.
    async fn finish_and_drain(
        &self,
        session: &mut Box<dyn SynthSession>,
        translation: &Translation,
        output: &SlidingSender<SynthChunk>,
    ) -> std::result::Result<Duration, DrainFailure> {
        let deadline = translation.origin + self.deadline;

        session
            .finish()
            .await
            .map_err(DrainFailure::Clean)?;

        let mut held: Option<SynthAudio> = None;
        let mut first_latency: Option<Duration> = None;
        let mut forwarded = 0usize;

        loop {
            let now = self.clock.now();
            if now >= deadline {
                let e = VoiceBridgeError::Timeout {
                    service: "synthesizer",
                    elapsed_ms: now.duration_since(translation.origin).as_millis() as u64,
                };
                return Err(if forwarded > 0 {
                    DrainFailure::AfterForwarding(e)
                } else {
                    DrainFailure::Clean(e)
                });
            }

            let poll = Duration::from_millis(50);
            match tokio::time::timeout(poll, session.next_chunk()).await {
                Err(_) => continue,
                Ok(Ok(Some(chunk))) => {
                    if let Some(prev) = held.take() {
                        self.forward(translation, prev.samples, false, output, &mut first_latency);
                        forwarded += 1;
                    }
                    if chunk.is_final {
                        self.forward(translation, chunk.samples, true, output, &mut first_latency);
                        forwarded += 1;
                        break;
                    }
                    held = Some(chunk);
                }
                Ok(Ok(None)) => {
                    match held.take() {
                        Some(prev) => {
                            self.forward(
                                translation,
                                prev.samples,
                                true,
                                output,
                                &mut first_latency,
                            );
                            forwarded += 1;
                            break;
                        }
                        None => {
                            let e = VoiceBridgeError::Protocol {
                                service: "synthesizer",
                                message: "stream ended without audio".to_string(),
                            };
                            return Err(if forwarded > 0 {
                                DrainFailure::AfterForwarding(e)
                            } else {
                                DrainFailure::Clean(e)
                            });
                        }
                    }
                }
                Ok(Err(e)) => {
                    return Err(if forwarded > 0 {
                        DrainFailure::AfterForwarding(e)
                    } else {
                        DrainFailure::Clean(e)
                    });
                }
            }
        }

        Ok(first_latency.unwrap_or_default())
    }

    /// Runs once the streaming path has failed cleanly (no audio forwarded).
    async fn fallback_chain(&mut self, translation: &Translation, output: &SlidingSender<SynthChunk>) {
        // 1. Retry the streaming subsession with the complete text
        for attempt in 0..self.backoff.max_attempts() {
            tokio::time::sleep(self.backoff.delay(attempt)).await;

            let Ok(mut session) = self.primary.open_stream().await else {
                continue;
            };
            if session.send_text(&translation.translated).await.is_err() {
                let _ = session.close().await;
                continue;
            }
            match self.finish_and_drain(&mut session, translation, output).await {
                Ok(first_latency) => {
                    self.stats.add_processed();
                    self.stats.record_latency(first_latency);
                    if self.degraded {
                        self.degraded = false;
                        let _ = self
                            .health
                            .send(HealthEvent::PrimaryRecovered { stage: Stage::Tts })
                            .await;
                    }
                    return;
                }
                Err(DrainFailure::AfterForwarding(e)) => {
                    self.emit_silence(translation, Duration::from_millis(300), output);
                    let _ = self
                        .health
                        .send(HealthEvent::FallbackEngaged {
                            stage: Stage::Tts,
                            detail: format!("retry truncated: {e}"),
                        })
                        .await;
                    return;
                }
                Err(DrainFailure::Clean(_)) => {
                    let _ = session.close().await;
                }
            }
        }

        // 2. One-shot request against the same vendor
        if let Ok(samples) = self.primary.synthesize(&translation.translated).await {
            self.forward(translation, samples, true, output, &mut None);
            self.stats.add_processed();
            // Streaming is down even though one-shot worked
            self.engage_fallback("primary one-shot synthesis").await;
            return;
        }

        // 3. Alternate synthesizer, non-cloned voice
        if let Ok(samples) = self.alternate.synthesize(&translation.translated).await {
            self.forward(translation, samples, true, output, &mut None);
            self.stats.add_processed();
            self.engage_fallback("alternate synthesizer voice").await;
            return;
        }

        // 4. Silence of the estimated duration, so output never starves
        self.stats.add_error();
        let estimate = estimate_speech_duration(&translation.translated);
        self.emit_silence(translation, estimate, output);
        self.engage_fallback("silence substitution").await;
    }

    async fn engage_fallback(&mut self, detail: &str) {
        self.degraded = true;
        let _ = self
            .health
            .send(HealthEvent::FallbackEngaged {
                stage: Stage::Tts,
                detail: detail.to_string(),
            })
            .await;
    }

    fn emit_silence(
        &self,
        translation: &Translation,
        duration: Duration,
        output: &SlidingSender<SynthChunk>,
    ) {
        let samples =
            vec![0i16; (duration.as_millis() as usize * defaults::SYNTH_SAMPLE_RATE as usize) / 1000];
        self.forward(translation, samples, true, output, &mut None);
    }

    fn forward(
        &self,
        translation: &Translation,
        samples: Vec<i16>,
        is_final: bool,
        output: &SlidingSender<SynthChunk>,
        first_latency: &mut Option<Duration>,
    ) {
        let latency = self.clock.since(translation.origin);
        if first_latency.is_none() {
            *first_latency = Some(latency);
        }

        output.send(SynthChunk {
            samples,
            sample_rate: defaults::SYNTH_SAMPLE_RATE,
            is_final,
            sequence: translation.sequence,
            origin: translation.origin,
            pipeline_latency: latency,
        });
        self.stats.set_dropped(output.dropped());
    }
}

/// How a drain attempt failed, which decides whether retrying is safe.
enum DrainFailure {
    /// Nothing was forwarded; the whole translation can be retried.
    Clean(VoiceBridgeError),
    /// Audio already reached the output channel; retrying would duplicate.
    AfterForwarding(VoiceBridgeError),
}

/// Rough speech duration for silence substitution: a third of a second per
/// word, clamped to something audible but bounded.
fn estimate_speech_duration(text: &str) -> Duration {
    let words = text.split_whitespace().count() as u64;
    Duration::from_millis((words * 330).clamp(500, 10_000))
}
