//! STT station: streams utterance audio to the recognizer and forwards
//! finalized transcripts.
//!
//! One persistent streaming session serves the whole run. Interim results
//! that hold identical text for long enough are promoted to final, guarding
//! against late finalization by the remote service; if the real final later
//! differs, a correction event goes to the orchestrator and the first
//! rendering stands.

use crate::audio::pcm;
use crate::clock::Clock;
use crate::defaults;
use crate::error::{Result, VoiceBridgeError};
use crate::pipeline::health::{HealthEvent, Stage};
use crate::pipeline::metrics::StageStats;
use crate::pipeline::types::{Transcript, Utterance};
use crate::services::backoff::Backoff;
use crate::services::stt::{RecognizerClient, RecognizerSession};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Collapses internal whitespace and trims.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when the text carries no letters or digits at all.
fn is_pure_punctuation(text: &str) -> bool {
    !text.chars().any(|c| c.is_alphanumeric())
}

pub struct SttStation {
    client: Arc<dyn RecognizerClient>,
    language: String,
    clock: Arc<dyn Clock>,
    stats: Arc<StageStats>,
    health: mpsc::Sender<HealthEvent>,
    backoff: Backoff,
    deadline: Duration,
    stable_after: Duration,
    keepalive_interval: Duration,
}

impl SttStation {
    pub fn new(
        client: Arc<dyn RecognizerClient>,
        language: String,
        clock: Arc<dyn Clock>,
        stats: Arc<StageStats>,
        health: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            client,
            language,
            clock,
            stats,
            health,
            backoff: Backoff::streaming(),
            deadline: Duration::from_millis(defaults::STT_DEADLINE_MS),
            stable_after: Duration::from_millis(defaults::INTERIM_STABLE_MS),
            keepalive_interval: Duration::from_secs(defaults::STT_KEEPALIVE_SECS),
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

    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Runs until upstream closes the utterance channel. Utterances still
    /// queued at shutdown are transcribed before the station exits, so
    /// nothing the VAD committed to is lost.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Utterance>,
        output: mpsc::Sender<Transcript>,
    ) {
        let mut session: Option<Box<dyn RecognizerSession>> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.keepalive_interval) => {
                    if let Some(s) = session.as_mut()
                        && s.keepalive().await.is_err()
                    {
                        session = None;
                    }
                }
                maybe = input.recv() => {
                    let Some(utterance) = maybe else { break };
                    let sequence = utterance.sequence;

                    match self.transcribe(&mut session, &utterance).await {
                        Ok(Some(transcript)) => {
                            self.stats.add_processed();
                            self.stats.record_latency(transcript.stt_latency);
                            if output.send(transcript).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            // Empty finals are discarded, but never silently
                            let _ = self.health.send(HealthEvent::UtteranceDropped {
                                stage: Stage::Stt,
                                sequence,
                                reason: "empty final transcript".to_string(),
                            }).await;
                        }
                        Err(e) => {
                            self.stats.add_error();
                            session = None;
                            if matches!(e, VoiceBridgeError::Timeout { .. }) {
                                let _ = self.health.send(HealthEvent::UtteranceDropped {
                                    stage: Stage::Stt,
                                    sequence,
                                    reason: e.to_string(),
                                }).await;
                            } else {
                                // Auth rejection or a transport failure that
                                // survived the retry budget
                                let _ = self.health.send(HealthEvent::Fatal {
                                    stage: Stage::Stt,
                                    error: e.to_string(),
                                }).await;
                            }
                        }
                    }
                }
            }
        }

        if let Some(mut s) = session {
            let grace = Duration::from_millis(defaults::CANCEL_GRACE_MS);
            let _ = tokio::time::timeout(grace, s.close()).await;
        }
    }

    /// Opens a session if none is live, with the stage's backoff budget.
    async fn ensure_session(
        &self,
        session: &mut Option<Box<dyn RecognizerSession>>,
    ) -> Result<()> {
        if session.is_some() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.client.open_session().await {
                Ok(s) => {
                    *session = Some(s);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts() {
                        return Err(e);
                    }
                    tracing::warn!(attempt, error = %e, "recognizer reconnect");
                    tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                }
            }
        }
    }

    /// Streams one utterance and waits for its final transcript.
    ///
    /// `Ok(None)` means the final was empty after normalization. Deadlines
    /// are measured from the utterance origin, not from when this stage
    /// started work.
    async fn transcribe(
        &mut self,
        session: &mut Option<Box<dyn RecognizerSession>>,
        utterance: &Utterance,
    ) -> Result<Option<Transcript>> {
        let deadline = utterance.origin + self.deadline;
        let started = self.clock.now();
        let pcm_bytes = pcm::samples_to_bytes(&utterance.samples);

        self.ensure_session(session).await?;

        // Audio mid-flight when the transport breaks is re-sent on a fresh
        // connection at most once.
        let mut resend_budget = 1u8;
        if let Err(e) = session.as_mut().unwrap().send_audio(&pcm_bytes).await {
            if !e.is_retriable() || resend_budget == 0 {
                return Err(e);
            }
            resend_budget -= 1;
            *session = None;
            self.ensure_session(session).await?;
            session.as_mut().unwrap().send_audio(&pcm_bytes).await?;
        }

        let mut stable: Option<(String, f32, Instant)> = None;

        loop {
            let now = self.clock.now();
            if now >= deadline {
                if let Some((text, confidence, _)) = stable.take() {
                    return Ok(Some(self.finish(utterance, text, confidence, None, started)));
                }
                return Err(VoiceBridgeError::Timeout {
                    service: "recognizer",
                    elapsed_ms: now.duration_since(utterance.origin).as_millis() as u64,
                });
            }

            if let Some((text, confidence, since)) = &stable
                && now.duration_since(*since) >= self.stable_after
            {
                // The service is late with its final: promote the stabilized
                // interim, then briefly watch for a differing late final.
                let (text, confidence) = (text.clone(), *confidence);
                let transcript = self.finish(utterance, text.clone(), confidence, None, started);
                self.watch_for_correction(session, utterance.sequence, &text)
                    .await;
                return Ok(Some(transcript));
            }

            let poll = Duration::from_millis(50);
            let next = tokio::time::timeout(poll, session.as_mut().unwrap().next_result()).await;

            let outcome = match next {
                Err(_) => continue, // poll tick; re-check deadline and stabilization
                Ok(outcome) => outcome,
            };

            match outcome {
                Ok(Some(result)) => {
                    let text = normalize(&result.text);

                    if result.is_final {
                        if text.is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(self.finish(
                            utterance,
                            text,
                            result.confidence,
                            result.words,
                            started,
                        )));
                    }

                    if text.is_empty() || is_pure_punctuation(&text) {
                        continue;
                    }
                    match &stable {
                        Some((prev, _, _)) if *prev == text => {} // still stable
                        _ => stable = Some((text, result.confidence, self.clock.now())),
                    }
                }
                Err(e) if !e.is_retriable() => return Err(e),
                Ok(None) | Err(_) => {
                    // Stream closed or transport broke mid-utterance
                    if resend_budget == 0 {
                        return Err(VoiceBridgeError::Transport {
                            service: "recognizer",
                            message: "stream lost after re-send".to_string(),
                        });
                    }
                    resend_budget -= 1;
                    *session = None;
                    self.ensure_session(session).await?;
                    session.as_mut().unwrap().send_audio(&pcm_bytes).await?;
                    stable = None;
                }
            }
        }
    }

    /// After promoting a stabilized interim, drain briefly for the real
    /// final; a differing one becomes a correction event (no re-synthesis).
    async fn watch_for_correction(
        &self,
        session: &mut Option<Box<dyn RecognizerSession>>,
        sequence: u64,
        forwarded: &str,
    ) {
        let Some(s) = session.as_mut() else { return };

        let budget = Duration::from_millis(50);
        let Ok(Ok(Some(result))) = tokio::time::timeout(budget, s.next_result()).await else {
            return;
        };

        if result.is_final {
            let corrected = normalize(&result.text);
            if !corrected.is_empty() && corrected != forwarded {
                let _ = self
                    .health
                    .send(HealthEvent::Correction {
                        sequence,
                        forwarded: forwarded.to_string(),
                        corrected,
                    })
                    .await;
            }
        }
    }

    fn finish(
        &self,
        utterance: &Utterance,
        text: String,
        confidence: f32,
        words: Option<Vec<crate::services::stt::WordTiming>>,
        started: Instant,
    ) -> Transcript {
        Transcript {
            text,
            language: self.language.clone(),
            confidence,
            words,
            sequence: utterance.sequence,
            origin: utterance.origin,
            stt_latency: self.clock.since(started),
        }
    }
}
