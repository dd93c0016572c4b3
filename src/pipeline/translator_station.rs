//! Translator station: one streaming request per transcript, with
//! speculative forwarding.
//!
//! Rather than waiting for stream completion, growing-prefix records flow
//! downstream as tokens arrive, on a cadence of ~60ms or 4 tokens. The TTS
//! station reconciles prefixes by sending only appended suffixes.

use crate::clock::Clock;
use crate::defaults;
use crate::error::Result;
use crate::pipeline::health::{HealthEvent, Stage};
use crate::pipeline::metrics::StageStats;
use crate::pipeline::types::{Transcript, Translation};
use crate::services::backoff::Backoff;
use crate::services::translate::TranslatorClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TranslatorStation {
    client: Arc<dyn TranslatorClient>,
    clock: Arc<dyn Clock>,
    stats: Arc<StageStats>,
    health: mpsc::Sender<HealthEvent>,
    backoff: Backoff,
    deadline: Duration,
    flush_interval: Duration,
    flush_tokens: usize,
}

impl TranslatorStation {
    pub fn new(
        client: Arc<dyn TranslatorClient>,
        clock: Arc<dyn Clock>,
        stats: Arc<StageStats>,
        health: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            client,
            clock,
            stats,
            health,
            backoff: Backoff::request(),
            deadline: Duration::from_millis(defaults::TRANSLATE_DEADLINE_MS),
            flush_interval: Duration::from_millis(defaults::PREFIX_FLUSH_MS),
            flush_tokens: defaults::PREFIX_FLUSH_TOKENS,
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

    /// Runs until upstream closes the transcript channel, translating any
    /// transcripts still queued at shutdown before exiting.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Transcript>,
        output: mpsc::Sender<Translation>,
    ) {
        while let Some(transcript) = input.recv().await {
            if !self.process(transcript, &output).await {
                break; // downstream closed
            }
        }
    }

    /// Translates one transcript, retrying the whole request while nothing
    /// has been forwarded yet. Returns false when downstream is gone.
    async fn process(&mut self, transcript: Transcript, output: &mpsc::Sender<Translation>) -> bool {
        let started = self.clock.now();
        let mut attempt = 0;

        loop {
            match self.translate(&transcript, output).await {
                Ok(Outcome::Completed) => {
                    self.stats.add_processed();
                    self.stats.record_latency(self.clock.since(started));
                    return true;
                }
                Ok(Outcome::Empty) => {
                    let _ = self
                        .health
                        .send(HealthEvent::UtteranceDropped {
                            stage: Stage::Translator,
                            sequence: transcript.sequence,
                            reason: "empty translation".to_string(),
                        })
                        .await;
                    return true;
                }
                Ok(Outcome::DownstreamClosed) => return false,
                Err(e) if e.is_fatal() => {
                    self.stats.add_error();
                    let _ = self
                        .health
                        .send(HealthEvent::Fatal {
                            stage: Stage::Translator,
                            error: e.to_string(),
                        })
                        .await;
                    return true;
                }
                Err(e) => {
                    self.stats.add_error();
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts() {
                        // Retry budget exhausted: passthrough trigger
                        let _ = self
                            .health
                            .send(HealthEvent::Fatal {
                                stage: Stage::Translator,
                                error: e.to_string(),
                            })
                            .await;
                        return true;
                    }
                    tracing::warn!(attempt, error = %e, "translation retry");
                    tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                }
            }
        }
    }

    /// One streaming attempt.
    async fn translate(
        &mut self,
        transcript: &Transcript,
        output: &mpsc::Sender<Translation>,
    ) -> Result<Outcome> {
        let deadline = transcript.origin + self.deadline;
        let started = self.clock.now();

        let mut stream = self.client.translate_stream(&transcript.text).await?;

        let mut text = String::new();
        let mut emitted_any = false;
        let mut tokens_since_flush = 0usize;
        let mut last_flush = self.clock.now();

        loop {
            let now = self.clock.now();
            if now >= deadline {
                // Hard timeout: whatever has arrived is the final translation
                tracing::warn!(sequence = transcript.sequence, "translation deadline, emitting partial text");
                if text.is_empty() {
                    return Ok(Outcome::Empty);
                }
                return self.emit(output, transcript, &text, true, started).await;
            }

            let poll = Duration::from_millis(50);
            match tokio::time::timeout(poll, stream.next_token()).await {
                Err(_) => {
                    // Tokens stalled: honor the flush cadence anyway
                    if tokens_since_flush > 0
                        && self.clock.since(last_flush) >= self.flush_interval
                    {
                        match self.emit(output, transcript, &text, false, started).await? {
                            Outcome::DownstreamClosed => return Ok(Outcome::DownstreamClosed),
                            _ => {}
                        }
                        emitted_any = true;
                        tokens_since_flush = 0;
                        last_flush = self.clock.now();
                    }
                }
                Ok(Ok(Some(token))) => {
                    text.push_str(&token);
                    tokens_since_flush += 1;

                    let due = !emitted_any
                        || tokens_since_flush >= self.flush_tokens
                        || self.clock.since(last_flush) >= self.flush_interval;
                    if due {
                        match self.emit(output, transcript, &text, false, started).await? {
                            Outcome::DownstreamClosed => return Ok(Outcome::DownstreamClosed),
                            _ => {}
                        }
                        emitted_any = true;
                        tokens_since_flush = 0;
                        last_flush = self.clock.now();
                    }
                }
                Ok(Ok(None)) => {
                    if text.trim().is_empty() {
                        return Ok(Outcome::Empty);
                    }
                    return self.emit(output, transcript, &text, true, started).await;
                }
                Ok(Err(e)) => {
                    if emitted_any {
                        // Prefixes were already forwarded; finalize what we
                        // have so the downstream prefix stays monotonic
                        tracing::warn!(error = %e, "translation stream broke after forwarding, finalizing prefix");
                        self.stats.add_error();
                        return self.emit(output, transcript, &text, true, started).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn emit(
        &self,
        output: &mpsc::Sender<Translation>,
        transcript: &Transcript,
        text: &str,
        is_final: bool,
        started: std::time::Instant,
    ) -> Result<Outcome> {
        let translation = Translation {
            original: transcript.text.clone(),
            translated: text.to_string(),
            is_final,
            sequence: transcript.sequence,
            origin: transcript.origin,
            stt_latency: transcript.stt_latency,
            translate_latency: self.clock.since(started),
        };

        if output.send(translation).await.is_err() {
            return Ok(Outcome::DownstreamClosed);
        }
        Ok(Outcome::Completed)
    }
}

enum Outcome {
    Completed,
    Empty,
    DownstreamClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::services::translate::MockTranslator;
    use std::time::Instant;

    fn transcript(sequence: u64, text: &str) -> Transcript {
        Transcript {
            text: text.to_string(),
            language: "es".to_string(),
            confidence: 0.95,
            words: None,
            sequence,
            origin: Instant::now(),
            stt_latency: Duration::from_millis(250),
        }
    }

    struct Harness {
        transcript_tx: mpsc::Sender<Transcript>,
        translation_rx: mpsc::Receiver<Translation>,
        health_rx: mpsc::Receiver<HealthEvent>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(translator: MockTranslator) -> Harness {
        let (transcript_tx, transcript_rx) = mpsc::channel(10);
        let (translation_tx, translation_rx) = mpsc::channel(64);
        let (health_tx, health_rx) = mpsc::channel(16);

        let station = TranslatorStation::new(
            Arc::new(translator),
            Arc::new(SystemClock),
            Arc::new(StageStats::new("translator")),
            health_tx,
        )
        .with_backoff(Backoff::new(
            Duration::from_millis(5),
            2.0,
            Duration::from_millis(50),
            0.0,
            3,
        ));

        let task = tokio::spawn(station.run(transcript_rx, translation_tx));

        Harness {
            transcript_tx,
            translation_rx,
            health_rx,
            task,
        }
    }

    async fn collect_sequence(harness: &mut Harness) -> Vec<Translation> {
        let mut records = Vec::new();
        loop {
            let record =
                tokio::time::timeout(Duration::from_secs(2), harness.translation_rx.recv())
                    .await
                    .expect("timed out waiting for translation")
                    .expect("channel closed");
            let done = record.is_final;
            records.push(record);
            if done {
                return records;
            }
        }
    }

    async fn finish(harness: Harness) {
        drop(harness.transcript_tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), harness.task).await;
    }

    #[tokio::test]
    async fn test_prefixes_grow_monotonically_to_final() {
        let translator = MockTranslator::new()
            .with_translation("hola cómo estás", "hello, how are you today my friend?")
            .with_token_delay(Duration::from_millis(5));
        let mut harness = start(translator);

        harness.transcript_tx.send(transcript(0, "hola cómo estás")).await.unwrap();
        let records = collect_sequence(&mut harness).await;

        // Every record is a prefix of the next; the last is the full text
        for pair in records.windows(2) {
            assert!(
                pair[1].translated.starts_with(&pair[0].translated),
                "{:?} is not a prefix of {:?}",
                pair[0].translated,
                pair[1].translated
            );
        }
        let last = records.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.translated, "hello, how are you today my friend?");
        assert_eq!(last.original, "hola cómo estás");
        assert_eq!(last.sequence, 0);
        finish(harness).await;
    }

    #[tokio::test]
    async fn test_first_token_is_forwarded_immediately() {
        let translator = MockTranslator::new()
            .with_default("one two three four five six seven eight")
            .with_token_delay(Duration::from_millis(30));
        let mut harness = start(translator);

        harness.transcript_tx.send(transcript(0, "x")).await.unwrap();
        let records = collect_sequence(&mut harness).await;

        // Speculative forwarding started before the stream completed
        assert!(records.len() >= 2, "expected prefix records, got {}", records.len());
        assert_eq!(records[0].translated, "one ");
        assert!(!records[0].is_final);
        finish(harness).await;
    }

    #[tokio::test]
    async fn test_stt_latency_carried_through() {
        let translator = MockTranslator::new().with_default("ok");
        let mut harness = start(translator);

        harness.transcript_tx.send(transcript(5, "bien")).await.unwrap();
        let records = collect_sequence(&mut harness).await;

        let last = records.last().unwrap();
        assert_eq!(last.stt_latency, Duration::from_millis(250));
        assert_eq!(last.sequence, 5);
        finish(harness).await;
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let translator = MockTranslator::new()
            .with_default("eventually fine")
            .with_request_failures(2);
        let mut harness = start(translator);

        harness.transcript_tx.send(transcript(0, "x")).await.unwrap();
        let records = collect_sequence(&mut harness).await;
        assert_eq!(records.last().unwrap().translated, "eventually fine");
        finish(harness).await;
    }

    #[tokio::test]
    async fn test_queued_transcripts_are_translated_after_input_closes() {
        let translator = MockTranslator::new()
            .with_translation("uno", "one")
            .with_translation("dos", "two");
        let mut harness = start(translator);

        // Both transcripts are queued before the sender goes away
        harness.transcript_tx.send(transcript(0, "uno")).await.unwrap();
        harness.transcript_tx.send(transcript(1, "dos")).await.unwrap();
        drop(harness.transcript_tx);

        let mut finals = Vec::new();
        while let Ok(Some(record)) =
            tokio::time::timeout(Duration::from_secs(2), harness.translation_rx.recv()).await
        {
            if record.is_final {
                finals.push(record);
            }
        }

        assert_eq!(finals.len(), 2, "queued transcripts were dropped");
        assert_eq!(finals[0].translated, "one");
        assert_eq!(finals[1].translated, "two");
        assert_eq!(finals[1].sequence, 1);

        let _ = tokio::time::timeout(Duration::from_secs(2), harness.task).await;
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_fatal() {
        let translator = MockTranslator::new().with_request_failures(100);
        let mut harness = start(translator);

        harness.transcript_tx.send(transcript(0, "x")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), harness.health_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            HealthEvent::Fatal { stage, .. } => assert_eq!(stage, Stage::Translator),
            other => panic!("Expected Fatal, got {other:?}"),
        }
        finish(harness).await;
    }

    #[tokio::test]
    async fn test_deadline_finalizes_partial_text() {
        // Tokens arrive far slower than the deadline allows
        let translator = MockTranslator::new()
            .with_default("very slow translation stream here")
            .with_token_delay(Duration::from_millis(200));
        let mut harness = {
            let (transcript_tx, transcript_rx) = mpsc::channel(10);
            let (translation_tx, translation_rx) = mpsc::channel(64);
            let (health_tx, health_rx) = mpsc::channel(16);

            let station = TranslatorStation::new(
                Arc::new(translator),
                Arc::new(SystemClock),
                Arc::new(StageStats::new("translator")),
                health_tx,
            )
            .with_deadline(Duration::from_millis(500));

            let task = tokio::spawn(station.run(transcript_rx, translation_tx));
            Harness {
                transcript_tx,
                translation_rx,
                health_rx,
                task,
            }
        };

        harness.transcript_tx.send(transcript(0, "x")).await.unwrap();
        let records = collect_sequence(&mut harness).await;

        let last = records.last().unwrap();
        assert!(last.is_final);
        // Deadline fired mid-stream: the final text is a partial prefix
        assert!(last.translated.len() < "very slow translation stream here".len());
        assert!(!last.translated.is_empty());
        finish(harness).await;
    }
}
