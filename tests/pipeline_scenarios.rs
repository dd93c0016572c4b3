//! End-to-end pipeline scenarios against mocked remote services.
//!
//! VAD timings are scaled down (frames still 30ms) so each scenario runs
//! in a few seconds of wall time while exercising the same state machines
//! as production settings.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use voicebridge::Config;
use voicebridge::PipelineBuilder;
use voicebridge::audio::device::{AudioInput, AudioOutputDevice, FramePhase, MockAudioInput, MockAudioOutput};
use voicebridge::pipeline::health::{HealthEvent, PassthroughReason, PipelineMode, Stage};
use voicebridge::services::backoff::Backoff;
use voicebridge::services::stt::{MockRecognizer, SttResult};
use voicebridge::services::translate::MockTranslator;
use voicebridge::services::tts::MockSynthesizer;
use voicebridge::vad::EnergyDetector;

const SPEECH_AMPLITUDE: i16 = 6000;
const FRAME: usize = 480;

/// Test configuration: real thresholds, shortened silence windows.
fn test_config() -> Config {
    let mut config = Config::default();
    config.credentials.recognizer_key = "dg-test".into();
    config.credentials.translator_key = "oa-test".into();
    config.credentials.synthesizer_key = "el-test".into();
    config.synthesizer.voice_id = "voice-test".into();
    config.vad.min_speech_ms = 60;
    config.vad.min_silence_ms = 60;
    config.vad.pad_ms = 30;
    config
}

fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(5), 2.0, Duration::from_millis(40), 0.0, 3)
}

fn speech_phase(frames: u32) -> FramePhase {
    FramePhase {
        samples: vec![SPEECH_AMPLITUDE; FRAME],
        count: frames,
    }
}

fn silence_phase(frames: u32) -> FramePhase {
    FramePhase {
        samples: vec![0i16; FRAME],
        count: frames,
    }
}

/// Input wrapper that records when the last speech frame left the device,
/// giving tests a precise end-of-utterance reference.
struct TimedInput {
    inner: MockAudioInput,
    last_speech_read: Arc<Mutex<Option<Instant>>>,
}

impl TimedInput {
    fn new(inner: MockAudioInput) -> (Self, Arc<Mutex<Option<Instant>>>) {
        let last_speech_read = Arc::new(Mutex::new(None));
        (
            Self {
                inner,
                last_speech_read: last_speech_read.clone(),
            },
            last_speech_read,
        )
    }
}

impl AudioInput for TimedInput {
    fn start(&mut self) -> voicebridge::Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> voicebridge::Result<()> {
        self.inner.stop()
    }

    fn read_samples(&mut self) -> voicebridge::Result<Vec<i16>> {
        let samples = self.inner.read_samples()?;
        if samples.iter().any(|&s| s != 0) {
            *self.last_speech_read.lock().unwrap() = Some(Instant::now());
        }
        Ok(samples)
    }

    fn is_finite(&self) -> bool {
        self.inner.is_finite()
    }
}

/// Output wrapper that records when the first sample hit the device.
#[derive(Clone)]
struct TimedOutput {
    inner: MockAudioOutput,
    first_write: Arc<Mutex<Option<Instant>>>,
}

impl TimedOutput {
    fn new() -> Self {
        Self {
            inner: MockAudioOutput::new(),
            first_write: Arc::new(Mutex::new(None)),
        }
    }
}

impl AudioOutputDevice for TimedOutput {
    fn start(&mut self) -> voicebridge::Result<()> {
        self.inner.start()
    }

    fn write(&mut self, samples: &[i16]) -> voicebridge::Result<()> {
        let mut first = self.first_write.lock().unwrap();
        if first.is_none() && !samples.is_empty() {
            *first = Some(Instant::now());
        }
        drop(first);
        self.inner.write(samples)
    }

    fn stop(&mut self) -> voicebridge::Result<()> {
        self.inner.stop()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }
}

/// Waits for the next UtteranceComplete event, skipping others.
async fn next_completion(
    events: &mut tokio::sync::broadcast::Receiver<HealthEvent>,
    budget: Duration,
) -> voicebridge::pipeline::SessionEntry {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for utterance completion")
            .expect("event channel closed");
        if let HealthEvent::UtteranceComplete(entry) = event {
            return entry;
        }
    }
}

/// Waits until the pipeline reports the expected mode.
async fn wait_for_mode(
    watch: &mut tokio::sync::watch::Receiver<PipelineMode>,
    expected: impl Fn(PipelineMode) -> bool,
    budget: Duration,
) -> PipelineMode {
    let deadline = Instant::now() + budget;
    loop {
        let current = *watch.borrow();
        if expected(current) {
            return current;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout(remaining, watch.changed())
            .await
            .expect("timed out waiting for mode change")
            .expect("mode channel closed");
    }
}

#[tokio::test]
async fn single_utterance_end_to_end_under_latency_budget() {
    // A 2-second clip, then silence; remote services simulate 250/150/300ms
    let clip = MockAudioInput::new().with_frame_sequence(vec![
        speech_phase(67),
        silence_phase(30),
    ]);
    let (input, last_speech_read) = TimedInput::new(clip);
    let output = TimedOutput::new();

    let recognizer = MockRecognizer::new()
        .with_utterance(vec![SttResult::final_text("hola cómo estás")])
        .with_delay(Duration::from_millis(250));
    let translator = MockTranslator::new()
        .with_translation("hola cómo estás", "hello, how are you?")
        .with_first_token_delay(Duration::from_millis(150))
        .with_token_delay(Duration::from_millis(5));
    let synthesizer = MockSynthesizer::new().with_first_chunk_delay(Duration::from_millis(300));

    let handle = PipelineBuilder::new(test_config())
        .with_input(Box::new(input))
        .with_output(Box::new(output.clone()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(recognizer))
        .with_translator(Arc::new(translator))
        .with_synthesizer(Arc::new(synthesizer))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();
    let mut events = handle.subscribe_events();

    let entry = next_completion(&mut events, Duration::from_secs(10)).await;
    assert_eq!(entry.sequence, 0);
    assert_eq!(entry.original_text, "hola cómo estás");
    assert!(entry.translated_text.contains("hello"));
    assert!(entry.translated_text.contains("how are you"));

    // Let the output station drain the chunk channel
    tokio::time::sleep(Duration::from_millis(200)).await;

    // "hello, how are you?" renders four words of audio: 2s at 24kHz,
    // within the 1.5s–3.5s acceptance window
    let written = output.inner.written_len();
    assert!(
        (36_000..=84_000).contains(&written),
        "expected 1.5s-3.5s of 24kHz audio, got {} samples",
        written
    );

    // End of clip to first synthesized sample stays inside the budget
    let clip_end = last_speech_read.lock().unwrap().expect("no speech was read");
    let first_sample = output.first_write.lock().unwrap().expect("no audio written");
    let latency = first_sample.duration_since(clip_end);
    assert!(
        latency <= Duration::from_millis(800),
        "end-to-end latency {}ms exceeds the 800ms budget",
        latency.as_millis()
    );

    assert_eq!(handle.mode(), PipelineMode::Active);
    handle.stop().await;
}

#[tokio::test]
async fn back_to_back_utterances_keep_order_and_sequences() {
    let clip = MockAudioInput::new().with_frame_sequence(vec![
        speech_phase(34), // ~1s
        silence_phase(17), // ~500ms
        speech_phase(34),
        silence_phase(20),
    ]);

    let recognizer = MockRecognizer::new()
        .with_final("primera frase")
        .with_final("segunda frase");
    let translator = MockTranslator::new()
        .with_translation("primera frase", "first sentence")
        .with_translation("segunda frase", "second sentence");
    let synthesizer = MockSynthesizer::new();
    let synthesizer_probe = synthesizer.clone();
    let output = MockAudioOutput::new();

    let handle = PipelineBuilder::new(test_config())
        .with_input(Box::new(clip))
        .with_output(Box::new(output.clone()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(recognizer))
        .with_translator(Arc::new(translator))
        .with_synthesizer(Arc::new(synthesizer))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();
    let mut events = handle.subscribe_events();

    let first = next_completion(&mut events, Duration::from_secs(10)).await;
    let second = next_completion(&mut events, Duration::from_secs(10)).await;

    assert_eq!(first.sequence, 0);
    assert_eq!(first.translated_text, "first sentence");
    assert_eq!(second.sequence, 1);
    assert_eq!(second.translated_text, "second sentence");

    // One subsession per utterance, opened strictly in order
    assert_eq!(synthesizer_probe.stream_count(), 2);
    assert_eq!(
        synthesizer_probe.synthesized_texts(),
        vec!["first sentence", "second sentence"]
    );
    handle.stop().await;
}

#[tokio::test]
async fn long_speech_splits_at_max_utterance_without_frame_loss() {
    let mut config = test_config();
    config.vad.max_utterance_ms = 900; // 30 frames

    // 2 seconds of continuous speech, no pauses
    let clip = MockAudioInput::new().with_frame_sequence(vec![
        speech_phase(67),
        silence_phase(20),
    ]);

    let handle = PipelineBuilder::new(config)
        .with_input(Box::new(clip))
        .with_output(Box::new(MockAudioOutput::new()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(MockRecognizer::new()))
        .with_translator(Arc::new(MockTranslator::new()))
        .with_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();
    let mut events = handle.subscribe_events();

    // The forced splits and the silence-terminated tail each complete
    let first = next_completion(&mut events, Duration::from_secs(10)).await;
    let second = next_completion(&mut events, Duration::from_secs(10)).await;
    let third = next_completion(&mut events, Duration::from_secs(10)).await;
    assert_eq!(first.sequence, 0);
    assert_eq!(second.sequence, 1);
    assert_eq!(third.sequence, 2);

    handle.stop().await;
}

#[tokio::test]
async fn silence_produces_no_utterances_and_clean_metrics() {
    let mut config = test_config();
    config.pipeline.metrics_interval_secs = 1;

    let silence = MockAudioInput::new().with_samples(vec![0i16; FRAME]);
    let output = MockAudioOutput::new();

    let handle = PipelineBuilder::new(config)
        .with_input(Box::new(silence))
        .with_output(Box::new(output.clone()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(MockRecognizer::new()))
        .with_translator(Arc::new(MockTranslator::new()))
        .with_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .build()
        .unwrap()
        .start()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let metrics = handle.metrics();
    assert_eq!(metrics.utterances_completed, 0);
    assert_eq!(metrics.total_errors(), 0);
    for stage in &metrics.stages {
        assert_eq!(stage.queue_depth, 0, "stage {} has queued records", stage.name);
    }

    // Metrics keep ticking even though nothing flows
    assert!(metrics.uptime >= Duration::from_secs(1));
    assert_eq!(output.written_len(), 0);
    assert_eq!(handle.mode(), PipelineMode::Active);
    handle.stop().await;
}

#[tokio::test]
async fn recognizer_outage_enters_passthrough_with_source_audio() {
    let mut config = test_config();
    // Continuous speech must still produce utterances promptly
    config.vad.max_utterance_ms = 300;
    config.pipeline.metrics_interval_secs = 1;

    let speech = MockAudioInput::new().with_samples(vec![SPEECH_AMPLITUDE; FRAME]);
    let output = MockAudioOutput::new();

    let recognizer = MockRecognizer::new().with_connection_refused();

    let handle = PipelineBuilder::new(config)
        .with_input(Box::new(speech))
        .with_output(Box::new(output.clone()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(recognizer))
        .with_translator(Arc::new(MockTranslator::new()))
        .with_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_retry_schedule(fast_backoff())
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();

    let mut mode = handle.mode_watch();
    let entered = wait_for_mode(
        &mut mode,
        |m| m.is_passthrough(),
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(
        entered,
        PipelineMode::Passthrough(PassthroughReason::Failure(Stage::Stt))
    );

    // Source audio now reaches the output, resampled from 16kHz
    let before = output.written_len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = output.written_len();
    assert!(after > before, "passthrough audio is not flowing");

    // The metrics snapshot eventually reports the passthrough reason
    let metrics_budget = Instant::now() + Duration::from_secs(5);
    loop {
        if handle.metrics().mode == entered {
            break;
        }
        assert!(
            Instant::now() < metrics_budget,
            "metrics never reported passthrough"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    handle.stop().await;
}

#[tokio::test]
async fn synthesizer_partial_outage_degrades_then_recovers() {
    let clip = MockAudioInput::new().with_frame_sequence(vec![
        speech_phase(10),
        silence_phase(10),
        speech_phase(10),
        silence_phase(10),
        speech_phase(10),
        silence_phase(20),
    ]);

    let recognizer = MockRecognizer::new()
        .with_final("uno")
        .with_final("dos")
        .with_final("tres");
    let translator = MockTranslator::new()
        .with_translation("uno", "one")
        .with_translation("dos", "two")
        .with_translation("tres", "three");

    // Sequences 0 and 1 fail every primary path: the initial subsession,
    // three chain retries and the one-shot, twice over. Sequence 2 streams.
    let primary = MockSynthesizer::new()
        .with_stream_failures(8)
        .with_oneshot_failures(2);
    let alternate = MockSynthesizer::new();
    let alternate_probe = alternate.clone();

    let handle = PipelineBuilder::new(test_config())
        .with_input(Box::new(clip))
        .with_output(Box::new(MockAudioOutput::new()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(recognizer))
        .with_translator(Arc::new(translator))
        .with_synthesizer(Arc::new(primary))
        .with_alternate_synthesizer(Arc::new(alternate))
        .with_retry_schedule(fast_backoff())
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();
    let mut events = handle.subscribe_events();
    let mut mode = handle.mode_watch();

    // No sequence is lost
    let first = next_completion(&mut events, Duration::from_secs(10)).await;
    let second = next_completion(&mut events, Duration::from_secs(10)).await;
    let third = next_completion(&mut events, Duration::from_secs(10)).await;
    assert_eq!(
        (first.sequence, second.sequence, third.sequence),
        (0, 1, 2)
    );

    // The first two were served by the alternate voice
    assert_eq!(alternate_probe.oneshot_count(), 2);
    assert_eq!(alternate_probe.synthesized_texts(), vec!["one", "two"]);

    // Degraded while the alternate served, active again after recovery
    let recovered = wait_for_mode(
        &mut mode,
        |m| m == PipelineMode::Active,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(recovered, PipelineMode::Active);

    handle.stop().await;
}

#[tokio::test]
async fn stop_completes_work_already_committed_to_channels() {
    // Three quick utterances land in the VAD → STT channel faster than the
    // recognizer clears them; stopping mid-backlog must still deliver all
    // three, because records committed to a channel are never dropped by
    // shutdown.
    let clip = MockAudioInput::new().with_frame_sequence(vec![
        speech_phase(10),
        silence_phase(4),
        speech_phase(10),
        silence_phase(4),
        speech_phase(10),
        silence_phase(5000), // keep the device alive until stop()
    ]);

    let recognizer = MockRecognizer::new()
        .with_final("uno")
        .with_final("dos")
        .with_final("tres")
        .with_delay(Duration::from_millis(150));
    let translator = MockTranslator::new()
        .with_translation("uno", "one")
        .with_translation("dos", "two")
        .with_translation("tres", "three");

    let handle = PipelineBuilder::new(test_config())
        .with_input(Box::new(clip))
        .with_output(Box::new(MockAudioOutput::new()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(recognizer))
        .with_translator(Arc::new(translator))
        .with_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();
    let mut events = handle.subscribe_events();

    // Long enough for every utterance to be queued, short enough that the
    // recognizer backlog is still being worked through
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.stop().await;

    // After stop() the event channel is closed; whatever was broadcast
    // during the drain is still buffered
    let mut completed = Vec::new();
    while let Ok(event) = events.recv().await {
        if let HealthEvent::UtteranceComplete(entry) = event {
            completed.push(entry.sequence);
        }
    }

    assert_eq!(
        completed,
        vec![0, 1, 2],
        "utterances buffered at shutdown were dropped"
    );
}

#[tokio::test]
async fn session_log_records_finalized_utterances() {
    let dir = tempfile::TempDir::new().unwrap();
    let template = dir
        .path()
        .join("session-{start}.jsonl")
        .to_string_lossy()
        .to_string();

    let mut config = test_config();
    config.pipeline.session_log_path = Some(template);

    let clip = MockAudioInput::new().with_frame_sequence(vec![
        speech_phase(10),
        silence_phase(20),
    ]);

    let handle = PipelineBuilder::new(config)
        .with_input(Box::new(clip))
        .with_output(Box::new(MockAudioOutput::new()))
        .with_detector(Box::new(EnergyDetector::new()))
        .with_recognizer(Arc::new(MockRecognizer::new().with_final("apunte")))
        .with_translator(Arc::new(MockTranslator::new().with_translation("apunte", "note")))
        .with_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_alternate_synthesizer(Arc::new(MockSynthesizer::new()))
        .with_capture_poll(Duration::from_millis(2))
        .build()
        .unwrap()
        .start()
        .unwrap();
    let mut events = handle.subscribe_events();

    let _ = next_completion(&mut events, Duration::from_secs(10)).await;
    handle.stop().await;

    let log_file = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("session-"))
        .expect("no session log written");

    let contents = std::fs::read_to_string(log_file.path()).unwrap();
    let entry: voicebridge::pipeline::SessionEntry =
        serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(entry.sequence, 0);
    assert_eq!(entry.original_text, "apunte");
    assert_eq!(entry.translated_text, "note");
}
