//! Pipeline orchestrator: builds the stations, wires the channels, and
//! supervises the run.
//!
//! A single builder constructs all stages and returns a sealed pipeline;
//! wiring never mutates afterwards. Startup is downstream-first so readers
//! exist before writers; shutdown reverses it by cascading channel closure
//! from capture down.

use crate::audio::capture::CpalInput;
use crate::audio::device::{AudioInput, AudioOutputDevice};
use crate::audio::playback::CpalOutput;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::defaults;
use crate::error::Result;
use crate::pipeline::capture_station::CaptureStation;
use crate::pipeline::health::{HealthEvent, PassthroughReason, PipelineMode, Stage};
use crate::pipeline::metrics::{PipelineMetrics, StageStats};
use crate::pipeline::output_station::OutputStation;
use crate::pipeline::ring::{DepthProbe, sliding_channel};
use crate::pipeline::session_log::SessionLog;
use crate::pipeline::stt_station::SttStation;
use crate::pipeline::translator_station::TranslatorStation;
use crate::pipeline::tts_station::TtsStation;
use crate::pipeline::types::{AudioFrame, SynthChunk, Transcript, Translation, Utterance};
use crate::pipeline::vad_station::VadStation;
use crate::services::backoff::Backoff;
use crate::services::deepgram::DeepgramRecognizer;
use crate::services::elevenlabs::ElevenLabsSynthesizer;
use crate::services::openai::{OpenAiSpeech, OpenAiTranslator};
use crate::services::stt::RecognizerClient;
use crate::services::translate::TranslatorClient;
use crate::services::tts::SynthesizerClient;
use crate::vad::{EnergyDetector, SpeechDetector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Builds a pipeline from configuration, with every external collaborator
/// injectable for tests.
pub struct PipelineBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    input: Option<Box<dyn AudioInput>>,
    output: Option<Box<dyn AudioOutputDevice>>,
    detector: Option<Box<dyn SpeechDetector>>,
    recognizer: Option<Arc<dyn RecognizerClient>>,
    translator: Option<Arc<dyn TranslatorClient>>,
    synthesizer: Option<Arc<dyn SynthesizerClient>>,
    alternate_synthesizer: Option<Arc<dyn SynthesizerClient>>,
    retry_schedule: Option<Backoff>,
    capture_poll: Duration,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            input: None,
            output: None,
            detector: None,
            recognizer: None,
            translator: None,
            synthesizer: None,
            alternate_synthesizer: None,
            retry_schedule: None,
            capture_poll: Duration::from_millis(10),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_input(mut self, input: Box<dyn AudioInput>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: Box<dyn AudioOutputDevice>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_detector(mut self, detector: Box<dyn SpeechDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn RecognizerClient>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn TranslatorClient>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SynthesizerClient>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_alternate_synthesizer(mut self, synthesizer: Arc<dyn SynthesizerClient>) -> Self {
        self.alternate_synthesizer = Some(synthesizer);
        self
    }

    /// Overrides the retry schedule of every remote stage (tests shrink it).
    pub fn with_retry_schedule(mut self, backoff: Backoff) -> Self {
        self.retry_schedule = Some(backoff);
        self
    }

    /// Overrides the capture poll cadence (tests speed it up).
    pub fn with_capture_poll(mut self, poll: Duration) -> Self {
        self.capture_poll = poll;
        self
    }

    /// Validates configuration and seals the pipeline.
    ///
    /// Unknown devices and out-of-range options surface here, never in
    /// steady state.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = self.config;

        let input: Box<dyn AudioInput> = match self.input {
            Some(input) => input,
            None => Box::new(CpalInput::new(config.audio.input_device.as_deref())?),
        };
        let output: Box<dyn AudioOutputDevice> = match self.output {
            Some(output) => output,
            None => Box::new(CpalOutput::new(config.audio.output_device.as_deref())?),
        };
        let detector = self
            .detector
            .unwrap_or_else(|| Box::new(EnergyDetector::new()));

        let recognizer: Arc<dyn RecognizerClient> = self.recognizer.unwrap_or_else(|| {
            Arc::new(DeepgramRecognizer::new(
                config.credentials.recognizer_key.clone(),
                config.recognizer.clone(),
            ))
        });
        let translator: Arc<dyn TranslatorClient> = self.translator.unwrap_or_else(|| {
            Arc::new(OpenAiTranslator::new(
                config.credentials.translator_key.clone(),
                config.translator.clone(),
            ))
        });
        let synthesizer: Arc<dyn SynthesizerClient> = self.synthesizer.unwrap_or_else(|| {
            Arc::new(ElevenLabsSynthesizer::new(
                config.credentials.synthesizer_key.clone(),
                config.synthesizer.clone(),
            ))
        });
        let alternate_synthesizer: Arc<dyn SynthesizerClient> =
            self.alternate_synthesizer.unwrap_or_else(|| {
                Arc::new(OpenAiSpeech::new(
                    config.credentials.translator_key.clone(),
                    config.synthesizer.fallback_voice.clone(),
                ))
            });

        Ok(Pipeline {
            config,
            clock: self.clock,
            input,
            output,
            detector,
            recognizer,
            translator,
            synthesizer,
            alternate_synthesizer,
            retry_schedule: self.retry_schedule,
            capture_poll: self.capture_poll,
        })
    }
}

/// A sealed, fully wired pipeline, ready to start.
pub struct Pipeline {
    config: Config,
    clock: Arc<dyn Clock>,
    input: Box<dyn AudioInput>,
    output: Box<dyn AudioOutputDevice>,
    detector: Box<dyn SpeechDetector>,
    recognizer: Arc<dyn RecognizerClient>,
    translator: Arc<dyn TranslatorClient>,
    synthesizer: Arc<dyn SynthesizerClient>,
    alternate_synthesizer: Arc<dyn SynthesizerClient>,
    retry_schedule: Option<Backoff>,
    capture_poll: Duration,
}

impl Pipeline {
    /// Spawns every station (downstream first) plus the supervisor, and
    /// returns the control handle.
    pub fn start(self) -> Result<PipelineHandle> {
        let pipeline_start = self.clock.now();

        let session_log = match &self.config.pipeline.session_log_path {
            Some(template) => Some(SessionLog::create(template, chrono::Local::now())?),
            None => None,
        };

        // Channels, per the backpressure table
        let (frame_tx, frame_rx) = sliding_channel::<AudioFrame>(defaults::CAPTURE_CHANNEL_FRAMES);
        let (pass_tx, pass_rx) = sliding_channel::<AudioFrame>(defaults::CAPTURE_CHANNEL_FRAMES);
        let (utterance_tx, utterance_rx) =
            mpsc::channel::<Utterance>(defaults::TEXT_CHANNEL_CAPACITY);
        let (transcript_tx, transcript_rx) =
            mpsc::channel::<Transcript>(defaults::TEXT_CHANNEL_CAPACITY);
        let (translation_tx, translation_rx) =
            mpsc::channel::<Translation>(defaults::TEXT_CHANNEL_CAPACITY);
        let (chunk_tx, chunk_rx) = sliding_channel::<SynthChunk>(defaults::SYNTH_CHANNEL_CHUNKS);

        let (health_tx, health_rx) = mpsc::channel::<HealthEvent>(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let initial_mode = if self.config.pipeline.force_passthrough {
            PipelineMode::Passthrough(PassthroughReason::Forced)
        } else {
            PipelineMode::Active
        };
        let (mode_tx, mode_rx) = watch::channel(initial_mode);
        let (metrics_tx, metrics_rx) = watch::channel(PipelineMetrics::default());
        let (event_tx, _) = broadcast::channel::<HealthEvent>(64);

        // Per-stage stats, owned by the stations, read by the supervisor
        let capture_stats = Arc::new(StageStats::new("capture"));
        let vad_stats = Arc::new(StageStats::new("vad"));
        let stt_stats = Arc::new(StageStats::new("stt"));
        let translator_stats = Arc::new(StageStats::new("translator"));
        let tts_stats = Arc::new(StageStats::new("tts"));
        let output_stats = Arc::new(StageStats::new("output"));

        let frame_probe = frame_tx.depth_probe();
        let chunk_probe = chunk_tx.depth_probe();

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // The supervisor holds clones of the text-channel senders for depth
        // reporting; it releases them the moment shutdown is signalled so
        // the closure cascade from capture can reach every stage.
        let supervisor = Supervisor {
            clock: self.clock.clone(),
            pipeline_start,
            metrics_interval: Duration::from_secs(
                self.config.pipeline.metrics_interval_secs.max(1),
            ),
            session_log,
            mode_tx,
            metrics_tx,
            event_tx: event_tx.clone(),
            recognizer: self.recognizer.clone(),
            translator: self.translator.clone(),
            synthesizer: self.synthesizer.clone(),
            stats: vec![
                capture_stats.clone(),
                vad_stats.clone(),
                stt_stats.clone(),
                translator_stats.clone(),
                tts_stats.clone(),
                output_stats.clone(),
            ],
            frame_probe,
            chunk_probe,
            utterance_probe: Some(utterance_tx.clone()),
            transcript_probe: Some(transcript_tx.clone()),
            translation_probe: Some(translation_tx.clone()),
            utterances_completed: 0,
        };
        tasks.push(tokio::spawn(supervisor.run(health_rx, shutdown_rx.clone())));

        // Stations, downstream first. Only capture watches the shutdown
        // signal; everything below it exits when its input channel closes,
        // after consuming whatever is still queued.
        let output_station = OutputStation::new(
            self.output,
            self.config.audio.silent_output,
            output_stats,
            health_tx.clone(),
        );
        tasks.push(tokio::spawn(output_station.run(chunk_rx, pass_rx)));

        let mut tts_station = TtsStation::new(
            self.synthesizer.clone(),
            self.alternate_synthesizer.clone(),
            self.clock.clone(),
            tts_stats,
            health_tx.clone(),
            pipeline_start,
        );
        if let Some(backoff) = &self.retry_schedule {
            tts_station = tts_station.with_backoff(backoff.clone());
        }
        tasks.push(tokio::spawn(tts_station.run(translation_rx, chunk_tx)));

        let mut translator_station = TranslatorStation::new(
            self.translator.clone(),
            self.clock.clone(),
            translator_stats,
            health_tx.clone(),
        );
        if let Some(backoff) = &self.retry_schedule {
            translator_station = translator_station.with_backoff(backoff.clone());
        }
        tasks.push(tokio::spawn(
            translator_station.run(transcript_rx, translation_tx),
        ));

        let mut stt_station = SttStation::new(
            self.recognizer.clone(),
            self.config.recognizer.language.clone(),
            self.clock.clone(),
            stt_stats,
            health_tx.clone(),
        );
        if let Some(backoff) = &self.retry_schedule {
            stt_station = stt_station.with_backoff(backoff.clone());
        }
        tasks.push(tokio::spawn(stt_station.run(utterance_rx, transcript_tx)));

        let vad_station = VadStation::new(self.config.vad.clone(), self.detector, vad_stats);
        tasks.push(tokio::spawn(vad_station.run(frame_rx, utterance_tx)));

        let capture_station = CaptureStation::new(
            self.input,
            self.config.audio.input_gain,
            self.clock.clone(),
            capture_stats,
            health_tx,
        )
        .with_poll_interval(self.capture_poll);
        tasks.push(tokio::spawn(capture_station.run(
            frame_tx,
            pass_tx,
            mode_rx.clone(),
            shutdown_rx,
        )));

        tracing::info!(mode = ?initial_mode, "pipeline started");

        Ok(PipelineHandle {
            shutdown_tx,
            mode_rx,
            metrics_rx,
            event_tx,
            tasks,
        })
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    mode_rx: watch::Receiver<PipelineMode>,
    metrics_rx: watch::Receiver<PipelineMetrics>,
    event_tx: broadcast::Sender<HealthEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Current pipeline mode.
    pub fn mode(&self) -> PipelineMode {
        *self.mode_rx.borrow()
    }

    /// A watch on mode transitions.
    pub fn mode_watch(&self) -> watch::Receiver<PipelineMode> {
        self.mode_rx.clone()
    }

    /// The latest metrics snapshot.
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics_rx.borrow().clone()
    }

    /// Subscribes to health events (corrections, fallbacks, completions).
    pub fn subscribe_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Stops the pipeline. Capture stops producing and closes its
    /// channels; each downstream stage then consumes what it already holds
    /// before closing its own output, so records committed to a channel
    /// are never lost to shutdown. The supervisor stays up until the last
    /// station is gone.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        tracing::info!("pipeline stopped");
    }

    /// True while any station task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}

/// Supervision loop: consumes health events, drives the mode state
/// machine, writes the session log, publishes metrics, and probes for
/// passthrough re-entry.
struct Supervisor {
    clock: Arc<dyn Clock>,
    pipeline_start: Instant,
    metrics_interval: Duration,
    session_log: Option<SessionLog>,
    mode_tx: watch::Sender<PipelineMode>,
    metrics_tx: watch::Sender<PipelineMetrics>,
    event_tx: broadcast::Sender<HealthEvent>,
    recognizer: Arc<dyn RecognizerClient>,
    translator: Arc<dyn TranslatorClient>,
    synthesizer: Arc<dyn SynthesizerClient>,
    stats: Vec<Arc<StageStats>>,
    frame_probe: DepthProbe<AudioFrame>,
    chunk_probe: DepthProbe<SynthChunk>,
    // Sender clones used only for depth readings. Held in Options so they
    // can be released at shutdown: a retained clone would keep its channel
    // open and stall the closure cascade.
    utterance_probe: Option<mpsc::Sender<Utterance>>,
    transcript_probe: Option<mpsc::Sender<Transcript>>,
    translation_probe: Option<mpsc::Sender<Translation>>,
    utterances_completed: u64,
}

impl Supervisor {
    async fn run(
        mut self,
        mut health_rx: mpsc::Receiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut metrics_tick = tokio::time::interval(self.metrics_interval);
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut probe_tick =
            tokio::time::interval(Duration::from_secs(defaults::REENTRY_PROBE_SECS));
        probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut draining = false;

        loop {
            tokio::select! {
                changed = shutdown.changed(), if !draining => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Release the depth probes so the closure cascade
                        // can reach every stage, but keep consuming health
                        // events: the stations are still draining, and
                        // their completions belong in the session log.
                        draining = true;
                        self.utterance_probe = None;
                        self.transcript_probe = None;
                        self.translation_probe = None;
                    }
                }
                maybe = health_rx.recv() => {
                    // The channel closes once the last station has exited
                    let Some(event) = maybe else { break };
                    self.handle_event(event);
                }
                _ = metrics_tick.tick() => {
                    self.publish_metrics();
                }
                _ = probe_tick.tick() => {
                    self.try_reenter_active().await;
                }
            }
        }

        self.publish_metrics();
    }

    fn handle_event(&mut self, event: HealthEvent) {
        match &event {
            HealthEvent::Fatal { stage, error } => {
                tracing::error!(stage = stage.name(), error = %error, "fatal stage failure");
                let _ = self
                    .mode_tx
                    .send(PipelineMode::Passthrough(PassthroughReason::Failure(*stage)));
            }
            HealthEvent::FallbackEngaged { stage, detail } => {
                tracing::warn!(stage = stage.name(), detail = %detail, "fallback engaged");
                if *self.mode_tx.borrow() == PipelineMode::Active {
                    let _ = self.mode_tx.send(PipelineMode::Degraded);
                }
            }
            HealthEvent::PrimaryRecovered { stage } => {
                tracing::info!(stage = stage.name(), "primary path recovered");
                if *self.mode_tx.borrow() == PipelineMode::Degraded {
                    let _ = self.mode_tx.send(PipelineMode::Active);
                }
            }
            HealthEvent::Correction {
                sequence,
                forwarded,
                corrected,
            } => {
                tracing::warn!(
                    sequence,
                    forwarded = %forwarded,
                    corrected = %corrected,
                    "late recognizer final differed from forwarded interim"
                );
            }
            HealthEvent::UtteranceDropped {
                stage,
                sequence,
                reason,
            } => {
                tracing::warn!(stage = stage.name(), sequence, reason = %reason, "utterance dropped");
            }
            HealthEvent::UtteranceComplete(entry) => {
                self.utterances_completed += 1;
                if let Some(log) = self.session_log.as_mut()
                    && let Err(e) = log.append(entry)
                {
                    tracing::warn!(error = %e, "session log write failed");
                }
            }
        }

        // Rebroadcast for observers; send fails only with no subscribers
        let _ = self.event_tx.send(event);
    }

    fn publish_metrics(&self) {
        fn depth_of<T>(tx: &Option<mpsc::Sender<T>>) -> usize {
            tx.as_ref()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0)
        }

        let depths = [
            0,
            self.frame_probe.depth(),
            depth_of(&self.utterance_probe),
            depth_of(&self.transcript_probe),
            depth_of(&self.translation_probe),
            self.chunk_probe.depth(),
        ];

        let metrics = PipelineMetrics {
            mode: *self.mode_tx.borrow(),
            uptime: self.clock.since(self.pipeline_start),
            utterances_completed: self.utterances_completed,
            stages: self
                .stats
                .iter()
                .zip(depths)
                .map(|(stats, depth)| stats.snapshot(depth))
                .collect(),
        };

        tracing::debug!(
            mode = ?metrics.mode,
            utterances = metrics.utterances_completed,
            "metrics snapshot"
        );
        let _ = self.metrics_tx.send(metrics);
    }

    /// On the re-entry cadence, probe the failed service; success returns
    /// the pipeline to active. A forced passthrough never auto-exits.
    async fn try_reenter_active(&mut self) {
        let PipelineMode::Passthrough(PassthroughReason::Failure(stage)) = *self.mode_tx.borrow()
        else {
            return;
        };

        let healthy = match stage {
            Stage::Stt => match self.recognizer.open_session().await {
                Ok(mut session) => {
                    let _ = session.close().await;
                    true
                }
                Err(_) => false,
            },
            Stage::Translator => self.translator.translate_stream("hola").await.is_ok(),
            Stage::Tts => match self.synthesizer.open_stream().await {
                Ok(mut session) => {
                    let _ = session.close().await;
                    true
                }
                Err(_) => false,
            },
            // Device failures have no cheap remote probe
            Stage::Capture | Stage::Output | Stage::Vad => false,
        };

        if healthy {
            tracing::info!(stage = stage.name(), "probe succeeded, re-entering active");
            let _ = self.mode_tx.send(PipelineMode::Active);
        } else {
            tracing::debug!(stage = stage.name(), "re-entry probe failed");
        }
    }
}
