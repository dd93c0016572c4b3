//! Capture station: polls the input device and emits fixed 30ms frames.
//!
//! Never blocks on downstream: the capture → VAD channel drops its oldest
//! frame under backpressure, because stale audio is useless for real-time
//! interpretation. In passthrough mode frames route directly to the output
//! station instead.

use crate::audio::device::AudioInput;
use crate::audio::pcm;
use crate::clock::Clock;
use crate::defaults;
use crate::pipeline::health::{HealthEvent, PipelineMode, Stage};
use crate::pipeline::metrics::StageStats;
use crate::pipeline::ring::SlidingSender;
use crate::pipeline::types::AudioFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub struct CaptureStation {
    input: Box<dyn AudioInput>,
    gain: f32,
    clock: Arc<dyn Clock>,
    stats: Arc<StageStats>,
    health: mpsc::Sender<HealthEvent>,
    poll_interval: Duration,
}

impl CaptureStation {
    pub fn new(
        input: Box<dyn AudioInput>,
        gain: f32,
        clock: Arc<dyn Clock>,
        stats: Arc<StageStats>,
        health: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            input,
            gain,
            clock,
            stats,
            health,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Overrides the device poll cadence (tests use a faster tick).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs until shutdown or source exhaustion. Dropping the senders on
    /// exit closes the downstream channels.
    pub async fn run(
        mut self,
        frames: SlidingSender<AudioFrame>,
        passthrough: SlidingSender<AudioFrame>,
        mode: watch::Receiver<PipelineMode>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.input.start() {
            tracing::error!(error = %e, "input device failed to open");
            let _ = self
                .health
                .send(HealthEvent::Fatal {
                    stage: Stage::Capture,
                    error: e.to_string(),
                })
                .await;
            return;
        }

        let mut pending: Vec<i16> = Vec::new();
        let mut sequence: u64 = 0;
        let mut reported_fatal = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.input.read_samples() {
                Ok(samples) if samples.is_empty() && self.input.is_finite() => {
                    // Pre-recorded source exhausted: flush the remainder as a
                    // short final frame, then close downstream.
                    if !pending.is_empty() {
                        let remainder = std::mem::take(&mut pending);
                        sequence = self.emit(remainder, sequence, &frames, &passthrough, &mode);
                    }
                    break;
                }
                Ok(mut samples) => {
                    reported_fatal = false;
                    pcm::apply_gain(&mut samples, self.gain);
                    pending.extend_from_slice(&samples);

                    while pending.len() >= defaults::FRAME_SAMPLES {
                        let frame_samples: Vec<i16> =
                            pending.drain(..defaults::FRAME_SAMPLES).collect();
                        sequence =
                            self.emit(frame_samples, sequence, &frames, &passthrough, &mode);
                    }
                }
                Err(e) => {
                    // One automatic reopen attempt; a second failure
                    // escalates to the orchestrator.
                    tracing::warn!(error = %e, "input device read failed, reopening");
                    let reopened = self.input.stop().is_ok() && self.input.start().is_ok();
                    if !reopened && !reported_fatal {
                        self.stats.add_error();
                        reported_fatal = true;
                        let _ = self
                            .health
                            .send(HealthEvent::Fatal {
                                stage: Stage::Capture,
                                error: e.to_string(),
                            })
                            .await;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    // A vanished handle can never stop us later; treat it
                    // like a shutdown request
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = self.input.stop();
    }

    fn emit(
        &self,
        samples: Vec<i16>,
        sequence: u64,
        frames: &SlidingSender<AudioFrame>,
        passthrough: &SlidingSender<AudioFrame>,
        mode: &watch::Receiver<PipelineMode>,
    ) -> u64 {
        let frame = AudioFrame::new(samples, self.clock.now(), sequence);

        if mode.borrow().is_passthrough() {
            passthrough.send(frame);
        } else {
            frames.send(frame);
        }

        self.stats.add_processed();
        self.stats.set_dropped(frames.dropped());
        sequence + 1
    }
}
