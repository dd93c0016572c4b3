//! Output station: writes synthesized PCM to the configured device.
//!
//! The device wrapper absorbs jitter (zero-fill on underrun happens in the
//! device callback); this station handles rate conversion, anti-click
//! fades at sequence boundaries, silent mode, and the passthrough route.

use crate::audio::device::AudioOutputDevice;
use crate::audio::pcm;
use crate::defaults;
use crate::pipeline::health::{HealthEvent, Stage};
use crate::pipeline::metrics::StageStats;
use crate::pipeline::ring::SlidingReceiver;
use crate::pipeline::types::{AudioFrame, SynthChunk};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct OutputStation {
    device: Box<dyn AudioOutputDevice>,
    silent: bool,
    stats: Arc<StageStats>,
    health: mpsc::Sender<HealthEvent>,
}

impl OutputStation {
    pub fn new(
        device: Box<dyn AudioOutputDevice>,
        silent: bool,
        stats: Arc<StageStats>,
        health: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            device,
            silent,
            stats,
            health,
        }
    }

    /// Runs until both input channels close, writing whatever audio is
    /// still queued on the way out.
    pub async fn run(
        mut self,
        mut synth: SlidingReceiver<SynthChunk>,
        mut passthrough: SlidingReceiver<AudioFrame>,
    ) {
        if let Err(e) = self.device.start() {
            tracing::error!(error = %e, "output device failed to open");
            let _ = self
                .health
                .send(HealthEvent::Fatal {
                    stage: Stage::Output,
                    error: e.to_string(),
                })
                .await;
            return;
        }

        // The device rate is fixed for the session; conversion is decided
        // once here, never mid-stream.
        let device_rate = self.device.sample_rate();
        let fade_samples =
            (defaults::FADE_MS as usize * defaults::SYNTH_SAMPLE_RATE as usize) / 1000;

        let mut last_sequence: Option<u64> = None;
        let mut synth_open = true;
        let mut passthrough_open = true;

        loop {
            tokio::select! {
                chunk = synth.recv(), if synth_open => {
                    let Some(mut chunk) = chunk else {
                        synth_open = false;
                        if !passthrough_open { break; }
                        continue;
                    };

                    // Anti-click ramps, never crossing sequence boundaries
                    if last_sequence != Some(chunk.sequence) {
                        pcm::fade_in(&mut chunk.samples, fade_samples);
                        last_sequence = Some(chunk.sequence);
                    }
                    if chunk.is_final {
                        pcm::fade_out(&mut chunk.samples, fade_samples);
                    }

                    let samples = if device_rate == chunk.sample_rate {
                        chunk.samples
                    } else {
                        pcm::resample(&chunk.samples, chunk.sample_rate, device_rate)
                    };

                    if !self.silent
                        && let Err(e) = self.device.write(&samples)
                    {
                        tracing::warn!(error = %e, "output write failed");
                        self.stats.add_error();
                        continue;
                    }

                    self.stats.add_processed();
                    self.stats.record_latency(chunk.pipeline_latency);
                    self.stats.set_dropped(synth.dropped());
                }
                frame = passthrough.recv(), if passthrough_open => {
                    let Some(frame) = frame else {
                        passthrough_open = false;
                        if !synth_open { break; }
                        continue;
                    };

                    let samples = if device_rate == frame.sample_rate {
                        frame.samples
                    } else {
                        pcm::resample(&frame.samples, frame.sample_rate, device_rate)
                    };

                    if !self.silent {
                        if let Err(e) = self.device.write(&samples) {
                            tracing::warn!(error = %e, "passthrough write failed");
                            self.stats.add_error();
                        } else {
                            self.stats.add_processed();
                        }
                    } else {
                        self.stats.add_processed();
                    }
                }
            }
        }

        let _ = self.device.stop();
    }
}
