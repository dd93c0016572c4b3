//! Audio device traits and mock implementations.
//!
//! The pipeline never talks to cpal directly; stages hold these traits so
//! tests can swap in scripted devices.

use crate::error::{Result, VoiceBridgeError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Trait for audio capture devices.
///
/// Implementations deliver 16-bit PCM at 16kHz mono. `read_samples` drains
/// whatever has accumulated since the last call and never blocks.
pub trait AudioInput: Send {
    /// Start capturing audio from the device.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio and release the device.
    fn stop(&mut self) -> Result<()>;

    /// Drain captured samples. Empty result means no new audio yet for live
    /// devices, or exhaustion for finite sources.
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// True when the source ends on its own (pre-recorded test input).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Trait for audio output devices.
///
/// Implementations accept 16-bit PCM mono at `sample_rate()`; writes are
/// buffered by the device and must not block the caller for longer than the
/// buffered duration.
pub trait AudioOutputDevice: Send {
    /// Open the device and begin playback.
    fn start(&mut self) -> Result<()>;

    /// Queue samples for playback.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Drain and close the device.
    fn stop(&mut self) -> Result<()>;

    /// The rate the device actually runs at. The output stage resamples once
    /// at start when this differs from 24kHz.
    fn sample_rate(&self) -> u32;
}

/// A phase of identical frames produced by `MockAudioInput`.
#[derive(Debug, Clone)]
pub struct FramePhase {
    /// Samples returned for each read in this phase.
    pub samples: Vec<i16>,
    /// Number of reads this phase lasts.
    pub count: u32,
}

/// Mock audio input for testing.
///
/// Either repeats a fixed sample buffer forever, or plays a finite sequence
/// of phases and then reports exhaustion.
pub struct MockAudioInput {
    started: bool,
    samples: Vec<i16>,
    phases: Option<Vec<FramePhase>>,
    phase_index: usize,
    phase_reads: u32,
    fail_start: bool,
    fail_reads_after: Option<u32>,
    reads: u32,
}

impl MockAudioInput {
    /// Creates a mock input that repeats silence.
    pub fn new() -> Self {
        Self {
            started: false,
            samples: vec![0i16; 480],
            phases: None,
            phase_index: 0,
            phase_reads: 0,
            fail_start: false,
            fail_reads_after: None,
            reads: 0,
        }
    }

    /// Repeats the given samples on every read.
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Plays the given phases in order, then reports exhaustion.
    pub fn with_frame_sequence(mut self, phases: Vec<FramePhase>) -> Self {
        self.phases = Some(phases);
        self
    }

    /// Makes `start` fail.
    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Makes every read after the given count fail.
    pub fn with_read_failure_after(mut self, reads: u32) -> Self {
        self.fail_reads_after = Some(reads);
        self
    }
}

impl Default for MockAudioInput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioInput for MockAudioInput {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(VoiceBridgeError::AudioCapture {
                message: "mock start failure".to_string(),
            });
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        self.reads += 1;
        if let Some(after) = self.fail_reads_after
            && self.reads > after
        {
            return Err(VoiceBridgeError::AudioCapture {
                message: "mock read failure".to_string(),
            });
        }

        match &self.phases {
            None => Ok(self.samples.clone()),
            Some(phases) => {
                while self.phase_index < phases.len() {
                    let phase = &phases[self.phase_index];
                    if self.phase_reads < phase.count {
                        self.phase_reads += 1;
                        return Ok(phase.samples.clone());
                    }
                    self.phase_index += 1;
                    self.phase_reads = 0;
                }
                // Sequence exhausted
                Ok(Vec::new())
            }
        }
    }

    fn is_finite(&self) -> bool {
        self.phases.is_some()
    }
}

/// Mock audio output that collects everything written to it.
#[derive(Clone)]
pub struct MockAudioOutput {
    written: Arc<Mutex<VecDeque<i16>>>,
    sample_rate: u32,
    started: Arc<Mutex<bool>>,
    fail_start: bool,
}

impl MockAudioOutput {
    /// Creates a mock output running at 24kHz.
    pub fn new() -> Self {
        Self::with_sample_rate(24_000)
    }

    /// Creates a mock output reporting a specific device rate.
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            written: Arc::new(Mutex::new(VecDeque::new())),
            sample_rate,
            started: Arc::new(Mutex::new(false)),
            fail_start: false,
        }
    }

    /// Makes `start` fail.
    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Returns everything written so far.
    pub fn written_samples(&self) -> Vec<i16> {
        self.written.lock().unwrap().iter().copied().collect()
    }

    /// Number of samples written so far.
    pub fn written_len(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

impl Default for MockAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutputDevice for MockAudioOutput {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(VoiceBridgeError::AudioPlayback {
                message: "mock start failure".to_string(),
            });
        }
        *self.started.lock().unwrap() = true;
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.written.lock().unwrap().extend(samples.iter().copied());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        *self.started.lock().unwrap() = false;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
