//! Frame-level speech probability detection.
//!
//! The pipeline treats the detector as an interface: anything that maps a
//! 30ms PCM frame to a speech probability in [0, 1] can drive utterance
//! segmentation. The built-in implementation is energy-based; a neural
//! detector with the same signature slots in without touching the pipeline.

/// Maps one audio frame to a speech probability.
pub trait SpeechDetector: Send {
    /// Returns the probability in [0.0, 1.0] that the frame contains speech.
    fn probability(&mut self, frame: &[i16]) -> f32;
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}

/// Energy-based speech detector.
///
/// Maps frame RMS through a soft knee centered on `reference_rms`, so a
/// frame at the reference level scores 0.5 and louder frames approach 1.0.
/// Tuned for typical microphone input where speech RMS sits well above the
/// noise floor.
pub struct EnergyDetector {
    reference_rms: f32,
}

impl EnergyDetector {
    /// Creates a detector with the default reference level.
    pub fn new() -> Self {
        Self::with_reference(0.03)
    }

    /// Creates a detector centered on a custom reference RMS.
    pub fn with_reference(reference_rms: f32) -> Self {
        Self {
            reference_rms: reference_rms.max(1e-6),
        }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechDetector for EnergyDetector {
    fn probability(&mut self, frame: &[i16]) -> f32 {
        let rms = calculate_rms(frame);
        // rms == reference → 0.5; saturates toward 1.0 for loud frames
        (rms / (rms + self.reference_rms)).clamp(0.0, 1.0)
    }
}

/// Detector that replays a scripted probability sequence, for tests.
pub struct ScriptedDetector {
    script: Vec<f32>,
    index: usize,
}

impl ScriptedDetector {
    /// Returns the scripted values in order, then repeats the last one.
    pub fn new(script: Vec<f32>) -> Self {
        Self { script, index: 0 }
    }
}

impl SpeechDetector for ScriptedDetector {
    fn probability(&mut self, _frame: &[i16]) -> f32 {
        let value = self
            .script
            .get(self.index)
            .or_else(|| self.script.last())
            .copied()
            .unwrap_or(0.0);
        if self.index < self.script.len() {
            self.index += 1;
        }
        value
    }
}
