//! Health events and pipeline mode.
//!
//! Stations never short-circuit each other: failures they cannot absorb
//! become typed events on the health channel, and the orchestrator alone
//! decides mode transitions.

use crate::pipeline::session_log::SessionEntry;

/// Pipeline stage identifiers, used in health events and passthrough
/// reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capture,
    Vad,
    Stt,
    Translator,
    Tts,
    Output,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Vad => "vad",
            Stage::Stt => "stt",
            Stage::Translator => "translator",
            Stage::Tts => "tts",
            Stage::Output => "output",
        }
    }
}

/// Why the pipeline is in passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Forced on by configuration.
    Forced,
    /// A fatal failure in the named stage.
    Failure(Stage),
}

/// Current pipeline mode, owned and published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// All stages healthy.
    Active,
    /// A non-fatal fallback is engaged; translated audio still flows.
    Degraded,
    /// Captured audio routes directly to output, remote stages idle.
    Passthrough(PassthroughReason),
}

impl PipelineMode {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, PipelineMode::Passthrough(_))
    }
}

/// Events stations report to the orchestrator.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// A failure the stage cannot absorb; triggers passthrough for the
    /// remote stages.
    Fatal { stage: Stage, error: String },
    /// A fallback path engaged (alternate synthesizer, silence
    /// substitution); the pipeline still delivers audio.
    FallbackEngaged { stage: Stage, detail: String },
    /// The stage's primary path succeeded again after a fallback.
    PrimaryRecovered { stage: Stage },
    /// A stabilized interim transcript was forwarded, and the recognizer's
    /// later final differed. The first rendering stands; no re-synthesis.
    Correction {
        sequence: u64,
        forwarded: String,
        corrected: String,
    },
    /// An utterance was dropped with cause, so no loss is silent.
    UtteranceDropped {
        stage: Stage,
        sequence: u64,
        reason: String,
    },
    /// An utterance made it all the way to synthesized audio.
    UtteranceComplete(SessionEntry),
}
