//! The streaming pipeline core.
//!
//! Six stations connected by bounded channels, supervised by the
//! orchestrator:
//!
//! Capture → VAD → STT → Translator → TTS → Output

pub mod capture_station;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod output_station;
pub mod ring;
pub mod session_log;
pub mod stt_station;
pub mod translator_station;
pub mod tts_station;
pub mod types;
pub mod vad_station;

pub use health::{HealthEvent, PassthroughReason, PipelineMode, Stage};
pub use metrics::{PipelineMetrics, StageSnapshot, StageStats};
pub use orchestrator::{Pipeline, PipelineBuilder, PipelineHandle};
pub use session_log::{SessionEntry, SessionLog};
pub use types::{AudioFrame, SynthChunk, Transcript, Translation, Utterance};
