//! voicebridge - real-time spoken-language interpretation.
//!
//! Captures microphone audio in one language and emits synthesized speech
//! of the translation through a virtual audio device, composing streaming
//! recognition, translation and voice-cloned synthesis with local voice
//! activity detection under a sub-second latency budget.

pub mod audio;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod error;
pub mod pipeline;
pub mod services;
pub mod vad;

pub use config::Config;
pub use error::{Result, VoiceBridgeError};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle, PipelineMode};
