//! Error types for voicebridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceBridgeError {
    // Configuration errors: fatal at startup, never seen in steady state
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio device errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio playback failed: {message}")]
    AudioPlayback { message: String },

    // Transport errors against remote services, retriable within a stage
    #[error("{service} connection failed: {message}")]
    Connection { service: &'static str, message: String },

    #[error("{service} transport error: {message}")]
    Transport { service: &'static str, message: String },

    #[error("{service} protocol error: {message}")]
    Protocol { service: &'static str, message: String },

    // Semantic rejections from remote services
    #[error("{service} authentication rejected: {message}")]
    Auth { service: &'static str, message: String },

    #[error("{service} rate limited: {message}")]
    RateLimited { service: &'static str, message: String },

    // Deadline breaches, measured from the utterance origin
    #[error("{service} deadline exceeded after {elapsed_ms}ms")]
    Timeout { service: &'static str, elapsed_ms: u64 },

    // Pipeline orchestration errors
    #[error("Pipeline error: {message}")]
    Pipeline { message: String },

    // General I/O errors (session log, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceBridgeError {
    /// True when the error is worth retrying within a stage's backoff budget.
    ///
    /// Authentication rejections and configuration errors are never retried;
    /// rate limits retry on a longer schedule handled by the caller.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            VoiceBridgeError::Connection { .. }
                | VoiceBridgeError::Transport { .. }
                | VoiceBridgeError::Protocol { .. }
                | VoiceBridgeError::RateLimited { .. }
        )
    }

    /// True when the error must take the pipeline to passthrough.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceBridgeError::Auth { .. })
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoiceBridgeError>;
