use crate::defaults;
use crate::error::{Result, VoiceBridgeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub credentials: CredentialsConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub recognizer: RecognizerConfig,
    pub translator: TranslatorConfig,
    pub synthesizer: SynthesizerConfig,
    pub pipeline: PipelineConfig,
}

/// API credentials for the three remote services.
///
/// All keys are required; `validate()` rejects empty values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CredentialsConfig {
    pub recognizer_key: String,
    pub translator_key: String,
    pub synthesizer_key: String,
}

/// Audio capture and output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device identifier (None = system default).
    pub input_device: Option<String>,
    /// Output device identifier (None = system default).
    pub output_device: Option<String>,
    /// Linear gain applied per captured sample, saturating at i16 range.
    pub input_gain: f32,
    /// Output jitter buffer size in milliseconds.
    pub output_buffer_ms: u32,
    /// Discard output audio while preserving channel semantics.
    pub silent_output: bool,
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    /// Speech probability threshold (0.0 to 1.0).
    pub threshold: f32,
    /// Minimum speech duration before an utterance is valid (ms).
    pub min_speech_ms: u32,
    /// Trailing silence that ends an utterance (ms).
    pub min_silence_ms: u32,
    /// Padding retained around speech segments (ms).
    pub pad_ms: u32,
    /// Maximum utterance duration before a forced split (ms).
    pub max_utterance_ms: u32,
}

/// Streaming recognizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Source language code, e.g. "es".
    pub language: String,
    /// Recognizer model identifier.
    pub model: String,
    /// Service-side endpointing threshold (ms); kept equal to
    /// `vad.min_silence_ms` so both sides agree on utterance boundaries.
    pub endpointing_ms: u32,
    /// Service-side utterance-end timeout (ms).
    pub utterance_end_ms: u32,
}

/// Streaming translator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Translation model identifier.
    pub model: String,
    /// Sampling temperature (0.0 to 2.0).
    pub temperature: f32,
    /// Token cap per translation request.
    pub max_tokens: u32,
    /// System instruction sent with every request.
    pub system_prompt: String,
}

/// Streaming synthesizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesizerConfig {
    /// Cloned voice identifier. Required.
    pub voice_id: String,
    /// Synthesis model identifier.
    pub model: String,
    /// Voice stability (0.0 to 1.0).
    pub stability: f32,
    /// Voice similarity boost (0.0 to 1.0).
    pub similarity: f32,
    /// Style exaggeration (0.0 to 1.0).
    pub style: f32,
    /// Latency optimization preset (0 to 4, higher = lower latency).
    pub latency_preset: u8,
    /// Non-cloned voice used by the alternate synthesizer fallback.
    pub fallback_voice: String,
}

/// Pipeline-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Force passthrough mode from startup.
    pub force_passthrough: bool,
    /// Metrics snapshot interval in seconds.
    pub metrics_interval_secs: u64,
    /// Session transcript log path template; `{start}` is replaced with the
    /// pipeline start time. None disables the log.
    pub session_log_path: Option<String>,
}

/// Default system instruction for the translator.
///
/// Mirrors the interpreter contract: translate only, keep proper nouns and
/// in-lexicon technical terms, match register, no meta-commentary.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a real-time interpreter translating spoken Spanish to English.
Translate the spoken text to natural, conversational English.
Do NOT translate proper nouns (names, company names, products).
Preserve technical terms already used in English in the source.
Match the speaker's formality register.
Output ONLY the English translation, with no explanations or commentary.";

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            input_gain: 1.0,
            output_buffer_ms: defaults::OUTPUT_BUFFER_MS,
            silent_output: false,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            min_speech_ms: defaults::MIN_SPEECH_MS,
            min_silence_ms: defaults::MIN_SILENCE_MS,
            pad_ms: defaults::SPEECH_PAD_MS,
            max_utterance_ms: defaults::MAX_UTTERANCE_MS,
        }
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            language: "es".to_string(),
            model: "nova-2".to_string(),
            endpointing_ms: defaults::MIN_SILENCE_MS,
            utterance_end_ms: 1000,
        }
    }
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_tokens: 500,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            model: "eleven_turbo_v2_5".to_string(),
            stability: 0.5,
            similarity: 0.8,
            style: 0.0,
            latency_preset: 3,
            fallback_voice: "onyx".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            force_passthrough: false,
            metrics_interval_secs: defaults::METRICS_INTERVAL_SECS,
            session_log_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOICEBRIDGE_RECOGNIZER_KEY → credentials.recognizer_key
    /// - VOICEBRIDGE_TRANSLATOR_KEY → credentials.translator_key
    /// - VOICEBRIDGE_SYNTHESIZER_KEY → credentials.synthesizer_key
    /// - VOICEBRIDGE_VOICE_ID → synthesizer.voice_id
    /// - VOICEBRIDGE_INPUT_DEVICE → audio.input_device
    /// - VOICEBRIDGE_OUTPUT_DEVICE → audio.output_device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("VOICEBRIDGE_RECOGNIZER_KEY")
            && !key.is_empty()
        {
            self.credentials.recognizer_key = key;
        }

        if let Ok(key) = std::env::var("VOICEBRIDGE_TRANSLATOR_KEY")
            && !key.is_empty()
        {
            self.credentials.translator_key = key;
        }

        if let Ok(key) = std::env::var("VOICEBRIDGE_SYNTHESIZER_KEY")
            && !key.is_empty()
        {
            self.credentials.synthesizer_key = key;
        }

        if let Ok(voice) = std::env::var("VOICEBRIDGE_VOICE_ID")
            && !voice.is_empty()
        {
            self.synthesizer.voice_id = voice;
        }

        if let Ok(device) = std::env::var("VOICEBRIDGE_INPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        if let Ok(device) = std::env::var("VOICEBRIDGE_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.output_device = Some(device);
        }

        self
    }

    /// Validates every range-bound and required option.
    ///
    /// Called once at pipeline construction; configuration errors never
    /// surface in steady state.
    pub fn validate(&self) -> Result<()> {
        fn required(key: &'static str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(VoiceBridgeError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be a non-empty string".to_string(),
                });
            }
            Ok(())
        }

        fn in_range(key: &'static str, value: f32, lo: f32, hi: f32) -> Result<()> {
            if !(lo..=hi).contains(&value) {
                return Err(VoiceBridgeError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("must be within [{lo}, {hi}], got {value}"),
                });
            }
            Ok(())
        }

        required("credentials.recognizer_key", &self.credentials.recognizer_key)?;
        required("credentials.translator_key", &self.credentials.translator_key)?;
        required("credentials.synthesizer_key", &self.credentials.synthesizer_key)?;
        required("synthesizer.voice_id", &self.synthesizer.voice_id)?;

        in_range("audio.input_gain", self.audio.input_gain, 0.0, 2.0)?;
        in_range("vad.threshold", self.vad.threshold, 0.0, 1.0)?;
        in_range("translator.temperature", self.translator.temperature, 0.0, 2.0)?;
        in_range("synthesizer.stability", self.synthesizer.stability, 0.0, 1.0)?;
        in_range("synthesizer.similarity", self.synthesizer.similarity, 0.0, 1.0)?;
        in_range("synthesizer.style", self.synthesizer.style, 0.0, 1.0)?;

        if self.synthesizer.latency_preset > 4 {
            return Err(VoiceBridgeError::ConfigInvalidValue {
                key: "synthesizer.latency_preset".to_string(),
                message: format!(
                    "must be within [0, 4], got {}",
                    self.synthesizer.latency_preset
                ),
            });
        }

        if self.vad.min_speech_ms == 0 || self.vad.max_utterance_ms <= self.vad.min_speech_ms {
            return Err(VoiceBridgeError::ConfigInvalidValue {
                key: "vad.max_utterance_ms".to_string(),
                message: "must exceed vad.min_speech_ms".to_string(),
            });
        }

        Ok(())
    }
}

/// A config with test credentials filled in, used across unit tests.
#[cfg(test)]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.credentials.recognizer_key = "dg-test".to_string();
    config.credentials.translator_key = "oa-test".to_string();
    config.credentials.synthesizer_key = "el-test".to_string();
    config.synthesizer.voice_id = "voice-test".to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_voicebridge_env() {
        remove_env("VOICEBRIDGE_RECOGNIZER_KEY");
        remove_env("VOICEBRIDGE_TRANSLATOR_KEY");
        remove_env("VOICEBRIDGE_SYNTHESIZER_KEY");
        remove_env("VOICEBRIDGE_VOICE_ID");
        remove_env("VOICEBRIDGE_INPUT_DEVICE");
        remove_env("VOICEBRIDGE_OUTPUT_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.audio.input_device, None);
        assert_eq!(config.audio.input_gain, 1.0);
        assert_eq!(config.audio.output_buffer_ms, 50);
        assert!(!config.audio.silent_output);

        assert_eq!(config.vad.threshold, 0.5);
        assert_eq!(config.vad.min_speech_ms, 250);
        assert_eq!(config.vad.min_silence_ms, 300);
        assert_eq!(config.vad.pad_ms, 100);
        assert_eq!(config.vad.max_utterance_ms, 15_000);

        assert_eq!(config.recognizer.language, "es");
        assert_eq!(config.recognizer.model, "nova-2");
        assert_eq!(config.recognizer.endpointing_ms, 300);

        assert_eq!(config.translator.model, "gpt-4o-mini");
        assert_eq!(config.translator.temperature, 0.3);
        assert_eq!(config.translator.max_tokens, 500);

        assert_eq!(config.synthesizer.model, "eleven_turbo_v2_5");
        assert_eq!(config.synthesizer.stability, 0.5);
        assert_eq!(config.synthesizer.similarity, 0.8);
        assert_eq!(config.synthesizer.latency_preset, 3);
        assert_eq!(config.synthesizer.fallback_voice, "onyx");

        assert!(!config.pipeline.force_passthrough);
        assert_eq!(config.pipeline.metrics_interval_secs, 30);
        assert!(config.pipeline.session_log_path.is_none());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [credentials]
            recognizer_key = "dg-key"
            translator_key = "oa-key"
            synthesizer_key = "el-key"

            [audio]
            input_device = "pipewire"
            input_gain = 1.5
            silent_output = true

            [vad]
            threshold = 0.6
            min_silence_ms = 400

            [synthesizer]
            voice_id = "abc123"
            stability = 0.7
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.credentials.recognizer_key, "dg-key");
        assert_eq!(config.audio.input_device, Some("pipewire".to_string()));
        assert_eq!(config.audio.input_gain, 1.5);
        assert!(config.audio.silent_output);
        assert_eq!(config.vad.threshold, 0.6);
        assert_eq!(config.vad.min_silence_ms, 400);
        // Unset fields fall back to defaults
        assert_eq!(config.vad.min_speech_ms, 250);
        assert_eq!(config.synthesizer.voice_id, "abc123");
        assert_eq!(config.synthesizer.stability, 0.7);
    }

    #[test]
    fn test_load_invalid_toml_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"not = valid = toml").unwrap();
        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_voicebridge_env();

        set_env("VOICEBRIDGE_RECOGNIZER_KEY", "env-dg");
        set_env("VOICEBRIDGE_VOICE_ID", "env-voice");
        set_env("VOICEBRIDGE_INPUT_DEVICE", "env-mic");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.credentials.recognizer_key, "env-dg");
        assert_eq!(config.synthesizer.voice_id, "env-voice");
        assert_eq!(config.audio.input_device, Some("env-mic".to_string()));
        // Untouched fields keep defaults
        assert_eq!(config.credentials.translator_key, "");

        clear_voicebridge_env();
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_voicebridge_env();

        set_env("VOICEBRIDGE_RECOGNIZER_KEY", "");

        let mut config = Config::default();
        config.credentials.recognizer_key = "from-file".to_string();
        let config = config.with_env_overrides();

        assert_eq!(config.credentials.recognizer_key, "from-file");

        clear_voicebridge_env();
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let mut config = test_config();
        config.credentials.translator_key = "  ".to_string();

        match config.validate() {
            Err(VoiceBridgeError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "credentials.translator_key");
            }
            other => panic!("Expected ConfigInvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_missing_voice_id() {
        let mut config = test_config();
        config.synthesizer.voice_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_gain() {
        let mut config = test_config();
        config.audio.input_gain = 2.5;

        match config.validate() {
            Err(VoiceBridgeError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "audio.input_gain");
            }
            other => panic!("Expected ConfigInvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut config = test_config();
        config.vad.threshold = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_latency_preset() {
        let mut config = test_config();
        config.synthesizer.latency_preset = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_vad_durations() {
        let mut config = test_config();
        config.vad.max_utterance_ms = config.vad.min_speech_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip_through_toml() {
        let config = test_config();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed, config);
    }
}
