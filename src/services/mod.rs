//! Remote service clients: recognizer, translator, synthesizer.
//!
//! Each service is a trait pair (client + session/stream) so the pipeline
//! stations never depend on a vendor. The vendor implementations live next
//! to the traits; mocks for tests live with the traits as well.

pub mod backoff;
pub mod deepgram;
pub mod elevenlabs;
pub mod openai;
pub mod stt;
pub mod translate;
pub mod tts;

pub use backoff::Backoff;
pub use deepgram::DeepgramRecognizer;
pub use elevenlabs::ElevenLabsSynthesizer;
pub use openai::{OpenAiSpeech, OpenAiTranslator};
pub use stt::{MockRecognizer, RecognizerClient, RecognizerSession, SttResult, WordTiming};
pub use translate::{MockTranslator, TokenStream, TranslatorClient};
pub use tts::{MockSynthesizer, SynthAudio, SynthSession, SynthesizerClient};
