//! OpenAI-backed clients: the streaming translator and the alternate
//! (non-cloned-voice) speech fallback.

use crate::audio::pcm;
use crate::config::TranslatorConfig;
use crate::error::{Result, VoiceBridgeError};
use crate::services::translate::{TokenStream, TranslatorClient};
use crate::services::tts::{SynthAudio, SynthSession, SynthesizerClient};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const TRANSLATOR: &str = "translator";
const SPEECH: &str = "synthesizer";

fn map_status(service: &'static str, status: reqwest::StatusCode, body: String) -> VoiceBridgeError {
    match status.as_u16() {
        401 | 403 => VoiceBridgeError::Auth {
            service,
            message: format!("{status}: {body}"),
        },
        429 => VoiceBridgeError::RateLimited {
            service,
            message: body,
        },
        _ => VoiceBridgeError::Transport {
            service,
            message: format!("{status}: {body}"),
        },
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ChunkDelta {
    content: Option<String>,
}

/// Streaming chat-completion translator.
pub struct OpenAiTranslator {
    client: reqwest::Client,
    api_key: String,
    config: TranslatorConfig,
    base_url: String,
}

impl OpenAiTranslator {
    pub fn new(api_key: String, config: TranslatorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            config,
            base_url: "https://api.openai.com".to_string(),
        }
    }

    /// Points the client at a different endpoint (test servers).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl TranslatorClient for OpenAiTranslator {
    async fn translate_stream(&self, text: &str) -> Result<Box<dyn TokenStream>> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceBridgeError::Connection {
                service: TRANSLATOR,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(TRANSLATOR, status, body));
        }

        Ok(Box::new(SseTokenStream {
            bytes: Box::pin(response.bytes_stream()),
            buffer: String::new(),
            done: false,
        }))
    }
}

/// Parses server-sent `data:` lines off the chunked response body.
struct SseTokenStream {
    bytes: Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
    done: bool,
}

impl SseTokenStream {
    /// Extracts the next complete `data:` payload from the buffer.
    fn next_data_line(&mut self) -> Option<String> {
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();
            if let Some(payload) = line.strip_prefix("data:") {
                return Some(payload.trim().to_string());
            }
        }
        None
    }
}

#[async_trait]
impl TokenStream for SseTokenStream {
    async fn next_token(&mut self) -> Result<Option<String>> {
        loop {
            if self.done {
                return Ok(None);
            }

            while let Some(payload) = self.next_data_line() {
                if payload == "[DONE]" {
                    self.done = true;
                    return Ok(None);
                }

                let chunk: ChatChunk =
                    serde_json::from_str(&payload).map_err(|e| VoiceBridgeError::Protocol {
                        service: TRANSLATOR,
                        message: format!("unparseable stream chunk: {e}"),
                    })?;

                if let Some(content) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    && !content.is_empty()
                {
                    return Ok(Some(content));
                }
            }

            match self.bytes.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(e)) => {
                    return Err(VoiceBridgeError::Transport {
                        service: TRANSLATOR,
                        message: e.to_string(),
                    });
                }
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// One-shot speech synthesis with a stock (non-cloned) voice.
///
/// Serves as the alternate synthesizer in the TTS fallback chain: voice
/// fidelity degrades, pipeline function is preserved.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    model: String,
    base_url: String,
}

impl OpenAiSpeech {
    pub fn new(api_key: String, voice: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            model: "tts-1".to_string(),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    /// Points the client at a different endpoint (test servers).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn request_speech(&self, text: &str) -> Result<Vec<i16>> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            // 24kHz signed 16-bit PCM, matching the primary synthesizer
            response_format: "pcm",
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceBridgeError::Connection {
                service: SPEECH,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(SPEECH, status, body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VoiceBridgeError::Transport {
                service: SPEECH,
                message: e.to_string(),
            })?;

        Ok(pcm::bytes_to_samples(&audio))
    }
}

#[async_trait]
impl SynthesizerClient for OpenAiSpeech {
    async fn open_stream(&self) -> Result<Box<dyn SynthSession>> {
        // No duplex protocol here: buffer fragments and synthesize at EOS.
        Ok(Box::new(BufferedSpeechSession {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            voice: self.voice.clone(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            text: String::new(),
            result: None,
        }))
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<i16>> {
        self.request_speech(text).await
    }
}

struct BufferedSpeechSession {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    model: String,
    base_url: String,
    text: String,
    result: Option<Vec<i16>>,
}

#[async_trait]
impl SynthSession for BufferedSpeechSession {
    async fn send_text(&mut self, fragment: &str) -> Result<()> {
        self.text.push_str(fragment);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let speech = OpenAiSpeech {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            voice: self.voice.clone(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
        };
        self.result = Some(speech.request_speech(&self.text).await?);
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<SynthAudio>> {
        Ok(self.result.take().map(|samples| SynthAudio {
            samples,
            is_final: true,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.result = None;
        Ok(())
    }
}
