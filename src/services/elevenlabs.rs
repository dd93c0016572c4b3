//! ElevenLabs streaming synthesizer over WebSocket, plus its one-shot
//! HTTP fallback.
//!
//! Each utterance gets its own duplex subsession against the
//! `stream-input` endpoint: a begin-of-stream message carries the voice
//! settings, text fragments append to the running synthesis, an empty text
//! message marks end-of-stream, and audio arrives as base64 PCM chunks.

use crate::audio::pcm;
use crate::config::SynthesizerConfig;
use crate::error::{Result, VoiceBridgeError};
use crate::services::tts::{SynthAudio, SynthSession, SynthesizerClient};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SERVICE: &str = "synthesizer";

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    audio: Option<String>,
    #[serde(rename = "isFinal", default)]
    is_final: bool,
}

#[derive(Serialize)]
struct OneShotRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
}

fn map_ws_error(err: WsError) -> VoiceBridgeError {
    match err {
        WsError::Http(response) if response.status().as_u16() == 401 => VoiceBridgeError::Auth {
            service: SERVICE,
            message: "credentials rejected".to_string(),
        },
        other => VoiceBridgeError::Transport {
            service: SERVICE,
            message: other.to_string(),
        },
    }
}

/// ElevenLabs synthesizer with the cloned voice.
pub struct ElevenLabsSynthesizer {
    api_key: String,
    config: SynthesizerConfig,
    client: reqwest::Client,
    ws_base: String,
    http_base: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(api_key: String, config: SynthesizerConfig) -> Self {
        Self {
            api_key,
            config,
            client: reqwest::Client::new(),
            ws_base: "wss://api.elevenlabs.io".to_string(),
            http_base: "https://api.elevenlabs.io".to_string(),
        }
    }

    /// Points the client at different endpoints (test servers).
    pub fn with_base_urls(mut self, ws_base: String, http_base: String) -> Self {
        self.ws_base = ws_base;
        self.http_base = http_base;
        self
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream-input?model_id={}&output_format=pcm_24000\
             &optimize_streaming_latency={}",
            self.ws_base, self.config.voice_id, self.config.model, self.config.latency_preset,
        )
    }

    fn voice_settings(&self) -> VoiceSettings {
        VoiceSettings {
            stability: self.config.stability,
            similarity_boost: self.config.similarity,
            style: self.config.style,
        }
    }
}

#[async_trait]
impl SynthesizerClient for ElevenLabsSynthesizer {
    async fn open_stream(&self) -> Result<Box<dyn SynthSession>> {
        let mut request =
            self.stream_url()
                .into_client_request()
                .map_err(|e| VoiceBridgeError::Connection {
                    service: SERVICE,
                    message: e.to_string(),
                })?;

        let key = HeaderValue::from_str(&self.api_key).map_err(|e| VoiceBridgeError::Connection {
            service: SERVICE,
            message: format!("invalid credential header: {e}"),
        })?;
        request.headers_mut().insert("xi-api-key", key);

        let (mut ws, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(_) => map_ws_error(e),
            other => VoiceBridgeError::Connection {
                service: SERVICE,
                message: other.to_string(),
            },
        })?;

        // Begin-of-stream: voice settings ride on a single-space text
        let bos = json!({
            "text": " ",
            "voice_settings": self.voice_settings(),
            "generation_config": {
                "chunk_length_schedule": [120, 160, 250, 290],
            },
        });
        ws.send(Message::Text(bos.to_string()))
            .await
            .map_err(map_ws_error)?;

        tracing::debug!(voice = %self.config.voice_id, "synthesizer subsession opened");

        Ok(Box::new(ElevenLabsSession { ws }))
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<i16>> {
        let url = format!(
            "{}/v1/text-to-speech/{}?output_format=pcm_24000",
            self.http_base, self.config.voice_id,
        );

        let request = OneShotRequest {
            text,
            model_id: &self.config.model,
            voice_settings: self.voice_settings(),
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceBridgeError::Connection {
                service: SERVICE,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => VoiceBridgeError::Auth {
                    service: SERVICE,
                    message: format!("{status}: {body}"),
                },
                429 => VoiceBridgeError::RateLimited {
                    service: SERVICE,
                    message: body,
                },
                _ => VoiceBridgeError::Transport {
                    service: SERVICE,
                    message: format!("{status}: {body}"),
                },
            });
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VoiceBridgeError::Transport {
                service: SERVICE,
                message: e.to_string(),
            })?;

        Ok(pcm::bytes_to_samples(&audio))
    }
}

struct ElevenLabsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SynthSession for ElevenLabsSession {
    async fn send_text(&mut self, fragment: &str) -> Result<()> {
        if fragment.is_empty() {
            return Ok(());
        }
        let message = json!({
            "text": fragment,
            "try_trigger_generation": true,
        });
        self.ws
            .send(Message::Text(message.to_string()))
            .await
            .map_err(map_ws_error)
    }

    async fn finish(&mut self) -> Result<()> {
        // Empty text is the end-of-stream marker
        self.ws
            .send(Message::Text(json!({"text": ""}).to_string()))
            .await
            .map_err(map_ws_error)
    }

    async fn next_chunk(&mut self) -> Result<Option<SynthAudio>> {
        while let Some(message) = self.ws.next().await {
            let message = message.map_err(map_ws_error)?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(None),
                _ => continue,
            };

            let chunk: StreamChunk =
                serde_json::from_str(&text).map_err(|e| VoiceBridgeError::Protocol {
                    service: SERVICE,
                    message: format!("unparseable chunk: {e}"),
                })?;

            let samples = match chunk.audio.as_deref() {
                Some(encoded) if !encoded.is_empty() => {
                    let bytes =
                        BASE64
                            .decode(encoded)
                            .map_err(|e| VoiceBridgeError::Protocol {
                                service: SERVICE,
                                message: format!("invalid audio encoding: {e}"),
                            })?;
                    pcm::bytes_to_samples(&bytes)
                }
                _ => Vec::new(),
            };

            if samples.is_empty() && !chunk.is_final {
                continue;
            }

            return Ok(Some(SynthAudio {
                samples,
                is_final: chunk.is_final,
            }));
        }

        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await.map_err(map_ws_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::samples_to_bytes;

    fn config() -> SynthesizerConfig {
        SynthesizerConfig {
            voice_id: "voice123".to_string(),
            ..SynthesizerConfig::default()
        }
    }

    #[test]
    fn test_stream_url_carries_format_and_preset() {
        let synthesizer = ElevenLabsSynthesizer::new("key".into(), config());
        let url = synthesizer.stream_url();

        assert!(url.contains("/v1/text-to-speech/voice123/stream-input"));
        assert!(url.contains("model_id=eleven_turbo_v2_5"));
        assert!(url.contains("output_format=pcm_24000"));
        assert!(url.contains("optimize_streaming_latency=3"));
    }

    #[test]
    fn test_voice_settings_serialization() {
        let synthesizer = ElevenLabsSynthesizer::new("key".into(), config());
        let json = serde_json::to_value(synthesizer.voice_settings()).unwrap();

        assert_eq!(json["stability"], 0.5);
        assert_eq!(json["similarity_boost"], 0.8);
        assert_eq!(json["style"], 0.0);
    }

    #[test]
    fn test_parse_audio_chunk() {
        let samples = vec![100i16, -100, 5000];
        let encoded = BASE64.encode(samples_to_bytes(&samples));
        let payload = format!(r#"{{"audio":"{encoded}","isFinal":false}}"#);

        let chunk: StreamChunk = serde_json::from_str(&payload).unwrap();
        let decoded = pcm::bytes_to_samples(&BASE64.decode(chunk.audio.unwrap()).unwrap());
        assert_eq!(decoded, samples);
        assert!(!chunk.is_final);
    }

    #[test]
    fn test_parse_final_marker_without_audio() {
        let chunk: StreamChunk = serde_json::from_str(r#"{"isFinal":true}"#).unwrap();
        assert!(chunk.is_final);
        assert!(chunk.audio.is_none());
    }

    #[test]
    fn test_base64_roundtrip_at_service_boundary() {
        let samples: Vec<i16> = (-50..50).map(|i| i * 300).collect();
        let encoded = BASE64.encode(samples_to_bytes(&samples));
        let decoded = pcm::bytes_to_samples(&BASE64.decode(&encoded).unwrap());
        assert_eq!(decoded, samples);
    }
}
