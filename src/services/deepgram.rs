//! Deepgram streaming recognizer over WebSocket.
//!
//! Session URL parameters keep the service's endpointing aligned with the
//! local VAD so both sides agree on utterance boundaries.

use crate::config::RecognizerConfig;
use crate::defaults;
use crate::error::{Result, VoiceBridgeError};
use crate::services::stt::{RecognizerClient, RecognizerSession, SttResult, WordTiming};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SERVICE: &str = "recognizer";

#[derive(Deserialize)]
struct StreamingResponse {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    is_final: bool,
    channel: Option<Channel>,
}

#[derive(Deserialize)]
struct Channel {
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
    words: Option<Vec<Word>>,
}

#[derive(Deserialize)]
struct Word {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    confidence: f32,
}

/// Deepgram live-transcription client.
pub struct DeepgramRecognizer {
    api_key: String,
    config: RecognizerConfig,
    base_url: String,
}

impl DeepgramRecognizer {
    pub fn new(api_key: String, config: RecognizerConfig) -> Self {
        Self {
            api_key,
            config,
            base_url: "wss://api.deepgram.com/v1/listen".to_string(),
        }
    }

    /// Points the client at a different endpoint (test servers).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn session_url(&self) -> String {
        format!(
            "{}?model={}&language={}&encoding=linear16&sample_rate={}&channels=1\
             &punctuate=true&smart_format=true&interim_results=true\
             &endpointing={}&utterance_end_ms={}",
            self.base_url,
            self.config.model,
            self.config.language,
            defaults::CAPTURE_SAMPLE_RATE,
            self.config.endpointing_ms,
            self.config.utterance_end_ms,
        )
    }
}

fn map_ws_error(err: WsError) -> VoiceBridgeError {
    match err {
        WsError::Http(response) if response.status().as_u16() == 401 => VoiceBridgeError::Auth {
            service: SERVICE,
            message: "credentials rejected".to_string(),
        },
        WsError::Http(response) if response.status().as_u16() == 429 => {
            VoiceBridgeError::RateLimited {
                service: SERVICE,
                message: "too many requests".to_string(),
            }
        }
        other => VoiceBridgeError::Transport {
            service: SERVICE,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl RecognizerClient for DeepgramRecognizer {
    async fn open_session(&self) -> Result<Box<dyn RecognizerSession>> {
        let mut request =
            self.session_url()
                .into_client_request()
                .map_err(|e| VoiceBridgeError::Connection {
                    service: SERVICE,
                    message: e.to_string(),
                })?;

        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key)).map_err(|e| {
            VoiceBridgeError::Connection {
                service: SERVICE,
                message: format!("invalid credential header: {e}"),
            }
        })?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(_) => map_ws_error(e),
            other => VoiceBridgeError::Connection {
                service: SERVICE,
                message: other.to_string(),
            },
        })?;

        tracing::debug!(model = %self.config.model, language = %self.config.language, "recognizer session opened");

        Ok(Box::new(DeepgramSession { ws }))
    }
}

struct DeepgramSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RecognizerSession for DeepgramSession {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
        self.ws
            .send(Message::Binary(pcm.to_vec()))
            .await
            .map_err(map_ws_error)
    }

    async fn next_result(&mut self) -> Result<Option<SttResult>> {
        while let Some(message) = self.ws.next().await {
            let message = message.map_err(map_ws_error)?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(None),
                // Pings are answered by tungstenite; skip everything else
                _ => continue,
            };

            let response: StreamingResponse =
                serde_json::from_str(&text).map_err(|e| VoiceBridgeError::Protocol {
                    service: SERVICE,
                    message: format!("unparseable result: {e}"),
                })?;

            if response.kind.as_deref() != Some("Results") {
                continue;
            }

            let Some(alternative) = response
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
            else {
                continue;
            };

            let words = alternative.words.map(|words| {
                words
                    .into_iter()
                    .map(|w| WordTiming {
                        word: w.word,
                        start_ms: w.start * 1000.0,
                        end_ms: w.end * 1000.0,
                        confidence: w.confidence,
                    })
                    .collect()
            });

            return Ok(Some(SttResult {
                text: alternative.transcript,
                is_final: response.is_final,
                confidence: alternative.confidence,
                words,
            }));
        }

        Ok(None)
    }

    async fn keepalive(&mut self) -> Result<()> {
        self.ws
            .send(Message::Text(r#"{"type":"KeepAlive"}"#.to_string()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await.map_err(map_ws_error)
    }
}
